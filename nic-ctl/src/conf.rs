//! Attach-time configuration surface.

use std::fmt;
use std::str::FromStr;

use arrayvec::ArrayVec;

use crate::{Error, Result};

/// Maximum number of target hardware addresses accepted at attach time.
pub const MAX_MAC_FILTERS: usize = 8;
/// Toeplitz hash key length the device accepts, in bytes.
pub const TOEPLITZ_HASH_KEY_SIZE: usize = 40;
/// Number of RSS indirection table entries.
pub const INDIRECTION_TABLE_SIZE: usize = 64;

/// A 48-bit hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidConfiguration(format!("bad MAC address {s:?}"));
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(bad)?;
            if part.len() != 2 {
                return Err(bad());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| bad())?;
        }
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(MacAddr(bytes))
    }
}

/// Driver key-value arguments: an optional list of up to [`MAX_MAC_FILTERS`]
/// hardware addresses. When present, only ports carrying one of them are
/// brought up; an empty list brings up every port.
#[derive(Debug, Clone, Default)]
pub struct DriverConf {
    macs: ArrayVec<MacAddr, MAX_MAC_FILTERS>,
}

impl DriverConf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Result<Self> {
        self.macs.try_push(mac).map_err(|_| {
            Error::InvalidConfiguration(format!("exceeding max of {MAX_MAC_FILTERS} MAC addresses"))
        })?;
        Ok(self)
    }

    /// Parse comma-separated `mac=<addr>` key-value arguments.
    pub fn parse(args: &str) -> Result<Self> {
        let mut conf = Self::default();
        for kv in args.split(',').filter(|s| !s.is_empty()) {
            let (key, value) = kv.split_once('=').ok_or_else(|| {
                Error::InvalidConfiguration(format!("malformed argument {kv:?}"))
            })?;
            match key {
                "mac" => {
                    let mac = value.parse()?;
                    conf.macs.try_push(mac).map_err(|_| {
                        Error::InvalidConfiguration(format!(
                            "exceeding max of {MAX_MAC_FILTERS} MAC addresses"
                        ))
                    })?;
                }
                other => {
                    return Err(Error::InvalidConfiguration(format!(
                        "unknown argument {other:?}"
                    )));
                }
            }
        }
        Ok(conf)
    }

    pub fn macs(&self) -> &[MacAddr] {
        &self.macs
    }

    /// Whether a port with this address should be brought up.
    pub fn matches(&self, mac: &MacAddr) -> bool {
        self.macs.is_empty() || self.macs.contains(mac)
    }
}

/// RSS hash type bits the device can negotiate. The hash itself is computed
/// in hardware; the core only stores the selection.
pub mod rss_types {
    pub const IPV4: u64 = 1 << 0;
    pub const TCP_IPV4: u64 = 1 << 1;
    pub const UDP_IPV4: u64 = 1 << 2;
    pub const IPV6: u64 = 1 << 3;
    pub const TCP_IPV6: u64 = 1 << 4;
    pub const UDP_IPV6: u64 = 1 << 5;

    pub const SUPPORTED: u64 = IPV4 | TCP_IPV4 | UDP_IPV4 | IPV6 | TCP_IPV6 | UDP_IPV6;
}

/// Stored RSS configuration.
#[derive(Debug, Clone, Default)]
pub struct RssConf {
    key: Option<[u8; TOEPLITZ_HASH_KEY_SIZE]>,
    hash_types: u64,
}

impl RssConf {
    /// Replace the hash selection and, when given, the Toeplitz key. The key
    /// must be exactly [`TOEPLITZ_HASH_KEY_SIZE`] bytes.
    pub fn update(&mut self, key: Option<&[u8]>, hash_types: u64) -> Result<()> {
        if hash_types & !rss_types::SUPPORTED != 0 {
            return Err(Error::InvalidConfiguration(format!(
                "unsupported RSS hash types {:#x}",
                hash_types & !rss_types::SUPPORTED
            )));
        }
        if let Some(k) = key {
            if k.len() != TOEPLITZ_HASH_KEY_SIZE {
                return Err(Error::InvalidConfiguration(format!(
                    "RSS hash key must be {TOEPLITZ_HASH_KEY_SIZE} bytes, got {}",
                    k.len()
                )));
            }
            let mut buf = [0u8; TOEPLITZ_HASH_KEY_SIZE];
            buf.copy_from_slice(k);
            self.key = Some(buf);
        }
        self.hash_types = hash_types;
        Ok(())
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_ref().map(|k| k.as_slice())
    }

    pub fn hash_types(&self) -> u64 {
        self.hash_types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_roundtrip() {
        let mac: MacAddr = "00:0d:3a:f9:00:01".parse().unwrap();
        assert_eq!(mac.0, [0x00, 0x0d, 0x3a, 0xf9, 0x00, 0x01]);
        assert_eq!(mac.to_string(), "00:0d:3a:f9:00:01");
    }

    #[test]
    fn mac_parse_rejects_garbage() {
        assert!("00:0d:3a:f9:00".parse::<MacAddr>().is_err());
        assert!("00:0d:3a:f9:00:01:02".parse::<MacAddr>().is_err());
        assert!("00:0d:3a:f9:00:zz".parse::<MacAddr>().is_err());
        assert!("000d3af90001".parse::<MacAddr>().is_err());
    }

    #[test]
    fn kvargs_parse() {
        let conf = DriverConf::parse("mac=00:00:00:00:00:01,mac=00:00:00:00:00:02").unwrap();
        assert_eq!(conf.macs().len(), 2);
        assert!(conf.matches(&"00:00:00:00:00:01".parse().unwrap()));
        assert!(!conf.matches(&"00:00:00:00:00:03".parse().unwrap()));
        assert!(DriverConf::parse("speed=100").is_err());
        assert!(DriverConf::parse("mac").is_err());
    }

    #[test]
    fn empty_filter_matches_everything() {
        let conf = DriverConf::new();
        assert!(conf.matches(&"aa:bb:cc:dd:ee:ff".parse().unwrap()));
    }

    #[test]
    fn more_than_max_macs_is_rejected() {
        let one = "mac=00:00:00:00:00:0f,";
        let args = one.repeat(MAX_MAC_FILTERS);
        assert!(DriverConf::parse(args.trim_end_matches(',')).is_ok());
        let args = one.repeat(MAX_MAC_FILTERS + 1);
        assert!(DriverConf::parse(args.trim_end_matches(',')).is_err());
    }

    #[test]
    fn rss_key_must_be_exact_size() {
        let mut rss = RssConf::default();
        assert!(rss.update(Some(&[0u8; 39]), rss_types::IPV4).is_err());
        rss.update(Some(&[0u8; TOEPLITZ_HASH_KEY_SIZE]), rss_types::TCP_IPV4)
            .unwrap();
        assert_eq!(rss.key().unwrap().len(), TOEPLITZ_HASH_KEY_SIZE);
        assert_eq!(rss.hash_types(), rss_types::TCP_IPV4);
        assert!(rss.update(None, 1 << 63).is_err());
    }
}

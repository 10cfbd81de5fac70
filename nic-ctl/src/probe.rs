//! Driver probe and remove.
//!
//! [`Driver::probe`] discovers candidate ports through the directory
//! collaborator, filters them against the configured MAC list, and brings
//! each one up for this process's role. Any failure unwinds the partial
//! state for that port before the error is returned.

use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::Arc;

use nix::libc::c_void;
use nix::sys::mman::{self, MapFlags, ProtFlags};

use crate::conf::{DriverConf, MacAddr};
use crate::hw::HwProvider;
use crate::intr::{Dispatcher, EventWatcher};
use crate::mp::{AuxChannel, Coordinator, Role};
use crate::port::Port;
use crate::shm::page_size;
use crate::{Error, Result};

/// Per-device coordination segment name prefix.
const SHARED_SEGMENT_PREFIX: &str = "/nic_ctl_shared";

/// A candidate port reported by the discovery directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortCandidate {
    pub port: u8,
    pub mac: MacAddr,
}

/// External discovery collaborator: maps a bus identity to candidate ports.
pub trait PortDirectory: Send + Sync {
    fn lookup(&self, bus_id: &str) -> Result<Vec<PortCandidate>>;
}

/// Process-local mapping of the doorbell page a secondary obtained from the
/// primary. The fd is closed once the page is mapped.
pub struct Doorbell {
    ptr: NonNull<c_void>,
    len: usize,
}

// Mapped privately for this process; written through raw pointers only by
// the owning data path.
unsafe impl Send for Doorbell {}

impl Doorbell {
    fn map(fd: OwnedFd) -> Result<Self> {
        let len = page_size();
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| Error::OutOfResources("zero page size".into()))?;
        let ptr = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }?;
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }
}

impl Drop for Doorbell {
    fn drop(&mut self) {
        let _ = unsafe { mman::munmap(self.ptr, self.len) };
    }
}

type RemovalCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// One attachment of the driver to a physical device.
pub struct Driver {
    hw: Arc<dyn HwProvider>,
    directory: Arc<dyn PortDirectory>,
    coordinator: Coordinator,
    dispatcher: Dispatcher,
    conf: DriverConf,
    on_removal: Option<RemovalCallback>,
    ports: Vec<Port>,
    doorbell: Option<Doorbell>,
}

impl Driver {
    /// Attach a driver instance for one physical device. `device_tag` keeps
    /// coordination segments of distinct devices apart.
    pub fn new(
        hw: Arc<dyn HwProvider>,
        directory: Arc<dyn PortDirectory>,
        aux: Arc<dyn AuxChannel>,
        conf: DriverConf,
        device_tag: &str,
    ) -> Result<Self> {
        let segment_name = format!("{SHARED_SEGMENT_PREFIX}_{device_tag}");
        let coordinator = Coordinator::new(&segment_name, aux)?;
        let dispatcher = Dispatcher::new()?;
        Ok(Self {
            hw,
            directory,
            coordinator,
            dispatcher,
            conf,
            on_removal: None,
            ports: Vec::new(),
            doorbell: None,
        })
    }

    /// Register the callback fired (once per port) when the device reports a
    /// fatal condition. Must be set before [`probe`].
    ///
    /// [`probe`]: Driver::probe
    pub fn with_removal_callback(mut self, cb: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.on_removal = Some(Arc::new(cb));
        self
    }

    pub fn role(&self) -> Role {
        self.coordinator.role()
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port_mut(&mut self, index: usize) -> Option<&mut Port> {
        self.ports.get_mut(index)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Attach counters from the shared segment, `(primary, secondary)`.
    pub fn counts(&self) -> (u32, u32) {
        self.coordinator.counts()
    }

    /// Whether this process has the doorbell page mapped.
    pub fn has_doorbell(&self) -> bool {
        self.doorbell.is_some()
    }

    /// Probe every port of the device that matches the configured address
    /// filter. Returns how many ports came up.
    pub fn probe(&mut self, bus_id: &str) -> Result<usize> {
        let candidates = self.directory.lookup(bus_id)?;
        let mut brought_up = 0;
        for candidate in candidates {
            if !self.conf.matches(&candidate.mac) {
                tracing::debug!(port = candidate.port, mac = %candidate.mac, "port filtered out");
                continue;
            }
            let role = self.coordinator.ensure_initialized()?;
            let result = match role {
                Role::Primary => self.probe_port_primary(candidate),
                Role::Secondary => self.probe_port_secondary(candidate),
            };
            if let Err(e) = result {
                tracing::error!(port = candidate.port, "probe failed: {e}");
                // Undo this port's attachment before bailing out.
                self.coordinator.release()?;
                return Err(e);
            }
            tracing::info!(port = candidate.port, mac = %candidate.mac, "probed port");
            brought_up += 1;
        }
        Ok(brought_up)
    }

    fn probe_port_primary(&mut self, candidate: PortCandidate) -> Result<()> {
        let hw = self.hw.clone();
        let dev = hw.open_device()?;
        let caps = match hw.query_caps(dev) {
            Ok(caps) => caps,
            Err(e) => {
                let _ = hw.close_device(dev);
                return Err(e);
            }
        };
        let pd = match hw.alloc_pd(dev) {
            Ok(pd) => pd,
            Err(e) => {
                let _ = hw.close_device(dev);
                return Err(e);
            }
        };
        let port_no = candidate.port;
        let on_removal = self.on_removal.clone();
        let watcher = match EventWatcher::install(hw.clone(), dev, &self.dispatcher, move || {
            tracing::error!(port = port_no, "device removal reported");
            if let Some(cb) = &on_removal {
                cb(port_no);
            }
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                let _ = hw.dealloc_pd(pd);
                let _ = hw.close_device(dev);
                return Err(e);
            }
        };
        tracing::info!(
            port = candidate.port,
            max_queues = caps.max_queues,
            max_desc = caps.max_desc,
            "device opened"
        );
        self.ports.push(Port::new_primary(
            hw,
            self.coordinator.aux().clone(),
            candidate.port,
            candidate.mac,
            dev,
            pd,
            caps,
            watcher,
        ));
        Ok(())
    }

    fn probe_port_secondary(&mut self, candidate: PortCandidate) -> Result<()> {
        // One doorbell mapping per process, shared by this device's ports.
        if self.doorbell.is_none() {
            let fd = self.coordinator.aux().request_doorbell_fd()?;
            let doorbell = Doorbell::map(fd)?;
            tracing::info!("secondary doorbell mapped at {:p}", doorbell.as_ptr());
            self.doorbell = Some(doorbell);
        }
        // Limits are device-wide; read them through a short-lived context of
        // our own, the device and pd stay with the primary.
        let dev = self.hw.open_device()?;
        let caps = self.hw.query_caps(dev);
        let _ = self.hw.close_device(dev);
        let port = Port::new_secondary(self.hw.clone(), candidate.port, candidate.mac, caps?);
        // Burst pointers follow the primary's start/stop notifications.
        port.follow_data_path(self.coordinator.aux());
        self.ports.push(port);
        Ok(())
    }

    /// Detach: close every port, dropping one coordinator attachment per
    /// port. Teardown is best effort; the first error is surfaced at the
    /// end.
    pub fn remove(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(mut port) = self.ports.pop() {
            if let Err(e) = port.close(&self.dispatcher) {
                first_err.get_or_insert(e);
            }
            if let Err(e) = self.coordinator.release() {
                first_err.get_or_insert(e);
            }
        }
        self.doorbell = None;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

//! Device context and queue lifecycle.
//!
//! A [`Port`] owns the per-port hardware state (device handle, protection
//! domain, queue tables, registration registry, event watcher) and the
//! published burst path. Activation is all or nothing: either every queue
//! comes up and the live entry points are published, or everything is rolled
//! back and the removed stubs stay in place.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use arc_swap::ArcSwap;
use arrayvec::ArrayVec;

use nix::errno::Errno;

use crate::conf::{INDIRECTION_TABLE_SIZE, MacAddr, RssConf, TOEPLITZ_HASH_KEY_SIZE};
use crate::hw::{DeviceCaps, HwDevice, HwProvider, MemRange, MrHandle, ProtectionDomain};
use crate::intr::{Dispatcher, EventWatcher};
use crate::mp::{AuxChannel, Role};
use crate::mr::{self, MR_CACHE_DEV_N, MrRegistry};
use crate::queue::{Direction, Queue};
use crate::ring::PacketDesc;
use crate::{Error, Result};

/// Largest burst the entry points accept.
pub const MAX_BURST: usize = 64;
/// Smallest descriptor count a queue may be set up with.
pub const MIN_BUFFERS_PER_QUEUE: u16 = 64;

/// Offload flags. Negotiated and stored here; the math happens in hardware.
pub mod offload {
    pub const RX_CHECKSUM: u64 = 1 << 0;
    pub const RX_RSS_HASH: u64 = 1 << 1;
    pub const TX_CHECKSUM: u64 = 1 << 2;
    pub const TX_MULTI_SEG: u64 = 1 << 3;

    pub const RX_SUPPORTED: u64 = RX_CHECKSUM | RX_RSS_HASH;
    pub const TX_SUPPORTED: u64 = TX_CHECKSUM | TX_MULTI_SEG;
}

/// Port-level configuration, builder style.
#[derive(Debug, Clone, Default)]
pub struct PortConf {
    rss: bool,
    rx_offloads: u64,
    tx_offloads: u64,
}

impl PortConf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distribute received flows over the rx queues.
    pub fn rss(mut self) -> Self {
        self.rss = true;
        self
    }

    pub fn rx_offloads(mut self, offloads: u64) -> Self {
        self.rx_offloads = offloads;
        self
    }

    pub fn tx_offloads(mut self, offloads: u64) -> Self {
        self.tx_offloads = offloads;
        self
    }
}

/// Which implementation the published burst entry points dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataPath {
    /// Stub path: acquire fence, zero packets. Published while the port is
    /// stopped or the device is gone.
    Removed,
    Live,
}

/// Link report. The device has no carrier concept, so the link is always up
/// at a fixed speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    pub speed_mbps: u32,
    pub full_duplex: bool,
}

/// Port limits and defaults reported to callers.
#[derive(Debug, Clone, Copy)]
pub struct PortInfo {
    pub max_queues: u16,
    pub max_desc: u16,
    pub min_desc: u16,
    pub max_sge: u16,
    pub rx_offload_capa: u64,
    pub tx_offload_capa: u64,
    pub reta_size: u16,
    pub hash_key_size: u8,
    pub default_burst: u16,
}

/// Per-queue report.
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    pub nb_desc: u32,
    pub offloads: u64,
}

/// Packet types the receive path can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    L2Ether,
    L3Ipv4,
    L3Ipv6,
    L4Tcp,
    L4Udp,
}

const SUPPORTED_PTYPES: &[PacketType] = &[
    PacketType::L2Ether,
    PacketType::L3Ipv4,
    PacketType::L3Ipv6,
    PacketType::L4Tcp,
    PacketType::L4Udp,
];

/// Device context for one logical port.
pub struct Port {
    hw: Arc<dyn HwProvider>,
    aux: Option<Arc<dyn AuxChannel>>,
    role: Role,
    port_no: u8,
    mac: MacAddr,
    dev: Option<HwDevice>,
    pd: Option<ProtectionDomain>,
    caps: DeviceCaps,
    conf: PortConf,
    num_queues: u16,
    rss: RssConf,
    rxqs: Vec<Option<Queue>>,
    txqs: Vec<Option<Queue>>,
    mr_registry: Option<MrRegistry>,
    data_path: Arc<ArcSwap<DataPath>>,
    watcher: Option<EventWatcher>,
    started: bool,
}

impl Port {
    pub(crate) fn new_primary(
        hw: Arc<dyn HwProvider>,
        aux: Arc<dyn AuxChannel>,
        port_no: u8,
        mac: MacAddr,
        dev: HwDevice,
        pd: ProtectionDomain,
        caps: DeviceCaps,
        watcher: EventWatcher,
    ) -> Self {
        Self {
            hw,
            aux: Some(aux),
            role: Role::Primary,
            port_no,
            mac,
            dev: Some(dev),
            pd: Some(pd),
            caps,
            conf: PortConf::default(),
            num_queues: 0,
            rss: RssConf::default(),
            rxqs: Vec::new(),
            txqs: Vec::new(),
            mr_registry: None,
            data_path: Arc::new(ArcSwap::from_pointee(DataPath::Removed)),
            watcher: Some(watcher),
            started: false,
        }
    }

    /// A secondary attachment exposes the burst surface only; device, pd and
    /// watcher stay with the primary process.
    pub(crate) fn new_secondary(
        hw: Arc<dyn HwProvider>,
        port_no: u8,
        mac: MacAddr,
        caps: DeviceCaps,
    ) -> Self {
        Self {
            hw,
            aux: None,
            role: Role::Secondary,
            port_no,
            mac,
            dev: None,
            pd: None,
            caps,
            conf: PortConf::default(),
            num_queues: 0,
            rss: RssConf::default(),
            rxqs: Vec::new(),
            txqs: Vec::new(),
            mr_registry: None,
            data_path: Arc::new(ArcSwap::from_pointee(DataPath::Removed)),
            watcher: None,
            started: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn port_no(&self) -> u8 {
        self.port_no
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn num_queues(&self) -> u16 {
        self.num_queues
    }

    /// Whether the removal callback has fired for this port's device.
    pub fn removal_reported(&self) -> bool {
        self.watcher.as_ref().is_some_and(|w| w.removal_reported())
    }

    /// Whether the live burst path is currently published.
    pub fn data_path_live(&self) -> bool {
        matches!(**self.data_path.load(), DataPath::Live)
    }

    /// Follow the primary's data-path broadcasts: publish the live entry
    /// points on start, retract to the removed stubs on stop. Secondaries
    /// never drive the activation path themselves.
    pub(crate) fn follow_data_path(&self, aux: &Arc<dyn AuxChannel>) {
        let data_path = self.data_path.clone();
        aux.subscribe_data_path(Box::new(move |start| {
            if start {
                fence(Ordering::Release);
                data_path.store(Arc::new(DataPath::Live));
            } else {
                data_path.store(Arc::new(DataPath::Removed));
                fence(Ordering::Release);
            }
        }));
    }

    pub fn info(&self) -> PortInfo {
        PortInfo {
            max_queues: self.caps.max_queues,
            max_desc: self.caps.max_desc,
            min_desc: MIN_BUFFERS_PER_QUEUE,
            max_sge: self.caps.max_sge,
            rx_offload_capa: offload::RX_SUPPORTED,
            tx_offload_capa: offload::TX_SUPPORTED,
            reta_size: INDIRECTION_TABLE_SIZE as u16,
            hash_key_size: TOEPLITZ_HASH_KEY_SIZE as u8,
            default_burst: MAX_BURST as u16,
        }
    }

    pub fn link(&self) -> LinkStatus {
        LinkStatus {
            up: true,
            speed_mbps: 100_000,
            full_duplex: true,
        }
    }

    pub fn supported_ptypes(&self) -> &'static [PacketType] {
        SUPPORTED_PTYPES
    }

    pub fn rx_queue_info(&self, id: u16) -> Option<QueueInfo> {
        self.queue(Direction::Rx, id).map(|q| QueueInfo {
            nb_desc: q.depth(),
            offloads: self.conf.rx_offloads,
        })
    }

    pub fn tx_queue_info(&self, id: u16) -> Option<QueueInfo> {
        self.queue(Direction::Tx, id).map(|q| QueueInfo {
            nb_desc: q.depth(),
            offloads: self.conf.tx_offloads,
        })
    }

    pub fn queue(&self, dir: Direction, id: u16) -> Option<&Queue> {
        let table = match dir {
            Direction::Rx => &self.rxqs,
            Direction::Tx => &self.txqs,
        };
        table.get(id as usize).and_then(|slot| slot.as_ref())
    }

    pub fn queue_mut(&mut self, dir: Direction, id: u16) -> Option<&mut Queue> {
        let table = match dir {
            Direction::Rx => &mut self.rxqs,
            Direction::Tx => &mut self.txqs,
        };
        table.get_mut(id as usize).and_then(|slot| slot.as_mut())
    }

    /// Negotiate port-level configuration. Queue counts must be equal and a
    /// power of two; nothing is created on rejection. Reconfiguring drops
    /// previously set-up queues.
    pub fn configure(&mut self, nb_rx: u16, nb_tx: u16, conf: PortConf) -> Result<()> {
        if self.started {
            return Err(Error::Device(Errno::EBUSY));
        }
        if nb_rx != nb_tx {
            return Err(Error::InvalidConfiguration(format!(
                "rx and tx queue counts must be equal, got {nb_rx}/{nb_tx}"
            )));
        }
        if nb_rx == 0 || !nb_rx.is_power_of_two() {
            return Err(Error::InvalidConfiguration(format!(
                "queue count must be a power of two, got {nb_rx}"
            )));
        }
        if nb_rx > self.caps.max_queues {
            return Err(Error::InvalidConfiguration(format!(
                "queue count {nb_rx} exceeds device limit {}",
                self.caps.max_queues
            )));
        }
        let mut conf = conf;
        if conf.rss {
            conf.rx_offloads |= offload::RX_RSS_HASH;
        }
        self.num_queues = nb_rx;
        self.conf = conf;
        self.rxqs = (0..nb_rx).map(|_| None).collect();
        self.txqs = (0..nb_tx).map(|_| None).collect();
        tracing::info!(port = self.port_no, queues = nb_rx, "port configured");
        Ok(())
    }

    pub fn setup_rx_queue(&mut self, id: u16, depth: u16, socket: u32) -> Result<()> {
        self.setup_queue(Direction::Rx, id, depth, socket)
    }

    pub fn setup_tx_queue(&mut self, id: u16, depth: u16, socket: u32) -> Result<()> {
        self.setup_queue(Direction::Tx, id, depth, socket)
    }

    fn setup_queue(&mut self, dir: Direction, id: u16, depth: u16, socket: u32) -> Result<()> {
        if self.num_queues == 0 {
            return Err(Error::InvalidConfiguration("port not configured".into()));
        }
        if id >= self.num_queues {
            return Err(Error::InvalidConfiguration(format!(
                "queue id {id} out of range, {} queues configured",
                self.num_queues
            )));
        }
        if depth < MIN_BUFFERS_PER_QUEUE || depth > self.caps.max_desc {
            return Err(Error::InvalidConfiguration(format!(
                "descriptor count {depth} outside [{MIN_BUFFERS_PER_QUEUE}, {}]",
                self.caps.max_desc
            )));
        }
        // Queue::new rolls itself back on failure; nothing partial escapes.
        let queue = Queue::new(id, dir, depth, socket)?;
        let table = match dir {
            Direction::Rx => &mut self.rxqs,
            Direction::Tx => &mut self.txqs,
        };
        if table[id as usize].is_some() {
            tracing::warn!(?dir, id, "queue already set up, replacing");
        }
        table[id as usize] = Some(queue);
        Ok(())
    }

    pub fn release_rx_queue(&mut self, id: u16) -> Result<()> {
        self.release_queue(Direction::Rx, id)
    }

    pub fn release_tx_queue(&mut self, id: u16) -> Result<()> {
        self.release_queue(Direction::Tx, id)
    }

    /// Free a queue's ring and cache. Never touches the hardware activation
    /// path; a started queue must be stopped through [`stop`] first.
    ///
    /// [`stop`]: Port::stop
    fn release_queue(&mut self, dir: Direction, id: u16) -> Result<()> {
        let table = match dir {
            Direction::Rx => &mut self.rxqs,
            Direction::Tx => &mut self.txqs,
        };
        let slot = table.get_mut(id as usize).ok_or_else(|| {
            Error::InvalidConfiguration(format!("queue id {id} out of range"))
        })?;
        match slot.as_ref() {
            Some(q) if q.is_started() => Err(Error::Device(Errno::EBUSY)),
            Some(_) => {
                *slot = None;
                tracing::debug!(?dir, id, "queue released");
                Ok(())
            }
            None => Err(Error::InvalidConfiguration(format!(
                "queue {id} not set up"
            ))),
        }
    }

    /// Activate every configured queue, all or nothing, then publish the
    /// live burst entry points and notify secondaries.
    ///
    /// Tx comes up before rx so nothing is received that cannot be echoed;
    /// on any failure the already-activated queues are torn down and the
    /// first error returned, with the removed stubs still published.
    pub fn start(&mut self) -> Result<()> {
        if self.role != Role::Primary {
            return Err(Error::Device(Errno::EPERM));
        }
        if self.started {
            return Err(Error::Device(Errno::EALREADY));
        }
        if self.removal_reported() {
            return Err(Error::FatalDevice);
        }
        let dev = self.dev.ok_or(Error::Device(Errno::ENODEV))?;
        if self.num_queues == 0 {
            return Err(Error::InvalidConfiguration("port not configured".into()));
        }
        let all_set_up = self
            .txqs
            .iter()
            .chain(self.rxqs.iter())
            .all(|slot| slot.is_some());
        if !all_set_up {
            return Err(Error::InvalidConfiguration(
                "not every configured queue is set up".into(),
            ));
        }

        // The canonical registration registry lives as long as the data path.
        self.mr_registry = Some(MrRegistry::new(MR_CACHE_DEV_N));

        let result = self
            .start_direction(dev, Direction::Tx)
            .and_then(|()| self.start_direction(dev, Direction::Rx));
        if let Err(e) = result {
            tracing::error!(port = self.port_no, "failed to start queues: {e}");
            self.teardown_hw_queues();
            self.mr_registry = None;
            return Err(e);
        }

        // Ring state must be visible before any thread can observe the live
        // entry points.
        fence(Ordering::Release);
        self.data_path.store(Arc::new(DataPath::Live));
        self.started = true;
        if let Some(aux) = &self.aux {
            aux.broadcast_data_path(true);
        }
        tracing::info!(port = self.port_no, "TX/RX queues started");
        Ok(())
    }

    fn start_direction(&mut self, dev: HwDevice, dir: Direction) -> Result<()> {
        let hw = self.hw.clone();
        let table = match dir {
            Direction::Rx => &mut self.rxqs,
            Direction::Tx => &mut self.txqs,
        };
        for slot in table.iter_mut() {
            let Some(queue) = slot.as_mut() else {
                continue;
            };
            let hwq = hw.create_queue(dev, dir, queue.depth() as u16)?;
            if let Err(e) = hw.activate_queue(hwq) {
                let _ = hw.destroy_queue(hwq);
                return Err(e);
            }
            queue.set_hw_queue(Some(hwq));
        }
        Ok(())
    }

    fn teardown_hw_queues(&mut self) -> Option<Error> {
        let hw = self.hw.clone();
        let mut first_err = None;
        for slot in self.txqs.iter_mut().chain(self.rxqs.iter_mut()) {
            if let Some(queue) = slot.as_mut()
                && let Some(hwq) = queue.hw_queue()
            {
                if let Err(e) = hw.deactivate_queue(hwq) {
                    tracing::warn!(id = queue.id(), "failed to deactivate queue: {e}");
                    first_err.get_or_insert(e);
                }
                if let Err(e) = hw.destroy_queue(hwq) {
                    tracing::warn!(id = queue.id(), "failed to destroy queue: {e}");
                    first_err.get_or_insert(e);
                }
                queue.set_hw_queue(None);
            }
        }
        first_err
    }

    /// Stop the data path: publish the removed stubs and notify secondaries
    /// first, then deactivate the hardware queues, so no burst call observes
    /// a queue mid-teardown. Stopping a stopped port is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.data_path.store(Arc::new(DataPath::Removed));
        if let Some(aux) = &self.aux {
            aux.broadcast_data_path(false);
        }
        fence(Ordering::Release);
        self.started = false;
        let mut first_err = self.teardown_hw_queues();
        // The registry lives only as long as the data path: release every
        // registration now and drop the per-queue copies, which would
        // otherwise go stale and leak the handles across a restart.
        if let Some(registry) = self.mr_registry.take()
            && let Err(e) = registry.clear(self.hw.as_ref())
        {
            first_err.get_or_insert(e);
        }
        for slot in self.rxqs.iter_mut().chain(self.txqs.iter_mut()) {
            if let Some(queue) = slot.as_mut() {
                queue.mr_cache_mut().clear();
            }
        }
        tracing::info!(port = self.port_no, "TX/RX queues stopped");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release everything this port holds: stop the data path, clear the
    /// registration registry, drop the queues, uninstall the watcher, free
    /// the protection domain and close the device. Best effort; the first
    /// error is surfaced after all teardown has been attempted.
    pub fn close(&mut self, dispatcher: &Dispatcher) -> Result<()> {
        let mut first_err: Option<Error> = None;
        if self.started && let Err(e) = self.stop() {
            first_err.get_or_insert(e);
        }
        // All registrations go; the data path is already down.
        if let Some(registry) = self.mr_registry.take()
            && let Err(e) = registry.clear(self.hw.as_ref())
        {
            first_err.get_or_insert(e);
        }
        for slot in self.rxqs.iter_mut().chain(self.txqs.iter_mut()) {
            slot.take();
        }
        if let Some(mut watcher) = self.watcher.take()
            && let Err(e) = watcher.uninstall(dispatcher)
        {
            first_err.get_or_insert(e);
        }
        if let Some(pd) = self.pd.take()
            && let Err(e) = self.hw.dealloc_pd(pd)
        {
            first_err.get_or_insert(e);
        }
        if let Some(dev) = self.dev.take()
            && let Err(e) = self.hw.close_device(dev)
        {
            first_err.get_or_insert(e);
        }
        tracing::info!(port = self.port_no, "port closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Replace the RSS selection. Only legal while the port is stopped; the
    /// device cannot retarget flows under a live data path.
    pub fn update_rss(&mut self, key: Option<&[u8]>, hash_types: u64) -> Result<()> {
        if self.started {
            return Err(Error::Device(Errno::ENODEV));
        }
        self.rss.update(key, hash_types)
    }

    pub fn rss(&self) -> &RssConf {
        &self.rss
    }

    /// Receive burst entry point. While the port is stopped this dispatches
    /// to the removed stub: an acquire fence and zero packets.
    pub fn rx_burst(&mut self, queue: u16, out: &mut ArrayVec<PacketDesc, MAX_BURST>) -> u16 {
        if matches!(**self.data_path.load(), DataPath::Removed) {
            fence(Ordering::Acquire);
            return 0;
        }
        let Some(q) = self.queue_mut(Direction::Rx, queue) else {
            return 0;
        };
        let mut received = 0;
        while !out.is_full() {
            match q.ring_mut().consume() {
                Some(desc) => {
                    out.push(desc);
                    received += 1;
                }
                None => break,
            }
        }
        received
    }

    /// Transmit burst entry point: posts descriptors until the ring fills,
    /// reporting how many were accepted. Dispatches to the removed stub
    /// while stopped.
    pub fn tx_burst(&mut self, queue: u16, pkts: &[PacketDesc]) -> u16 {
        if matches!(**self.data_path.load(), DataPath::Removed) {
            fence(Ordering::Acquire);
            return 0;
        }
        let Some(q) = self.queue_mut(Direction::Tx, queue) else {
            return 0;
        };
        let mut sent = 0;
        for desc in pkts.iter().take(MAX_BURST) {
            if q.ring_mut().post(*desc).is_err() {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Fast-path registration lookup for a queue: per-queue cache, then the
    /// device registry, registering fresh memory on a full miss.
    pub fn lookup_or_register(
        &mut self,
        dir: Direction,
        queue: u16,
        range: MemRange,
    ) -> Result<MrHandle> {
        let pd = self.pd.ok_or(Error::Device(Errno::ENODEV))?;
        let registry = self
            .mr_registry
            .as_ref()
            .ok_or(Error::Device(Errno::ENODEV))?;
        let hw = &self.hw;
        let table = match dir {
            Direction::Rx => &mut self.rxqs,
            Direction::Tx => &mut self.txqs,
        };
        let q = table
            .get_mut(queue as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| Error::InvalidConfiguration(format!("queue {queue} not set up")))?;
        mr::lookup_or_register(q.mr_cache_mut(), registry, hw.as_ref(), pd, range)
    }

    /// Number of registrations the device-wide registry currently owns.
    pub fn registered_ranges(&self) -> usize {
        self.mr_registry.as_ref().map_or(0, |r| r.len())
    }
}

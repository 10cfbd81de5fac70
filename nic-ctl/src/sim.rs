//! Simulated external collaborators.
//!
//! Models the hardware transport provider, the port directory and the
//! primary/secondary resource channel precisely enough to exercise the whole
//! control plane without hardware. Async events are queued in memory and
//! signalled through an eventfd so the dispatcher sees real readiness.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::off_t;
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::mman;
use nix::sys::stat::Mode;
use nix::unistd;

use crate::hw::{
    AsyncEvent, DeviceCaps, EventKind, HwDevice, HwProvider, HwQueue, MemRange, MrHandle,
    ProtectionDomain,
};
use crate::mp::AuxChannel;
use crate::probe::{PortCandidate, PortDirectory};
use crate::queue::Direction;
use crate::shm::page_size;
use crate::{Error, Result};

/// Call counts accumulated by [`SimProvider`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SimCounters {
    pub queues_created: u32,
    pub queues_destroyed: u32,
    pub activations: u32,
    pub deactivations: u32,
    pub registrations: u32,
    pub deregistrations: u32,
    pub acked_events: u32,
}

#[derive(Debug)]
struct SimQueue {
    #[allow(dead_code)]
    dir: Direction,
    #[allow(dead_code)]
    depth: u16,
    active: bool,
}

struct SimState {
    next_handle: u64,
    devices: HashMap<u64, ()>,
    pds: HashMap<u64, u64>,
    mrs: HashMap<u64, MemRange>,
    queues: HashMap<u64, SimQueue>,
    events: VecDeque<AsyncEvent>,
    next_event_seq: u64,
    fail_activation_at: Option<u32>,
    counters: SimCounters,
}

/// Simulated hardware transport provider.
pub struct SimProvider {
    state: Mutex<SimState>,
    event_signal: EventFd,
    caps: DeviceCaps,
}

impl SimProvider {
    pub fn new() -> Result<Self> {
        Ok(Self {
            state: Mutex::new(SimState {
                next_handle: 1,
                devices: HashMap::new(),
                pds: HashMap::new(),
                mrs: HashMap::new(),
                queues: HashMap::new(),
                events: VecDeque::new(),
                next_event_seq: 0,
                fail_activation_at: None,
                counters: SimCounters::default(),
            }),
            event_signal: EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)?,
            caps: DeviceCaps {
                max_queues: 64,
                max_desc: 1024,
                max_sge: 30,
                max_mr: 1 << 16,
                max_mr_size: 1 << 30,
            },
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state lock poisoned")
    }

    fn alloc_handle(state: &mut SimState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }

    /// Make the `n`th activation from now fail (1-based).
    pub fn fail_activation_at(&self, n: u32) {
        let mut state = self.lock();
        state.fail_activation_at = Some(state.counters.activations + n);
    }

    /// Queue a synthetic async event and signal the event fd.
    pub fn push_event(&self, kind: EventKind) {
        {
            let mut state = self.lock();
            state.next_event_seq += 1;
            let seq = state.next_event_seq;
            state.events.push_back(AsyncEvent { kind, seq });
        }
        let _ = self.event_signal.write(1);
    }

    pub fn counters(&self) -> SimCounters {
        self.lock().counters
    }

    pub fn active_queues(&self) -> usize {
        self.lock().queues.values().filter(|q| q.active).count()
    }

    pub fn outstanding_registrations(&self) -> usize {
        self.lock().mrs.len()
    }
}

impl HwProvider for SimProvider {
    fn open_device(&self) -> Result<HwDevice> {
        let mut state = self.lock();
        let handle = Self::alloc_handle(&mut state);
        state.devices.insert(handle, ());
        Ok(HwDevice(handle))
    }

    fn close_device(&self, dev: HwDevice) -> Result<()> {
        self.lock()
            .devices
            .remove(&dev.0)
            .map(|_| ())
            .ok_or(Error::Device(Errno::EBADF))
    }

    fn query_caps(&self, dev: HwDevice) -> Result<DeviceCaps> {
        if !self.lock().devices.contains_key(&dev.0) {
            return Err(Error::Device(Errno::EBADF));
        }
        Ok(self.caps)
    }

    fn alloc_pd(&self, dev: HwDevice) -> Result<ProtectionDomain> {
        let mut state = self.lock();
        if !state.devices.contains_key(&dev.0) {
            return Err(Error::Device(Errno::EBADF));
        }
        let handle = Self::alloc_handle(&mut state);
        state.pds.insert(handle, dev.0);
        Ok(ProtectionDomain(handle))
    }

    fn dealloc_pd(&self, pd: ProtectionDomain) -> Result<()> {
        self.lock()
            .pds
            .remove(&pd.0)
            .map(|_| ())
            .ok_or(Error::Device(Errno::EINVAL))
    }

    fn register_memory(&self, pd: ProtectionDomain, range: MemRange) -> Result<MrHandle> {
        let mut state = self.lock();
        if !state.pds.contains_key(&pd.0) {
            return Err(Error::Device(Errno::EINVAL));
        }
        if range.len == 0 || range.len > self.caps.max_mr_size {
            return Err(Error::Device(Errno::EINVAL));
        }
        let handle = Self::alloc_handle(&mut state);
        state.mrs.insert(handle, range);
        state.counters.registrations += 1;
        Ok(MrHandle(handle))
    }

    fn deregister_memory(&self, mr: MrHandle) -> Result<()> {
        let mut state = self.lock();
        state
            .mrs
            .remove(&mr.0)
            .ok_or(Error::Device(Errno::EINVAL))?;
        state.counters.deregistrations += 1;
        Ok(())
    }

    fn create_queue(&self, dev: HwDevice, dir: Direction, depth: u16) -> Result<HwQueue> {
        let mut state = self.lock();
        if !state.devices.contains_key(&dev.0) {
            return Err(Error::Device(Errno::EBADF));
        }
        if depth == 0 || depth > self.caps.max_desc {
            return Err(Error::Device(Errno::EINVAL));
        }
        let handle = Self::alloc_handle(&mut state);
        state.queues.insert(
            handle,
            SimQueue {
                dir,
                depth,
                active: false,
            },
        );
        state.counters.queues_created += 1;
        Ok(HwQueue(handle))
    }

    fn destroy_queue(&self, queue: HwQueue) -> Result<()> {
        let mut state = self.lock();
        let q = state
            .queues
            .remove(&queue.0)
            .ok_or(Error::Device(Errno::EINVAL))?;
        if q.active {
            return Err(Error::Device(Errno::EBUSY));
        }
        state.counters.queues_destroyed += 1;
        Ok(())
    }

    fn activate_queue(&self, queue: HwQueue) -> Result<()> {
        let mut state = self.lock();
        state.counters.activations += 1;
        if state.fail_activation_at == Some(state.counters.activations) {
            state.fail_activation_at = None;
            return Err(Error::Device(Errno::EIO));
        }
        let q = state
            .queues
            .get_mut(&queue.0)
            .ok_or(Error::Device(Errno::EINVAL))?;
        q.active = true;
        Ok(())
    }

    fn deactivate_queue(&self, queue: HwQueue) -> Result<()> {
        let mut state = self.lock();
        state.counters.deactivations += 1;
        let q = state
            .queues
            .get_mut(&queue.0)
            .ok_or(Error::Device(Errno::EINVAL))?;
        q.active = false;
        Ok(())
    }

    fn event_fd(&self, _dev: HwDevice) -> Result<RawFd> {
        Ok(self.event_signal.as_fd().as_raw_fd())
    }

    fn fetch_event(&self, _dev: HwDevice) -> Result<Option<AsyncEvent>> {
        let popped = self.lock().events.pop_front();
        match popped {
            Some(event) => Ok(Some(event)),
            None => {
                // Source drained; clear the readiness signal, then look
                // again: a push landing between the empty pop and the read
                // must not be stranded with its signal swallowed.
                let _ = self.event_signal.read();
                Ok(self.lock().events.pop_front())
            }
        }
    }

    fn ack_event(&self, _dev: HwDevice, _event: AsyncEvent) -> Result<()> {
        self.lock().counters.acked_events += 1;
        Ok(())
    }
}

/// Simulated port discovery.
pub struct SimDirectory {
    ports: Vec<PortCandidate>,
}

impl SimDirectory {
    pub fn new(ports: Vec<PortCandidate>) -> Self {
        Self { ports }
    }
}

impl PortDirectory for SimDirectory {
    fn lookup(&self, _bus_id: &str) -> Result<Vec<PortCandidate>> {
        Ok(self.ports.clone())
    }
}

/// In-process stand-in for the primary/secondary resource channel. The
/// doorbell page is a named shared memory object the primary creates and a
/// secondary re-opens on request.
pub struct SimAuxChannel {
    doorbell_name: String,
    primary_up: AtomicBool,
    secondary_up: AtomicBool,
    primary_inits: AtomicU32,
    secondary_inits: AtomicU32,
    broadcasts: Mutex<Vec<bool>>,
    listeners: Mutex<Vec<Box<dyn Fn(bool) + Send + Sync>>>,
}

impl SimAuxChannel {
    pub fn new(tag: &str) -> Self {
        Self {
            doorbell_name: format!("/nic_ctl_sim_db_{tag}"),
            primary_up: AtomicBool::new(false),
            secondary_up: AtomicBool::new(false),
            primary_inits: AtomicU32::new(0),
            secondary_inits: AtomicU32::new(0),
            broadcasts: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn primary_inits(&self) -> u32 {
        self.primary_inits.load(Ordering::SeqCst)
    }

    pub fn secondary_inits(&self) -> u32 {
        self.secondary_inits.load(Ordering::SeqCst)
    }

    pub fn is_primary_up(&self) -> bool {
        self.primary_up.load(Ordering::SeqCst)
    }

    pub fn is_secondary_up(&self) -> bool {
        self.secondary_up.load(Ordering::SeqCst)
    }

    /// Data-path start/stop notifications seen so far.
    pub fn broadcasts(&self) -> Vec<bool> {
        self.broadcasts.lock().expect("sim aux lock poisoned").clone()
    }
}

impl AuxChannel for SimAuxChannel {
    fn init_primary(&self) -> Result<()> {
        let fd = mman::shm_open(
            self.doorbell_name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        unistd::ftruncate(&fd, page_size() as off_t)?;
        drop(fd);
        self.primary_up.store(true, Ordering::SeqCst);
        self.primary_inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn uninit_primary(&self) {
        let _ = mman::shm_unlink(self.doorbell_name.as_str());
        self.primary_up.store(false, Ordering::SeqCst);
    }

    fn init_secondary(&self) -> Result<()> {
        self.secondary_up.store(true, Ordering::SeqCst);
        self.secondary_inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn uninit_secondary(&self) {
        self.secondary_up.store(false, Ordering::SeqCst);
    }

    fn request_doorbell_fd(&self) -> Result<OwnedFd> {
        let fd = mman::shm_open(self.doorbell_name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|_| Error::Device(Errno::ENOTCONN))?;
        Ok(fd)
    }

    fn broadcast_data_path(&self, start: bool) {
        self.broadcasts
            .lock()
            .expect("sim aux lock poisoned")
            .push(start);
        // In-process delivery; a real channel would send a message here.
        for listener in self.listeners.lock().expect("sim aux lock poisoned").iter() {
            listener(start);
        }
    }

    fn subscribe_data_path(&self, listener: Box<dyn Fn(bool) + Send + Sync>) {
        self.listeners
            .lock()
            .expect("sim aux lock poisoned")
            .push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_activation_failure_hits_the_requested_call() {
        let sim = SimProvider::new().unwrap();
        let dev = sim.open_device().unwrap();
        let q1 = sim.create_queue(dev, Direction::Tx, 64).unwrap();
        let q2 = sim.create_queue(dev, Direction::Tx, 64).unwrap();
        sim.fail_activation_at(2);
        sim.activate_queue(q1).unwrap();
        assert!(sim.activate_queue(q2).is_err());
        // The fault is one-shot.
        sim.activate_queue(q2).unwrap();
        assert_eq!(sim.active_queues(), 2);
    }

    #[test]
    fn events_queue_in_order() {
        let sim = SimProvider::new().unwrap();
        let dev = sim.open_device().unwrap();
        sim.push_event(EventKind::Other);
        sim.push_event(EventKind::DeviceFatal);
        let first = sim.fetch_event(dev).unwrap().unwrap();
        let second = sim.fetch_event(dev).unwrap().unwrap();
        assert_eq!(first.kind, EventKind::Other);
        assert_eq!(second.kind, EventKind::DeviceFatal);
        assert!(second.seq > first.seq);
        assert!(sim.fetch_event(dev).unwrap().is_none());
    }

    #[test]
    fn doorbell_requires_primary_init() {
        let aux = SimAuxChannel::new(&format!("unit_{}", std::process::id()));
        assert!(aux.request_doorbell_fd().is_err());
        aux.init_primary().unwrap();
        let fd = aux.request_doorbell_fd().unwrap();
        drop(fd);
        aux.uninit_primary();
        assert!(aux.request_doorbell_fd().is_err());
    }
}

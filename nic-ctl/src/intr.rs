//! Async device event plumbing: a poll-based readiness dispatcher and the
//! per-device event watcher.

use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::hw::{EventKind, HwDevice, HwProvider};
use crate::{Error, Result};

/// Handle identifying one dispatcher registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

type Handler = Arc<dyn Fn() + Send + Sync>;

struct Registration {
    fd: RawFd,
    handler: Handler,
}

struct DispatcherShared {
    wake: EventFd,
    running: AtomicBool,
    next_token: AtomicU64,
    regs: Mutex<HashMap<u64, Registration>>,
}

/// Readiness dispatcher: one background thread polling every registered fd
/// and invoking its handler on readiness.
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new() -> Result<Self> {
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)?;
        let shared = Arc::new(DispatcherShared {
            wake,
            running: AtomicBool::new(true),
            next_token: AtomicU64::new(1),
            regs: Mutex::new(HashMap::new()),
        });
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("nic-ctl-intr".into())
                .spawn(move || dispatch_loop(&shared))
                .map_err(|e| Error::OutOfResources(format!("spawn dispatcher thread: {e}")))?
        };
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Register `fd` for readiness callbacks. The fd must stay open until
    /// the registration is removed.
    pub fn register(&self, fd: RawFd, handler: impl Fn() + Send + Sync + 'static) -> Result<Token> {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared
            .regs
            .lock()
            .expect("dispatcher lock poisoned")
            .insert(
                token,
                Registration {
                    fd,
                    handler: Arc::new(handler),
                },
            );
        let _ = self.shared.wake.write(1);
        tracing::debug!(token, fd, "registered event handler");
        Ok(Token(token))
    }

    /// Remove a registration. Fails with `ENOENT` when the token is not (or
    /// no longer) registered.
    pub fn unregister(&self, token: Token) -> Result<()> {
        let removed = self
            .shared
            .regs
            .lock()
            .expect("dispatcher lock poisoned")
            .remove(&token.0);
        match removed {
            Some(_) => {
                let _ = self.shared.wake.write(1);
                tracing::debug!(token = token.0, "unregistered event handler");
                Ok(())
            }
            None => Err(Error::Device(Errno::ENOENT)),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.wake.write(1);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn dispatch_loop(shared: &DispatcherShared) {
    while shared.running.load(Ordering::Acquire) {
        // Snapshot the table so handlers may re-enter the dispatcher.
        let snapshot: Vec<(RawFd, Handler)> = shared
            .regs
            .lock()
            .expect("dispatcher lock poisoned")
            .values()
            .map(|r| (r.fd, r.handler.clone()))
            .collect();

        let mut fds = Vec::with_capacity(snapshot.len() + 1);
        fds.push(PollFd::new(shared.wake.as_fd(), PollFlags::POLLIN));
        for (fd, _) in &snapshot {
            // Valid per the register() contract: the fd outlives its
            // registration.
            let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
            fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::from(200u16)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!("dispatcher poll failed: {e}");
                break;
            }
        }

        let ready_mask = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
        let ready: Vec<bool> = fds
            .iter()
            .map(|f| f.revents().map(|r| r.intersects(ready_mask)).unwrap_or(false))
            .collect();
        drop(fds);

        if ready[0] {
            let _ = shared.wake.read();
        }
        for (i, (_, handler)) in snapshot.iter().enumerate() {
            if ready[i + 1] {
                handler();
            }
        }
    }
}

/// Watcher lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Constructed but not yet registered (never observed through
    /// [`EventWatcher::state`]; install happens in the constructor).
    Idle,
    Installed,
    Draining,
    Uninstalled,
}

struct WatcherInner {
    hw: Arc<dyn HwProvider>,
    dev: HwDevice,
    removal_reported: AtomicBool,
    draining: AtomicBool,
    on_removal: Box<dyn Fn() + Send + Sync>,
}

impl WatcherInner {
    /// Drain the event source: fetch one event at a time until empty,
    /// acknowledging each. A fatal event reports removal exactly once, no
    /// matter how often the device repeats it; the drain never stops early
    /// because of it.
    fn drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
        loop {
            let event = match self.hw.fetch_event(self.dev) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("failed to fetch async event: {e}");
                    break;
                }
            };
            if event.kind == EventKind::DeviceFatal
                && !self.removal_reported.swap(true, Ordering::AcqRel)
            {
                tracing::error!(seq = event.seq, "fatal device condition, reporting removal");
                (self.on_removal)();
            }
            if let Err(e) = self.hw.ack_event(self.dev, event) {
                tracing::warn!(seq = event.seq, "failed to ack async event: {e}");
            }
        }
        self.draining.store(false, Ordering::Relaxed);
    }
}

/// Watches a device's async event source and fires the removal callback
/// exactly once on the first fatal event.
pub struct EventWatcher {
    inner: Arc<WatcherInner>,
    fd: RawFd,
    saved_flags: OFlag,
    token: Option<Token>,
}

impl EventWatcher {
    /// Switch the device's event fd to non-blocking and register it with
    /// the dispatcher. The fd flags are rolled back if registration fails.
    pub fn install(
        hw: Arc<dyn HwProvider>,
        dev: HwDevice,
        dispatcher: &Dispatcher,
        on_removal: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self> {
        let fd = hw.event_fd(dev)?;
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let saved_flags = OFlag::from_bits_retain(fcntl(borrowed, FcntlArg::F_GETFL)?);
        fcntl(borrowed, FcntlArg::F_SETFL(saved_flags | OFlag::O_NONBLOCK))?;

        let inner = Arc::new(WatcherInner {
            hw,
            dev,
            removal_reported: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            on_removal: Box::new(on_removal),
        });
        let drain = {
            let inner = inner.clone();
            move || inner.drain()
        };
        let token = match dispatcher.register(fd, drain) {
            Ok(token) => token,
            Err(e) => {
                let _ = fcntl(borrowed, FcntlArg::F_SETFL(saved_flags));
                return Err(e);
            }
        };
        tracing::debug!(?dev, fd, "device event watcher installed");
        Ok(Self {
            inner,
            fd,
            saved_flags,
            token: Some(token),
        })
    }

    pub fn state(&self) -> WatchState {
        if self.token.is_none() {
            WatchState::Uninstalled
        } else if self.inner.draining.load(Ordering::Relaxed) {
            WatchState::Draining
        } else {
            WatchState::Installed
        }
    }

    /// Whether the removal callback has fired.
    pub fn removal_reported(&self) -> bool {
        self.inner.removal_reported.load(Ordering::Acquire)
    }

    /// Deregister from the dispatcher and restore the fd flags. Fails when
    /// the registration is already gone.
    pub fn uninstall(&mut self, dispatcher: &Dispatcher) -> Result<()> {
        let token = self.token.take().ok_or(Error::Device(Errno::ENOENT))?;
        dispatcher.unregister(token)?;
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let _ = fcntl(borrowed, FcntlArg::F_SETFL(self.saved_flags));
        tracing::debug!(fd = self.fd, "device event watcher uninstalled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn dispatcher_invokes_handler_on_readiness() {
        let dispatcher = Dispatcher::new().unwrap();
        let efd = Arc::new(EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap());
        let hits = Arc::new(AtomicU32::new(0));
        let token = {
            let efd = efd.clone();
            let hits = hits.clone();
            dispatcher
                .register(efd.as_fd().as_raw_fd(), move || {
                    let _ = efd.read();
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };
        efd.write(1).unwrap();
        wait_for("handler", || hits.load(Ordering::SeqCst) >= 1);
        dispatcher.unregister(token).unwrap();
    }

    #[test]
    fn watcher_install_uninstall_states() {
        use crate::sim::SimProvider;

        let dispatcher = Dispatcher::new().unwrap();
        let sim = Arc::new(SimProvider::new().unwrap());
        let dev = sim.open_device().unwrap();
        let mut watcher = EventWatcher::install(sim.clone(), dev, &dispatcher, || {}).unwrap();
        assert_eq!(watcher.state(), WatchState::Installed);
        assert!(!watcher.removal_reported());

        sim.push_event(EventKind::DeviceFatal);
        wait_for("fatal drained", || watcher.removal_reported());

        watcher.uninstall(&dispatcher).unwrap();
        assert_eq!(watcher.state(), WatchState::Uninstalled);
        assert!(matches!(
            watcher.uninstall(&dispatcher),
            Err(Error::Device(Errno::ENOENT))
        ));
    }

    #[test]
    fn unregister_twice_fails() {
        let dispatcher = Dispatcher::new().unwrap();
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap();
        let token = dispatcher.register(efd.as_fd().as_raw_fd(), || {}).unwrap();
        dispatcher.unregister(token).unwrap();
        assert!(matches!(
            dispatcher.unregister(token),
            Err(Error::Device(Errno::ENOENT))
        ));
    }
}

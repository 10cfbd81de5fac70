//! Process role coordination.
//!
//! Decides whether this process is the primary or a secondary attachment for
//! a device, runs role-specific one-time setup exactly once, and tracks
//! attach refcounts in the shared segment.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::Result;
use crate::shm::SharedSegment;

/// Whether this process owns global device setup or reuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

/// Channel handing process-local resources from the primary to secondaries,
/// and carrying data-path control notifications the other way.
pub trait AuxChannel: Send + Sync {
    /// One-time primary-side setup (e.g. start serving resource requests).
    fn init_primary(&self) -> Result<()>;
    fn uninit_primary(&self);
    /// One-time secondary-side setup.
    fn init_secondary(&self) -> Result<()>;
    fn uninit_secondary(&self);
    /// Ask the primary for a mappable doorbell descriptor.
    fn request_doorbell_fd(&self) -> Result<OwnedFd>;
    /// Tell secondary processes to start or stop their data path.
    fn broadcast_data_path(&self, start: bool);
    /// Install a handler a secondary runs when the primary broadcasts a
    /// data-path change. One handler per attached port.
    fn subscribe_data_path(&self, listener: Box<dyn Fn(bool) + Send + Sync>);
}

/// Per-process mirror of the coordination flags. A process may attach to
/// several logical ports of the same device and must run its local one-time
/// setup exactly once regardless of the shared state.
#[derive(Debug, Default)]
struct ProcessLocalState {
    init_done: bool,
    secondary_cnt: u32,
}

pub struct Coordinator {
    segment: SharedSegment,
    role: Role,
    local: ProcessLocalState,
    aux: Arc<dyn AuxChannel>,
}

impl Coordinator {
    /// Attach to (or create) the device's coordination segment. The creator
    /// becomes the primary for the device; everyone else is a secondary.
    pub fn new(segment_name: &str, aux: Arc<dyn AuxChannel>) -> Result<Self> {
        let segment = SharedSegment::create_or_attach(segment_name)?;
        let role = if segment.created() {
            Role::Primary
        } else {
            Role::Secondary
        };
        tracing::info!(?role, name = segment_name, "attached to coordination segment");
        Ok(Self {
            segment,
            role,
            local: ProcessLocalState::default(),
            aux,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn aux(&self) -> &Arc<dyn AuxChannel> {
        &self.aux
    }

    /// Run this role's one-time setup if it has not happened yet and count
    /// one attachment. Calling again is counted but sets up nothing new.
    pub fn ensure_initialized(&mut self) -> Result<Role> {
        let state = self.segment.state();
        let guard = state.lock();
        match self.role {
            Role::Primary => {
                if !state.init_done(&guard) {
                    self.aux.init_primary()?;
                    state.set_init_done(&guard);
                    tracing::info!("primary one-time init done");
                }
                state.inc_primary(&guard);
            }
            Role::Secondary => {
                if !self.local.init_done {
                    self.aux.init_secondary()?;
                    self.local.init_done = true;
                    tracing::info!("secondary one-time init done");
                }
                state.inc_secondary(&guard);
                self.local.secondary_cnt += 1;
            }
        }
        Ok(self.role)
    }

    /// Drop one attachment. The last primary runs global teardown and
    /// removes the segment name; a secondary runs its process-local teardown
    /// when its local count reaches zero.
    ///
    /// Panics if the relevant count is already zero.
    pub fn release(&mut self) -> Result<()> {
        match self.role {
            Role::Primary => {
                let last = {
                    let state = self.segment.state();
                    let guard = state.lock();
                    let left = state.dec_primary(&guard);
                    if left == 0 {
                        tracing::debug!("last primary detached, tearing down channel");
                        self.aux.uninit_primary();
                    }
                    left == 0
                };
                // The name is removed outside the critical section. A fresh
                // primary racing in right here can re-create the segment
                // before the unlink lands; the coordination tests pin this
                // window down.
                if last {
                    self.segment.unlink()?;
                }
            }
            Role::Secondary => {
                {
                    let state = self.segment.state();
                    let guard = state.lock();
                    state.dec_secondary(&guard);
                }
                assert!(self.local.secondary_cnt > 0, "local secondary refcount underflow");
                self.local.secondary_cnt -= 1;
                if self.local.secondary_cnt == 0 {
                    tracing::debug!("last local secondary detached, tearing down channel");
                    self.aux.uninit_secondary();
                    self.local.init_done = false;
                }
            }
        }
        Ok(())
    }

    /// Counter snapshot, for diagnostics.
    pub fn counts(&self) -> (u32, u32) {
        let state = self.segment.state();
        let guard = state.lock();
        (state.primary_cnt(&guard), state.secondary_cnt(&guard))
    }
}

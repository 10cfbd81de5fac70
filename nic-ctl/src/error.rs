use nix::errno::Errno;

/// Errors surfaced by the control plane.
///
/// Invariant breaks (a refcount going negative, a ring slot consumed twice)
/// are programming errors and panic instead of appearing here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Allocation failed for a ring, a cache or the coordination segment.
    #[error("out of resources: {0}")]
    OutOfResources(String),
    /// Rejected configuration. Nothing partial is left behind.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// An OS call or the hardware transport provider failed.
    #[error("device error: {0}")]
    Device(#[from] Errno),
    /// The device reported an unrecoverable condition.
    #[error("fatal device condition")]
    FatalDevice,
}

pub type Result<T> = std::result::Result<T, Error>;

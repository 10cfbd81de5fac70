//! Control-plane core for a multi-process NIC poll-mode driver.
//!
//! This crate brings a physical port under the control of a packet-processing
//! runtime: it coordinates one-time device initialization across cooperating
//! OS processes through a shared memory segment, manages the lifetime of
//! per-queue hardware resources, caches memory registrations used for
//! zero-copy DMA, and watches the device's async event source for fatal
//! conditions.
//!
//! The actual burst data path, the register-level command interface and port
//! discovery are external collaborators, reached through the [`hw::HwProvider`],
//! [`probe::PortDirectory`] and [`mp::AuxChannel`] traits. The [`sim`] module
//! provides in-process implementations of all three for tests.

pub mod conf;
pub mod error;
pub mod hw;
pub mod intr;
pub mod mp;
pub mod mr;
pub mod port;
pub mod probe;
pub mod queue;
pub mod ring;
pub mod shm;
pub mod sim;

pub use error::{Error, Result};

//! Kernel state surface for amesh.
//!
//! The reconciliation engine drives the kernel through the [`Kernel`]
//! trait: interface lifecycle, WireGuard device/peer state, and IP routes.
//! [`CommandKernel`] maps each action to one external `ip`/`wg` command;
//! [`FakeKernel`] records actions for tests. [`DevTracker`] watches kernel
//! address changes on a configured interface set and feeds the agent's
//! self-descriptor updates.

mod command;
mod error;
mod kernel;
mod tracker;

pub use command::CommandKernel;
pub use error::KernelError;
pub use kernel::{FakeKernel, Kernel, KernelAction};
pub use tracker::{AddrAction, AddrEvent, DevTracker, TrackerError};

/// Convenience result alias for kernel actions.
pub type Result<T> = std::result::Result<T, KernelError>;

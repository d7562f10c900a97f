//! Forwarding Information Base for amesh.
//!
//! The FIB is the desired kernel state computed from the directory: a set
//! of WireGuard [`Peer`]s and a set of IP [`Route`]s. [`Fib::build`] derives
//! it from the self-descriptor and the node table; [`Fib::reconcile`]
//! applies the ordered delta between the currently installed FIB and a
//! freshly built one through the kernel action surface.

mod fib;
mod peer;
mod ports;
mod route;

pub use fib::{BuildParams, Fib, check_group, outbound_ifname};
pub use peer::Peer;
pub use ports::PortAllocator;
pub use route::Route;

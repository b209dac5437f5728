//! Conveniences on top of the session objects, each sharing the device connection through a
//!  [crate::session::manager::NetmpManager] lease.

pub mod capture;
pub mod console;
pub mod dualshock;
pub mod info;

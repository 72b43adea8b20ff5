//! Platform poller backends.
//!
//! The reactor talks to the OS readiness facility through this module.
//! Only the Linux `epoll` backend is provided; the module keeps the
//! backend-selection shape so other platforms can slot in later.

mod common;
pub(crate) mod unix;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub(crate) use epoll::EpollPoller as Poller;

#[cfg(not(target_os = "linux"))]
compile_error!("spindle currently supports only Linux (epoll)");

pub(crate) use common::{Interest, Waker};

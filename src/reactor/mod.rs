//! The event loop and its supporting machinery.
//!
//! One [`Reactor`] owns one OS thread and multiplexes readiness-based
//! I/O, timers and task queues over a single `epoll` instance. Sockets
//! in [`crate::net`] register themselves here; other threads inject work
//! through [`Remote`].

mod core;
mod timer;

pub mod throttle;

pub(crate) mod event;
pub(crate) mod poller;

pub use core::{OperationGuard, Reactor, ReactorStats, Remote};
pub use throttle::{ThrottleConfig, ThrottlingController};
pub use timer::ScheduledTask;

pub(crate) use core::StreamHandler;

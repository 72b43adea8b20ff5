//! # Spindle
//!
//! **Spindle** is a single-threaded reactor library for Rust: one event
//! loop per OS thread, multiplexing readiness-based I/O, timers and task
//! queues over `epoll`, with handler-driven non-blocking sockets on top.
//!
//! Unlike future-based runtimes, Spindle keeps the loop explicit. Code
//! running inside a reactor is plain callbacks over `Rc` state, with no
//! locks and no `Send` bounds; other threads reach the loop only through
//! a [`Remote`] handle. Scaling out means running several reactors and
//! dealing connections between them.
//!
//! What's in the box:
//!
//! - A **reactor** with local, concurrent, scheduled and background task
//!   queues, a virtual timestamp, and an eventfd wake-up
//! - **Non-blocking TCP and UDP sockets** with pooled buffers, write
//!   coalescing and optional read/write timeouts
//! - A **transparent TLS filter** over any socket, backed by rustls
//! - **Pooled byte buffers** with zero-copy slices and a byte-queue
//! - **Adaptive throttling** that sheds accepts when the loop falls
//!   behind its time budget
//! - **Primary/worker servers** that round-robin accepted connections
//!   across reactors
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use spindle::net::{Server, ServerConfig, AsyncSocket, SocketHandler};
//! use spindle::Reactor;
//!
//! let reactor = Reactor::new();
//! let server = Server::new(&reactor, config, |socket, peer| {
//!     socket.set_handler(EchoHandler::new(socket.clone()));
//!     socket.read();
//! });
//! server.listen().expect("failed to listen");
//! reactor.run();
//! ```
//!
//! ## Modules
//!
//! - [`buf`]: pooled buffers and the buffer queue
//! - [`reactor`]: the event loop, timers, throttling
//! - [`net`]: TCP, UDP, TLS and servers
//! - [`executor`]: the boundary for blocking work

mod utils;

pub mod buf;
pub mod error;
pub mod executor;
pub mod net;
pub mod reactor;

pub use buf::{Buf, BufQueue};
pub use error::{FatalErrorPolicy, SocketError};
pub use reactor::{
    OperationGuard, Reactor, ReactorStats, Remote, ScheduledTask, ThrottleConfig,
    ThrottlingController,
};

//! Non-blocking TCP.
//!
//! [`TcpSocket`] wraps a connected descriptor and drives it from the
//! reactor: reads are armed explicitly and delivered to the attached
//! handler, writes are queued and coalesced into as few syscalls as
//! possible. Listening sockets live in [`crate::net::server`].

mod stream;

pub use stream::TcpSocket;

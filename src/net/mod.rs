//! Non-blocking networking primitives.
//!
//! Sockets here are handler-driven rather than future-driven: a socket
//! is created, a [`SocketHandler`] is attached, and the socket pushes
//! data, flush notifications, end-of-stream and errors into it as the
//! reactor reports readiness. Everything runs on the socket's reactor
//! thread.

mod socket;

pub mod server;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use socket::{AsyncSocket, SocketConfig, SocketHandler};

pub use server::{
    AcceptFilterFn, AcceptStats, PrimaryServer, ServeFn, Server, ServerConfig, WorkerServeFn,
};
pub use tcp::TcpSocket;
pub use tls::TlsSocket;
pub use udp::{UdpHandler, UdpSocket};

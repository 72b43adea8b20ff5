//! Error taxonomy for sockets and the reactor.
//!
//! Errors are strictly local: a failure on one connection closes that
//! connection and notifies its handler, and never cascades to sibling
//! connections or terminates the event loop. Unrecoverable conditions
//! are delegated to a [`FatalErrorPolicy`] chosen by the hosting code.

use std::io;
use std::process;

use thiserror::Error;

/// An error delivered to a socket handler.
///
/// A closed connection produces exactly one terminal notification:
/// either an end-of-stream callback or a single `SocketError`, never both.
#[derive(Debug, Error)]
pub enum SocketError {
    /// A channel-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A read or write timeout fired before the matching I/O completed.
    #[error("timed out")]
    Timeout,

    /// The operation was attempted on a socket that is already closed.
    #[error("socket closed")]
    Closed,

    /// A TLS protocol or handshake failure reported by the crypto engine.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The peer closed the transport without sending a TLS close_notify.
    #[error("peer closed without close_notify")]
    CloseWithoutNotify,
}

impl SocketError {
    /// Returns `true` for channel-level I/O failures.
    pub fn is_io(&self) -> bool {
        matches!(self, SocketError::Io(_))
    }

    /// Returns `true` for timeout-classified errors.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SocketError::Timeout)
    }
}

/// Policy applied to unrecoverable, process-level errors.
///
/// The reactor itself never invokes this policy on its own; it only
/// catches, counts and logs per-task failures. Hosting code decides
/// what is fatal and calls [`crate::Reactor::handle_fatal_error`].
pub enum FatalErrorPolicy {
    /// Log the error and carry on.
    Ignore,

    /// Abort the process immediately.
    Abort,

    /// Abort only when the error matches the given predicate.
    AbortOn(Box<dyn Fn(&SocketError) -> bool>),
}

impl FatalErrorPolicy {
    pub(crate) fn handle(&self, error: &SocketError, context: &str) {
        match self {
            FatalErrorPolicy::Ignore => {
                tracing::error!(context, %error, "fatal error ignored by policy");
            }
            FatalErrorPolicy::Abort => {
                tracing::error!(context, %error, "fatal error, aborting");
                process::abort();
            }
            FatalErrorPolicy::AbortOn(predicate) => {
                if predicate(error) {
                    tracing::error!(context, %error, "fatal error matched policy, aborting");
                    process::abort();
                }
                tracing::error!(context, %error, "fatal error did not match policy");
            }
        }
    }
}

impl Default for FatalErrorPolicy {
    fn default() -> Self {
        FatalErrorPolicy::Ignore
    }
}

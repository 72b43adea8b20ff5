use std::rc::Rc;
use std::time::Duration;

use crate::buf::Buf;
use crate::error::SocketError;

/// Default size of the buffer handed to each read syscall, 16 KiB.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Default write-coalescing threshold, 16 KiB. Adjacent queued buffers
/// smaller than this are concatenated before the write syscall.
pub const DEFAULT_MERGE_SIZE: usize = 16 * 1024;

/// Per-socket settings.
#[derive(Clone, Copy, Debug)]
pub struct SocketConfig {
    pub read_buffer_size: usize,
    pub merge_size: usize,
    /// Closes the socket with a timeout error when armed reads see no
    /// data for this long.
    pub read_timeout: Option<Duration>,
    /// Closes the socket with a timeout error when queued writes make no
    /// progress for this long.
    pub write_timeout: Option<Duration>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            merge_size: DEFAULT_MERGE_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl SocketConfig {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        assert!(size > 0, "read buffer size must be positive");
        self.read_buffer_size = size;
        self
    }

    pub fn with_merge_size(mut self, size: usize) -> Self {
        self.merge_size = size;
        self
    }
}

/// Callbacks a socket delivers to the code using it.
///
/// A closed connection produces exactly one terminal notification:
/// [`on_read_end_of_stream`](SocketHandler::on_read_end_of_stream) or
/// [`on_error`](SocketHandler::on_error), never both.
pub trait SocketHandler {
    /// A chunk of data arrived. Only called while reads are armed.
    fn on_read(&self, buf: Buf);

    /// The peer will send no more data.
    fn on_read_end_of_stream(&self) {}

    /// Every queued write reached the OS.
    fn on_write_flushed(&self) {}

    /// The socket failed and has been closed.
    fn on_error(&self, error: SocketError);
}

/// The socket surface shared by plain TCP and the TLS filter.
///
/// All operations are non-blocking and must be called on the socket's
/// reactor thread. `read` arms interest; data is then delivered to the
/// handler for as long as the interest stays armed. `write` enqueues and
/// returns; completion is signalled through
/// [`SocketHandler::on_write_flushed`].
pub trait AsyncSocket {
    fn set_handler(&self, handler: Rc<dyn SocketHandler>);

    /// Arms read interest. Idempotent; restarts the read timeout.
    fn read(&self);

    /// Enqueues `buf` for sending.
    fn write(&self, buf: Buf);

    /// Half-closes the outgoing direction once queued writes drain.
    fn write_end_of_stream(&self);

    /// Closes the socket. Idempotent; queued buffers are recycled and
    /// no further notifications are delivered.
    fn close(&self);

    fn is_open(&self) -> bool;
}

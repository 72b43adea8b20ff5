//! An ordered queue of pooled buffers.

use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::io;

use crate::buf::Buf;

/// A FIFO queue of [`Buf`]s behaving as one contiguous byte stream.
///
/// Bytes come out in exactly the order they went in, regardless of how
/// reads are split across entries. Empty buffers are recycled on entry and
/// never stored; dropping the queue recycles everything still inside.
#[derive(Default)]
pub struct BufQueue {
    bufs: VecDeque<Buf>,
    remaining: usize,
}

impl BufQueue {
    pub fn new() -> BufQueue {
        BufQueue {
            bufs: VecDeque::new(),
            remaining: 0,
        }
    }

    /// Appends a buffer to the back. Empty buffers are discarded outright.
    pub fn add(&mut self, buf: Buf) {
        if buf.is_empty() {
            return;
        }
        self.remaining += buf.remaining();
        self.bufs.push_back(buf);
    }

    /// Puts a buffer back at the front, ahead of everything queued.
    pub fn push_front(&mut self, buf: Buf) {
        if buf.is_empty() {
            return;
        }
        self.remaining += buf.remaining();
        self.bufs.push_front(buf);
    }

    /// Total readable bytes across all entries.
    pub fn remaining_bytes(&self) -> usize {
        self.remaining
    }

    /// Number of buffers queued.
    pub fn remaining_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    pub fn has_remaining_bytes(&self, n: usize) -> bool {
        self.remaining >= n
    }

    /// Removes and returns the front buffer.
    pub fn take(&mut self) -> Option<Buf> {
        let buf = self.bufs.pop_front()?;
        self.remaining -= buf.remaining();
        Some(buf)
    }

    /// Readable length of the front buffer, if any.
    pub fn peek_len(&self) -> Option<usize> {
        self.bufs.front().map(Buf::remaining)
    }

    /// First byte of the stream without consuming it.
    pub fn peek_byte(&self) -> Option<u8> {
        self.bufs.front().and_then(Buf::first)
    }

    /// Consumes and returns one byte.
    pub fn get_byte(&mut self) -> Option<u8> {
        let front = self.bufs.front_mut()?;
        let byte = front.get_byte();
        self.remaining -= 1;
        if front.is_empty() {
            self.bufs.pop_front();
        }
        Some(byte)
    }

    /// Skips up to `n` bytes, returning how many were actually skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        let mut skipped = 0;
        while skipped < n {
            let Some(front) = self.bufs.front_mut() else {
                break;
            };
            let step = cmp::min(n - skipped, front.remaining());
            front.advance(step);
            skipped += step;
            if front.is_empty() {
                self.bufs.pop_front();
            }
        }
        self.remaining -= skipped;
        skipped
    }

    /// Takes exactly `n` bytes as a single buffer.
    ///
    /// When the front entry alone covers `n` bytes this is a zero-copy
    /// referential slice of it; otherwise bytes are gathered into a fresh
    /// buffer. The queue must hold at least `n` bytes.
    pub fn take_exact(&mut self, n: usize) -> Buf {
        debug_assert!(self.has_remaining_bytes(n));
        if n == 0 {
            return Buf::allocate(0);
        }
        let front = self
            .bufs
            .front_mut()
            .filter(|front| front.remaining() >= n);
        if let Some(front) = front {
            let slice = front.slice_to(n);
            front.advance(n);
            if front.is_empty() {
                self.bufs.pop_front();
            }
            self.remaining -= n;
            return slice;
        }
        let mut gathered = Buf::allocate(n);
        let copied = self.drain_to_slice(&mut gathered.write_slice()[..n]);
        gathered.commit(copied);
        gathered
    }

    /// Takes at most `n` bytes as a single buffer; may return less when the
    /// queue is short.
    pub fn take_at_most(&mut self, n: usize) -> Buf {
        self.take_exact(cmp::min(n, self.remaining))
    }

    /// Takes everything queued as a single buffer.
    pub fn take_remaining(&mut self) -> Buf {
        self.take_exact(self.remaining)
    }

    /// Copies bytes into `dst`, consuming them; returns the count copied.
    pub fn drain_to_slice(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = self.bufs.front_mut() else {
                break;
            };
            let step = cmp::min(dst.len() - copied, front.remaining());
            dst[copied..copied + step].copy_from_slice(&front.as_slice()[..step]);
            front.advance(step);
            copied += step;
            if front.is_empty() {
                self.bufs.pop_front();
            }
        }
        self.remaining -= copied;
        copied
    }

    /// Moves every queued buffer into `dst`, preserving order; returns the
    /// number of bytes moved.
    pub fn drain_into(&mut self, dst: &mut BufQueue) -> usize {
        let moved = self.remaining;
        while let Some(buf) = self.take() {
            dst.add(buf);
        }
        moved
    }

    /// Recycles every queued buffer.
    pub fn recycle(&mut self) {
        self.bufs.clear();
        self.remaining = 0;
    }
}

impl fmt::Debug for BufQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufQueue")
            .field("bufs", &self.bufs.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// Destructive read, used to feed ciphertext into the TLS engine.
impl io::Read for BufQueue {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        Ok(self.drain_to_slice(dst))
    }
}

//! Linux `epoll` poller backend.
//!
//! Owns the epoll instance plus an `eventfd` wake source, and translates
//! raw `epoll_event`s into the reactor's [`Event`] records. Registration
//! tokens are slab indices from the reactor's registry; the wake source
//! uses a reserved token that the slab can never produce.

use super::common::{Interest, Waker};
use crate::reactor::event::Event;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Reserved token for the wake-up event; never collides with slab indices.
const WAKE_TOKEN: u64 = u64::MAX;

const EVENT_CAPACITY: usize = 256;

/// Linux `epoll` poller.
pub(crate) struct EpollPoller {
    epoll: RawFd,

    /// Reusable buffer handed to `epoll_wait`.
    events: Vec<epoll_event>,

    waker: Arc<Waker>,
}

impl Waker {
    /// Interrupts a blocking `epoll_wait` by writing to the eventfd.
    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.0, &one as *const _ as *const _, 8);
        }
    }
}

impl EpollPoller {
    /// Creates the epoll instance, the non-blocking `eventfd`, and
    /// registers the eventfd as a persistent wake source.
    pub(crate) fn new() -> Self {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        assert!(epoll >= 0, "epoll_create1 failed");

        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(eventfd >= 0, "eventfd failed");

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, eventfd, &mut event) };
        assert!(rc == 0, "failed to register wake eventfd");

        Self {
            epoll,
            events: Vec::with_capacity(EVENT_CAPACITY),
            waker: Arc::new(Waker(eventfd)),
        }
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Registers a descriptor under `token` with the given interests.
    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) {
        let mut event = Self::to_event(token, interest);
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) };
        debug_assert_eq!(rc, 0, "epoll add failed: {}", io::Error::last_os_error());
    }

    /// Updates the interests of an already registered descriptor.
    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) {
        let mut event = Self::to_event(token, interest);
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_MOD, fd, &mut event) };
        debug_assert_eq!(rc, 0, "epoll mod failed: {}", io::Error::last_os_error());
    }

    /// Removes a descriptor from the poller.
    pub(crate) fn deregister(&self, fd: RawFd) {
        unsafe {
            epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    fn to_event(token: usize, interest: Interest) -> epoll_event {
        let mut flags = 0;
        if interest.read {
            flags |= EPOLLIN;
        }
        if interest.write {
            flags |= EPOLLOUT;
        }
        epoll_event {
            events: flags as u32,
            u64: token as u64,
        }
    }

    /// Blocks until readiness, a wake-up, or the timeout, and fills
    /// `events` with the ready registrations.
    ///
    /// `None` blocks indefinitely. A signal interruption is reported as a
    /// normal empty poll.
    pub(crate) fn poll(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        // Round a sub-millisecond timeout up so a zero Duration still
        // yields an immediate return while short waits do not spin.
        let timeout_ms = match timeout {
            None => -1,
            Some(t) if t.is_zero() => 0,
            Some(t) => t.as_millis().max(1).min(i32::MAX as u128) as i32,
        };

        events.clear();

        let n = unsafe {
            self.events.set_len(0);
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        for ev in &self.events {
            if ev.u64 == WAKE_TOKEN {
                let mut drained = 0u64;
                unsafe {
                    libc::read(self.waker.0, &mut drained as *mut _ as *mut _, 8);
                }
                continue;
            }

            // Errors and hang-ups surface through the read path, where the
            // next syscall reports the actual cause.
            events.push(Event {
                token: ev.u64 as usize,
                readable: ev.events & ((EPOLLIN | EPOLLERR | EPOLLHUP) as u32) != 0,
                writable: ev.events & ((EPOLLOUT | EPOLLERR | EPOLLHUP) as u32) != 0,
            });
        }

        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.waker.0);
            libc::close(self.epoll);
        }
    }
}

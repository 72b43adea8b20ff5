use std::os::fd::RawFd;

/// Readiness interests for a registered descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const NONE: Interest = Interest {
        read: false,
        write: false,
    };

    pub(crate) fn is_none(&self) -> bool {
        !self.read && !self.write
    }
}

/// Handle to the poller's wake-up descriptor.
///
/// Writing to it interrupts a blocking `epoll_wait`, which is how other
/// threads get the reactor's attention after enqueueing a task.
pub(crate) struct Waker(pub(crate) RawFd);

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

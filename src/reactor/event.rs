/// An I/O readiness event reported by the poller.
///
/// The token identifies the registration inside the reactor's registry;
/// the flags say which directions became ready. Error and hang-up
/// conditions are folded into readiness so the next syscall surfaces the
/// actual cause.
pub(crate) struct Event {
    pub(crate) token: usize,

    pub(crate) readable: bool,

    pub(crate) writable: bool,
}

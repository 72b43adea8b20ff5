//! The reactor: a single-threaded, readiness-driven event loop.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;

use crate::error::{FatalErrorPolicy, SocketError};
use crate::executor::BlockingExecutor;
use crate::reactor::event::Event;
use crate::reactor::poller::{unix, Interest, Poller, Waker};
use crate::reactor::throttle::ThrottlingController;
use crate::reactor::timer::{ScheduledInner, ScheduledTask, TimerEntry};
use crate::utils::Slab;

/// Upper bound on how long a poll may block while timers are pending.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(20);

/// Poll timeout used while cross-thread tasks are known to be queued.
const CONCURRENT_POLL_TIMEOUT: Duration = Duration::from_millis(1);

thread_local! {
    static CURRENT: RefCell<Weak<Reactor>> = RefCell::new(Weak::new());
}

type LocalTask = Box<dyn FnOnce()>;
type RemoteTask = Box<dyn FnOnce() + Send>;

/// Readiness callbacks of a registered stream socket.
///
/// Implementors are held weakly by the registry; a registration whose
/// handler has been dropped counts as an invalid key and is discarded.
pub(crate) trait StreamHandler {
    fn on_read_ready(&self);
    fn on_write_ready(&self);
}

enum Registration {
    Accept {
        fd: RawFd,
        on_accept: Rc<dyn Fn(RawFd, SocketAddr)>,
    },
    Connect {
        fd: RawFd,
        on_complete: Option<Box<dyn FnOnce(io::Result<RawFd>)>>,
        timeout: Option<ScheduledTask>,
    },
    Stream {
        handler: Weak<dyn StreamHandler>,
    },
}

/// State shared with other threads: the concurrent task queue, the
/// operation-in-flight counter and the poller's wake handle.
struct Shared {
    tasks: SegQueue<RemoteTask>,
    operations: AtomicUsize,
    waker: Arc<Waker>,
}

/// A cloneable, `Send` handle for injecting tasks into a reactor from
/// other threads.
#[derive(Clone)]
pub struct Remote {
    shared: Arc<Shared>,
}

impl Remote {
    /// Enqueues a task on the reactor's concurrent queue and wakes the
    /// poller. Tasks run in FIFO order during the concurrent phase.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.tasks.push(Box::new(task));
        self.shared.waker.wake();
    }

    /// Marks an external operation as in flight, keeping the reactor
    /// alive until the returned guard is completed.
    pub fn start_operation(&self) -> OperationGuard {
        self.shared.operations.fetch_add(1, Ordering::SeqCst);
        OperationGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether this handle points at `reactor`.
    pub fn belongs_to(&self, reactor: &Reactor) -> bool {
        Arc::ptr_eq(&self.shared, &reactor.shared)
    }
}

/// Keeps the owning reactor's loop alive while an external operation is
/// in flight. Dropping the guard completes the operation exactly once.
pub struct OperationGuard {
    shared: Arc<Shared>,
}

impl OperationGuard {
    /// Completes the operation. Equivalent to dropping the guard.
    pub fn complete(self) {}
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.shared.operations.fetch_sub(1, Ordering::SeqCst);
        // The loop may be blocked with no other wake source left.
        self.shared.waker.wake();
    }
}

/// Per-phase counters of a reactor. Values are informational; callers
/// must not depend on exact numbers.
#[derive(Default)]
pub struct ReactorStats {
    ticks: Cell<u64>,
    selected_keys: Cell<u64>,
    invalid_keys: Cell<u64>,
    accept_keys: Cell<u64>,
    connect_keys: Cell<u64>,
    read_keys: Cell<u64>,
    write_keys: Cell<u64>,
    concurrent_tasks: Cell<u64>,
    scheduled_tasks: Cell<u64>,
    background_tasks: Cell<u64>,
    local_tasks: Cell<u64>,
    io_errors: Cell<u64>,
}

fn inc(cell: &Cell<u64>) {
    cell.set(cell.get() + 1);
}

impl ReactorStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    pub fn selected_keys(&self) -> u64 {
        self.selected_keys.get()
    }

    /// Events whose registration was gone by the time they surfaced.
    pub fn invalid_keys(&self) -> u64 {
        self.invalid_keys.get()
    }

    pub fn accept_keys(&self) -> u64 {
        self.accept_keys.get()
    }

    pub fn connect_keys(&self) -> u64 {
        self.connect_keys.get()
    }

    pub fn read_keys(&self) -> u64 {
        self.read_keys.get()
    }

    pub fn write_keys(&self) -> u64 {
        self.write_keys.get()
    }

    pub fn concurrent_tasks(&self) -> u64 {
        self.concurrent_tasks.get()
    }

    pub fn scheduled_tasks(&self) -> u64 {
        self.scheduled_tasks.get()
    }

    pub fn background_tasks(&self) -> u64 {
        self.background_tasks.get()
    }

    pub fn local_tasks(&self) -> u64 {
        self.local_tasks.get()
    }

    pub fn io_errors(&self) -> u64 {
        self.io_errors.get()
    }
}

/// A single-threaded event loop.
///
/// One reactor owns one OS thread. Inside that thread everything is
/// callback-driven and free of locks; other threads reach the loop only
/// through [`Remote`]. The loop keeps spinning while there is anything
/// to wait for: live registrations, scheduled tasks, queued tasks,
/// in-flight external operations, or an explicit keep-alive.
///
/// Per tick the phases run in a fixed order: poll, I/O dispatch,
/// concurrent tasks, scheduled tasks, background tasks, local tasks.
pub struct Reactor {
    poller: RefCell<Poller>,
    events: RefCell<Vec<Event>>,
    registry: RefCell<Slab<Registration>>,
    local_tasks: RefCell<VecDeque<LocalTask>>,
    shared: Arc<Shared>,
    scheduled: RefCell<BinaryHeap<TimerEntry>>,
    background: RefCell<BinaryHeap<TimerEntry>>,
    blocking: RefCell<Slab<Box<dyn FnOnce(Box<dyn Any + Send>)>>>,
    keep_alive: Cell<bool>,
    break_requested: Cell<bool>,
    tick: Cell<u64>,
    timestamp: Cell<Instant>,
    throttling: RefCell<Option<Rc<ThrottlingController>>>,
    fatal_policy: RefCell<FatalErrorPolicy>,
    stats: ReactorStats,
}

impl Reactor {
    /// Creates a reactor and installs it as the current thread's reactor.
    pub fn new() -> Rc<Reactor> {
        let poller = Poller::new();
        let waker = poller.waker();

        let reactor = Rc::new(Reactor {
            poller: RefCell::new(poller),
            events: RefCell::new(Vec::new()),
            registry: RefCell::new(Slab::new()),
            local_tasks: RefCell::new(VecDeque::new()),
            shared: Arc::new(Shared {
                tasks: SegQueue::new(),
                operations: AtomicUsize::new(0),
                waker,
            }),
            scheduled: RefCell::new(BinaryHeap::new()),
            background: RefCell::new(BinaryHeap::new()),
            blocking: RefCell::new(Slab::new()),
            keep_alive: Cell::new(false),
            break_requested: Cell::new(false),
            tick: Cell::new(0),
            timestamp: Cell::new(Instant::now()),
            throttling: RefCell::new(None),
            fatal_policy: RefCell::new(FatalErrorPolicy::default()),
            stats: ReactorStats::default(),
        });

        CURRENT.with(|current| *current.borrow_mut() = Rc::downgrade(&reactor));
        reactor
    }

    /// The reactor owning the current thread, if one exists.
    pub fn current() -> Option<Rc<Reactor>> {
        CURRENT.with(|current| current.borrow().upgrade())
    }

    /// Runs the loop until nothing keeps it alive or
    /// [`break_loop`](Reactor::break_loop) is called.
    pub fn run(self: &Rc<Self>) {
        self.break_requested.set(false);
        self.timestamp.set(Instant::now());
        tracing::debug!("reactor started");

        loop {
            if !self.is_alive() {
                break;
            }

            let timeout = self.poll_timeout();
            let polled = {
                let mut poller = self.poller.borrow_mut();
                let mut events = self.events.borrow_mut();
                poller.poll(&mut events, timeout)
            };
            self.timestamp.set(Instant::now());

            if let Err(error) = polled {
                inc(&self.stats.io_errors);
                tracing::error!(%error, "poll failed");
                continue;
            }

            let ready_keys = self.events.borrow().len() + self.shared.tasks.len();
            if let Some(throttling) = &*self.throttling.borrow() {
                throttling.recalculate(ready_keys);
            }

            let round_start = self.timestamp.get();
            self.dispatch_io();
            self.run_concurrent_tasks();
            self.run_scheduled_tasks(false);
            self.run_scheduled_tasks(true);
            self.run_local_tasks();

            if let Some(throttling) = &*self.throttling.borrow() {
                throttling.update_round(ready_keys, round_start.elapsed());
            }

            self.tick.set(self.tick.get() + 1);
            inc(&self.stats.ticks);
        }

        tracing::debug!(ticks = self.tick.get(), "reactor stopped");
    }

    /// Requests the loop to stop after the current tick.
    pub fn break_loop(&self) {
        self.break_requested.set(true);
    }

    /// Forces the loop to keep spinning even with nothing registered.
    pub fn keep_alive(&self, keep_alive: bool) {
        self.keep_alive.set(keep_alive);
    }

    fn is_alive(&self) -> bool {
        if self.break_requested.get() {
            return false;
        }
        !self.local_tasks.borrow().is_empty()
            || !self.shared.tasks.is_empty()
            || self.shared.operations.load(Ordering::SeqCst) > 0
            || self.keep_alive.get()
            || !self.registry.borrow().is_empty()
            || self.has_live_timers(&self.scheduled)
    }

    fn has_live_timers(&self, queue: &RefCell<BinaryHeap<TimerEntry>>) -> bool {
        let mut heap = queue.borrow_mut();
        while matches!(heap.peek(), Some(entry) if entry.inner.is_cancelled()) {
            heap.pop();
        }
        !heap.is_empty()
    }

    fn next_deadline(&self, queue: &RefCell<BinaryHeap<TimerEntry>>) -> Option<Instant> {
        let mut heap = queue.borrow_mut();
        while matches!(heap.peek(), Some(entry) if entry.inner.is_cancelled()) {
            heap.pop();
        }
        heap.peek().map(|entry| entry.inner.deadline)
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.local_tasks.borrow().is_empty() {
            return Some(Duration::ZERO);
        }
        if !self.shared.tasks.is_empty() {
            return Some(CONCURRENT_POLL_TIMEOUT);
        }

        let nearest = match (
            self.next_deadline(&self.scheduled),
            self.next_deadline(&self.background),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        nearest.map(|deadline| {
            deadline
                .saturating_duration_since(Instant::now())
                .min(DEFAULT_POLL_TIMEOUT)
        })
    }

    // region task queues

    /// Posts a task to the *front* of the local queue: tasks posted
    /// within one tick run in reverse order of posting, before anything
    /// posted with [`post_later`](Reactor::post_later).
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.local_tasks.borrow_mut().push_front(Box::new(task));
    }

    /// Posts a task to the *back* of the local queue: tasks run in
    /// posting order, after everything posted with [`post`](Reactor::post).
    pub fn post_later(&self, task: impl FnOnce() + 'static) {
        self.local_tasks.borrow_mut().push_back(Box::new(task));
    }

    /// A `Send` handle for posting tasks from other threads.
    pub fn remote(&self) -> Remote {
        Remote {
            shared: Arc::clone(&self.shared),
        }
    }

    fn run_concurrent_tasks(&self) {
        while let Some(task) = self.shared.tasks.pop() {
            inc(&self.stats.concurrent_tasks);
            task();
        }
    }

    fn run_local_tasks(&self) {
        loop {
            let task = self.local_tasks.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    inc(&self.stats.local_tasks);
                    task();
                }
                None => break,
            }
        }
    }

    // endregion

    // region timers

    /// Schedules a task for `deadline`; never runs early.
    pub fn schedule_at(&self, deadline: Instant, task: impl FnOnce() + 'static) -> ScheduledTask {
        Self::add_timer(&self.scheduled, deadline, Box::new(task))
    }

    /// Schedules a task `delay` from the loop's current timestamp.
    pub fn delay(&self, delay: Duration, task: impl FnOnce() + 'static) -> ScheduledTask {
        self.schedule_at(self.now() + delay, task)
    }

    /// Like [`schedule_at`](Reactor::schedule_at), but the task does not
    /// keep the loop alive on its own.
    pub fn schedule_background_at(
        &self,
        deadline: Instant,
        task: impl FnOnce() + 'static,
    ) -> ScheduledTask {
        Self::add_timer(&self.background, deadline, Box::new(task))
    }

    /// Background variant of [`delay`](Reactor::delay).
    pub fn delay_background(
        &self,
        delay: Duration,
        task: impl FnOnce() + 'static,
    ) -> ScheduledTask {
        self.schedule_background_at(self.now() + delay, task)
    }

    fn add_timer(
        queue: &RefCell<BinaryHeap<TimerEntry>>,
        deadline: Instant,
        task: LocalTask,
    ) -> ScheduledTask {
        let inner = ScheduledInner::new(deadline, task);
        queue.borrow_mut().push(TimerEntry {
            inner: Rc::clone(&inner),
        });
        ScheduledTask::new(inner)
    }

    fn run_scheduled_tasks(&self, is_background: bool) {
        let queue = if is_background {
            &self.background
        } else {
            &self.scheduled
        };
        loop {
            let entry = {
                let mut heap = queue.borrow_mut();
                match heap.peek() {
                    Some(entry) if entry.inner.is_cancelled() => {
                        heap.pop();
                        continue;
                    }
                    Some(entry) if entry.inner.deadline <= self.timestamp.get() => heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            inc(if is_background {
                &self.stats.background_tasks
            } else {
                &self.stats.scheduled_tasks
            });
            entry.inner.fire();
        }
    }

    // endregion

    // region time

    /// The loop's cached timestamp, refreshed once per tick after the
    /// poll returns.
    pub fn now(&self) -> Instant {
        self.timestamp.get()
    }

    /// Completed loop iterations.
    pub fn tick(&self) -> u64 {
        self.tick.get()
    }

    // endregion

    // region I/O registry

    pub(crate) fn register_accept(
        &self,
        fd: RawFd,
        on_accept: Rc<dyn Fn(RawFd, SocketAddr)>,
    ) -> usize {
        let token = self
            .registry
            .borrow_mut()
            .insert(Registration::Accept { fd, on_accept });
        self.poller.borrow().register(
            fd,
            token,
            Interest {
                read: true,
                write: false,
            },
        );
        token
    }

    /// Adds a stream socket to the registry without arming the poller.
    /// The socket arms and disarms interests itself as its state changes.
    pub(crate) fn register_stream(&self, handler: Weak<dyn StreamHandler>) -> usize {
        self.registry
            .borrow_mut()
            .insert(Registration::Stream { handler })
    }

    pub(crate) fn poller_register(&self, fd: RawFd, token: usize, interest: Interest) {
        self.poller.borrow().register(fd, token, interest);
    }

    pub(crate) fn poller_reregister(&self, fd: RawFd, token: usize, interest: Interest) {
        self.poller.borrow().reregister(fd, token, interest);
    }

    pub(crate) fn poller_deregister(&self, fd: RawFd) {
        self.poller.borrow().deregister(fd);
    }

    /// Releases a channel: disarms the poller if needed, drops the
    /// registration and closes the descriptor.
    pub(crate) fn close_channel(&self, token: usize, fd: RawFd, polled: bool) {
        if polled {
            self.poller_deregister(fd);
        }
        self.registry.borrow_mut().remove(token);
        unix::sys_close(fd);
    }

    /// Opens a non-blocking connection to `addr`. The callback receives
    /// the connected descriptor or the failure, exactly once; an optional
    /// timeout resolves the attempt with `TimedOut`.
    pub(crate) fn connect_fd(
        self: &Rc<Self>,
        addr: SocketAddr,
        timeout: Option<Duration>,
        on_complete: Box<dyn FnOnce(io::Result<RawFd>)>,
    ) {
        let fd = match unix::sys_stream_socket(&addr) {
            Ok(fd) => fd,
            Err(error) => {
                self.post(move || on_complete(Err(error)));
                return;
            }
        };

        match unix::sys_connect(fd, &addr) {
            Ok(true) => {
                self.post(move || on_complete(Ok(fd)));
            }
            Ok(false) => {
                let token = self.registry.borrow_mut().insert(Registration::Connect {
                    fd,
                    on_complete: Some(on_complete),
                    timeout: None,
                });
                self.poller.borrow().register(
                    fd,
                    token,
                    Interest {
                        read: false,
                        write: true,
                    },
                );
                if let Some(delay) = timeout {
                    let weak = Rc::downgrade(self);
                    let timer = self.delay_background(delay, move || {
                        if let Some(reactor) = weak.upgrade() {
                            reactor.abort_connect(token, fd);
                        }
                    });
                    if let Some(Registration::Connect { timeout, .. }) =
                        self.registry.borrow_mut().get_mut(token)
                    {
                        *timeout = Some(timer);
                    }
                }
            }
            Err(error) => {
                unix::sys_close(fd);
                self.post(move || on_complete(Err(error)));
            }
        }
    }

    /// Times out a still-pending connect. A no-op when the attempt has
    /// already resolved; resolution is exclusive either way.
    fn abort_connect(&self, token: usize, fd: RawFd) {
        let on_complete = {
            let mut registry = self.registry.borrow_mut();
            match registry.get_mut(token) {
                Some(Registration::Connect {
                    fd: entry_fd,
                    on_complete,
                    ..
                }) if *entry_fd == fd => on_complete.take(),
                _ => return,
            }
        };
        self.poller_deregister(fd);
        self.registry.borrow_mut().remove(token);
        unix::sys_close(fd);
        if let Some(on_complete) = on_complete {
            on_complete(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            )));
        }
    }

    fn dispatch_io(&self) {
        let events = std::mem::take(&mut *self.events.borrow_mut());
        for event in &events {
            self.dispatch_event(event);
        }
        // Hand the buffer back so its capacity is reused next tick.
        *self.events.borrow_mut() = events;
    }

    fn dispatch_event(&self, event: &Event) {
        inc(&self.stats.selected_keys);

        let mut registry = self.registry.borrow_mut();
        match registry.get_mut(event.token) {
            None => {
                inc(&self.stats.invalid_keys);
            }

            Some(Registration::Accept { fd, on_accept }) => {
                let fd = *fd;
                let on_accept = Rc::clone(on_accept);
                drop(registry);
                inc(&self.stats.accept_keys);
                // Drain the backlog; the listener stays level-triggered
                // so anything left over resurfaces next tick.
                loop {
                    match unix::sys_accept(fd) {
                        Ok((client, peer)) => on_accept(client, peer),
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                        Err(error) => {
                            inc(&self.stats.io_errors);
                            tracing::warn!(%error, "accept failed");
                            break;
                        }
                    }
                }
            }

            Some(Registration::Connect {
                fd,
                on_complete,
                timeout,
            }) => {
                let fd = *fd;
                let on_complete = on_complete.take();
                let timer = timeout.take();
                drop(registry);
                inc(&self.stats.connect_keys);
                if let Some(timer) = timer {
                    timer.cancel();
                }
                self.poller_deregister(fd);
                self.registry.borrow_mut().remove(event.token);
                let Some(on_complete) = on_complete else { return };
                match unix::sys_take_socket_error(fd) {
                    Ok(()) => on_complete(Ok(fd)),
                    Err(error) => {
                        inc(&self.stats.io_errors);
                        unix::sys_close(fd);
                        on_complete(Err(error));
                    }
                }
            }

            Some(Registration::Stream { handler }) => {
                let handler = handler.upgrade();
                drop(registry);
                match handler {
                    Some(handler) => {
                        if event.readable {
                            inc(&self.stats.read_keys);
                            handler.on_read_ready();
                        }
                        if event.writable {
                            inc(&self.stats.write_keys);
                            handler.on_write_ready();
                        }
                    }
                    None => {
                        inc(&self.stats.invalid_keys);
                        self.registry.borrow_mut().remove(event.token);
                    }
                }
            }
        }
    }

    // endregion

    // region blocking operations

    /// Runs `job` on `executor` and feeds its result back to `callback`
    /// on the reactor thread through the concurrent queue. The loop is
    /// kept alive for the whole round trip.
    pub fn run_blocking<T, F, C>(self: &Rc<Self>, executor: &dyn BlockingExecutor, job: F, callback: C)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce(T) + 'static,
    {
        let id = self.blocking.borrow_mut().insert(Box::new(move |payload| {
            match payload.downcast::<T>() {
                Ok(value) => callback(*value),
                Err(_) => debug_assert!(false, "blocking continuation type mismatch"),
            }
        }));

        let remote = self.remote();
        let guard = remote.start_operation();
        let rejoin = remote.clone();
        executor.execute(Box::new(move || {
            let value = job();
            rejoin.post(move || {
                if let Some(reactor) = Reactor::current() {
                    reactor.finish_blocking(id, Box::new(value));
                }
                guard.complete();
            });
        }));
    }

    fn finish_blocking(&self, id: usize, payload: Box<dyn Any + Send>) {
        if let Some(continuation) = self.blocking.borrow_mut().remove(id) {
            continuation(payload);
        }
    }

    // endregion

    // region inspection and policy

    pub fn stats(&self) -> &ReactorStats {
        &self.stats
    }

    /// Attaches an adaptive throttling controller; servers on this
    /// reactor consult it on every accept.
    pub fn set_throttling(&self, throttling: Rc<ThrottlingController>) {
        *self.throttling.borrow_mut() = Some(throttling);
    }

    pub fn throttling(&self) -> Option<Rc<ThrottlingController>> {
        self.throttling.borrow().clone()
    }

    pub fn set_fatal_error_policy(&self, policy: FatalErrorPolicy) {
        *self.fatal_policy.borrow_mut() = policy;
    }

    /// Applies the configured policy to an error the hosting code deems
    /// unrecoverable. The reactor itself never calls this.
    pub fn handle_fatal_error(&self, error: &SocketError, context: &str) {
        self.fatal_policy.borrow().handle(error, context);
    }

    // endregion
}

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::Rc;
use std::time::Instant;

/// Shared state between a [`ScheduledTask`] handle and its heap entry.
pub(crate) struct ScheduledInner {
    pub(crate) deadline: Instant,
    cancelled: Cell<bool>,
    complete: Cell<bool>,
    task: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl ScheduledInner {
    pub(crate) fn new(deadline: Instant, task: Box<dyn FnOnce()>) -> Rc<ScheduledInner> {
        Rc::new(ScheduledInner {
            deadline,
            cancelled: Cell::new(false),
            complete: Cell::new(false),
            task: RefCell::new(Some(task)),
        })
    }

    /// Runs the task unless it was cancelled; either way the entry is spent.
    pub(crate) fn fire(&self) {
        if self.cancelled.get() {
            return;
        }
        // The borrow must end before the task runs: the callback may
        // reach back and cancel this very handle.
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            self.complete.set(true);
            task();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Handle to a task scheduled on the reactor's timer queue.
///
/// Cancellation is lazy: the heap entry stays in place and is skipped
/// when it surfaces, so `cancel` is O(1).
#[derive(Clone)]
pub struct ScheduledTask {
    inner: Rc<ScheduledInner>,
}

impl ScheduledTask {
    pub(crate) fn new(inner: Rc<ScheduledInner>) -> ScheduledTask {
        ScheduledTask { inner }
    }

    /// Prevents the task from running. No-op once it has run.
    pub fn cancel(&self) {
        self.inner.cancelled.set(true);
        self.inner.task.borrow_mut().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Whether the task has already run.
    pub fn is_complete(&self) -> bool {
        self.inner.complete.get()
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }
}

/// An entry in a reactor timer queue.
///
/// Ordered by deadline only, with the comparison reversed so that a
/// `BinaryHeap<TimerEntry>` behaves as a min-heap. Entries with equal
/// deadlines run in unspecified relative order.
pub(crate) struct TimerEntry {
    pub(crate) inner: Rc<ScheduledInner>,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.inner.deadline.eq(&other.inner.deadline)
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.inner.deadline.cmp(&self.inner.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

//! The boundary for blocking work.
//!
//! Nothing inside a reactor may block except the poll itself. Blocking
//! jobs leave the loop through a [`BlockingExecutor`] and rejoin through
//! the concurrent queue via [`crate::Reactor::run_blocking`].

/// Runs blocking jobs off the reactor thread.
pub trait BlockingExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// The simplest executor: one freshly spawned thread per job.
///
/// Fine for occasional work like certificate loading or DNS lookups;
/// anything high-volume deserves a real pool behind this trait.
#[derive(Default, Clone, Copy)]
pub struct ThreadPerJobExecutor;

impl BlockingExecutor for ThreadPerJobExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(job);
    }
}

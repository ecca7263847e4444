//! Deferred callback queue drained on the main thread
//!
//! Worker threads never call back into user code directly. Instead they pend
//! a job here and the main thread runs it between iterations of its own loop.
//! That keeps all user callbacks single-threaded: protocol dispatch and
//! database load completions both arrive through this funnel.
//!
//! Jobs must not block; they are glue, not workers.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use poseidon::job::JobQueue;
//!
//! let jobs = Arc::new(JobQueue::new());
//! jobs.pend(|| println!("runs on whichever thread drains the queue"));
//! assert_eq!(jobs.perform_all(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A deferred callback
pub type Job = Box<dyn FnOnce() + Send>;

/// FIFO of deferred callbacks, filled from any thread, drained from one
#[derive(Default)]
pub struct JobQueue {
    queue: Mutex<VecDeque<Job>>,
    avail: Condvar,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl JobQueue {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently queued
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether no jobs are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a job; callable from any thread
    pub fn pend(&self, job: impl FnOnce() + Send + 'static) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(Box::new(job));
        self.avail.notify_all();
    }

    /// Runs every currently queued job in FIFO order; returns how many ran
    ///
    /// Jobs run with the queue unlocked, so a job may pend further jobs;
    /// those run on the next call.
    pub fn perform_all(&self) -> usize {
        let batch: VecDeque<Job> = std::mem::take(&mut *self.queue.lock().unwrap());
        let count = batch.len();
        for job in batch {
            job();
        }
        count
    }

    /// Waits up to `timeout` for at least one job, then drains
    ///
    /// The bounded wait keeps the draining thread responsive to its own
    /// shutdown checks. Returns how many jobs ran, possibly zero.
    pub fn wait_and_perform(&self, timeout: Duration) -> usize {
        {
            let queue = self.queue.lock().unwrap();
            if queue.is_empty() {
                let _unused = self.avail.wait_timeout(queue, timeout).unwrap();
            }
        }
        self.perform_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_fifo_order() {
        let queue = JobQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            queue.pend(move || order.lock().unwrap().push(i));
        }
        assert_eq!(queue.perform_all(), 4);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_job_may_pend_another_job() {
        let queue = Arc::new(JobQueue::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let inner_queue = Arc::clone(&queue);
        let inner_ran = Arc::clone(&ran);
        queue.pend(move || {
            let ran = Arc::clone(&inner_ran);
            inner_queue.pend(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        });
        assert_eq!(queue.perform_all(), 1);
        assert_eq!(queue.perform_all(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_and_perform_wakes_on_pend() {
        let queue = Arc::new(JobQueue::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let producer_queue = Arc::clone(&queue);
        let producer_ran = Arc::clone(&ran);
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            producer_queue.pend(move || {
                producer_ran.fetch_add(1, Ordering::SeqCst);
            });
        });

        let mut total = 0;
        for _ in 0..100 {
            total += queue.wait_and_perform(Duration::from_millis(100));
            if total > 0 {
                break;
            }
        }
        producer.join().unwrap();
        assert_eq!(total, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}

//! Worker pool (spec.md §5): bounded-channel task-parallel workers for
//! per-file extraction and per-match streamdiff, with cooperative
//! cancellation.
//!
//! Grounded on `thegwan-retina::filter::Filter`-adjacent subscription
//! runners, which hand independent units of work to a fixed pool of
//! OS threads over a channel rather than a work-stealing executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Shared cooperative-cancellation flag (spec.md §5: "workers check a
/// cancellation signal between dissector invocations").
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A fixed-size pool of worker threads draining a bounded channel of
/// `Job` closures, each producing an `Output` sent back over a result
/// channel. Results are unordered; callers that need a stable order
/// re-collate by whatever index the job embeds in its output (spec.md §5:
/// "implementations must re-collate by a stable key").
pub struct WorkerPool<Output: Send + 'static> {
    job_tx: Sender<Box<dyn FnOnce() -> Output + Send>>,
    result_rx: Receiver<Output>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<Output: Send + 'static> WorkerPool<Output> {
    /// Spawns `workers` threads, each looping on the job channel until it
    /// closes. `workers` is typically [`crate::config::Config::workers`].
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (job_tx, job_rx) = bounded::<Box<dyn FnOnce() -> Output + Send>>(workers * 2);
        let (result_tx, result_rx) = bounded::<Output>(workers * 2);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let job_rx: Receiver<Box<dyn FnOnce() -> Output + Send>> = job_rx.clone();
            let result_tx = result_tx.clone();
            handles.push(thread::spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let output = job();
                    if result_tx.send(output).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        WorkerPool {
            job_tx,
            result_rx,
            handles,
        }
    }

    /// Submits one unit of work. Blocks if the job queue is full
    /// (back-pressure, not unbounded buffering).
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() -> Output + Send + 'static,
    {
        let _ = self.job_tx.send(Box::new(job));
    }

    /// Closes the job channel, waits for every in-flight job to finish, and
    /// drains every produced result.
    pub fn join(self) -> Vec<Output> {
        drop(self.job_tx);
        let mut results = Vec::new();
        while let Ok(output) = self.result_rx.recv() {
            results.push(output);
        }
        for handle in self.handles {
            let _ = handle.join();
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_runs_all_submitted_jobs() {
        let pool: WorkerPool<u32> = WorkerPool::new(4);
        for i in 0..20u32 {
            pool.submit(move || i * 2);
        }
        let mut results = pool.join();
        results.sort_unstable();
        let expected: Vec<u32> = (0..20).map(|i| i * 2).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn cancellation_token_is_observable_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}

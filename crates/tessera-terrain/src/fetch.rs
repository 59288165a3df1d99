//! Worker pool that runs tile fetches off the main thread.

use crossbeam_channel::{bounded, Sender, TrySendError};
use std::thread::JoinHandle;
use tessera_common::{TerrainError, TerrainResult};
use tracing::{debug, info};

/// A unit of work submitted to the pool.
pub type FetchJob = Box<dyn FnOnce() + Send + 'static>;

/// Executes fetch jobs on a fixed set of named worker threads.
///
/// With zero workers, jobs run inline on the submitting thread.
pub struct FetchPool {
    sender: Option<Sender<FetchJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl FetchPool {
    /// Spawns `workers` threads sharing a queue of `queue_capacity` jobs.
    pub fn new(workers: usize, queue_capacity: usize) -> TerrainResult<Self> {
        if workers == 0 {
            debug!("Fetch pool running inline");
            return Ok(Self {
                sender: None,
                workers: Vec::new(),
            });
        }

        let (sender, receiver) = bounded::<FetchJob>(queue_capacity.max(1));
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = receiver.clone();
            let name = format!("terrain-fetch-{i}");
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    for job in receiver {
                        job();
                    }
                })
                .map_err(|e| TerrainError::ThreadSpawn {
                    name,
                    reason: e.to_string(),
                })?;
            handles.push(handle);
        }

        info!("Started fetch pool with {workers} workers");
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }

    /// Creates a pool that runs every job on the submitting thread.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            sender: None,
            workers: Vec::new(),
        }
    }

    /// Submits a job without blocking.
    ///
    /// Returns `false` if the queue is full or the pool has shut down.
    pub fn submit(&self, job: FetchJob) -> bool {
        match &self.sender {
            None => {
                job();
                true
            },
            Some(sender) => match sender.try_send(job) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("Fetch queue full, deferring request");
                    false
                },
                Err(TrySendError::Disconnected(_)) => false,
            },
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Returns `true` if jobs run on the submitting thread.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.sender.is_none()
    }
}

impl Drop for FetchPool {
    fn drop(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for FetchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_inline_pool_runs_immediately() {
        let pool = FetchPool::new(0, 4).expect("pool");
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        assert!(pool.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(pool.is_inline());
    }

    #[test]
    fn test_workers_drain_queue_before_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = FetchPool::new(2, 64).expect("pool");
            assert_eq!(pool.worker_count(), 2);
            for _ in 0..32 {
                let c = Arc::clone(&counter);
                assert!(pool.submit(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_full_queue_rejects() {
        let (block_tx, block_rx) = crossbeam_channel::bounded::<()>(0);
        let pool = FetchPool::new(1, 1).expect("pool");
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        assert!(pool.submit(Box::new(move || {
            let _ = started_tx.send(());
            let _ = block_rx.recv();
        })));
        started_rx.recv().expect("worker started");
        assert!(pool.submit(Box::new(|| {})));
        assert!(!pool.submit(Box::new(|| {})));
        drop(block_tx);
    }
}

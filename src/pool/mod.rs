//! Fixed worker pool over the lock-free queue.
//!
//! The pool is an explicit process-scoped resource: create one, pass it by
//! reference to whoever offloads work, drop it to stop the workers (each
//! finishes its in-flight item first). There is deliberately no ambient
//! global pool.
//!
//! Workers are the queue's consumer side. The queue allows one logical
//! consumer, so workers serialize their pops behind a mutex; producers
//! (anyone offloading work) stay lock-free.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::queue::LockFreeQueue;

mod bridge;
mod pair;


pub use bridge::{AsyncCall, AsyncStatus};
pub(crate) use bridge::Record;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Blocks pre-seeded on the queue's free list.
    pub queue_blocks: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8);
        Self {
            workers,
            queue_blocks: 3,
        }
    }
}

/// Errors constructing a [`ThreadPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool requires at least one thread")]
    NoWorkers,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct PoolShared {
    queue: LockFreeQueue<Box<Record>>,
    /// Serializes workers on the queue's single-consumer side.
    consumer: Mutex<()>,
    stop: AtomicBool,
}

/// A fixed set of threads popping offloaded work from the shared queue.
///
/// Dropping the pool requests a stop and joins every worker; items a worker
/// already holds run to completion, still-queued records are detached
/// safely when the queue itself is dropped.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Create a pool with the given configuration.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let shared = Arc::new(PoolShared {
            queue: LockFreeQueue::with_blocks(config.queue_blocks),
            consumer: Mutex::new(()),
            stop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("coflow-worker-{id}"))
                .spawn(move || worker_loop(id, &shared))?;
            workers.push(handle);
        }

        Ok(Self { shared, workers })
    }

    /// Create a pool with `workers` threads and default queue settings.
    pub fn with_workers(workers: usize) -> Result<Self, PoolError> {
        Self::new(PoolConfig {
            workers,
            ..PoolConfig::default()
        })
    }

    /// Number of offloaded items not yet picked up by a worker.
    #[inline]
    pub fn pending(&self) -> usize {
        self.shared.queue.num()
    }

    /// Number of worker threads.
    #[inline]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn submit(&self, record: Box<Record>) {
        self.shared.queue.enqueue(record);
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.len())
            .field("pending", &self.shared.queue.num())
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, shared: &PoolShared) {
    debug!(worker = id, "pool worker started");
    let mut backoff = Backoff::new();
    while !shared.stop.load(Ordering::Relaxed) {
        let record = {
            let _consumer = shared.consumer.lock();
            // SAFETY: pops are serialized by the consumer mutex.
            unsafe { shared.queue.pop_unsync() }
        };
        match record {
            Some(record) => {
                if let Some(job) = record.forward_job() {
                    job(&record);
                }
                backoff = Backoff::new();
            }
            None => backoff.snooze(),
        }
    }
    debug!(worker = id, "pool worker stopped");
}

//! Fixed-size worker pool.
//!
//! `size` threads pull jobs from one `crossbeam-channel` queue. A job is
//! only accepted while one of the `size` slots is free; the slot is held
//! until the job has finished, so nothing ever waits in the queue behind a
//! busy worker and the queue capacity of `size` never blocks a sender.
//! Callers that get [`PoolError::Full`] retry later.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error};

/// Default number of concurrent collections.
pub const DEFAULT_POOL_SIZE: usize = 16;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Error returned when a job cannot be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is taken.
    Full,
    /// Every worker thread has exited.
    Disconnected,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Full => write!(f, "worker pool has no free slot"),
            PoolError::Disconnected => write!(f, "worker pool has no live workers"),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug, Default)]
struct PoolStats {
    /// Slots taken by accepted jobs that have not finished yet.
    reserved: AtomicUsize,
    queued: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    panics: AtomicU64,
}

/// Bounded pool of worker threads.
///
/// Dropping the pool closes the queue; workers finish what is already
/// queued and exit. Nothing waits for them.
pub struct WorkerPool {
    sender: Sender<Job>,
    stats: Arc<PoolStats>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` worker threads (at least one).
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = bounded::<Job>(size);
        let stats = Arc::new(PoolStats::default());

        for idx in 0..size {
            let receiver = receiver.clone();
            let stats = Arc::clone(&stats);
            std::thread::Builder::new()
                .name(format!("telepoll-worker-{}", idx))
                .spawn(move || worker_loop(receiver, stats))?;
        }
        debug!(size, "Worker pool started");

        Ok(Self {
            sender,
            stats,
            size,
        })
    }

    /// Hands a job to a free worker, or fails with [`PoolError::Full`].
    pub fn try_submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = self.size;
        self.stats
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < size).then_some(n + 1)
            })
            .map_err(|_| PoolError::Full)?;

        self.stats.queued.fetch_add(1, Ordering::AcqRel);
        self.sender.send(Box::new(job)).map_err(|_| {
            self.stats.queued.fetch_sub(1, Ordering::AcqRel);
            self.stats.reserved.fetch_sub(1, Ordering::AcqRel);
            PoolError::Disconnected
        })
    }

    /// Slots not taken by an unfinished job.
    pub fn available(&self) -> usize {
        self.size
            .saturating_sub(self.stats.reserved.load(Ordering::Acquire))
    }

    /// Maximum number of jobs executing at once.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::Acquire)
    }

    /// Jobs accepted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.stats.queued.load(Ordering::Acquire)
    }

    /// Highest number of jobs ever executing at once.
    pub fn peak(&self) -> usize {
        self.stats.peak.load(Ordering::Acquire)
    }

    /// Jobs that panicked.
    pub fn panics(&self) -> u64 {
        self.stats.panics.load(Ordering::Acquire)
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("active", &self.active())
            .field("queued", &self.queued())
            .finish()
    }
}

fn worker_loop(receiver: Receiver<Job>, stats: Arc<PoolStats>) {
    while let Ok(job) = receiver.recv() {
        stats.queued.fetch_sub(1, Ordering::AcqRel);
        let running = stats.active.fetch_add(1, Ordering::AcqRel) + 1;
        stats.peak.fetch_max(running, Ordering::AcqRel);

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            stats.panics.fetch_add(1, Ordering::Relaxed);
            error!(location = "worker_loop", "Worker job panicked");
        }

        stats.active.fetch_sub(1, Ordering::AcqRel);
        stats.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Retries until a slot frees up.
    fn submit_blocking(pool: &WorkerPool, job: impl Fn() + Send + Sync + 'static) {
        let job = Arc::new(job);
        loop {
            let attempt = Arc::clone(&job);
            match pool.try_submit(move || attempt()) {
                Ok(()) => return,
                Err(PoolError::Full) => std::thread::sleep(Duration::from_millis(2)),
                Err(e) => panic!("submit failed: {}", e),
            }
        }
    }

    #[test]
    fn test_concurrency_never_exceeds_size() {
        let pool = WorkerPool::new(4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let done = Arc::clone(&done);
            submit_blocking(&pool, move || {
                std::thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 20));
        assert!(pool.peak() <= 4);
        assert!(pool.peak() >= 1);
        assert!(wait_until(Duration::from_secs(1), || pool.available() == 4));
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_full_pool_rejects_until_a_job_finishes() {
        let pool = WorkerPool::new(2).unwrap();
        let gate = Arc::new(Barrier::new(3));

        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            pool.try_submit(move || {
                gate.wait();
            })
            .unwrap();
        }
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.try_submit(|| {}), Err(PoolError::Full));

        gate.wait();
        assert!(wait_until(Duration::from_secs(1), || pool.available() == 2));
        assert!(pool.try_submit(|| {}).is_ok());
    }

    #[test]
    fn test_all_workers_run_in_parallel() {
        let pool = WorkerPool::new(3).unwrap();
        let barrier = Arc::new(Barrier::new(4));

        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            pool.try_submit(move || {
                barrier.wait();
            })
            .unwrap();
        }

        // Only returns once all three jobs are running at the same time.
        barrier.wait();
        assert!(wait_until(Duration::from_secs(1), || pool.peak() == 3));
    }

    #[test]
    fn test_panicking_job_frees_its_slot() {
        let pool = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.try_submit(|| panic!("boom")).unwrap();
        assert!(wait_until(Duration::from_secs(2), || pool.panics() == 1));
        assert!(wait_until(Duration::from_secs(1), || pool.available() == 1));

        let r = Arc::clone(&ran);
        pool.try_submit(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(wait_until(Duration::from_secs(2), || ran.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_zero_size_is_one() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.available(), 1);
    }
}

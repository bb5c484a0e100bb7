//! Collection scheduler.
//!
//! A single control loop scans every device's sensors in order, hands due
//! sensors to a bounded [`WorkerPool`] and sleeps until the next known due
//! time, clamped to `[MIN_SLEEP, MAX_SLEEP]`. A due sensor is only claimed
//! while the pool has a free slot; otherwise it stays due and unclaimed and
//! the loop looks again after `MIN_SLEEP`.
//!
//! ```text
//!            start()                 stop()              loop exits
//! Stopped ──────────────► Running ──────────► Stopping ─────────────► Stopped
//! ```
//!
//! Ownership of the per-sensor flags is split: only the loop sets
//! `in_flight` (by compare-and-swap), only the worker running the cycle
//! clears it and moves the next due time.
//!
//! `stop()` does not wait. Cycles already handed to the pool run to
//! completion; callers that need quiescence poll the sensors' in-flight
//! flags.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace};

use crate::device::Device;
use crate::pool::{PoolError, WorkerPool};
use crate::ports::Ports;
use crate::task::run_collection;

/// Shortest sleep between ticks.
pub const MIN_SLEEP: Duration = Duration::from_millis(1);
/// Longest sleep between ticks; bounds the reaction time to `stop()` and
/// to newly enabled sensors.
pub const MAX_SLEEP: Duration = Duration::from_millis(1000);

/// Device list shared between the project and the scheduler.
///
/// Structural changes are only allowed while the scheduler is stopped.
pub(crate) type DeviceList = Arc<RwLock<Vec<Device>>>;

/// Loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    /// Stop was requested but a loop has not exited yet.
    Stopping,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Live counters, updated by the loop and the workers.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub(crate) ticks: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) collected: AtomicU64,
    pub(crate) failed: AtomicU64,
    /// Collected values the data store rejected.
    pub(crate) persist_failed: AtomicU64,
    /// Due sensors left for a later tick because the pool was full.
    pub(crate) deferred: AtomicU64,
    pub(crate) tick_errors: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    pub collected: u64,
    pub failed: u64,
    pub persist_failed: u64,
    pub deferred: u64,
    pub tick_errors: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            persist_failed: self.persist_failed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            tick_errors: self.tick_errors.load(Ordering::Relaxed),
        }
    }
}

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sensors handed to the pool.
    pub dispatched: usize,
    /// Due sensors skipped because every pool slot was taken.
    pub deferred: usize,
    /// Earliest due time among enabled, idle sensors that were not
    /// dispatched; the scan time itself if any were deferred.
    pub next_due: Option<DateTime<Utc>>,
    /// The scan stopped early because a stop was requested.
    pub aborted: bool,
}

/// Sleep before the next tick: time until `next_due`, clamped.
pub fn sleep_duration(now: DateTime<Utc>, next_due: Option<DateTime<Utc>>) -> Duration {
    let Some(next_due) = next_due else {
        return MAX_SLEEP;
    };
    let wait_ms = (next_due - now).num_milliseconds();
    let wait = Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0));
    wait.clamp(MIN_SLEEP, MAX_SLEEP)
}

struct Shared {
    devices: DeviceList,
    ports: Ports,
    pool: WorkerPool,
    running: AtomicBool,
    /// Bumped by every start; a loop only runs while its generation is current.
    generation: AtomicU64,
    live_loops: AtomicUsize,
    stats: Arc<SchedulerStats>,
    #[cfg(test)]
    scan_hook: std::sync::Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Shared {
    fn keep_running(&self, generation: Option<u64>) -> bool {
        match generation {
            None => true,
            Some(g) => {
                self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == g
            }
        }
    }

    fn scan(&self, now: DateTime<Utc>, generation: Option<u64>) -> TickReport {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        #[cfg(test)]
        if let Some(hook) = self
            .scan_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            hook();
        }
        let now_ms = now.timestamp_millis();
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);

        let mut report = TickReport::default();
        let mut next_due_ms: Option<i64> = None;

        'scan: for device in devices.iter() {
            for sensor in device.sensors() {
                if !self.keep_running(generation) {
                    report.aborted = true;
                    break 'scan;
                }
                if !sensor.is_enabled() || sensor.is_in_flight() {
                    continue;
                }

                let due_ms = sensor.next_collect_millis();
                if due_ms > now_ms {
                    next_due_ms = Some(next_due_ms.map_or(due_ms, |n| n.min(due_ms)));
                    continue;
                }

                if self.pool.available() == 0 {
                    report.deferred += 1;
                    continue;
                }
                if !sensor.try_begin() {
                    continue;
                }
                let job_sensor = Arc::clone(sensor);
                let ports = self.ports.clone();
                let stats = Arc::clone(&self.stats);
                let submitted = self.pool.try_submit(move || {
                    run_collection(&job_sensor, &ports, &stats);
                });
                match submitted {
                    Ok(()) => {
                        report.dispatched += 1;
                        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                        trace!(sensor = sensor.identity(), device = device.identity(), "Dispatched");
                    }
                    Err(PoolError::Full) => {
                        sensor.abort();
                        report.deferred += 1;
                    }
                    Err(e) => {
                        sensor.abort();
                        error!(
                            location = "dispatch",
                            sensor = sensor.identity(),
                            error = %e,
                            "Failed to dispatch collection"
                        );
                    }
                }
            }
        }

        if report.deferred > 0 {
            self.stats
                .deferred
                .fetch_add(report.deferred as u64, Ordering::Relaxed);
            next_due_ms = Some(now_ms);
        }
        report.next_due = next_due_ms.and_then(DateTime::from_timestamp_millis);
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_loop(shared: &Shared, generation: u64) {
    info!(generation, pool_size = shared.pool.size(), "Collection loop started");

    while shared.keep_running(Some(generation)) {
        let now = Utc::now();
        let report = match catch_unwind(AssertUnwindSafe(|| shared.scan(now, Some(generation)))) {
            Ok(report) => report,
            Err(payload) => {
                shared.stats.tick_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    location = "collection_loop",
                    error = %panic_message(payload.as_ref()),
                    "Tick failed"
                );
                TickReport::default()
            }
        };

        if !shared.keep_running(Some(generation)) {
            break;
        }

        let sleep = sleep_duration(Utc::now(), report.next_due);
        if report.dispatched > 0 || report.deferred > 0 {
            debug!(
                dispatched = report.dispatched,
                deferred = report.deferred,
                sleep_ms = sleep.as_millis() as u64,
                "Tick completed"
            );
        }
        std::thread::sleep(sleep);
    }

    info!(generation, "Collection loop stopped");
}

/// Drives periodic collection of every enabled sensor.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub(crate) fn new(devices: DeviceList, ports: Ports, pool_size: usize) -> std::io::Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                devices,
                ports,
                pool: WorkerPool::new(pool_size)?,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                live_loops: AtomicUsize::new(0),
                stats: Arc::new(SchedulerStats::default()),
                #[cfg(test)]
                scan_hook: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Spawns the control loop unless one is already running.
    ///
    /// Returns `true` if a loop was spawned.
    pub fn start(&self) -> bool {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Scheduler already running");
            return false;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let shared = Arc::clone(&self.shared);
        shared.live_loops.fetch_add(1, Ordering::AcqRel);

        let spawned = std::thread::Builder::new()
            .name("telepoll-scheduler".to_string())
            .spawn(move || {
                run_loop(&shared, generation);
                shared.live_loops.fetch_sub(1, Ordering::AcqRel);
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                self.shared.live_loops.fetch_sub(1, Ordering::AcqRel);
                self.shared.running.store(false, Ordering::Release);
                error!(location = "start", error = %e, "Failed to spawn collection loop");
                false
            }
        }
    }

    /// Requests the loop to stop. Returns immediately.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            info!("Collection loop stop requested");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SchedulerState {
        if self.is_running() {
            SchedulerState::Running
        } else if self.shared.live_loops.load(Ordering::Acquire) > 0 {
            SchedulerState::Stopping
        } else {
            SchedulerState::Stopped
        }
    }

    /// Runs one scan at `now` on the calling thread, ignoring the stop flag.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.shared.scan(now, None)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    /// Installs a callback run at the start of every scan.
    #[cfg(test)]
    fn set_scan_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self
            .shared
            .scan_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("pool", &self.shared.pool)
            .finish()
    }
}

//! One sensor's collection cycle: collect, evaluate/notify, persist,
//! reschedule.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::ports::Ports;
use crate::scheduler::SchedulerStats;
use crate::sensor::{NotificationState, Sensor};

/// Result of a single cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Outcome {
    Collected(f64),
    Failed,
}

/// Reschedules the sensor and releases its claim when dropped, so the
/// bookkeeping also happens when a port panics mid-cycle.
struct Reschedule<'a> {
    sensor: &'a Sensor,
    started: DateTime<Utc>,
}

impl Drop for Reschedule<'_> {
    fn drop(&mut self) {
        self.sensor.finish(self.started);
    }
}

fn device_name(sensor: &Sensor) -> String {
    sensor
        .device()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

/// Runs one cycle for a sensor already claimed via `try_begin`.
pub(crate) fn run_collection(sensor: &Sensor, ports: &Ports, stats: &SchedulerStats) -> Outcome {
    let started = Utc::now();
    let _reschedule = Reschedule { sensor, started };

    let value = match sensor.collect() {
        Ok(v) => v,
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                location = "collect",
                sensor = sensor.identity(),
                name = sensor.name(),
                device = %device_name(sensor),
                kind = sensor.probe().kind(),
                error = %e,
                "Collection failed"
            );
            return Outcome::Failed;
        }
    };
    let timestamp = Utc::now();

    let notified = catch_unwind(AssertUnwindSafe(|| {
        evaluate_and_notify(sensor, ports, timestamp, value)
    }));
    if notified.is_err() {
        error!(
            location = "notify",
            sensor = sensor.identity(),
            "Notification port panicked"
        );
    }

    match ports.store.write(sensor.identity(), timestamp, value) {
        Ok(()) => {
            stats.collected.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            stats.persist_failed.fetch_add(1, Ordering::Relaxed);
            error!(
                location = "persist",
                sensor = sensor.identity(),
                name = sensor.name(),
                error = %e,
                "Failed to persist value"
            );
        }
    }
    debug!(
        sensor = sensor.identity(),
        value,
        duration_ms = (Utc::now() - started).num_milliseconds(),
        "Collection succeeded"
    );
    Outcome::Collected(value)
}

fn evaluate_and_notify(sensor: &Sensor, ports: &Ports, timestamp: DateTime<Utc>, value: f64) {
    let state = ports.notifier.evaluate(sensor, timestamp, value);
    let previous = sensor.swap_state(state);
    if state == previous {
        return;
    }

    let message = match state {
        NotificationState::Normal => format!(
            "{} returned to normal (was {}), value {}",
            sensor.name(),
            previous,
            value
        ),
        _ => format!("{} is {}, value {}", sensor.name(), state, value),
    };
    ports
        .notifier
        .notify(sensor, state, timestamp, value, &message);
}

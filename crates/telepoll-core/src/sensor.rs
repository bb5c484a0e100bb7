//! Sensor data model.
//!
//! A [`Sensor`] couples a measurement capability ([`Probe`]) with the
//! scheduling state the collection loop needs: the enabled flag, the
//! in-flight flag and the next due time. The scheduling fields are atomics
//! so that the loop thread and the worker threads observe each other's
//! writes without a lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceContext;
use crate::probes::ProbeConfig;

/// Shortest interval a sensor may be configured with.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Errors produced by a single collection attempt.
#[derive(Debug)]
pub enum CollectError {
    /// I/O error while reading the measured resource.
    Io(std::io::Error),
    /// The resource was read but its content could not be interpreted.
    Parse(String),
    /// The measured resource does not exist.
    NotFound(String),
    /// The owning device was discarded while the sensor was still scheduled.
    DeviceGone,
    /// The measurement is not available on this platform.
    Unsupported(String),
    /// Any other probe-specific failure.
    Other(String),
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::Io(e) => write!(f, "I/O error: {}", e),
            CollectError::Parse(msg) => write!(f, "parse error: {}", msg),
            CollectError::NotFound(what) => write!(f, "not found: {}", what),
            CollectError::DeviceGone => write!(f, "owning device no longer exists"),
            CollectError::Unsupported(msg) => write!(f, "unsupported: {}", msg),
            CollectError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CollectError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            CollectError::NotFound(e.to_string())
        } else {
            CollectError::Io(e)
        }
    }
}

/// Outcome of evaluating a value against a sensor's thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl NotificationState {
    fn as_u8(self) -> u8 {
        match self {
            NotificationState::Normal => 0,
            NotificationState::Warning => 1,
            NotificationState::Critical => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => NotificationState::Warning,
            2 => NotificationState::Critical,
            _ => NotificationState::Normal,
        }
    }
}

impl fmt::Display for NotificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationState::Normal => "normal",
            NotificationState::Warning => "warning",
            NotificationState::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Alarm thresholds for a sensor. Unset bounds never trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub high_warning: Option<f64>,
    pub high_critical: Option<f64>,
    pub low_warning: Option<f64>,
    pub low_critical: Option<f64>,
}

impl Thresholds {
    /// Classifies a value. Critical bounds win over warning bounds.
    pub fn evaluate(&self, value: f64) -> NotificationState {
        let above = |limit: Option<f64>| limit.is_some_and(|l| value >= l);
        let below = |limit: Option<f64>| limit.is_some_and(|l| value <= l);

        if above(self.high_critical) || below(self.low_critical) {
            NotificationState::Critical
        } else if above(self.high_warning) || below(self.low_warning) {
            NotificationState::Warning
        } else {
            NotificationState::Normal
        }
    }
}

/// Measurement capability of a sensor.
///
/// Implementations must not touch scheduling state; they only produce a
/// value or fail. New sensor kinds are added by implementing this trait.
pub trait Probe: Send + Sync {
    /// Takes one measurement using the owning device's connection context.
    fn collect(&self, device: &DeviceContext) -> Result<f64, CollectError>;

    /// Short name of the probe kind, used in logs.
    fn kind(&self) -> &'static str;

    /// Serialisable description of this probe, if it has one.
    fn config(&self) -> Option<ProbeConfig> {
        None
    }
}

/// A single polled metric source.
pub struct Sensor {
    identity: u32,
    name: String,
    interval: Duration,
    thresholds: Thresholds,
    device: Weak<DeviceContext>,
    probe: Box<dyn Probe>,
    enabled: AtomicBool,
    in_flight: AtomicBool,
    /// Next due time in epoch milliseconds.
    next_collect_ms: AtomicI64,
    last_state: AtomicU8,
}

impl Sensor {
    /// Creates an unbound sensor, due immediately.
    ///
    /// Identity and device are assigned when the sensor is added to a project.
    pub fn new(name: impl Into<String>, interval: Duration, probe: Box<dyn Probe>) -> Self {
        let interval = if interval < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL, "Sensor interval below minimum, clamping");
            MIN_INTERVAL
        } else {
            interval
        };

        Self {
            identity: 0,
            name: name.into(),
            interval,
            thresholds: Thresholds::default(),
            device: Weak::new(),
            probe,
            enabled: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
            next_collect_ms: AtomicI64::new(0),
            last_state: AtomicU8::new(NotificationState::Normal.as_u8()),
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        self.enabled.store(enabled, Ordering::Relaxed);
        self
    }

    /// Sets the first due time (default: due immediately).
    pub fn with_next_collect(self, at: DateTime<Utc>) -> Self {
        self.next_collect_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
        self
    }

    pub(crate) fn bind(&mut self, identity: u32, device: &Arc<DeviceContext>) {
        self.identity = identity;
        self.device = Arc::downgrade(device);
    }

    pub fn identity(&self) -> u32 {
        self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn probe(&self) -> &dyn Probe {
        self.probe.as_ref()
    }

    /// Owning device context, if it still exists.
    pub fn device(&self) -> Option<Arc<DeviceContext>> {
        self.device.upgrade()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enables or disables the sensor. Takes effect on the next tick.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// True exactly while a collection cycle for this sensor holds a worker
    /// slot.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn next_collect_millis(&self) -> i64 {
        self.next_collect_ms.load(Ordering::Acquire)
    }

    pub fn next_collect_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.next_collect_millis())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// State recorded by the last successful evaluation.
    pub fn last_state(&self) -> NotificationState {
        NotificationState::from_u8(self.last_state.load(Ordering::Acquire))
    }

    /// Records a new state and returns the previous one.
    pub(crate) fn swap_state(&self, state: NotificationState) -> NotificationState {
        NotificationState::from_u8(self.last_state.swap(state.as_u8(), Ordering::AcqRel))
    }

    /// Claims the sensor for one collection cycle.
    ///
    /// Returns `false` if a cycle is already in flight.
    pub(crate) fn try_begin(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases a claim without rescheduling (dispatch never happened).
    pub(crate) fn abort(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    /// Reschedules relative to the attempt start and releases the claim.
    ///
    /// The next due time is published before the flag is cleared so the
    /// loop never sees a released sensor with its old due time.
    pub(crate) fn finish(&self, started: DateTime<Utc>) {
        let interval_ms = i64::try_from(self.interval.as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        let next = started.timestamp_millis().saturating_add(interval_ms);
        self.next_collect_ms.store(next, Ordering::Release);
        self.in_flight.store(false, Ordering::Release);
    }

    /// Takes one measurement through the probe.
    pub fn collect(&self) -> Result<f64, CollectError> {
        let device = self.device().ok_or(CollectError::DeviceGone)?;
        self.probe.collect(&device)
    }
}

impl fmt::Debug for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sensor")
            .field("identity", &self.identity)
            .field("name", &self.name)
            .field("kind", &self.probe.kind())
            .field("interval", &self.interval)
            .field("enabled", &self.is_enabled())
            .field("in_flight", &self.is_in_flight())
            .field("next_collect", &self.next_collect_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(f64);

    impl Probe for Constant {
        fn collect(&self, _device: &DeviceContext) -> Result<f64, CollectError> {
            Ok(self.0)
        }

        fn kind(&self) -> &'static str {
            "constant"
        }
    }

    fn bound_sensor(ctx: &Arc<DeviceContext>) -> Sensor {
        let mut s = Sensor::new("c", Duration::from_secs(5), Box::new(Constant(7.0)));
        s.bind(3, ctx);
        s
    }

    #[test]
    fn test_try_begin_is_exclusive() {
        let ctx = Arc::new(DeviceContext::new(1, "local", "localhost"));
        let s = bound_sensor(&ctx);

        assert!(s.try_begin());
        assert!(!s.try_begin());
        assert!(s.is_in_flight());

        s.finish(Utc::now());
        assert!(!s.is_in_flight());
        assert!(s.try_begin());
    }

    #[test]
    fn test_finish_anchors_on_start_time() {
        let ctx = Arc::new(DeviceContext::new(1, "local", "localhost"));
        let s = bound_sensor(&ctx);
        let started = Utc::now();

        assert!(s.try_begin());
        s.finish(started);

        assert_eq!(
            s.next_collect_millis(),
            started.timestamp_millis() + 5_000
        );
        assert!(s.next_collect_time() > started);
    }

    #[test]
    fn test_collect_needs_device() {
        let s = Sensor::new("orphan", Duration::from_secs(1), Box::new(Constant(1.0)));
        assert!(matches!(s.collect(), Err(CollectError::DeviceGone)));

        let ctx = Arc::new(DeviceContext::new(1, "local", "localhost"));
        let s = bound_sensor(&ctx);
        assert_eq!(s.collect().unwrap(), 7.0);
        drop(ctx);
        assert!(matches!(s.collect(), Err(CollectError::DeviceGone)));
    }

    #[test]
    fn test_interval_clamped() {
        let s = Sensor::new("fast", Duration::ZERO, Box::new(Constant(1.0)));
        assert_eq!(s.interval(), MIN_INTERVAL);
    }

    #[test]
    fn test_thresholds() {
        let t = Thresholds {
            high_warning: Some(80.0),
            high_critical: Some(95.0),
            low_warning: None,
            low_critical: Some(1.0),
        };
        assert_eq!(t.evaluate(50.0), NotificationState::Normal);
        assert_eq!(t.evaluate(80.0), NotificationState::Warning);
        assert_eq!(t.evaluate(99.0), NotificationState::Critical);
        assert_eq!(t.evaluate(0.5), NotificationState::Critical);
        assert_eq!(Thresholds::default().evaluate(1e9), NotificationState::Normal);
    }

    #[test]
    fn test_swap_state() {
        let s = Sensor::new("s", Duration::from_secs(1), Box::new(Constant(1.0)));
        assert_eq!(s.last_state(), NotificationState::Normal);
        assert_eq!(s.swap_state(NotificationState::Critical), NotificationState::Normal);
        assert_eq!(s.last_state(), NotificationState::Critical);
    }
}

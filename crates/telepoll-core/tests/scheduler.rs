use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;

use telepoll_core::{
    CollectError, DeviceContext, MemoryStore, OutboxNotifier, Ports, Probe, Project,
    ProjectOptions, SchedulerState, Sensor,
};

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

fn project(pool_size: usize) -> (Project, Arc<MemoryStore>, TempDir) {
    let outbox = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let ports = Ports::new(Arc::new(OutboxNotifier::new(outbox.path())), store.clone());
    let options = ProjectOptions {
        pool_size,
        ..ProjectOptions::default()
    };
    (Project::new(ports, options).unwrap(), store, outbox)
}

/// Sleeps, tracking how many collections run at once across all sensors.
struct Busy {
    delay: Duration,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Probe for Busy {
    fn collect(&self, _device: &DeviceContext) -> Result<f64, CollectError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(1.0)
    }

    fn kind(&self) -> &'static str {
        "busy"
    }
}

/// Flags an overlap if it is entered while a previous call is still inside.
struct Exclusive {
    inside: AtomicBool,
    overlaps: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl Exclusive {
    fn new(overlaps: &Arc<AtomicUsize>, calls: &Arc<AtomicUsize>) -> Self {
        Self {
            inside: AtomicBool::new(false),
            overlaps: Arc::clone(overlaps),
            calls: Arc::clone(calls),
        }
    }
}

impl Probe for Exclusive {
    fn collect(&self, _device: &DeviceContext) -> Result<f64, CollectError> {
        if self.inside.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        self.inside.store(false, Ordering::SeqCst);
        Ok(0.0)
    }

    fn kind(&self) -> &'static str {
        "exclusive"
    }
}

struct Healthy;

impl Probe for Healthy {
    fn collect(&self, _device: &DeviceContext) -> Result<f64, CollectError> {
        Ok(42.0)
    }

    fn kind(&self) -> &'static str {
        "healthy"
    }
}

struct AlwaysFails;

impl Probe for AlwaysFails {
    fn collect(&self, _device: &DeviceContext) -> Result<f64, CollectError> {
        Err(CollectError::NotFound("/var/log/missing.log".to_string()))
    }

    fn kind(&self) -> &'static str {
        "always_fails"
    }
}

#[test]
fn twenty_due_sensors_share_a_pool_of_sixteen() {
    let (mut project, store, _outbox) = project(16);
    let device = project.add_device("bulk", "localhost", None).unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..20 {
        let probe = Busy {
            delay: Duration::from_millis(300),
            running: Arc::clone(&running),
            peak: Arc::clone(&peak),
        };
        let sensor = Sensor::new(format!("s{}", i), Duration::from_secs(3600), Box::new(probe));
        project.add_sensor(device, sensor).unwrap();
    }

    let done = AtomicBool::new(false);
    let in_flight_peak = std::thread::scope(|scope| {
        let sampler = scope.spawn(|| {
            let mut max = 0;
            while !done.load(Ordering::SeqCst) {
                max = max.max(project.in_flight());
                std::thread::sleep(Duration::from_millis(1));
            }
            max
        });

        assert!(project.start());
        let finished = wait_until(Duration::from_secs(5), || store.total() == 20);
        done.store(true, Ordering::SeqCst);
        assert!(finished);
        sampler.join().unwrap()
    });
    project.stop();
    assert!(project.wait_idle(Duration::from_secs(3)));

    assert!(in_flight_peak <= 16, "in flight peaked at {}", in_flight_peak);
    assert!(in_flight_peak > 0);
    assert!(peak.load(Ordering::SeqCst) <= 16);
    assert!(project.scheduler().pool().peak() <= 16);
    assert!(project.stats().deferred >= 4);
    for sensor in project.sensors() {
        assert_eq!(store.len(sensor.identity()), 1);
        assert!(!sensor.is_in_flight());
    }
}

#[test]
fn failing_sensor_does_not_stall_healthy_one() {
    let (mut project, store, _outbox) = project(4);
    let device = project.add_device("mixed", "localhost", None).unwrap();
    let b = project
        .add_sensor(device, Sensor::new("b", Duration::from_millis(20), Box::new(Healthy)))
        .unwrap();
    let c = project
        .add_sensor(device, Sensor::new("c", Duration::from_millis(20), Box::new(AlwaysFails)))
        .unwrap();
    let started = Utc::now();

    assert!(project.start());
    assert!(wait_until(Duration::from_secs(3), || store.len(b.identity()) >= 5));
    assert_eq!(project.state(), SchedulerState::Running);

    project.stop();
    assert!(project.wait_idle(Duration::from_secs(3)));

    assert_eq!(store.len(c.identity()), 0);
    assert!(!c.is_in_flight());
    assert!(c.next_collect_time() > started);
    let stats = project.stats();
    assert!(stats.failed >= 1);
    assert!(stats.collected >= 5);
}

#[test]
fn sensor_is_never_collected_twice_at_once() {
    let (mut project, _store, _outbox) = project(8);
    let device = project.add_device("tight", "localhost", None).unwrap();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    for i in 0..4 {
        let probe = Exclusive::new(&overlaps, &calls);
        let sensor = Sensor::new(format!("x{}", i), Duration::from_millis(1), Box::new(probe));
        project.add_sensor(device, sensor).unwrap();
    }

    assert!(project.start());
    std::thread::sleep(Duration::from_millis(400));
    project.stop();
    assert!(project.wait_idle(Duration::from_secs(3)));

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(calls.load(Ordering::SeqCst) > 4);
}

#[test]
fn newly_enabled_sensor_is_collected_within_a_second() {
    let (mut project, store, _outbox) = project(2);
    let device = project.add_device("late", "localhost", None).unwrap();
    let sensor = project
        .add_sensor(
            device,
            Sensor::new("late", Duration::from_secs(3600), Box::new(Healthy)).with_enabled(false),
        )
        .unwrap();

    assert!(project.start());
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(store.len(sensor.identity()), 0);

    let enabled_at = Instant::now();
    sensor.set_enabled(true);
    assert!(wait_until(Duration::from_secs(3), || store.len(sensor.identity()) == 1));
    assert!(enabled_at.elapsed() < Duration::from_millis(1500));

    project.stop();
    assert!(project.wait_idle(Duration::from_secs(3)));
}

#[test]
fn repeated_start_keeps_one_loop() {
    let (mut project, _store, _outbox) = project(4);
    let device = project.add_device("idem", "localhost", None).unwrap();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let sensor = Sensor::new(
        "idem",
        Duration::from_millis(200),
        Box::new(Exclusive::new(&overlaps, &calls)),
    );
    project.add_sensor(device, sensor).unwrap();

    assert!(project.start());
    assert!(!project.start());
    assert!(!project.start());
    std::thread::sleep(Duration::from_millis(1000));
    project.stop();
    assert!(project.wait_idle(Duration::from_secs(3)));

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let collected = project.stats().collected;
    assert!(collected >= 2, "collected {}", collected);
    assert!(collected <= 7, "collected {}", collected);
}

#[test]
fn stop_then_start_resumes_collection() {
    let (mut project, store, _outbox) = project(2);
    let device = project.add_device("cycle", "localhost", None).unwrap();
    let sensor = project
        .add_sensor(device, Sensor::new("cycle", Duration::from_millis(10), Box::new(Healthy)))
        .unwrap();

    assert!(project.start());
    project.stop();
    assert!(project.start());
    assert!(wait_until(Duration::from_secs(3), || store.len(sensor.identity()) >= 3));

    project.stop();
    assert!(project.wait_idle(Duration::from_secs(3)));
    assert_eq!(project.state(), SchedulerState::Stopped);

    let settled = store.len(sensor.identity());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(store.len(sensor.identity()), settled);
}

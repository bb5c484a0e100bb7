//! Project context: the device graph, the scheduler and the two ports.
//!
//! Structural changes (adding or removing devices and sensors) are only
//! accepted while the scheduler is fully stopped. Identities are handed out
//! from monotonically increasing counters and never reused.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, warn};

use crate::config::{
    ConfigError, DeviceConfig, ProjectConfig, ProjectSettings, SensorConfig, TimeZonePreference,
};
use crate::device::{Credentials, Device, DeviceContext};
use crate::fs::{FileSystem, RealFs};
use crate::pool::DEFAULT_POOL_SIZE;
use crate::ports::{Ports, StoreError};
use crate::report::{HttpVerb, Table};
use crate::scheduler::{DeviceList, Scheduler, SchedulerState, StatsSnapshot};
use crate::sensor::Sensor;

const REPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum ProjectError {
    /// The operation needs a stopped scheduler.
    Running,
    UnknownDevice(u32),
    /// The worker pool could not be spawned.
    Spawn(std::io::Error),
}

impl fmt::Display for ProjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectError::Running => write!(f, "project must be stopped for structural changes"),
            ProjectError::UnknownDevice(id) => write!(f, "unknown device {}", id),
            ProjectError::Spawn(e) => write!(f, "failed to spawn worker pool: {}", e),
        }
    }
}

impl std::error::Error for ProjectError {}

/// Runtime options that are not part of the saved configuration.
#[derive(Clone)]
pub struct ProjectOptions {
    pub pool_size: usize,
    /// Filesystem handed to probes rebuilt from configuration.
    pub fs: Arc<dyn FileSystem>,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            fs: Arc::new(RealFs::new()),
        }
    }
}

impl fmt::Debug for ProjectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectOptions")
            .field("pool_size", &self.pool_size)
            .finish_non_exhaustive()
    }
}

pub struct Project {
    devices: DeviceList,
    scheduler: Scheduler,
    ports: Ports,
    settings: ProjectSettings,
    next_sensor_id: u32,
    next_device_id: u32,
}

impl Project {
    /// Creates an empty, stopped project.
    pub fn new(ports: Ports, options: ProjectOptions) -> Result<Self, ProjectError> {
        let devices = DeviceList::default();
        let scheduler = Scheduler::new(Arc::clone(&devices), ports.clone(), options.pool_size)
            .map_err(ProjectError::Spawn)?;

        Ok(Self {
            devices,
            scheduler,
            ports,
            settings: ProjectSettings::default(),
            next_sensor_id: 1,
            next_device_id: 1,
        })
    }

    pub fn with_settings(mut self, settings: ProjectSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &ProjectSettings {
        &self.settings
    }

    /// Builds a stopped project from its saved form.
    ///
    /// Missing or duplicate identities are re-numbered and the counters are
    /// advanced past every identity present.
    pub fn from_config(
        config: ProjectConfig,
        ports: Ports,
        options: ProjectOptions,
    ) -> Result<Self, ProjectError> {
        let fs = Arc::clone(&options.fs);
        let mut project = Self::new(ports, options)?.with_settings(config.settings);

        let max_device = config.devices.iter().map(|d| d.identity).max().unwrap_or(0);
        let max_sensor = config
            .devices
            .iter()
            .flat_map(|d| d.sensors.iter().map(|s| s.identity))
            .max()
            .unwrap_or(0);
        project.next_device_id = config.next_device_id.max(max_device.saturating_add(1)).max(1);
        project.next_sensor_id = config.next_sensor_id.max(max_sensor.saturating_add(1)).max(1);

        let mut seen_devices = Vec::new();
        let mut seen_sensors = Vec::new();
        let mut devices = Vec::with_capacity(config.devices.len());

        for dc in config.devices {
            let identity = project.claim_identity(dc.identity, &mut seen_devices, false);
            let mut context = DeviceContext::new(identity, dc.name, dc.host);
            if let Some(username) = dc.username {
                context = context.with_credentials(Credentials {
                    username,
                    password: dc.password.unwrap_or_default(),
                    domain: dc.domain,
                });
            }

            let mut device = Device::new(context);
            for sc in dc.sensors {
                let sensor_id = project.claim_identity(sc.identity, &mut seen_sensors, true);
                let sensor = Sensor::new(
                    sc.name,
                    Duration::from_millis(sc.interval_ms),
                    sc.probe.into_probe_with(Arc::clone(&fs)),
                )
                .with_thresholds(sc.thresholds)
                .with_enabled(sc.enabled);
                device.attach(sensor_id, sensor);
            }
            devices.push(device);
        }

        *project.devices.write().unwrap_or_else(PoisonError::into_inner) = devices;
        info!(
            devices = project.device_count(),
            sensors = project.sensor_count(),
            "Project loaded"
        );
        Ok(project)
    }

    /// Loads a project file, falling back to an empty project if it cannot
    /// be read or parsed.
    pub fn load(path: &Path, ports: Ports, options: ProjectOptions) -> Result<Self, ProjectError> {
        Self::from_config(ProjectConfig::load_or_default(path), ports, options)
    }

    /// Keeps `wanted` if it is non-zero and unused, otherwise takes the next
    /// counter value.
    fn claim_identity(&mut self, wanted: u32, seen: &mut Vec<u32>, sensor: bool) -> u32 {
        let identity = if wanted == 0 || seen.contains(&wanted) {
            let counter = if sensor {
                &mut self.next_sensor_id
            } else {
                &mut self.next_device_id
            };
            let fresh = *counter;
            *counter += 1;
            warn!(
                kind = if sensor { "sensor" } else { "device" },
                wanted,
                assigned = fresh,
                "Duplicate or missing identity, re-numbering"
            );
            fresh
        } else {
            wanted
        };
        seen.push(identity);
        identity
    }

    /// Serialisable form of the current project.
    ///
    /// Sensors whose probe has no serialisable description are left out.
    pub fn to_config(&self) -> ProjectConfig {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let devices = devices
            .iter()
            .map(|device| {
                let ctx = device.context();
                let credentials = ctx.credentials();
                let sensors = device
                    .sensors()
                    .iter()
                    .filter_map(|sensor| {
                        let Some(probe) = sensor.probe().config() else {
                            warn!(
                                sensor = sensor.identity(),
                                kind = sensor.probe().kind(),
                                "Probe has no saved form, skipping sensor"
                            );
                            return None;
                        };
                        Some(SensorConfig {
                            identity: sensor.identity(),
                            name: sensor.name().to_string(),
                            interval_ms: u64::try_from(sensor.interval().as_millis())
                                .unwrap_or(u64::MAX),
                            enabled: sensor.is_enabled(),
                            thresholds: *sensor.thresholds(),
                            probe,
                        })
                    })
                    .collect();

                DeviceConfig {
                    identity: ctx.identity(),
                    name: ctx.name().to_string(),
                    host: ctx.host().to_string(),
                    username: credentials.map(|c| c.username.clone()),
                    password: credentials.map(|c| c.password.clone()),
                    domain: credentials.and_then(|c| c.domain.clone()),
                    sensors,
                }
            })
            .collect();

        ProjectConfig {
            next_sensor_id: self.next_sensor_id,
            next_device_id: self.next_device_id,
            settings: self.settings.clone(),
            devices,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.to_config().save(path)?;
        debug!(path = %path.display(), "Project saved");
        Ok(())
    }

    fn ensure_stopped(&self) -> Result<(), ProjectError> {
        if self.scheduler.state() == SchedulerState::Stopped {
            Ok(())
        } else {
            Err(ProjectError::Running)
        }
    }

    /// Appends a device and returns its identity.
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        host: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Result<u32, ProjectError> {
        self.ensure_stopped()?;
        let identity = self.next_device_id;
        self.next_device_id += 1;

        let mut context = DeviceContext::new(identity, name, host);
        if let Some(credentials) = credentials {
            context = context.with_credentials(credentials);
        }
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Device::new(context));
        Ok(identity)
    }

    /// Assigns the sensor an identity and appends it to a device.
    pub fn add_sensor(&mut self, device_id: u32, sensor: Sensor) -> Result<Arc<Sensor>, ProjectError> {
        self.ensure_stopped()?;
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let device = devices
            .iter_mut()
            .find(|d| d.identity() == device_id)
            .ok_or(ProjectError::UnknownDevice(device_id))?;

        let identity = self.next_sensor_id;
        self.next_sensor_id += 1;
        Ok(device.attach(identity, sensor))
    }

    /// Removes a device together with its sensors.
    pub fn remove_device(&mut self, device_id: u32) -> Result<(), ProjectError> {
        self.ensure_stopped()?;
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let idx = devices
            .iter()
            .position(|d| d.identity() == device_id)
            .ok_or(ProjectError::UnknownDevice(device_id))?;
        devices.remove(idx);
        Ok(())
    }

    /// Runs `f` with read access to the device list.
    pub fn with_devices<R>(&self, f: impl FnOnce(&[Device]) -> R) -> R {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        f(&devices)
    }

    /// All sensors in scan order.
    pub fn sensors(&self) -> Vec<Arc<Sensor>> {
        self.with_devices(|devices| {
            devices
                .iter()
                .flat_map(|d| d.sensors().iter().cloned())
                .collect()
        })
    }

    pub fn sensor(&self, sensor_id: u32) -> Option<Arc<Sensor>> {
        self.with_devices(|devices| {
            devices
                .iter()
                .flat_map(|d| d.sensors())
                .find(|s| s.identity() == sensor_id)
                .cloned()
        })
    }

    pub fn device_count(&self) -> usize {
        self.with_devices(|devices| devices.len())
    }

    pub fn sensor_count(&self) -> usize {
        self.with_devices(|devices| devices.iter().map(|d| d.sensors().len()).sum())
    }

    /// Starts the scheduler; a no-op if it is already running.
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    /// Requests the scheduler to stop without waiting.
    pub fn stop(&self) {
        self.scheduler.stop()
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.scheduler.stats()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    /// Number of sensors currently being collected.
    pub fn in_flight(&self) -> usize {
        self.with_devices(|devices| {
            devices
                .iter()
                .flat_map(|d| d.sensors())
                .filter(|s| s.is_in_flight())
                .count()
        })
    }

    /// Polls until the loop has exited and no sensor is in flight.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() == SchedulerState::Stopped && self.in_flight() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(IDLE_POLL);
        }
    }

    fn format_timestamp(&self, ts: DateTime<Utc>) -> String {
        match self.settings.time_zone {
            TimeZonePreference::Utc => ts.format(REPORT_TIME_FORMAT).to_string(),
            TimeZonePreference::Local => ts.with_timezone(&Local).format(REPORT_TIME_FORMAT).to_string(),
        }
    }

    /// The stored series of a sensor as a `timestamp`/`value` table.
    pub fn series_report(&self, sensor_id: u32) -> Result<Table, StoreError> {
        let points = self.ports.store.read_series(sensor_id)?;
        let mut table = Table::new(["timestamp", "value"]);
        for point in points {
            table.push_row([self.format_timestamp(point.timestamp), point.value.to_string()]);
        }
        Ok(table)
    }

    fn sensor_label(&self, sensor_id: u32) -> String {
        self.sensor(sensor_id)
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| format!("sensor {}", sensor_id))
    }

    /// Sends a sensor's series through the notification port in the
    /// project's report format. An empty `recipients` list means the
    /// project's default recipients.
    pub fn send_series_report(&self, sensor_id: u32, recipients: &[String]) -> Result<(), StoreError> {
        let table = self.series_report(sensor_id)?;
        let recipients = if recipients.is_empty() {
            self.settings.default_recipients.as_slice()
        } else {
            recipients
        };
        let label = self.sensor_label(sensor_id);
        let format = self.settings.report_format;

        self.ports.notifier.send_report(
            recipients,
            &format!("Series report: {}", label),
            &format!("{} values collected for {}.", table.rows.len(), label),
            &table,
            format,
            &format!("sensor-{}.{}", sensor_id, format.extension()),
        );
        Ok(())
    }

    /// Uploads a sensor's series as delimited text using the owning
    /// device's credentials.
    pub fn upload_series(
        &self,
        sensor_id: u32,
        url: &str,
        verb: HttpVerb,
        include_header: bool,
    ) -> Result<(), StoreError> {
        let table = self.series_report(sensor_id)?;
        let device = self.sensor(sensor_id).and_then(|s| s.device());
        let credentials = device.as_ref().and_then(|d| d.credentials());

        self.ports
            .notifier
            .upload_report(&table, include_header, url, verb, credentials);
        Ok(())
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("devices", &self.device_count())
            .field("sensors", &self.sensor_count())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

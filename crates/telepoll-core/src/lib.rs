//! telepoll-core: polling engine for host telemetry.
//!
//! Provides:
//! - `sensor`, `device`: data model and per-sensor scheduling state
//! - `scheduler`, `pool`: the collection loop and its bounded worker pool
//! - `ports`: notification and data store contracts
//! - `store`, `notify`: bundled file-backed port implementations
//! - `probes`: built-in sensor variants (file, disk, system)
//! - `report`: CSV and spreadsheet report builders
//! - `project`, `config`: the top-level aggregate and its JSON form
//! - `fs`: filesystem abstraction with a mock for tests

pub mod config;
pub mod device;
pub mod fs;
pub mod notify;
pub mod pool;
pub mod ports;
pub mod probes;
pub mod project;
pub mod report;
pub mod scheduler;
pub mod sensor;
pub mod store;

mod task;

pub use config::{ConfigError, ProjectConfig, ProjectSettings, TimeZonePreference};
pub use device::{Credentials, Device, DeviceContext};
pub use notify::OutboxNotifier;
pub use ports::{DataPoint, DataStore, NotificationPort, Ports, StoreError};
pub use project::{Project, ProjectError, ProjectOptions};
pub use scheduler::{SchedulerState, StatsSnapshot};
pub use sensor::{CollectError, NotificationState, Probe, Sensor, Thresholds};
pub use store::{MemoryStore, SeriesStore};

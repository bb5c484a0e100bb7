//! Project configuration file.
//!
//! A project is stored as pretty-printed JSON:
//!
//! ```json
//! {
//!   "next_sensor_id": 3,
//!   "next_device_id": 2,
//!   "settings": { "report_format": "spreadsheet", "time_zone": "utc" },
//!   "devices": [{
//!     "identity": 1, "name": "db01", "host": "10.0.0.5",
//!     "sensors": [{
//!       "identity": 1, "name": "root free %", "interval_ms": 60000,
//!       "thresholds": { "low_warning": 10.0, "low_critical": 5.0 },
//!       "probe": { "type": "disk", "mount": "/", "measurement": "percent_free" }
//!     }]
//!   }]
//! }
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::notify::DEFAULT_SUBJECT_TEMPLATE;
use crate::probes::ProbeConfig;
use crate::report::ReportFormat;
use crate::sensor::Thresholds;

/// Errors reading or writing a project file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Json(e) => write!(f, "invalid project file: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

/// How report timestamps are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeZonePreference {
    #[default]
    Utc,
    Local,
}

fn default_subject_template() -> String {
    DEFAULT_SUBJECT_TEMPLATE.to_string()
}

/// Project-wide preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub report_format: ReportFormat,
    pub time_zone: TimeZonePreference,
    #[serde(default = "default_subject_template")]
    pub subject_template: String,
    pub default_recipients: Vec<String>,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            report_format: ReportFormat::default(),
            time_zone: TimeZonePreference::default(),
            subject_template: default_subject_template(),
            default_recipients: Vec::new(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default)]
    pub identity: u32,
    pub name: String,
    pub interval_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub thresholds: Thresholds,
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub identity: u32,
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

/// Serialisable form of a whole project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub next_sensor_id: u32,
    pub next_device_id: u32,
    pub settings: ProjectSettings,
    pub devices: Vec<DeviceConfig>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            next_sensor_id: 1,
            next_device_id: 1,
            settings: ProjectSettings::default(),
            devices: Vec::new(),
        }
    }
}

impl ProjectConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Loads the file, falling back to an empty project on any error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Project file not found, starting empty");
                Self::default()
            }
            Err(e) => {
                error!(
                    location = "load_project",
                    path = %path.display(),
                    error = %e,
                    "Failed to load project, starting empty"
                );
                Self::default()
            }
        }
    }

    /// Writes the file atomically via a temporary sibling.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

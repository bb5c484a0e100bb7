//! Built-in sensor probes.
//!
//! Each probe implements [`Probe`](crate::sensor::Probe). [`ProbeConfig`] is
//! the serialisable form, tagged by `type`, from which probes are rebuilt
//! when a project is loaded.

mod disk;
mod file;
mod system;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fs::{FileSystem, RealFs};
use crate::sensor::Probe;

pub use disk::{DiskMeasurement, DiskProbe};
pub use file::{FileMeasurement, FileProbe};
pub use system::{SystemMeasurement, SystemProbe, parse_loadavg, parse_meminfo};

fn default_proc_path() -> PathBuf {
    PathBuf::from("/proc")
}

/// Serialisable description of a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeConfig {
    File {
        path: PathBuf,
        measurement: FileMeasurement,
    },
    Disk {
        mount: PathBuf,
        measurement: DiskMeasurement,
    },
    System {
        measurement: SystemMeasurement,
        #[serde(default = "default_proc_path")]
        proc_path: PathBuf,
    },
}

impl ProbeConfig {
    /// Builds the probe against the real filesystem.
    pub fn into_probe(self) -> Box<dyn Probe> {
        self.into_probe_with(Arc::new(RealFs::new()))
    }

    /// Builds the probe against the given filesystem.
    pub fn into_probe_with(self, fs: Arc<dyn FileSystem>) -> Box<dyn Probe> {
        match self {
            ProbeConfig::File { path, measurement } => {
                Box::new(FileProbe::new(path, measurement).with_fs(fs))
            }
            ProbeConfig::Disk { mount, measurement } => Box::new(DiskProbe::new(mount, measurement)),
            ProbeConfig::System {
                measurement,
                proc_path,
            } => Box::new(SystemProbe::new(measurement).with_proc_path(proc_path).with_fs(fs)),
        }
    }
}

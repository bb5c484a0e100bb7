//! Host load and memory read from procfs.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::DeviceContext;
use crate::fs::{FileSystem, RealFs};
use crate::probes::ProbeConfig;
use crate::sensor::{CollectError, Probe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMeasurement {
    Load1,
    Load5,
    Load15,
    MemAvailableKb,
    MemUsedPercent,
}

/// Parses `/proc/loadavg` into (load1, load5, load15).
pub fn parse_loadavg(content: &str) -> Result<(f64, f64, f64), CollectError> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(CollectError::Parse("invalid loadavg format".to_string()));
    }

    let field = |idx: usize, name: &str| -> Result<f64, CollectError> {
        parts[idx]
            .parse()
            .map_err(|_| CollectError::Parse(format!("invalid {}", name)))
    };

    Ok((field(0, "load1")?, field(1, "load5")?, field(2, "load15")?))
}

/// Parses `/proc/meminfo` into (MemTotal, MemAvailable) in kB.
pub fn parse_meminfo(content: &str) -> Result<(u64, u64), CollectError> {
    let parse_kb = |line: &str| -> Option<u64> { line.split_whitespace().nth(1)?.parse().ok() };

    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            total = parse_kb(line);
        } else if line.starts_with("MemAvailable:") {
            available = parse_kb(line);
        }
    }

    match (total, available) {
        (Some(t), Some(a)) => Ok((t, a)),
        _ => Err(CollectError::Parse(
            "meminfo lacks MemTotal or MemAvailable".to_string(),
        )),
    }
}

/// Reads load averages and memory figures of the local host.
pub struct SystemProbe {
    measurement: SystemMeasurement,
    proc_path: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl SystemProbe {
    pub fn new(measurement: SystemMeasurement) -> Self {
        Self {
            measurement,
            proc_path: PathBuf::from("/proc"),
            fs: Arc::new(RealFs::new()),
        }
    }

    pub fn with_proc_path(mut self, proc_path: impl Into<PathBuf>) -> Self {
        self.proc_path = proc_path.into();
        self
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }
}

impl Probe for SystemProbe {
    fn collect(&self, _device: &DeviceContext) -> Result<f64, CollectError> {
        match self.measurement {
            SystemMeasurement::Load1 | SystemMeasurement::Load5 | SystemMeasurement::Load15 => {
                let content = self.fs.read_to_string(&self.proc_path.join("loadavg"))?;
                let (l1, l5, l15) = parse_loadavg(&content)?;
                Ok(match self.measurement {
                    SystemMeasurement::Load1 => l1,
                    SystemMeasurement::Load5 => l5,
                    _ => l15,
                })
            }
            SystemMeasurement::MemAvailableKb | SystemMeasurement::MemUsedPercent => {
                let content = self.fs.read_to_string(&self.proc_path.join("meminfo"))?;
                let (total, available) = parse_meminfo(&content)?;
                if self.measurement == SystemMeasurement::MemAvailableKb {
                    return Ok(available as f64);
                }
                if total == 0 {
                    return Err(CollectError::Parse("MemTotal is zero".to_string()));
                }
                Ok(total.saturating_sub(available) as f64 / total as f64 * 100.0)
            }
        }
    }

    fn kind(&self) -> &'static str {
        "system"
    }

    fn config(&self) -> Option<ProbeConfig> {
        Some(ProbeConfig::System {
            measurement: self.measurement,
            proc_path: self.proc_path.clone(),
        })
    }
}

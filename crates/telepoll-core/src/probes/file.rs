//! Facts about a single file: size and age.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::device::DeviceContext;
use crate::fs::{FileSystem, RealFs};
use crate::probes::ProbeConfig;
use crate::sensor::{CollectError, Probe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMeasurement {
    FileSizeBytes,
    MinutesSinceChanged,
    MinutesSinceCreated,
}

/// Reports the size or age of a file.
pub struct FileProbe {
    path: PathBuf,
    measurement: FileMeasurement,
    fs: Arc<dyn FileSystem>,
}

impl FileProbe {
    pub fn new(path: impl Into<PathBuf>, measurement: FileMeasurement) -> Self {
        Self {
            path: path.into(),
            measurement,
            fs: Arc::new(RealFs::new()),
        }
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }
}

/// Minutes elapsed since `then`; timestamps in the future count as zero.
fn minutes_since(then: Option<SystemTime>, what: &str) -> Result<f64, CollectError> {
    let then = then.ok_or_else(|| CollectError::Unsupported(format!("{} time not available", what)))?;
    let elapsed = SystemTime::now()
        .duration_since(then)
        .unwrap_or_default();
    Ok(elapsed.as_secs_f64() / 60.0)
}

impl Probe for FileProbe {
    fn collect(&self, _device: &DeviceContext) -> Result<f64, CollectError> {
        let stat = self.fs.stat(&self.path)?;
        match self.measurement {
            FileMeasurement::FileSizeBytes => Ok(stat.len as f64),
            FileMeasurement::MinutesSinceChanged => minutes_since(stat.modified, "modification"),
            FileMeasurement::MinutesSinceCreated => minutes_since(stat.created, "creation"),
        }
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn config(&self) -> Option<ProbeConfig> {
        Some(ProbeConfig::File {
            path: self.path.clone(),
            measurement: self.measurement,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFs;
    use std::time::Duration;

    fn ctx() -> DeviceContext {
        DeviceContext::new(1, "local", "localhost")
    }

    #[test]
    fn test_file_size_real_fs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, vec![b'x'; 2048]).unwrap();

        let probe = FileProbe::new(&path, FileMeasurement::FileSizeBytes);
        assert_eq!(probe.collect(&ctx()).unwrap(), 2048.0);
    }

    #[test]
    fn test_file_age_minutes() {
        let mut fs = MockFs::new();
        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        let day_ago = SystemTime::now() - Duration::from_secs(86_400);
        fs.add_file_with_times("/srv/backup.tar", "data", day_ago, hour_ago);
        let fs: Arc<dyn FileSystem> = Arc::new(fs);

        let changed = FileProbe::new("/srv/backup.tar", FileMeasurement::MinutesSinceChanged)
            .with_fs(Arc::clone(&fs));
        let minutes = changed.collect(&ctx()).unwrap();
        assert!((59.9..61.0).contains(&minutes), "got {minutes}");

        let created = FileProbe::new("/srv/backup.tar", FileMeasurement::MinutesSinceCreated)
            .with_fs(fs);
        let minutes = created.collect(&ctx()).unwrap();
        assert!((1439.9..1441.0).contains(&minutes), "got {minutes}");
    }

    #[test]
    fn test_missing_file_fails() {
        let probe = FileProbe::new("/missing.txt", FileMeasurement::FileSizeBytes)
            .with_fs(Arc::new(MockFs::new()));
        assert!(matches!(
            probe.collect(&ctx()),
            Err(CollectError::NotFound(_))
        ));
    }
}

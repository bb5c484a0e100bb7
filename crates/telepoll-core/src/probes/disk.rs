//! Disk usage of a mounted filesystem.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::Disks;

use crate::device::DeviceContext;
use crate::probes::ProbeConfig;
use crate::sensor::{CollectError, Probe};

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskMeasurement {
    BytesFree,
    BytesUsed,
    MegabytesFree,
    MegabytesUsed,
    PercentFree,
    PercentUsed,
}

impl DiskMeasurement {
    /// Derives the measurement from raw totals.
    pub fn compute(self, total: u64, free: u64) -> Result<f64, CollectError> {
        if total == 0 {
            return Err(CollectError::Other("disk reports zero size".to_string()));
        }
        let total = total as f64;
        let free = free as f64;
        let used = (total - free).max(0.0);
        let pct_free = free / total * 100.0;

        Ok(match self {
            DiskMeasurement::BytesFree => free,
            DiskMeasurement::BytesUsed => used,
            DiskMeasurement::MegabytesFree => free / MB,
            DiskMeasurement::MegabytesUsed => used / MB,
            DiskMeasurement::PercentFree => pct_free,
            DiskMeasurement::PercentUsed => 100.0 - pct_free,
        })
    }
}

/// Measures the filesystem that holds `mount`.
#[derive(Debug, Clone)]
pub struct DiskProbe {
    mount: PathBuf,
    measurement: DiskMeasurement,
}

impl DiskProbe {
    pub fn new(mount: impl Into<PathBuf>, measurement: DiskMeasurement) -> Self {
        Self {
            mount: mount.into(),
            measurement,
        }
    }
}

/// Picks the disk with the longest mount point containing `path`.
fn find_disk<'a>(
    disks: impl IntoIterator<Item = (&'a Path, u64, u64)>,
    path: &Path,
) -> Option<(u64, u64)> {
    disks
        .into_iter()
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())
        .map(|(_, total, free)| (total, free))
}

impl Probe for DiskProbe {
    fn collect(&self, _device: &DeviceContext) -> Result<f64, CollectError> {
        let disks = Disks::new_with_refreshed_list();
        let (total, free) = find_disk(
            disks
                .list()
                .iter()
                .map(|d| (d.mount_point(), d.total_space(), d.available_space())),
            &self.mount,
        )
        .ok_or_else(|| CollectError::NotFound(format!("no disk mounted at {}", self.mount.display())))?;

        self.measurement.compute(total, free)
    }

    fn kind(&self) -> &'static str {
        "disk"
    }

    fn config(&self) -> Option<ProbeConfig> {
        Some(ProbeConfig::Disk {
            mount: self.mount.clone(),
            measurement: self.measurement,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_measurements() {
        let total = 100 * 1024 * 1024;
        let free = 25 * 1024 * 1024;

        assert_eq!(DiskMeasurement::BytesFree.compute(total, free).unwrap(), free as f64);
        assert_eq!(
            DiskMeasurement::BytesUsed.compute(total, free).unwrap(),
            (total - free) as f64
        );
        assert_eq!(DiskMeasurement::MegabytesFree.compute(total, free).unwrap(), 25.0);
        assert_eq!(DiskMeasurement::MegabytesUsed.compute(total, free).unwrap(), 75.0);
        assert_eq!(DiskMeasurement::PercentFree.compute(total, free).unwrap(), 25.0);
        assert_eq!(DiskMeasurement::PercentUsed.compute(total, free).unwrap(), 75.0);
    }

    #[test]
    fn test_zero_sized_disk_fails() {
        assert!(DiskMeasurement::PercentFree.compute(0, 0).is_err());
    }

    #[test]
    fn test_find_disk_longest_prefix() {
        let disks = vec![
            (Path::new("/"), 1000, 500),
            (Path::new("/var"), 200, 20),
            (Path::new("/var/lib/docker"), 50, 5),
        ];
        assert_eq!(find_disk(disks.clone(), Path::new("/var/log")), Some((200, 20)));
        assert_eq!(find_disk(disks.clone(), Path::new("/home")), Some((1000, 500)));
        assert_eq!(find_disk(disks, Path::new("/var/lib/docker/x")), Some((50, 5)));
        assert_eq!(find_disk(Vec::new(), Path::new("/")), None);
    }
}

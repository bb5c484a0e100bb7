//! Abstractions for filesystem access to enable testing and mocking.
//!
//! Probes read files through the `FileSystem` trait so that they can work
//! against the real filesystem in production and against [`MockFs`] in tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Subset of file metadata used by probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File length in bytes.
    pub len: u64,
    /// Last modification time, if the platform reports it.
    pub modified: Option<SystemTime>,
    /// Creation time, if the platform reports it.
    pub created: Option<SystemTime>,
}

/// Abstraction for filesystem operations.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Returns metadata for a file.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    /// Creates a new `RealFs` instance.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = std::fs::metadata(path)?;
        Ok(FileStat {
            len: meta.len(),
            modified: meta.modified().ok(),
            created: meta.created().ok(),
        })
    }
}

#[derive(Debug, Clone)]
struct MockFile {
    content: String,
    modified: SystemTime,
    created: SystemTime,
}

/// In-memory filesystem for testing.
///
/// Stores file contents and timestamps in memory, so tests can simulate
/// `/proc` content or aged files without touching the real filesystem.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, MockFile>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content, created and modified now.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let now = SystemTime::now();
        self.add_file_with_times(path, content, now, now);
    }

    /// Adds a file with explicit creation and modification times.
    pub fn add_file_with_times(
        &mut self,
        path: impl AsRef<Path>,
        content: impl Into<String>,
        created: SystemTime,
        modified: SystemTime,
    ) {
        self.files.insert(
            path.as_ref().to_path_buf(),
            MockFile {
                content: content.into(),
                modified,
                created,
            },
        );
    }

    /// Builds a mock with typical `/proc/loadavg` and `/proc/meminfo` content.
    pub fn typical_system() -> Self {
        let mut fs = Self::new();
        fs.add_file("/proc/loadavg", "0.52 0.58 0.59 2/1024 31337\n");
        fs.add_file(
            "/proc/meminfo",
            "MemTotal:       16000000 kB\n\
             MemFree:         2000000 kB\n\
             MemAvailable:    4000000 kB\n\
             Buffers:          500000 kB\n\
             Cached:          3000000 kB\n",
        );
        fs
    }

    fn get(&self, path: &Path) -> io::Result<&MockFile> {
        self.files.get(path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {}", path.display()),
            )
        })
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.get(path).map(|f| f.content.clone())
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let file = self.get(path)?;
        Ok(FileStat {
            len: file.content.len() as u64,
            modified: Some(file.modified),
            created: Some(file.created),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_real_fs_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.txt");
        std::fs::write(&path, "12345").unwrap();

        let fs = RealFs::new();
        let stat = fs.stat(&path).unwrap();
        assert_eq!(stat.len, 5);
        assert!(stat.modified.is_some());
        assert_eq!(fs.read_to_string(&path).unwrap(), "12345");
    }

    #[test]
    fn test_real_fs_missing_file() {
        let fs = RealFs::new();
        let err = fs.stat(Path::new("/nonexistent/path/12345")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_mock_fs_times() {
        let mut fs = MockFs::new();
        let created = SystemTime::now() - Duration::from_secs(3600);
        fs.add_file_with_times("/data/a.log", "abc", created, created);

        let stat = fs.stat(Path::new("/data/a.log")).unwrap();
        assert_eq!(stat.len, 3);
        assert_eq!(stat.created, Some(created));
        assert!(fs.read_to_string(Path::new("/data/missing")).is_err());
    }
}

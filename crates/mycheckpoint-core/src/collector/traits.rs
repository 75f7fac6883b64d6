//! Abstractions over the data sources a snapshot is built from.
//!
//! `FileSystem` lets the OS collector read the real `/proc` and mounted
//! filesystems, or an in-memory mock; `StatusSource` lets the collector read a live MySQL server or a
//! scripted fake.

use std::io;
use std::path::{Path, PathBuf};

use super::CollectError;

/// Capacity of one mounted filesystem, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl Mount {
    /// Used share of the filesystem, rounded to whole percent.
    pub fn usage_percent(&self) -> Option<i64> {
        if self.total_bytes == 0 {
            return None;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        Some((used as f64 * 100.0 / self.total_bytes as f64).round() as i64)
    }
}

/// Abstraction for filesystem reads.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Lists mounted filesystems with their capacity.
    fn mounts(&self) -> io::Result<Vec<Mount>>;
}

/// The mount holding `path`: the longest mount point that prefixes it.
pub fn mount_for<'a>(mounts: &'a [Mount], path: &Path) -> Option<&'a Mount> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn mounts(&self) -> io::Result<Vec<Mount>> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        Ok(disks
            .list()
            .iter()
            .map(|disk| Mount {
                mount_point: disk.mount_point().to_path_buf(),
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
            .collect())
    }
}

/// Result of `SHOW MASTER STATUS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterStatus {
    pub file: String,
    pub position: Option<i64>,
}

impl MasterStatus {
    /// Numeric suffix of the binary log file name (`mysql-bin.000042` → 42).
    pub fn file_number(&self) -> Option<i64> {
        self.file.rsplit('.').next()?.parse().ok()
    }
}

/// Positions from `SHOW SLAVE STATUS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveStatus {
    pub read_master_log_pos: Option<i64>,
    pub relay_log_pos: Option<i64>,
    pub exec_master_log_pos: Option<i64>,
    pub relay_log_space: Option<i64>,
    pub seconds_behind_master: Option<i64>,
}

/// The monitored server.
///
/// `global_status` and `global_variables` failing is fatal for the cycle.
/// Replication reads may fail on privileges; the collector turns those
/// failures into absent values.
pub trait StatusSource {
    /// `SHOW GLOBAL STATUS` as raw name/value pairs.
    fn global_status(&mut self) -> Result<Vec<(String, String)>, CollectError>;

    /// `SHOW GLOBAL VARIABLES` as raw name/value pairs.
    fn global_variables(&mut self) -> Result<Vec<(String, String)>, CollectError>;

    /// `Ok(None)` when the server is not a master.
    fn master_status(&mut self) -> Result<Option<MasterStatus>, CollectError>;

    /// `Ok(None)` when the server is not a replica.
    fn slave_status(&mut self) -> Result<Option<SlaveStatus>, CollectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_fs_read_to_string() {
        let fs = RealFs::new();
        let cargo_toml = std::env::current_dir().unwrap().join("Cargo.toml");
        let content = fs.read_to_string(&cargo_toml).unwrap();
        assert!(content.contains("[package]"));
        assert!(fs.read_to_string(Path::new("/nonexistent/path/12345")).is_err());
    }

    #[test]
    fn test_master_file_number() {
        let m = MasterStatus {
            file: "mysql-bin.000042".to_string(),
            position: Some(107),
        };
        assert_eq!(m.file_number(), Some(42));

        let m = MasterStatus {
            file: "binlog".to_string(),
            position: None,
        };
        assert_eq!(m.file_number(), None);
    }

    fn mount(point: &str, total: u64, available: u64) -> Mount {
        Mount {
            mount_point: PathBuf::from(point),
            total_bytes: total,
            available_bytes: available,
        }
    }

    #[test]
    fn test_mount_for_picks_longest_prefix() {
        let mounts = vec![
            mount("/", 100, 50),
            mount("/var", 100, 10),
            mount("/var/lib/mysql", 100, 75),
        ];
        let m = mount_for(&mounts, Path::new("/var/lib/mysql/")).unwrap();
        assert_eq!(m.mount_point, Path::new("/var/lib/mysql"));
        let m = mount_for(&mounts, Path::new("/var/tmp")).unwrap();
        assert_eq!(m.mount_point, Path::new("/var"));
        // Component-wise: /variable is not under /var.
        let m = mount_for(&mounts, Path::new("/variable")).unwrap();
        assert_eq!(m.mount_point, Path::new("/"));
        assert!(mount_for(&[], Path::new("/")).is_none());
    }

    #[test]
    fn test_mount_usage_percent() {
        assert_eq!(mount("/", 200, 50).usage_percent(), Some(75));
        assert_eq!(mount("/", 3, 2).usage_percent(), Some(33));
        assert_eq!(mount("/", 0, 0).usage_percent(), None);
    }
}

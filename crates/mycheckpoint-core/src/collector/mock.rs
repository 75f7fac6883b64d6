//! In-memory fakes for testing collectors without `/proc` or a MySQL server.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use super::CollectError;
use super::traits::{FileSystem, MasterStatus, Mount, SlaveStatus, StatusSource};

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, String>,
    mounts: Vec<Mount>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        self.files
            .insert(path.as_ref().to_path_buf(), content.into());
    }

    pub fn add_mount(
        &mut self,
        mount_point: impl AsRef<Path>,
        total_bytes: u64,
        available_bytes: u64,
    ) {
        self.mounts.push(Mount {
            mount_point: mount_point.as_ref().to_path_buf(),
            total_bytes,
            available_bytes,
        });
    }

    /// A host with the three `/proc` files the OS collector reads, a root
    /// filesystem at 60% and a separate MySQL data volume at 25%.
    pub fn typical_system() -> Self {
        let mut fs = Self::new();
        fs.add_file("/proc/loadavg", "0.52 0.58 0.59 2/512 12345\n");
        fs.add_file(
            "/proc/stat",
            "cpu  10132153 290696 3084719 46828483 16683 0 25195 0 0 0\n\
             cpu0 1393280 32966 572056 13343292 6130 0 17875 0 0 0\n\
             ctxt 1990473\n\
             btime 1062191376\n",
        );
        fs.add_file(
            "/proc/meminfo",
            "MemTotal:       16384000 kB\n\
             MemFree:         2048000 kB\n\
             MemAvailable:    8192000 kB\n\
             Buffers:          512000 kB\n\
             Cached:          4096000 kB\n\
             SwapCached:            0 kB\n\
             Active:          6144000 kB\n\
             SwapTotal:       2097148 kB\n\
             SwapFree:        2097148 kB\n",
        );
        fs.add_mount("/", 50_000_000_000, 20_000_000_000);
        fs.add_mount("/var/lib/mysql", 200_000_000_000, 150_000_000_000);
        fs
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn mounts(&self) -> io::Result<Vec<Mount>> {
        Ok(self.mounts.clone())
    }
}

/// Scripted status source.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    pub status: Vec<(String, String)>,
    pub variables: Vec<(String, String)>,
    pub master: Option<MasterStatus>,
    pub slave: Option<SlaveStatus>,
    /// Simulates missing `REPLICATION CLIENT` privilege.
    pub deny_replication: bool,
    /// Simulates a lost connection.
    pub offline: bool,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, name: &str, value: &str) -> Self {
        self.set_status(name, value);
        self
    }

    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables.push((name.to_string(), value.to_string()));
        self
    }

    /// Replaces or adds a status variable.
    pub fn set_status(&mut self, name: &str, value: &str) {
        match self.status.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.status.push((name.to_string(), value.to_string())),
        }
    }

    fn check_online(&self) -> Result<(), CollectError> {
        if self.offline {
            Err(CollectError::Connection("server has gone away".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_replication(&self) -> Result<(), CollectError> {
        if self.deny_replication {
            Err(CollectError::Query(
                "Access denied; you need the REPLICATION CLIENT privilege".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl StatusSource for MockSource {
    fn global_status(&mut self) -> Result<Vec<(String, String)>, CollectError> {
        self.check_online()?;
        Ok(self.status.clone())
    }

    fn global_variables(&mut self) -> Result<Vec<(String, String)>, CollectError> {
        self.check_online()?;
        Ok(self.variables.clone())
    }

    fn master_status(&mut self) -> Result<Option<MasterStatus>, CollectError> {
        self.check_online()?;
        self.check_replication()?;
        Ok(self.master.clone())
    }

    fn slave_status(&mut self) -> Result<Option<SlaveStatus>, CollectError> {
        self.check_online()?;
        self.check_replication()?;
        Ok(self.slave.clone())
    }
}

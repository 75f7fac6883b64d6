//! OS metrics from `/proc` and mounted filesystems.
//!
//! Parsers are pure functions over file contents so they can be tested with
//! string inputs. `OsCollector` reads through a `FileSystem` and degrades to
//! absent values when a file is missing or malformed.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::CollectError;
use super::traits::{FileSystem, Mount, mount_for};

/// 1 minute load average from `/proc/loadavg`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAvg {
    pub load1: f64,
}

/// Parsed `/proc/meminfo`, values in kB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub active: u64,
    pub cached: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

/// Aggregate `cpu` line of `/proc/stat`, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
}

fn parse_error(what: &'static str, message: impl Into<String>) -> CollectError {
    CollectError::Parse {
        what,
        message: message.into(),
    }
}

pub fn parse_loadavg(content: &str) -> Result<LoadAvg, CollectError> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(parse_error("/proc/loadavg", "invalid loadavg format"));
    }
    let load1 = parts[0]
        .parse()
        .map_err(|_| parse_error("/proc/loadavg", "invalid load1"))?;
    Ok(LoadAvg { load1 })
}

pub fn parse_meminfo(content: &str) -> MemInfo {
    let mut info = MemInfo::default();

    let parse_kb = |line: &str| -> u64 {
        line.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    for line in content.lines() {
        let Some((key, _)) = line.split_once(':') else {
            continue;
        };
        match key {
            "MemTotal" => info.mem_total = parse_kb(line),
            "MemFree" => info.mem_free = parse_kb(line),
            "MemAvailable" => info.mem_available = parse_kb(line),
            "Active" => info.active = parse_kb(line),
            "Cached" => info.cached = parse_kb(line),
            "SwapTotal" => info.swap_total = parse_kb(line),
            "SwapFree" => info.swap_free = parse_kb(line),
            _ => {}
        }
    }

    info
}

pub fn parse_cpu_times(content: &str) -> Result<CpuTimes, CollectError> {
    let line = content
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| parse_error("/proc/stat", "no aggregate cpu line"))?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    let get_val = |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };
    Ok(CpuTimes {
        user: get_val(1),
        nice: get_val(2),
        system: get_val(3),
        idle: get_val(4),
        iowait: get_val(5),
    })
}

fn clamp(v: u64) -> Option<i64> {
    Some(i64::try_from(v).unwrap_or(i64::MAX))
}

/// Server directories whose filesystem usage is sampled alongside `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDirs {
    pub datadir: Option<PathBuf>,
    pub tmpdir: Option<PathBuf>,
}

impl ServerDirs {
    /// Records `datadir` or `tmpdir` from `SHOW GLOBAL VARIABLES`.
    /// `tmpdir` may be a colon separated list; the first entry is used.
    pub fn observe(&mut self, name: &str, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        match name {
            "datadir" => self.datadir = Some(PathBuf::from(raw)),
            "tmpdir" => {
                let first = raw.split(':').next().unwrap_or(raw);
                self.tmpdir = Some(PathBuf::from(first));
            }
            _ => {}
        }
    }
}

fn mount_usage(mounts: &[Mount], dir: Option<&Path>) -> Option<i64> {
    let dir = dir?;
    match mount_for(mounts, dir) {
        Some(m) => m.usage_percent(),
        None => {
            debug!(dir = %dir.display(), "no mount holds directory");
            None
        }
    }
}

/// Samples the local host. Only meaningful when MySQL runs on this machine.
pub struct OsCollector<F> {
    fs: F,
}

impl<F: FileSystem> OsCollector<F> {
    pub fn new(fs: F) -> Self {
        Self { fs }
    }

    fn read(&self, path: &str) -> Option<String> {
        match self.fs.read_to_string(Path::new(path)) {
            Ok(content) => Some(content),
            Err(e) => {
                debug!(path, error = %e, "cannot read OS metrics file");
                None
            }
        }
    }

    /// Returns every OS column, `None` where the value is unavailable.
    pub fn collect(&self, dirs: &ServerDirs) -> Vec<(&'static str, Option<i64>)> {
        let load = self.read("/proc/loadavg").and_then(|c| match parse_loadavg(&c) {
            Ok(l) => Some(l),
            Err(e) => {
                debug!(error = %e, "ignoring load average");
                None
            }
        });
        let mem = self.read("/proc/meminfo").map(|c| parse_meminfo(&c));
        let cpu = self.read("/proc/stat").and_then(|c| match parse_cpu_times(&c) {
            Ok(t) => Some(t),
            Err(e) => {
                debug!(error = %e, "ignoring CPU times");
                None
            }
        });

        let mounts = self.fs.mounts().unwrap_or_else(|e| {
            debug!(error = %e, "cannot list mounts");
            Vec::new()
        });

        // A zero MemAvailable means an old kernel that does not report it.
        let mem_field = |f: fn(&MemInfo) -> u64| mem.as_ref().and_then(|m| clamp(f(m)));
        vec![
            (
                "os_loadavg_millis",
                load.map(|l| (l.load1 * 1000.0).round() as i64),
            ),
            ("os_mem_total_kb", mem_field(|m| m.mem_total)),
            ("os_mem_free_kb", mem_field(|m| m.mem_free)),
            (
                "os_mem_available_kb",
                mem.as_ref()
                    .filter(|m| m.mem_available > 0)
                    .and_then(|m| clamp(m.mem_available)),
            ),
            ("os_mem_active_kb", mem_field(|m| m.active)),
            ("os_mem_cached_kb", mem_field(|m| m.cached)),
            ("os_swap_total_kb", mem_field(|m| m.swap_total)),
            ("os_swap_free_kb", mem_field(|m| m.swap_free)),
            ("os_cpu_user", cpu.and_then(|c| clamp(c.user))),
            ("os_cpu_nice", cpu.and_then(|c| clamp(c.nice))),
            ("os_cpu_system", cpu.and_then(|c| clamp(c.system))),
            ("os_cpu_idle", cpu.and_then(|c| clamp(c.idle))),
            ("os_cpu_iowait", cpu.and_then(|c| clamp(c.iowait))),
            (
                "os_root_mountpoint_usage_percent",
                mount_usage(&mounts, Some(Path::new("/"))),
            ),
            (
                "os_datadir_mountpoint_usage_percent",
                mount_usage(&mounts, dirs.datadir.as_deref()),
            ),
            (
                "os_tmpdir_mountpoint_usage_percent",
                mount_usage(&mounts, dirs.tmpdir.as_deref()),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockFs;
    use crate::metrics::{OS_COUNTER_COLUMNS, OS_GAUGE_COLUMNS};

    #[test]
    fn test_parse_loadavg() {
        let l = parse_loadavg("1.25 0.80 0.50 3/700 4242\n").unwrap();
        assert_eq!(l.load1, 1.25);
        assert!(parse_loadavg("1.25\n").is_err());
        assert!(parse_loadavg("garbage").is_err());
    }

    #[test]
    fn test_parse_meminfo_distinguishes_cached() {
        let m = parse_meminfo("Cached:  100 kB\nSwapCached:  7 kB\nMemTotal: 2000 kB\n");
        assert_eq!(m.cached, 100);
        assert_eq!(m.mem_total, 2000);
    }

    #[test]
    fn test_parse_cpu_times_uses_aggregate_line() {
        let t = parse_cpu_times("cpu0 1 1 1 1 1\ncpu  10 2 3 40 5 0 0\n").unwrap();
        assert_eq!(
            t,
            CpuTimes {
                user: 10,
                nice: 2,
                system: 3,
                idle: 40,
                iowait: 5
            }
        );
        assert!(parse_cpu_times("ctxt 5\n").is_err());
    }

    #[test]
    fn test_collect_typical_system() {
        let os = OsCollector::new(MockFs::typical_system());
        let dirs = ServerDirs {
            datadir: Some(PathBuf::from("/var/lib/mysql/")),
            tmpdir: Some(PathBuf::from("/tmp")),
        };
        let values: std::collections::HashMap<_, _> = os.collect(&dirs).into_iter().collect();

        assert_eq!(values["os_loadavg_millis"], Some(520));
        assert_eq!(values["os_mem_total_kb"], Some(16_384_000));
        assert_eq!(values["os_mem_available_kb"], Some(8_192_000));
        assert_eq!(values["os_cpu_user"], Some(10_132_153));
        assert_eq!(values["os_cpu_iowait"], Some(16_683));
        assert_eq!(values["os_root_mountpoint_usage_percent"], Some(60));
        assert_eq!(values["os_datadir_mountpoint_usage_percent"], Some(25));
        assert_eq!(values["os_tmpdir_mountpoint_usage_percent"], Some(60));

        for column in OS_GAUGE_COLUMNS.iter().chain(OS_COUNTER_COLUMNS) {
            assert!(values.contains_key(column), "missing {}", column);
        }
    }

    #[test]
    fn test_collect_missing_files_yields_none() {
        let os = OsCollector::new(MockFs::new());
        let dirs = ServerDirs {
            datadir: Some(PathBuf::from("/var/lib/mysql")),
            tmpdir: None,
        };
        assert!(os.collect(&dirs).iter().all(|(_, v)| v.is_none()));
    }

    #[test]
    fn test_collect_mount_usage_without_server_dirs() {
        let os = OsCollector::new(MockFs::typical_system());
        let values: std::collections::HashMap<_, _> =
            os.collect(&ServerDirs::default()).into_iter().collect();
        assert_eq!(values["os_root_mountpoint_usage_percent"], Some(60));
        assert_eq!(values["os_datadir_mountpoint_usage_percent"], None);
        assert_eq!(values["os_tmpdir_mountpoint_usage_percent"], None);
    }

    #[test]
    fn test_server_dirs_observe() {
        let mut dirs = ServerDirs::default();
        dirs.observe("datadir", "/data/mysql/");
        dirs.observe("tmpdir", "/mnt/tmp1:/mnt/tmp2");
        dirs.observe("basedir", "/usr");
        assert_eq!(dirs.datadir, Some(PathBuf::from("/data/mysql/")));
        assert_eq!(dirs.tmpdir, Some(PathBuf::from("/mnt/tmp1")));

        dirs.observe("datadir", "  ");
        assert_eq!(dirs.datadir, Some(PathBuf::from("/data/mysql/")));
    }
}

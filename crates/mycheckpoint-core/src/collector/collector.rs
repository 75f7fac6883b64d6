use std::collections::BTreeMap;

use tracing::debug;

use super::CollectError;
use super::procfs::{OsCollector, ServerDirs};
use super::traits::{FileSystem, RealFs, StatusSource};
use crate::metrics::{
    MONITORED_GLOBAL_VARIABLES, REPLICATION_COLUMNS, is_neglectable_variable, normalize_value,
};

/// Builds one normalized value map per invocation.
///
/// Column names are lowercased. Every monitored global variable and, unless
/// replication checks are skipped, every replication column is present even
/// when the server does not report it.
pub struct Collector<S, F = RealFs> {
    source: S,
    os: Option<OsCollector<F>>,
    check_replication: bool,
}

impl<S: StatusSource> Collector<S, RealFs> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            os: None,
            check_replication: true,
        }
    }
}

impl<S: StatusSource, F: FileSystem> Collector<S, F> {
    /// Adds OS metrics; only meaningful when the server is local.
    pub fn with_os<G: FileSystem>(self, os: OsCollector<G>) -> Collector<S, G> {
        Collector {
            source: self.source,
            os: Some(os),
            check_replication: self.check_replication,
        }
    }

    pub fn skip_replication(mut self, skip: bool) -> Self {
        self.check_replication = !skip;
        self
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Samples the server. Failing to read status or variables is fatal;
    /// replication and OS reads degrade to `None`.
    pub fn collect(&mut self) -> Result<BTreeMap<String, Option<i64>>, CollectError> {
        let mut values = BTreeMap::new();

        for (name, raw) in self.source.global_status()? {
            let name = name.to_lowercase();
            if is_neglectable_variable(&name) {
                continue;
            }
            values.insert(name, normalize_value(&raw));
        }

        for name in MONITORED_GLOBAL_VARIABLES {
            values.insert(name.to_string(), None);
        }
        let mut dirs = ServerDirs::default();
        for (name, raw) in self.source.global_variables()? {
            let name = name.to_lowercase();
            dirs.observe(&name, &raw);
            if MONITORED_GLOBAL_VARIABLES.contains(&name.as_str()) {
                values.insert(name, normalize_value(&raw));
            }
        }

        if self.check_replication {
            self.collect_replication(&mut values);
        }

        if let Some(os) = &self.os {
            for (name, value) in os.collect(&dirs) {
                values.insert(name.to_string(), value);
            }
        }

        debug!(columns = values.len(), "collected sample");
        Ok(values)
    }

    fn collect_replication(&mut self, values: &mut BTreeMap<String, Option<i64>>) {
        for name in REPLICATION_COLUMNS {
            values.insert(name.to_string(), None);
        }

        match self.source.master_status() {
            Ok(Some(master)) => {
                values.insert("master_status_position".to_string(), master.position);
                values.insert(
                    "master_status_file_number".to_string(),
                    master.file_number(),
                );
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "master status unavailable"),
        }

        match self.source.slave_status() {
            Ok(Some(slave)) => {
                for (name, value) in [
                    ("read_master_log_pos", slave.read_master_log_pos),
                    ("relay_log_pos", slave.relay_log_pos),
                    ("exec_master_log_pos", slave.exec_master_log_pos),
                    ("relay_log_space", slave.relay_log_space),
                    ("seconds_behind_master", slave.seconds_behind_master),
                ] {
                    values.insert(name.to_string(), value);
                }
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "slave status unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{MasterStatus, MockFs, MockSource, SlaveStatus};

    fn source() -> MockSource {
        MockSource::new()
            .with_status("Questions", "1000")
            .with_status("Threads_connected", "12")
            .with_status("Ssl_accepts", "5")
            .with_status("Last_query_cost", "0.000000")
            .with_status("Compression", "OFF")
            .with_variable("max_connections", "151")
            .with_variable("innodb_file_per_table", "ON")
            .with_variable("version_comment", "MySQL Community Server")
            .with_variable("datadir", "/var/lib/mysql/")
            .with_variable("tmpdir", "/tmp")
    }

    #[test]
    fn test_collect_normalizes_and_skips_neglectable() {
        let mut collector = Collector::new(source()).skip_replication(true);
        let values = collector.collect().unwrap();

        assert_eq!(values["questions"], Some(1000));
        assert_eq!(values["threads_connected"], Some(12));
        assert_eq!(values["compression"], Some(0));
        assert!(!values.contains_key("ssl_accepts"));
        assert!(!values.contains_key("last_query_cost"));
        assert!(!values.contains_key("master_status_position"));
    }

    #[test]
    fn test_collect_monitored_variables_always_present() {
        let mut collector = Collector::new(source()).skip_replication(true);
        let values = collector.collect().unwrap();

        assert_eq!(values["max_connections"], Some(151));
        assert_eq!(values["innodb_file_per_table"], Some(1));
        for name in MONITORED_GLOBAL_VARIABLES {
            assert!(values.contains_key(*name), "missing {}", name);
        }
        assert!(!values.contains_key("version_comment"));
    }

    #[test]
    fn test_collect_replication_positions() {
        let mut src = source();
        src.master = Some(MasterStatus {
            file: "mysql-bin.000017".to_string(),
            position: Some(4_500),
        });
        src.slave = Some(SlaveStatus {
            read_master_log_pos: Some(900),
            seconds_behind_master: None,
            ..Default::default()
        });
        let values = Collector::new(src).collect().unwrap();

        assert_eq!(values["master_status_position"], Some(4_500));
        assert_eq!(values["master_status_file_number"], Some(17));
        assert_eq!(values["read_master_log_pos"], Some(900));
        assert_eq!(values["seconds_behind_master"], None);
    }

    #[test]
    fn test_collect_replication_permission_fault_is_not_fatal() {
        let mut src = source();
        src.deny_replication = true;
        let values = Collector::new(src).collect().unwrap();

        for name in REPLICATION_COLUMNS {
            assert_eq!(values[*name], None);
        }
        assert_eq!(values["questions"], Some(1000));
    }

    #[test]
    fn test_collect_offline_is_fatal() {
        let mut src = source();
        src.offline = true;
        let err = Collector::new(src).collect().unwrap_err();
        assert!(matches!(err, CollectError::Connection(_)));
    }

    #[test]
    fn test_collect_with_os_metrics() {
        let values = Collector::new(source())
            .skip_replication(true)
            .with_os(OsCollector::new(MockFs::typical_system()))
            .collect()
            .unwrap();
        assert_eq!(values["os_loadavg_millis"], Some(520));
        assert_eq!(values["os_datadir_mountpoint_usage_percent"], Some(25));
        assert_eq!(values["os_tmpdir_mountpoint_usage_percent"], Some(60));
        assert!(!values.contains_key("datadir"));
    }
}

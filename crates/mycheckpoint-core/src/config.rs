//! Settings for one invocation.
//!
//! Values come from an optional TOML file; the binary overrides them with
//! command-line flags and environment variables.
//!
//! ```toml
//! data_dir = "/var/lib/mycheckpoint"
//! purge_days = 62
//!
//! [mysql]
//! host = "localhost"
//! user = "monitor"
//!
//! [mail]
//! to = ["dba@example.com"]
//!
//! [[alert]]
//! id = 1
//! condition = "seconds_behind_master > 600"
//! description = "Replication lag above 10 minutes"
//! severity = "error"
//! alert_delay_minutes = 5
//!
//! [[metric]]
//! name = "tmp_disk_tables_percent"
//! expression = "ROUND(100*created_tmp_disk_tables_diff/NULLIF(created_tmp_tables_diff, 0), 2)"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::alert::AlertCondition;
use crate::report::DerivedMetric;

pub const DEFAULT_PURGE_DAYS: u32 = 62;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("alert condition id {0} is defined more than once")]
    DuplicateCondition(u32),
}

/// Connection parameters for the monitored server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MysqlOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Unix socket; overrides host/port when set.
    pub socket: Option<String>,
}

impl Default for MysqlOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            socket: None,
        }
    }
}

impl MysqlOptions {
    /// True when the server runs on this host, so `/proc` describes it.
    pub fn is_local(&self) -> bool {
        self.socket.is_some() || matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    pub from: String,
    pub to: Vec<String>,
    pub sendmail: PathBuf,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            from: "mycheckpoint@localhost".to_string(),
            to: Vec::new(),
            sendmail: PathBuf::from("/usr/sbin/sendmail"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mysql: MysqlOptions,
    pub data_dir: PathBuf,
    pub purge_days: u32,
    pub skip_check_replication: bool,
    pub skip_alerts: bool,
    pub skip_emails: bool,
    /// Collect `/proc` metrics; defaults to whether the server is local.
    pub os_metrics: Option<bool>,
    pub mail: MailSettings,
    #[serde(rename = "alert")]
    pub conditions: Vec<AlertCondition>,
    /// Additional derived report metrics; a name matching a built-in
    /// replaces it.
    #[serde(rename = "metric")]
    pub metrics: Vec<DerivedMetric>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mysql: MysqlOptions::default(),
            data_dir: PathBuf::from("mycheckpoint-data"),
            purge_days: DEFAULT_PURGE_DAYS,
            skip_check_replication: false,
            skip_alerts: false,
            skip_emails: false,
            os_metrics: None,
            mail: MailSettings::default(),
            conditions: Vec::new(),
            metrics: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.purge_days < 1 {
            return Err(ConfigError::InvalidValue {
                field: "purge_days".to_string(),
                value: self.purge_days.to_string(),
            });
        }

        let mut ids = HashSet::new();
        for condition in &self.conditions {
            if !ids.insert(condition.id) {
                return Err(ConfigError::DuplicateCondition(condition.id));
            }
            if let Err(e) = condition.compile() {
                warn!(
                    condition = condition.id,
                    error = %e,
                    "alert condition does not parse and will never fire"
                );
            }
        }

        for metric in &self.metrics {
            if let Err(e) = metric.compile() {
                return Err(ConfigError::InvalidValue {
                    field: format!("metric.{}", metric.name),
                    value: e.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn collect_os_metrics(&self) -> bool {
        self.os_metrics.unwrap_or_else(|| self.mysql.is_local())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Severity;

    #[test]
    fn test_defaults() {
        let s = Settings::load(None).unwrap();
        assert_eq!(s.purge_days, 62);
        assert_eq!(s.mysql.port, 3306);
        assert!(s.collect_os_metrics());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mycheckpoint.toml");
        std::fs::write(
            &path,
            r#"
            data_dir = "/srv/mycheckpoint"
            purge_days = 30

            [mysql]
            host = "db1.example.com"
            user = "monitor"

            [mail]
            to = ["dba@example.com"]

            [[alert]]
            id = 1
            condition = "seconds_behind_master > 600"
            severity = "critical"
            alert_delay_minutes = 5

            [[metric]]
            name = "tmp_disk_tables_percent"
            expression = "ROUND(100*created_tmp_disk_tables_diff/NULLIF(created_tmp_tables_diff, 0), 2)"
            "#,
        )
        .unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.data_dir, PathBuf::from("/srv/mycheckpoint"));
        assert_eq!(s.purge_days, 30);
        assert_eq!(s.mysql.host, "db1.example.com");
        assert_eq!(s.mysql.port, 3306);
        assert!(!s.collect_os_metrics());
        assert_eq!(s.mail.to, vec!["dba@example.com".to_string()]);
        assert_eq!(s.mail.sendmail, PathBuf::from("/usr/sbin/sendmail"));
        assert_eq!(s.conditions[0].severity, Severity::Critical);
        assert_eq!(s.metrics[0].name, "tmp_disk_tables_percent");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let s = Settings {
            purge_days: 0,
            ..Default::default()
        };
        assert!(matches!(
            s.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let c: AlertCondition = toml::from_str("id = 1\ncondition = \"1 = 1\"").unwrap();
        let s = Settings {
            conditions: vec![c.clone(), c],
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(ConfigError::DuplicateCondition(1))));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "purge_days = \"many\"").unwrap();
        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_is_local() {
        assert!(MysqlOptions::default().is_local());
        let remote = MysqlOptions {
            host: "db1.example.com".to_string(),
            ..Default::default()
        };
        assert!(!remote.is_local());
        let socket = MysqlOptions {
            socket: Some("/var/run/mysqld/mysqld.sock".to_string()),
            ..remote
        };
        assert!(socket.is_local());
    }
}

//! Human-facing views: derived metrics, configuration changes and the
//! brief plain-text report.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alert::{AlertCondition, ExprError, Expression, PendingAlert};
use crate::metrics::{Classification, ColumnKind, ColumnLookup};
use crate::notify::{Message, format_ts};
use crate::rates::{RateRecord, predecessor_id};
use crate::rollup::RollupRecord;
use crate::storage::Snapshot;

// ---------------------------------------------------------------------------
// Derived metrics
// ---------------------------------------------------------------------------

/// Named expression over a sample or rollup row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedMetric {
    pub name: String,
    pub expression: String,
}

impl DerivedMetric {
    pub fn new(name: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            expression: expression.to_string(),
        }
    }

    pub fn compile(&self) -> Result<Expression, ExprError> {
        Expression::parse(&self.expression)
    }
}

/// Ratios every report shows.
pub const BUILTIN_METRICS: &[(&str, &str)] = &[
    ("com_select_percent", "ROUND(100*com_select_diff/NULLIF(questions_diff, 0), 2)"),
    ("com_insert_percent", "ROUND(100*com_insert_diff/NULLIF(questions_diff, 0), 2)"),
    ("com_update_percent", "ROUND(100*com_update_diff/NULLIF(questions_diff, 0), 2)"),
    ("com_delete_percent", "ROUND(100*com_delete_diff/NULLIF(questions_diff, 0), 2)"),
    ("com_replace_percent", "ROUND(100*com_replace_diff/NULLIF(questions_diff, 0), 2)"),
    ("com_commit_percent", "ROUND(100*com_commit_diff/NULLIF(questions_diff, 0), 2)"),
    ("slow_queries_percent", "ROUND(100*slow_queries_diff/NULLIF(questions_diff, 0), 2)"),
    ("select_scan_percent", "ROUND(100*select_scan_diff/NULLIF(com_select_diff, 0), 2)"),
    ("select_full_join_percent", "ROUND(100*select_full_join_diff/NULLIF(com_select_diff, 0), 2)"),
    ("select_range_percent", "ROUND(100*select_range_diff/NULLIF(com_select_diff, 0), 2)"),
    (
        "innodb_estimated_log_mb_written_per_hour",
        "ROUND(innodb_os_log_written_psec*60*60/1024/1024, 1)",
    ),
    (
        "innodb_read_hit_percent",
        "ROUND(100 - (100*innodb_buffer_pool_reads_diff/NULLIF(innodb_buffer_pool_read_requests_diff, 0)), 2)",
    ),
    (
        "innodb_buffer_pool_used_percent",
        "ROUND(100 - 100*innodb_buffer_pool_pages_free/NULLIF(innodb_buffer_pool_pages_total, 0), 2)",
    ),
    (
        "key_buffer_usage_percent",
        "ROUND(100 - 100*(key_blocks_unused * key_cache_block_size)/NULLIF(key_buffer_size, 0), 2)",
    ),
    ("key_read_hit_percent", "ROUND(100 - 100*key_reads_diff/NULLIF(key_read_requests_diff, 0), 2)"),
    ("key_write_hit_percent", "ROUND(100 - 100*key_writes_diff/NULLIF(key_write_requests_diff, 0), 2)"),
    (
        "table_lock_waited_percent",
        "ROUND(100*table_locks_waited_diff/NULLIF(table_locks_waited_diff + table_locks_immediate_diff, 0), 2)",
    ),
    (
        "aborted_connections_percent",
        "ROUND(100*aborted_connects_diff/NULLIF(connections_diff, 0), 2)",
    ),
    ("table_cache_use_percent", "ROUND(100*open_tables/NULLIF(table_open_cache, 0), 2)"),
];

/// Built-in metrics with `extra` appended; an extra metric with a built-in
/// name replaces it in place.
pub fn derived_metrics(extra: &[DerivedMetric]) -> Vec<DerivedMetric> {
    let overrides: HashMap<&str, &DerivedMetric> =
        extra.iter().map(|m| (m.name.as_str(), m)).collect();
    let mut metrics: Vec<DerivedMetric> = BUILTIN_METRICS
        .iter()
        .map(|(name, expr)| match overrides.get(name) {
            Some(m) => (*m).clone(),
            None => DerivedMetric::new(name, expr),
        })
        .collect();
    metrics.extend(
        extra
            .iter()
            .filter(|m| !BUILTIN_METRICS.iter().any(|(name, _)| *name == m.name))
            .cloned(),
    );
    metrics
}

/// Evaluates every metric against `row`. A metric that references a column
/// the row lacks (older server, skipped replication) is `None`.
pub fn evaluate_metrics(
    metrics: &[DerivedMetric],
    row: &dyn ColumnLookup,
) -> Vec<(String, Option<f64>)> {
    metrics
        .iter()
        .map(|metric| {
            let value = match metric.compile().and_then(|e| e.evaluate(row)) {
                Ok(v) => v,
                Err(e) => {
                    debug!(metric = %metric.name, error = %e, "metric unavailable");
                    None
                }
            };
            (metric.name.clone(), value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Parameter changes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterChange {
    pub timestamp: i64,
    pub variable: String,
    pub old_value: i64,
    pub new_value: i64,
}

/// Global variables whose value differs from the logically previous
/// snapshot, ordered by time then name. Missing values never count as a
/// change.
pub fn parameter_changes(
    snapshots: &[Snapshot],
    classification: &Classification,
) -> Vec<ParameterChange> {
    let by_id: HashMap<u64, &Snapshot> = snapshots.iter().map(|s| (s.id, s)).collect();
    let mut changes = Vec::new();
    for curr in snapshots {
        let Some(prev) = predecessor_id(curr).and_then(|id| by_id.get(&id)) else {
            continue;
        };
        for (name, new_value) in &curr.values {
            if name == "timestamp" || classification.kind(name) != ColumnKind::Gauge {
                continue;
            }
            if let (Some(old_value), Some(new_value)) = (prev.value(name), *new_value)
                && old_value != new_value
            {
                changes.push(ParameterChange {
                    timestamp: curr.timestamp,
                    variable: name.clone(),
                    old_value,
                    new_value,
                });
            }
        }
    }
    changes.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.variable.cmp(&b.variable))
    });
    changes
}

// ---------------------------------------------------------------------------
// Brief report
// ---------------------------------------------------------------------------

/// Columns shown for every period, before the derived metrics.
const KEY_COLUMNS: &[(&str, &str)] = &[
    ("questions_psec", "Questions/sec"),
    ("com_select_psec", "SELECT/sec"),
    ("com_insert_psec", "INSERT/sec"),
    ("com_update_psec", "UPDATE/sec"),
    ("com_delete_psec", "DELETE/sec"),
    ("slow_queries_psec", "Slow queries/sec"),
    ("bytes_sent_psec", "Bytes sent/sec"),
    ("bytes_received_psec", "Bytes received/sec"),
    ("threads_connected", "Threads connected"),
    ("threads_running", "Threads running"),
    ("seconds_behind_master", "Seconds behind master"),
    ("os_loadavg_millis", "Load average x1000"),
];

fn fmt_value(v: Option<f64>) -> String {
    match v {
        Some(v) if v.fract() == 0.0 => format!("{}", v as i64),
        Some(v) => format!("{:.2}", v),
        None => "n/a".to_string(),
    }
}

/// Everything the brief report shows.
pub struct BriefReport<'a> {
    pub host: &'a str,
    pub generated_at: i64,
    pub latest: Option<&'a RateRecord>,
    pub last_hour: Option<&'a RollupRecord>,
    pub last_day: Option<&'a RollupRecord>,
    pub parameter_changes: &'a [ParameterChange],
    pub open_alerts: Vec<(&'a AlertCondition, &'a PendingAlert)>,
    pub metrics: &'a [DerivedMetric],
}

impl BriefReport<'_> {
    fn section(&self, out: &mut String, title: &str, row: &dyn ColumnLookup) {
        let _ = writeln!(out, "{}", title);
        for (column, label) in KEY_COLUMNS {
            if let Some(value) = row.lookup(column) {
                let _ = writeln!(out, "  {:<42} {}", label, fmt_value(value));
            }
        }
        for (name, value) in evaluate_metrics(self.metrics, row) {
            if value.is_some() {
                let _ = writeln!(out, "  {:<42} {}", name, fmt_value(value));
            }
        }
        out.push('\n');
    }

    pub fn render(&self) -> Message {
        let mut out = String::new();
        let _ = writeln!(out, "mycheckpoint brief report for {}", self.host);
        let _ = writeln!(out, "Generated {}\n", format_ts(self.generated_at));

        match self.latest {
            Some(r) => self.section(
                &mut out,
                &format!(
                    "Latest sample (#{} at {}, {}s interval)",
                    r.id(),
                    format_ts(r.timestamp()),
                    r.elapsed_seconds()
                ),
                r,
            ),
            None => out.push_str("No samples yet\n\n"),
        }
        if let Some(h) = self.last_hour {
            self.section(
                &mut out,
                &format!("Hour starting {} ({} samples)", format_ts(h.start), h.sample_count),
                h,
            );
        }
        if let Some(d) = self.last_day {
            self.section(
                &mut out,
                &format!("Day starting {} ({} samples)", format_ts(d.start), d.sample_count),
                d,
            );
        }

        out.push_str("Parameter changes\n");
        if self.parameter_changes.is_empty() {
            out.push_str("  none\n");
        }
        for c in self.parameter_changes {
            let _ = writeln!(
                out,
                "  {} {}: {} -> {}",
                format_ts(c.timestamp),
                c.variable,
                c.old_value,
                c.new_value
            );
        }
        out.push('\n');

        out.push_str("Open alerts\n");
        if self.open_alerts.is_empty() {
            out.push_str("  none\n");
        }
        for (condition, pending) in &self.open_alerts {
            let _ = writeln!(
                out,
                "  #{} [{}] {} (since {})",
                condition.id,
                condition.severity,
                condition.label(),
                format_ts(pending.start_ts)
            );
        }

        Message {
            subject: format!("mycheckpoint brief report: {}", self.host),
            body: out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Severity;
    use crate::rates::compute_rate;

    fn snapshot(id: u64, timestamp: i64, pairs: &[(&str, Option<i64>)]) -> Snapshot {
        Snapshot {
            id,
            timestamp,
            values: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn test_builtin_metrics_parse() {
        for metric in derived_metrics(&[]) {
            assert!(metric.compile().is_ok(), "{} does not parse", metric.name);
        }
    }

    #[test]
    fn test_derived_metrics_override_and_extend() {
        let metrics = derived_metrics(&[
            DerivedMetric::new("com_select_percent", "1"),
            DerivedMetric::new("custom", "2"),
        ]);
        assert_eq!(metrics.len(), BUILTIN_METRICS.len() + 1);
        assert_eq!(metrics[0].expression, "1");
        assert_eq!(metrics.last().unwrap().name, "custom");
    }

    #[test]
    fn test_evaluate_metrics_on_rate_record() {
        let c = Classification::new();
        let prev = snapshot(
            1,
            0,
            &[
                ("questions", Some(1000)),
                ("com_select", Some(100)),
                ("innodb_buffer_pool_pages_free", Some(10)),
                ("innodb_buffer_pool_pages_total", Some(40)),
            ],
        );
        let curr = snapshot(
            2,
            60,
            &[
                ("questions", Some(1400)),
                ("com_select", Some(200)),
                ("innodb_buffer_pool_pages_free", Some(10)),
                ("innodb_buffer_pool_pages_total", Some(40)),
            ],
        );
        let r = compute_rate(&curr, &prev, &c);
        let values: HashMap<String, Option<f64>> =
            evaluate_metrics(&derived_metrics(&[]), &r).into_iter().collect();

        assert_eq!(values["com_select_percent"], Some(25.0));
        assert_eq!(values["innodb_buffer_pool_used_percent"], Some(75.0));
        // Columns absent from the sample.
        assert_eq!(values["key_read_hit_percent"], None);
    }

    #[test]
    fn test_parameter_changes() {
        let c = Classification::new();
        let snaps = vec![
            snapshot(1, 0, &[("max_connections", Some(100)), ("questions", Some(1))]),
            snapshot(2, 60, &[("max_connections", Some(200)), ("questions", Some(9))]),
            snapshot(3, 120, &[("max_connections", None), ("questions", Some(10))]),
            snapshot(4, 180, &[("max_connections", Some(300)), ("questions", Some(11))]),
        ];
        let changes = parameter_changes(&snaps, &c);
        assert_eq!(
            changes,
            vec![ParameterChange {
                timestamp: 60,
                variable: "max_connections".to_string(),
                old_value: 100,
                new_value: 200,
            }]
        );
    }

    #[test]
    fn test_brief_report_render() {
        let c = Classification::new();
        let prev = snapshot(1, 0, &[("questions", Some(0)), ("threads_connected", Some(3))]);
        let curr = snapshot(2, 60, &[("questions", Some(600)), ("threads_connected", Some(4))]);
        let r = compute_rate(&curr, &prev, &c);
        let condition = AlertCondition {
            id: 3,
            enabled: true,
            condition: "threads_connected > 2".to_string(),
            description: "Busy".to_string(),
            severity: Severity::Info,
            alert_delay_minutes: 0,
            repetitive_alert: false,
        };
        let pending = PendingAlert::new(3, 2, 60, 60);
        let metrics = derived_metrics(&[]);

        let message = BriefReport {
            host: "db1",
            generated_at: 60,
            latest: Some(&r),
            last_hour: None,
            last_day: None,
            parameter_changes: &[],
            open_alerts: vec![(&condition, &pending)],
            metrics: &metrics,
        }
        .render();

        assert_eq!(message.subject, "mycheckpoint brief report: db1");
        assert!(message.body.contains("Questions/sec"));
        assert!(message.body.contains(" 10\n"));
        assert!(message.body.contains("#3 [info] Busy (since 1970-01-01 00:01:00 UTC)"));
        assert!(!message.body.contains("key_read_hit_percent"));
    }
}

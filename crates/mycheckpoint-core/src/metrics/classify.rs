use std::collections::HashSet;

use super::variables::{MONITORED_GLOBAL_VARIABLES, OS_GAUGE_COLUMNS, SIGNED_STATUS_VARIABLES};

/// How a column is diffed and aggregated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// Holds its own value; carried through diffs unchanged.
    Gauge,
    /// Cumulative value; diffed against the previous snapshot.
    /// `signed` counters may go down and are never reset-corrected.
    Counter { signed: bool },
}

impl ColumnKind {
    pub fn is_counter(self) -> bool {
        matches!(self, ColumnKind::Counter { .. })
    }
}

/// Fixed per-run classification table.
///
/// Anything not listed as a gauge is a counter, and anything not listed as
/// signed is an unsigned counter, so columns added by newer server versions
/// are classified without configuration.
#[derive(Debug, Clone)]
pub struct Classification {
    gauges: HashSet<String>,
    signed: HashSet<String>,
}

impl Default for Classification {
    fn default() -> Self {
        Self::new()
    }
}

impl Classification {
    pub fn new() -> Self {
        let gauges = MONITORED_GLOBAL_VARIABLES
            .iter()
            .chain(OS_GAUGE_COLUMNS)
            .map(|s| s.to_string())
            .collect();
        let signed = SIGNED_STATUS_VARIABLES
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self { gauges, signed }
    }

    pub fn kind(&self, column: &str) -> ColumnKind {
        if self.gauges.contains(column) {
            ColumnKind::Gauge
        } else {
            ColumnKind::Counter {
                signed: self.signed.contains(column),
            }
        }
    }

    pub fn is_gauge(&self, column: &str) -> bool {
        self.kind(column) == ColumnKind::Gauge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_columns() {
        let c = Classification::new();
        assert_eq!(c.kind("max_connections"), ColumnKind::Gauge);
        assert_eq!(c.kind("os_mem_free_kb"), ColumnKind::Gauge);
        assert_eq!(
            c.kind("threads_connected"),
            ColumnKind::Counter { signed: true }
        );
        assert_eq!(
            c.kind("seconds_behind_master"),
            ColumnKind::Counter { signed: true }
        );
        assert_eq!(c.kind("questions"), ColumnKind::Counter { signed: false });
    }

    #[test]
    fn test_unknown_column_is_unsigned_counter() {
        let c = Classification::new();
        let kind = c.kind("some_future_status_variable");
        assert!(kind.is_counter());
        assert_eq!(kind, ColumnKind::Counter { signed: false });
    }
}

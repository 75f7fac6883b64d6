//! Snapshot structures for storage.
//!
//! On disk a snapshot is a [`SampleRow`]: values aligned with the ordered
//! column list of the store. Rows written before a column was added are
//! shorter than the column list; the missing tail reads back as `None`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One timestamped reading of every monitored column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Store-assigned identity, increasing in insertion order.
    pub id: u64,
    /// Unix seconds (UTC). Unique within the store.
    pub timestamp: i64,
    /// Column name → value. `None` when the server did not report it.
    pub values: BTreeMap<String, Option<i64>>,
}

impl Snapshot {
    pub fn value(&self, column: &str) -> Option<i64> {
        self.values.get(column).copied().flatten()
    }

    /// Id distance to the logically previous snapshot.
    ///
    /// Follows the server's `auto_increment_increment` as recorded in this
    /// snapshot, never less than 1.
    pub fn auto_increment_step(&self) -> u64 {
        self.value("auto_increment_increment")
            .filter(|v| *v > 0)
            .map(|v| v as u64)
            .unwrap_or(1)
    }
}

/// Serialized form of a snapshot inside a segment file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct SampleRow {
    pub(crate) id: u64,
    pub(crate) timestamp: i64,
    pub(crate) values: Vec<Option<i64>>,
}

impl SampleRow {
    pub(crate) fn into_snapshot(self, columns: &[String]) -> Snapshot {
        let mut values = BTreeMap::new();
        for (i, column) in columns.iter().enumerate() {
            values.insert(column.clone(), self.values.get(i).copied().flatten());
        }
        Snapshot {
            id: self.id,
            timestamp: self.timestamp,
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_row_reads_missing_columns_as_none() {
        let columns = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let row = SampleRow {
            id: 3,
            timestamp: 100,
            values: vec![Some(1), None],
        };
        let snap = row.into_snapshot(&columns);
        assert_eq!(snap.values.len(), 3);
        assert_eq!(snap.value("a"), Some(1));
        assert_eq!(snap.value("b"), None);
        assert_eq!(snap.value("c"), None);
        assert!(snap.values.contains_key("c"));
    }

    #[test]
    fn test_auto_increment_step() {
        let mut snap = Snapshot {
            id: 1,
            timestamp: 0,
            values: BTreeMap::new(),
        };
        assert_eq!(snap.auto_increment_step(), 1);
        snap.values
            .insert("auto_increment_increment".to_string(), Some(0));
        assert_eq!(snap.auto_increment_step(), 1);
        snap.values
            .insert("auto_increment_increment".to_string(), Some(5));
        assert_eq!(snap.auto_increment_step(), 5);
    }
}

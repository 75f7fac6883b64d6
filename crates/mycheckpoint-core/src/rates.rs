//! Per-interval diffs and per-second rates between logically adjacent
//! snapshots.
//!
//! This module is the single place where deltas are computed. Rollups,
//! reports and alert evaluation all consume its `RateRecord`s.

use std::collections::{BTreeMap, HashMap};

use crate::metrics::{Classification, ColumnKind, ColumnLookup, ColumnRef};
use crate::storage::Snapshot;

// ---------------------------------------------------------------------------
// Delta helpers
// ---------------------------------------------------------------------------

/// Delta of one counter between two snapshots.
///
/// Signed counters subtract plainly. Unsigned counters assume a server
/// restart when the value went down and take the current value as the
/// delta. This under-counts activity across the restart and is accepted.
pub fn counter_delta(curr: Option<i64>, prev: Option<i64>, signed: bool) -> Option<i64> {
    let (curr, prev) = (curr?, prev?);
    if signed || curr >= prev {
        curr.checked_sub(prev)
    } else {
        Some(curr)
    }
}

/// Rounds half away from zero to two decimals.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `delta / elapsed`, rounded to two decimals. `None` when either side is
/// missing or no time elapsed.
pub fn per_second(delta: Option<i64>, elapsed_seconds: i64) -> Option<f64> {
    let delta = delta?;
    (elapsed_seconds > 0).then(|| round2(delta as f64 / elapsed_seconds as f64))
}

/// Id of the snapshot this one is diffed against.
pub fn predecessor_id(curr: &Snapshot) -> Option<u64> {
    curr.id
        .checked_sub(curr.auto_increment_step())
        .filter(|id| *id > 0)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One column of a diff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnDiff {
    pub kind: ColumnKind,
    /// Value in the newer snapshot. Gauges carry it unchanged.
    pub value: Option<i64>,
    /// `None` for gauges and whenever either side is missing.
    pub delta: Option<i64>,
}

/// Snapshot paired with its predecessor.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffRecord {
    pub id: u64,
    pub timestamp: i64,
    pub elapsed_seconds: i64,
    pub columns: BTreeMap<String, ColumnDiff>,
}

impl DiffRecord {
    pub fn value(&self, column: &str) -> Option<i64> {
        self.columns.get(column).and_then(|c| c.value)
    }

    pub fn delta(&self, column: &str) -> Option<i64> {
        self.columns.get(column).and_then(|c| c.delta)
    }
}

/// Diff record plus per-second rates of every counter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateRecord {
    pub diff: DiffRecord,
    pub rates: BTreeMap<String, Option<f64>>,
}

impl RateRecord {
    pub fn id(&self) -> u64 {
        self.diff.id
    }

    pub fn timestamp(&self) -> i64 {
        self.diff.timestamp
    }

    pub fn elapsed_seconds(&self) -> i64 {
        self.diff.elapsed_seconds
    }

    pub fn value(&self, column: &str) -> Option<i64> {
        self.diff.value(column)
    }

    pub fn delta(&self, column: &str) -> Option<i64> {
        self.diff.delta(column)
    }

    pub fn rate(&self, column: &str) -> Option<f64> {
        self.rates.get(column).copied().flatten()
    }
}

impl ColumnLookup for RateRecord {
    fn lookup(&self, name: &str) -> Option<Option<f64>> {
        if let Some(c) = self.diff.columns.get(name) {
            return Some(c.value.map(|v| v as f64));
        }
        match ColumnRef::parse(name) {
            ColumnRef::Elapsed => Some(Some(self.diff.elapsed_seconds as f64)),
            ColumnRef::Value(_) => None,
            ColumnRef::Delta(column) => {
                let c = self.diff.columns.get(column)?;
                c.kind.is_counter().then(|| c.delta.map(|d| d as f64))
            }
            ColumnRef::Rate(column) => self.rates.get(column).copied(),
        }
    }
}

// ---------------------------------------------------------------------------
// Computation
// ---------------------------------------------------------------------------

pub fn compute_diff(curr: &Snapshot, prev: &Snapshot, classification: &Classification) -> DiffRecord {
    let columns = curr
        .values
        .iter()
        .map(|(name, value)| {
            let kind = classification.kind(name);
            let delta = match kind {
                ColumnKind::Gauge => None,
                ColumnKind::Counter { signed } => counter_delta(*value, prev.value(name), signed),
            };
            (
                name.clone(),
                ColumnDiff {
                    kind,
                    value: *value,
                    delta,
                },
            )
        })
        .collect();

    DiffRecord {
        id: curr.id,
        timestamp: curr.timestamp,
        elapsed_seconds: curr.timestamp - prev.timestamp,
        columns,
    }
}

pub fn compute_rate(curr: &Snapshot, prev: &Snapshot, classification: &Classification) -> RateRecord {
    let diff = compute_diff(curr, prev, classification);
    let rates = diff
        .columns
        .iter()
        .filter(|(_, c)| c.kind.is_counter())
        .map(|(name, c)| (name.clone(), per_second(c.delta, diff.elapsed_seconds)))
        .collect();
    RateRecord { diff, rates }
}

/// Rate records for every snapshot whose predecessor is among `snapshots`.
///
/// The first snapshot, and any whose predecessor was purged or skipped,
/// produce no record.
pub fn rate_series(snapshots: &[Snapshot], classification: &Classification) -> Vec<RateRecord> {
    let by_id: HashMap<u64, &Snapshot> = snapshots.iter().map(|s| (s.id, s)).collect();
    let mut records: Vec<RateRecord> = snapshots
        .iter()
        .filter_map(|curr| {
            let prev = by_id.get(&predecessor_id(curr)?)?;
            Some(compute_rate(curr, prev, classification))
        })
        .collect();
    records.sort_by_key(|r| r.timestamp());
    records
}

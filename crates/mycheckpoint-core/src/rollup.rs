//! Hour and day aggregation of rate records, recent-window views and the
//! fixed-interval grid used for charting.

use std::collections::BTreeMap;

use crate::metrics::{ColumnKind, ColumnLookup, ColumnRef};
use crate::rates::{RateRecord, round2};

pub const HOUR_SECONDS: i64 = 3_600;
pub const DAY_SECONDS: i64 = 86_400;

/// Slot width of the chart grid.
pub const GRID_SLOT_SECONDS: i64 = 600;

/// Aggregation bucket, truncated in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Hour,
    Day,
}

impl Bucket {
    pub fn seconds(self) -> i64 {
        match self {
            Bucket::Hour => HOUR_SECONDS,
            Bucket::Day => DAY_SECONDS,
        }
    }

    /// Start of the bucket containing `timestamp`.
    pub fn start_of(self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.seconds())
    }
}

// ---------------------------------------------------------------------------
// Aggregation rules
// ---------------------------------------------------------------------------

/// Which derived quantity of a column is aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    Value,
    Delta,
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationRule {
    Sum,
    /// Mean, rounded to two decimals.
    Avg,
    Max,
    /// Value of the latest sample in the bucket.
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnClass {
    Gauge,
    Counter,
}

/// Single source of truth for how a bucket combines its samples.
/// Gauges have no delta or rate.
const AGGREGATION_RULES: &[(ColumnClass, Measure, AggregationRule)] = &[
    (ColumnClass::Counter, Measure::Delta, AggregationRule::Sum),
    (ColumnClass::Counter, Measure::Rate, AggregationRule::Avg),
    (ColumnClass::Counter, Measure::Value, AggregationRule::Last),
    (ColumnClass::Gauge, Measure::Value, AggregationRule::Max),
];

impl AggregationRule {
    pub fn for_column(kind: ColumnKind, measure: Measure) -> Option<Self> {
        let class = match kind {
            ColumnKind::Gauge => ColumnClass::Gauge,
            ColumnKind::Counter { .. } => ColumnClass::Counter,
        };
        AGGREGATION_RULES
            .iter()
            .find(|(c, m, _)| *c == class && *m == measure)
            .map(|(_, _, rule)| *rule)
    }

    /// Combines integer values in sample order. SQL semantics: missing
    /// values are ignored, and an all-missing input yields `None`.
    fn fold_i64(self, values: &[Option<i64>]) -> Option<i64> {
        let present = values.iter().flatten().copied();
        match self {
            AggregationRule::Sum => present.fold(None, |acc: Option<i64>, v| {
                Some(acc.unwrap_or(0).saturating_add(v))
            }),
            AggregationRule::Max => present.max(),
            AggregationRule::Last => values.last().copied().flatten(),
            AggregationRule::Avg => None,
        }
    }

    fn fold_f64(self, values: &[Option<f64>]) -> Option<f64> {
        let present: Vec<f64> = values.iter().flatten().copied().collect();
        match self {
            AggregationRule::Avg if !present.is_empty() => {
                Some(round2(present.iter().sum::<f64>() / present.len() as f64))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rollup records
// ---------------------------------------------------------------------------

/// One aggregated column of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollupColumn {
    pub kind: ColumnKind,
    /// MAX for gauges, LAST for counters.
    pub value: Option<i64>,
    /// SUM of counter deltas.
    pub delta: Option<i64>,
    /// AVG of counter rates.
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupRecord {
    pub bucket: Bucket,
    pub start: i64,
    pub end: i64,
    /// Smallest sample id in the bucket.
    pub first_id: u64,
    pub sample_count: usize,
    pub elapsed_seconds: i64,
    pub columns: BTreeMap<String, RollupColumn>,
}

impl RollupRecord {
    pub fn value(&self, column: &str) -> Option<i64> {
        self.columns.get(column).and_then(|c| c.value)
    }

    pub fn delta(&self, column: &str) -> Option<i64> {
        self.columns.get(column).and_then(|c| c.delta)
    }

    pub fn rate(&self, column: &str) -> Option<f64> {
        self.columns.get(column).and_then(|c| c.rate)
    }
}

impl ColumnLookup for RollupRecord {
    fn lookup(&self, name: &str) -> Option<Option<f64>> {
        if let Some(c) = self.columns.get(name) {
            return Some(c.value.map(|v| v as f64));
        }
        match ColumnRef::parse(name) {
            ColumnRef::Elapsed => Some(Some(self.elapsed_seconds as f64)),
            ColumnRef::Value(_) => None,
            ColumnRef::Delta(column) => {
                let c = self.columns.get(column)?;
                c.kind.is_counter().then(|| c.delta.map(|d| d as f64))
            }
            ColumnRef::Rate(column) => {
                let c = self.columns.get(column)?;
                c.kind.is_counter().then_some(c.rate)
            }
        }
    }
}

/// Groups rate records into buckets. Each record lands in exactly one
/// bucket; buckets without records are not produced.
pub fn rollup(rates: &[RateRecord], bucket: Bucket) -> Vec<RollupRecord> {
    let mut groups: BTreeMap<i64, Vec<&RateRecord>> = BTreeMap::new();
    for record in rates {
        groups
            .entry(bucket.start_of(record.timestamp()))
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|(start, mut records)| {
            records.sort_by_key(|r| r.timestamp());
            aggregate(bucket, start, &records)
        })
        .collect()
}

fn aggregate(bucket: Bucket, start: i64, records: &[&RateRecord]) -> RollupRecord {
    let mut kinds: BTreeMap<&str, ColumnKind> = BTreeMap::new();
    for record in records {
        for (name, column) in &record.diff.columns {
            kinds.entry(name.as_str()).or_insert(column.kind);
        }
    }

    let columns = kinds
        .into_iter()
        .map(|(name, kind)| {
            let rule = |measure| AggregationRule::for_column(kind, measure);
            let values: Vec<Option<i64>> = records.iter().map(|r| r.value(name)).collect();
            let value = rule(Measure::Value).and_then(|r| r.fold_i64(&values));
            let (delta, rate) = if kind.is_counter() {
                let deltas: Vec<Option<i64>> = records.iter().map(|r| r.delta(name)).collect();
                let rates: Vec<Option<f64>> = records.iter().map(|r| r.rate(name)).collect();
                (
                    rule(Measure::Delta).and_then(|r| r.fold_i64(&deltas)),
                    rule(Measure::Rate).and_then(|r| r.fold_f64(&rates)),
                )
            } else {
                (None, None)
            };
            (
                name.to_string(),
                RollupColumn {
                    kind,
                    value,
                    delta,
                    rate,
                },
            )
        })
        .collect();

    RollupRecord {
        bucket,
        start,
        end: start + bucket.seconds(),
        first_id: records.iter().map(|r| r.id()).min().unwrap_or_default(),
        sample_count: records.len(),
        elapsed_seconds: records.iter().map(|r| r.elapsed_seconds()).sum(),
        columns,
    }
}

// ---------------------------------------------------------------------------
// Recent windows
// ---------------------------------------------------------------------------

/// Lookback of the "recent" views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Last 24 hours of samples.
    Sample,
    /// Last 10 days of hours.
    Hour,
    /// Last 365 days of days.
    Day,
}

impl Window {
    pub fn seconds(self) -> i64 {
        match self {
            Window::Sample => DAY_SECONDS,
            Window::Hour => 10 * DAY_SECONDS,
            Window::Day => 365 * DAY_SECONDS,
        }
    }

    pub fn since(self, now: i64) -> i64 {
        now - self.seconds()
    }
}

pub fn recent_samples(rates: &[RateRecord], now: i64) -> Vec<RateRecord> {
    let since = Window::Sample.since(now);
    rates
        .iter()
        .filter(|r| r.timestamp() >= since)
        .cloned()
        .collect()
}

pub fn recent_hours(rates: &[RateRecord], now: i64) -> Vec<RollupRecord> {
    recent_buckets(rates, Bucket::Hour, Window::Hour.since(now))
}

pub fn recent_days(rates: &[RateRecord], now: i64) -> Vec<RollupRecord> {
    recent_buckets(rates, Bucket::Day, Window::Day.since(now))
}

fn recent_buckets(rates: &[RateRecord], bucket: Bucket, since: i64) -> Vec<RollupRecord> {
    let first_bucket = bucket.start_of(since);
    let in_window: Vec<RateRecord> = rates
        .iter()
        .filter(|r| r.timestamp() >= first_bucket)
        .cloned()
        .collect();
    rollup(&in_window, bucket)
        .into_iter()
        .filter(|r| r.start >= since)
        .collect()
}

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub start: i64,
    pub value: Option<f64>,
}

/// Dense grid of `slot_seconds` slots over `[from, to)`, `from` aligned down
/// to a slot boundary. A slot takes the value of the latest record inside
/// it and is `None` when no record falls inside.
///
/// `name` is resolved like an expression identifier, so `questions_psec`
/// charts the rate.
pub fn regrid<T: ColumnLookup>(
    records: &[(i64, T)],
    name: &str,
    from: i64,
    to: i64,
    slot_seconds: i64,
) -> Vec<GridPoint> {
    if slot_seconds <= 0 || to <= from {
        return Vec::new();
    }
    let first = from - from.rem_euclid(slot_seconds);
    let slot_count = ((to - first) + slot_seconds - 1) / slot_seconds;
    let mut grid: Vec<(Option<i64>, Option<f64>)> = vec![(None, None); slot_count as usize];

    for (timestamp, record) in records {
        if *timestamp < from || *timestamp >= to {
            continue;
        }
        let idx = ((timestamp - first) / slot_seconds) as usize;
        let Some(slot) = grid.get_mut(idx) else {
            continue;
        };
        if slot.0.is_none_or(|seen| *timestamp >= seen) {
            *slot = (Some(*timestamp), record.lookup(name).flatten());
        }
    }

    grid.into_iter()
        .enumerate()
        .map(|(i, (_, value))| GridPoint {
            start: first + i as i64 * slot_seconds,
            value,
        })
        .collect()
}

/// Grid of one rate-record column at the standard 10-minute resolution.
pub fn regrid_rates(rates: &[RateRecord], name: &str, from: i64, to: i64) -> Vec<GridPoint> {
    let keyed: Vec<(i64, &RateRecord)> = rates.iter().map(|r| (r.timestamp(), r)).collect();
    regrid(&keyed, name, from, to, GRID_SLOT_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Classification;
    use crate::rates::rate_series;
    use crate::storage::Snapshot;

    // 2026-10-01 00:00:00 UTC
    const T0: i64 = 1_790_812_800;

    fn snapshots(points: &[(i64, i64, i64)]) -> Vec<Snapshot> {
        points
            .iter()
            .enumerate()
            .map(|(i, (ts, questions, max_conn))| Snapshot {
                id: i as u64 + 1,
                timestamp: *ts,
                values: [
                    ("questions".to_string(), Some(*questions)),
                    ("max_connections".to_string(), Some(*max_conn)),
                ]
                .into_iter()
                .collect(),
            })
            .collect()
    }

    #[test]
    fn test_bucket_truncation() {
        assert_eq!(Bucket::Hour.start_of(T0 + 3_599), T0);
        assert_eq!(Bucket::Hour.start_of(T0 + 3_600), T0 + 3_600);
        assert_eq!(Bucket::Day.start_of(T0 + 86_399), T0);
    }

    #[test]
    fn test_rule_table() {
        use AggregationRule::*;
        let counter = ColumnKind::Counter { signed: false };
        assert_eq!(AggregationRule::for_column(counter, Measure::Delta), Some(Sum));
        assert_eq!(AggregationRule::for_column(counter, Measure::Rate), Some(Avg));
        assert_eq!(AggregationRule::for_column(counter, Measure::Value), Some(Last));
        assert_eq!(
            AggregationRule::for_column(ColumnKind::Gauge, Measure::Value),
            Some(Max)
        );
        assert_eq!(
            AggregationRule::for_column(ColumnKind::Gauge, Measure::Delta),
            None
        );
    }

    #[test]
    fn test_hour_rollup_sums_deltas_exactly() {
        let c = Classification::new();
        let snaps = snapshots(&[
            (T0 + 600, 100, 100),
            (T0 + 1_200, 160, 150),
            (T0 + 1_800, 400, 120),
            (T0 + 3_600, 1_000, 120),
            (T0 + 4_200, 1_060, 120),
        ]);
        let rates = rate_series(&snaps, &c);
        let hours = rollup(&rates, Bucket::Hour);

        assert_eq!(hours.len(), 2);
        let first = &hours[0];
        assert_eq!(first.start, T0);
        assert_eq!(first.end, T0 + 3_600);
        assert_eq!(first.first_id, 2);
        assert_eq!(first.sample_count, 2);
        assert_eq!(first.elapsed_seconds, 1_200);
        assert_eq!(first.delta("questions"), Some(60 + 240));
        assert_eq!(first.rate("questions"), Some(0.25));
        assert_eq!(first.value("questions"), Some(400));
        assert_eq!(first.value("max_connections"), Some(150));

        let total: i64 = hours.iter().filter_map(|h| h.delta("questions")).sum();
        let direct: i64 = rates.iter().filter_map(|r| r.delta("questions")).sum();
        assert_eq!(total, direct);
    }

    #[test]
    fn test_day_rollup_and_lookup() {
        let c = Classification::new();
        let snaps = snapshots(&[(T0, 0, 10), (T0 + 60, 120, 10), (T0 + 120, 180, 10)]);
        let days = rollup(&rate_series(&snaps, &c), Bucket::Day);

        assert_eq!(days.len(), 1);
        let day = &days[0];
        assert_eq!(day.lookup("questions_diff"), Some(Some(180.0)));
        assert_eq!(day.lookup("questions_psec"), Some(Some(1.5)));
        assert_eq!(day.lookup("ts_diff_seconds"), Some(Some(120.0)));
        assert_eq!(day.lookup("max_connections_psec"), None);
    }

    #[test]
    fn test_recent_windows() {
        let c = Classification::new();
        let now = T0 + 20 * DAY_SECONDS;
        let snaps = snapshots(&[
            (T0, 0, 1),
            (T0 + 60, 60, 1),
            (now - 2 * DAY_SECONDS, 120, 1),
            (now - 2 * DAY_SECONDS + 60, 180, 1),
            (now - 600, 240, 1),
            (now - 540, 300, 1),
        ]);
        // Consecutive ids make every snapshot diff against the previous one.
        let rates = rate_series(&snaps, &c);

        assert_eq!(recent_samples(&rates, now).len(), 2);
        assert!(recent_hours(&rates, now).iter().all(|h| h.start >= now - 10 * DAY_SECONDS));
        assert_eq!(recent_hours(&rates, now).len(), 2);
        assert_eq!(recent_days(&rates, now).len(), 3);
    }

    #[test]
    fn test_regrid_dense_with_gaps() {
        let c = Classification::new();
        let snaps = snapshots(&[
            (T0, 0, 1),
            (T0 + 60, 60, 1),
            (T0 + 300, 300, 1),
            (T0 + 1_860, 1_860, 1),
        ]);
        let rates = rate_series(&snaps, &c);
        let grid = regrid_rates(&rates, "questions_diff", T0, T0 + 2_400);

        assert_eq!(grid.len(), 4);
        assert_eq!(grid[0].start, T0);
        // Latest sample in the first slot wins.
        assert_eq!(grid[0].value, Some(240.0));
        assert_eq!(grid[1].value, None);
        assert_eq!(grid[2].value, None);
        assert_eq!(grid[3].value, Some(1_560.0));
    }
}

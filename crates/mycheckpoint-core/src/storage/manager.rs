use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate};
use tracing::{debug, info, warn};

use super::StoreError;
use super::model::{SampleRow, Snapshot};
use super::schema::{StoreState, read_json, write_json_atomic};

const STATE_FILE: &str = "store.json";
const LOCK_FILE: &str = "store.lock";
const SAMPLES_DIR: &str = "samples";

/// Append-only, daily-segmented snapshot store.
///
/// Layout under `base_path`:
/// - `store.json`: ordered column list and last assigned id
/// - `store.lock`: held exclusively by whoever writes
/// - `samples/mycheckpoint_YYYY-MM-DD.log`: bincode rows, one segment per UTC day
///
/// Each row is written with a single append + fsync. A torn write at the
/// tail of a segment is detected and truncated on open. Writers take the
/// lock and reload `store.json` first, so overlapping invocations never
/// assign the same id or store the same timestamp twice.
pub struct SampleStore {
    base_path: PathBuf,
    samples_path: PathBuf,
    state: StoreState,
    column_index: HashMap<String, usize>,
    latest: Option<(u64, i64)>,
}

impl SampleStore {
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        let samples_path = base_path.join(SAMPLES_DIR);
        std::fs::create_dir_all(&samples_path)?;

        let mut store = Self {
            base_path,
            samples_path,
            state: StoreState::default(),
            column_index: HashMap::new(),
            latest: None,
        };
        {
            let _lock = store.lock()?;
            store.recover_segments()?;
            store.reload()?;
        }
        Ok(store)
    }

    fn lock(&self) -> Result<File, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.base_path.join(LOCK_FILE))?;
        file.lock()?;
        Ok(file)
    }

    /// Re-reads `store.json` and the newest segment. Must hold the lock.
    ///
    /// Columns written by another instance are adopted. `last_id` never
    /// falls behind the newest stored row, which covers a crash between the
    /// segment fsync and the `store.json` update.
    fn reload(&mut self) -> Result<(), StoreError> {
        let on_disk: StoreState = read_json(&self.base_path.join(STATE_FILE))?.unwrap_or_default();
        let mut columns = on_disk.columns;
        for name in &self.state.columns {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
        self.column_index = index_columns(&columns);
        self.state.columns = columns;
        self.state.last_id = self.state.last_id.max(on_disk.last_id);

        self.latest = self.find_latest()?;
        if let Some((id, _)) = self.latest.filter(|(id, _)| *id > self.state.last_id) {
            warn!(
                recorded = self.state.last_id,
                stored = id,
                "store.json is behind the samples, continuing after the newest row"
            );
            self.state.last_id = id;
        }
        Ok(())
    }

    /// Removes leftovers of an interrupted purge rewrite and truncates
    /// garbage after the last valid row of every segment.
    fn recover_segments(&self) -> Result<(), StoreError> {
        for entry in std::fs::read_dir(&self.samples_path)?.flatten() {
            if entry.path().extension().is_some_and(|ext| ext == "tmp") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        for (_, path) in self.segments()? {
            let data = std::fs::read(&path)?;
            let (rows, valid_end) = decode_rows(&data);
            let file_size = data.len() as u64;
            if valid_end < file_size {
                warn!(
                    "Segment {} corrupted: {} garbage bytes after {} valid rows. Truncating.",
                    path.display(),
                    file_size - valid_end,
                    rows.len()
                );
                OpenOptions::new()
                    .write(true)
                    .open(&path)?
                    .set_len(valid_end)?;
            }
        }
        Ok(())
    }

    fn find_latest(&self) -> Result<Option<(u64, i64)>, StoreError> {
        let mut latest: Option<(u64, i64)> = None;
        for (_, path) in self.segments()?.into_iter().rev() {
            let rows = read_segment(&path)?;
            for row in rows {
                if latest.is_none_or(|(id, _)| row.id > id) {
                    latest = Some((row.id, row.timestamp));
                }
            }
            if latest.is_some() {
                break;
            }
        }
        Ok(latest)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Ordered column list.
    pub fn columns(&self) -> &[String] {
        &self.state.columns
    }

    /// Adds columns that are not yet known. Existing columns are never
    /// removed or reordered. Returns the names that were added.
    pub fn upgrade_columns<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Result<Vec<String>, StoreError> {
        let _lock = self.lock()?;
        self.reload()?;
        self.add_columns(names)
    }

    fn add_columns<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Result<Vec<String>, StoreError> {
        let mut added = Vec::new();
        for name in names {
            if !self.column_index.contains_key(name) {
                self.column_index
                    .insert(name.clone(), self.state.columns.len());
                self.state.columns.push(name.clone());
                added.push(name.clone());
            }
        }
        if !added.is_empty() {
            self.save_state()?;
            info!(columns = added.len(), "Schema upgraded with new columns");
            debug!("New columns: {}", added.join(", "));
        }
        Ok(added)
    }

    fn save_state(&self) -> Result<(), StoreError> {
        write_json_atomic(&self.base_path.join(STATE_FILE), &self.state)
    }

    /// Appends a snapshot taken at `timestamp`.
    ///
    /// Returns `Ok(None)` without writing anything if a snapshot with the same
    /// timestamp is already stored. The id is the previous id plus the
    /// snapshot's `auto_increment_increment` (at least 1).
    pub fn append(
        &mut self,
        timestamp: i64,
        values: &BTreeMap<String, Option<i64>>,
    ) -> Result<Option<Snapshot>, StoreError> {
        let date = segment_date(timestamp)?;
        let path = self.segment_path(date);
        let _lock = self.lock()?;
        self.reload()?;
        if read_segment(&path)?.iter().any(|r| r.timestamp == timestamp) {
            debug!(timestamp, "Snapshot with this timestamp already stored, skipping");
            return Ok(None);
        }

        self.add_columns(values.keys())?;

        let mut snapshot = Snapshot {
            id: 0,
            timestamp,
            values: BTreeMap::new(),
        };
        for column in &self.state.columns {
            snapshot
                .values
                .insert(column.clone(), values.get(column).copied().flatten());
        }
        snapshot.id = self.state.last_id + snapshot.auto_increment_step();

        let row = SampleRow {
            id: snapshot.id,
            timestamp,
            values: self
                .state
                .columns
                .iter()
                .map(|c| snapshot.values.get(c).copied().flatten())
                .collect(),
        };
        let encoded = bincode::serialize(&row)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        self.state.last_id = snapshot.id;
        self.save_state()?;
        self.latest = Some((snapshot.id, timestamp));
        Ok(Some(snapshot))
    }

    /// Deletes every snapshot with `timestamp < now - horizon`.
    /// Returns the number of snapshots removed.
    pub fn purge(&mut self, horizon: Duration, now: i64) -> Result<usize, StoreError> {
        let cutoff = now - horizon.num_seconds();
        let cutoff_date = segment_date(cutoff)?;
        let _lock = self.lock()?;
        let mut removed = 0usize;

        for (date, path) in self.segments()? {
            if date < cutoff_date {
                removed += read_segment(&path)?.len();
                std::fs::remove_file(&path)?;
                continue;
            }
            if date > cutoff_date {
                continue;
            }
            let rows = read_segment(&path)?;
            let before = rows.len();
            let kept: Vec<SampleRow> = rows.into_iter().filter(|r| r.timestamp >= cutoff).collect();
            if kept.len() == before {
                continue;
            }
            removed += before - kept.len();
            rewrite_segment(&path, &kept)?;
        }

        if removed > 0 {
            info!(removed, "Purged old snapshots");
            self.latest = self.find_latest()?;
        }
        Ok(removed)
    }

    /// Id and timestamp of the most recently appended snapshot.
    pub fn latest(&self) -> Option<(u64, i64)> {
        self.latest
    }

    /// Smallest id still retained.
    pub fn oldest_id(&self) -> Result<Option<u64>, StoreError> {
        for (_, path) in self.segments()? {
            if let Some(id) = read_segment(&path)?.iter().map(|r| r.id).min() {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    pub fn get(&self, id: u64) -> Result<Option<Snapshot>, StoreError> {
        for (_, path) in self.segments()?.into_iter().rev() {
            if let Some(row) = read_segment(&path)?.into_iter().find(|r| r.id == id) {
                return Ok(Some(row.into_snapshot(&self.state.columns)));
            }
        }
        Ok(None)
    }

    /// Snapshots with `from <= timestamp < to`, ordered by timestamp.
    pub fn range(&self, from: i64, to: i64) -> Result<Vec<Snapshot>, StoreError> {
        let from_date = segment_date(from)?;
        let to_date = segment_date(to)?;
        let mut snapshots = Vec::new();
        for (date, path) in self.segments()? {
            if date < from_date || date > to_date {
                continue;
            }
            snapshots.extend(
                read_segment(&path)?
                    .into_iter()
                    .filter(|r| r.timestamp >= from && r.timestamp < to)
                    .map(|r| r.into_snapshot(&self.state.columns)),
            );
        }
        snapshots.sort_by_key(|s| s.timestamp);
        Ok(snapshots)
    }

    /// Every retained snapshot, ordered by timestamp.
    pub fn all(&self) -> Result<Vec<Snapshot>, StoreError> {
        let mut snapshots = Vec::new();
        for (_, path) in self.segments()? {
            snapshots.extend(
                read_segment(&path)?
                    .into_iter()
                    .map(|r| r.into_snapshot(&self.state.columns)),
            );
        }
        snapshots.sort_by_key(|s| s.timestamp);
        Ok(snapshots)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let mut n = 0;
        for (_, path) in self.segments()? {
            n += read_segment(&path)?.len();
        }
        Ok(n)
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_none()
    }

    fn segment_path(&self, date: NaiveDate) -> PathBuf {
        self.samples_path
            .join(format!("mycheckpoint_{}.log", date.format("%Y-%m-%d")))
    }

    /// Segment files sorted by date (oldest first).
    fn segments(&self) -> Result<Vec<(NaiveDate, PathBuf)>, StoreError> {
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&self.samples_path)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(date) = parse_date_from_filename(name) {
                segments.push((date, path));
            }
        }
        segments.sort();
        Ok(segments)
    }
}

fn index_columns(columns: &[String]) -> HashMap<String, usize> {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.clone(), i))
        .collect()
}

fn segment_date(timestamp: i64) -> Result<NaiveDate, StoreError> {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.date_naive())
        .ok_or(StoreError::Timestamp(timestamp))
}

/// Parses date from `mycheckpoint_YYYY-MM-DD.log`.
fn parse_date_from_filename(filename: &str) -> Option<NaiveDate> {
    let date = filename
        .strip_prefix("mycheckpoint_")?
        .strip_suffix(".log")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Decodes consecutive rows; returns them with the byte offset after the
/// last complete row.
fn decode_rows(data: &[u8]) -> (Vec<SampleRow>, u64) {
    let mut cursor = std::io::Cursor::new(data);
    let mut rows = Vec::new();
    let mut valid_end = 0u64;
    while (cursor.position() as usize) < data.len() {
        match bincode::deserialize_from::<_, SampleRow>(&mut cursor) {
            Ok(row) => {
                valid_end = cursor.position();
                rows.push(row);
            }
            Err(_) => break,
        }
    }
    (rows, valid_end)
}

fn read_segment(path: &Path) -> Result<Vec<SampleRow>, StoreError> {
    match std::fs::read(path) {
        Ok(data) => Ok(decode_rows(&data).0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn rewrite_segment(path: &Path, rows: &[SampleRow]) -> Result<(), StoreError> {
    if rows.is_empty() {
        std::fs::remove_file(path)?;
        return Ok(());
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        for row in rows {
            file.write_all(&bincode::serialize(row)?)?;
        }
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

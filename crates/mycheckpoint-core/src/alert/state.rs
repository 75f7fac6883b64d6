//! Persistent alert state: open episodes and the firing log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::storage::{StoreError, read_json, write_json_atomic};

const ALERTS_FILE: &str = "alerts.json";

#[derive(Debug, Error)]
pub enum AlertStoreError {
    #[error("alert state: {0}")]
    Store(#[from] StoreError),
}

/// An open episode of a condition being true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAlert {
    pub condition_id: u32,
    pub start_sample_id: u64,
    pub start_ts: i64,
    pub end_sample_id: u64,
    pub end_ts: i64,
    /// Interval length of the first true sample; counts toward the episode.
    pub episode_offset_seconds: i64,
    pub last_notified_ts: Option<i64>,
    pub resolved: bool,
    pub resolved_ts: Option<i64>,
    /// Set once the resolved notice of a notified episode went out.
    #[serde(default)]
    pub resolved_notified: bool,
}

impl PendingAlert {
    pub fn new(condition_id: u32, sample_id: u64, timestamp: i64, offset_seconds: i64) -> Self {
        Self {
            condition_id,
            start_sample_id: sample_id,
            start_ts: timestamp,
            end_sample_id: sample_id,
            end_ts: timestamp,
            episode_offset_seconds: offset_seconds.max(0),
            last_notified_ts: None,
            resolved: false,
            resolved_ts: None,
            resolved_notified: false,
        }
    }

    pub fn episode_seconds(&self) -> i64 {
        self.end_ts - self.start_ts + self.episode_offset_seconds
    }

    pub fn is_notified(&self) -> bool {
        self.last_notified_ts.is_some()
    }

    /// Resolved after being notified, but the resolved notice has not been
    /// delivered yet.
    pub fn awaits_resolved_notice(&self) -> bool {
        self.resolved && self.is_notified() && !self.resolved_notified
    }
}

/// One tick on which a condition was firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFiring {
    pub condition_id: u32,
    pub sample_id: u64,
    pub timestamp: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AlertState {
    pending: BTreeMap<u32, PendingAlert>,
    firings: Vec<AlertFiring>,
}

/// JSON-backed alert state next to the sample store.
pub struct AlertStore {
    path: PathBuf,
    state: AlertState,
    dirty: bool,
}

impl AlertStore {
    pub fn open(base_path: &Path) -> Result<Self, AlertStoreError> {
        let path = base_path.join(ALERTS_FILE);
        let state = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            state,
            dirty: false,
        })
    }

    pub fn pending(&self, condition_id: u32) -> Option<&PendingAlert> {
        self.state.pending.get(&condition_id)
    }

    pub fn pending_mut(&mut self, condition_id: u32) -> Option<&mut PendingAlert> {
        self.dirty = true;
        self.state.pending.get_mut(&condition_id)
    }

    pub fn pending_alerts(&self) -> impl Iterator<Item = &PendingAlert> {
        self.state.pending.values()
    }

    pub fn insert_pending(&mut self, alert: PendingAlert) {
        self.dirty = true;
        self.state.pending.insert(alert.condition_id, alert);
    }

    /// Drops pending alerts for which `keep` returns false. Returns how many
    /// were removed.
    pub fn retain_pending(&mut self, mut keep: impl FnMut(&PendingAlert) -> bool) -> usize {
        let before = self.state.pending.len();
        self.state.pending.retain(|_, a| keep(a));
        let removed = before - self.state.pending.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Records a firing. Returns false if this pair is already recorded.
    pub fn record_firing(&mut self, firing: AlertFiring) -> bool {
        let exists = self.state.firings.iter().any(|f| {
            f.condition_id == firing.condition_id && f.sample_id == firing.sample_id
        });
        if exists {
            return false;
        }
        self.state.firings.push(firing);
        self.dirty = true;
        true
    }

    pub fn firings(&self) -> &[AlertFiring] {
        &self.state.firings
    }

    /// Drops state that refers to purged samples. `oldest_id` is the
    /// smallest retained sample id, `None` when no samples remain.
    ///
    /// Resolved episodes that started on a purged sample are dropped. Open
    /// ones stay open: their sample ids move up to `oldest_id` and `start_ts`
    /// is kept, so the episode neither restarts nor fires a second time.
    pub fn reconcile(&mut self, oldest_id: Option<u64>) -> (usize, usize) {
        let live = |id: u64| oldest_id.is_some_and(|oldest| id >= oldest);
        let pending = self.retain_pending(|a| {
            live(a.start_sample_id) || (!a.resolved && oldest_id.is_some())
        });
        if let Some(oldest) = oldest_id {
            for a in self.state.pending.values_mut() {
                if a.start_sample_id < oldest {
                    a.start_sample_id = oldest;
                    a.end_sample_id = a.end_sample_id.max(oldest);
                    self.dirty = true;
                }
            }
        }
        let before = self.state.firings.len();
        self.state.firings.retain(|f| live(f.sample_id));
        let firings = before - self.state.firings.len();
        if firings > 0 {
            self.dirty = true;
        }
        if pending + firings > 0 {
            debug!(pending, firings, "dropped alert state of purged samples");
        }
        (pending, firings)
    }

    /// Writes the state if anything changed since it was loaded.
    pub fn save(&mut self) -> Result<(), AlertStoreError> {
        if self.dirty {
            write_json_atomic(&self.path, &self.state)?;
            self.dirty = false;
        }
        Ok(())
    }
}

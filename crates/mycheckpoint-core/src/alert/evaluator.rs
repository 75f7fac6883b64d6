use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::condition::{AlertCondition, Severity};
use super::state::{AlertFiring, AlertStore, PendingAlert};
use crate::metrics::ColumnLookup;

/// Whether a notice announces a firing or the end of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Firing,
    Resolved,
}

/// One line of the per-tick notification batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub condition_id: u32,
    pub severity: Severity,
    pub description: String,
    pub condition: String,
    pub episode_start_ts: i64,
    pub timestamp: i64,
}

/// The sample a tick is evaluated against.
pub struct Tick<'a> {
    pub sample_id: u64,
    pub timestamp: i64,
    pub elapsed_seconds: i64,
    pub row: &'a dyn ColumnLookup,
}

/// Runs one evaluation tick for every condition.
///
/// Per condition:
/// - true: open or extend the episode; once it lasts `alert_delay_minutes`
///   it fires, logging a firing and queueing a notice unless this episode
///   was already notified (and the condition is not repetitive)
/// - false or unknown: resolve an open episode, queueing a resolved notice
///   only if the episode was notified
///
/// Episodes resolved on an earlier tick, and episodes of disabled or
/// removed conditions, are dropped first. A resolved episode whose resolved
/// notice was never delivered is kept and its notice queued again. Notices
/// are returned for the caller to deliver as one batch; see
/// [`mark_notified`].
pub fn evaluate_tick(
    conditions: &[AlertCondition],
    tick: &Tick<'_>,
    store: &mut AlertStore,
) -> Vec<Notice> {
    let enabled: HashSet<u32> = conditions
        .iter()
        .filter(|c| c.enabled)
        .map(|c| c.id)
        .collect();
    let dropped = store.retain_pending(|a| {
        enabled.contains(&a.condition_id) && (!a.resolved || a.awaits_resolved_notice())
    });
    if dropped > 0 {
        debug!(dropped, "cleaned up resolved or orphaned pending alerts");
    }

    let mut conditions: Vec<&AlertCondition> = conditions.iter().filter(|c| c.enabled).collect();
    conditions.sort_by_key(|c| c.id);

    let mut notices = Vec::new();
    for condition in conditions {
        let unsent = store
            .pending(condition.id)
            .filter(|p| p.awaits_resolved_notice());
        if let Some(pending) = unsent {
            debug!(condition = condition.id, "resending resolved notice");
            notices.push(notice(
                NoticeKind::Resolved,
                condition,
                pending.start_ts,
                pending.resolved_ts.unwrap_or(tick.timestamp),
            ));
        }

        let holds = match condition.compile().and_then(|e| e.is_true(tick.row)) {
            Ok(v) => v.unwrap_or(false),
            Err(e) => {
                debug!(condition = condition.id, error = %e, "condition evaluated as unknown");
                false
            }
        };

        if holds {
            if let Some(notice) = advance(condition, tick, store) {
                notices.push(notice);
            }
        } else if let Some(notice) = resolve(condition, tick, store) {
            notices.push(notice);
        }
    }
    notices
}

fn advance(condition: &AlertCondition, tick: &Tick<'_>, store: &mut AlertStore) -> Option<Notice> {
    // A resolved episode still waiting for delivery is replaced by a new one.
    let pending = match store.pending_mut(condition.id).filter(|p| !p.resolved) {
        Some(pending) => {
            pending.end_sample_id = tick.sample_id;
            pending.end_ts = tick.timestamp;
            pending.clone()
        }
        None => {
            let pending = PendingAlert::new(
                condition.id,
                tick.sample_id,
                tick.timestamp,
                tick.elapsed_seconds,
            );
            store.insert_pending(pending.clone());
            debug!(condition = condition.id, "alert pending");
            pending
        }
    };

    if pending.episode_seconds() < condition.delay_seconds() {
        return None;
    }

    store.record_firing(AlertFiring {
        condition_id: condition.id,
        sample_id: tick.sample_id,
        timestamp: tick.timestamp,
    });

    if pending.is_notified() && !condition.repetitive_alert {
        return None;
    }
    if !pending.is_notified() {
        info!(
            condition = condition.id,
            severity = %condition.severity,
            "alert firing: {}",
            condition.label()
        );
    }
    Some(notice(
        NoticeKind::Firing,
        condition,
        pending.start_ts,
        tick.timestamp,
    ))
}

fn resolve(condition: &AlertCondition, tick: &Tick<'_>, store: &mut AlertStore) -> Option<Notice> {
    let pending = store.pending_mut(condition.id)?;
    if pending.resolved {
        return None;
    }
    pending.resolved = true;
    pending.resolved_ts = Some(tick.timestamp);
    if !pending.is_notified() {
        return None;
    }
    info!(condition = condition.id, "alert resolved: {}", condition.label());
    Some(notice(
        NoticeKind::Resolved,
        condition,
        pending.start_ts,
        tick.timestamp,
    ))
}

fn notice(kind: NoticeKind, condition: &AlertCondition, start_ts: i64, timestamp: i64) -> Notice {
    Notice {
        kind,
        condition_id: condition.id,
        severity: condition.severity,
        description: condition.label().to_string(),
        condition: condition.condition.clone(),
        episode_start_ts: start_ts,
        timestamp,
    }
}

/// Records delivery of a notice batch. Firing notices mark their episode
/// notified; resolved notices let the next tick drop the episode.
pub fn mark_notified(store: &mut AlertStore, notices: &[Notice], delivered_at: i64) {
    for notice in notices {
        let Some(pending) = store.pending_mut(notice.condition_id) else {
            warn!(condition = notice.condition_id, "notified alert has no pending state");
            continue;
        };
        match notice.kind {
            NoticeKind::Firing => pending.last_notified_ts = Some(delivered_at),
            NoticeKind::Resolved if pending.resolved => pending.resolved_notified = true,
            NoticeKind::Resolved => {}
        }
    }
}

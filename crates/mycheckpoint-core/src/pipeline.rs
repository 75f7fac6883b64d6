//! One invocation of the tool: deploy, the collect → store → purge → alert
//! cycle, and the brief report.

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::alert::{AlertStore, Tick, evaluate_tick, mark_notified};
use crate::collector::{Collector, FileSystem, StatusSource};
use crate::config::Settings;
use crate::metrics::{
    Classification, MONITORED_GLOBAL_VARIABLES, OS_COUNTER_COLUMNS, OS_GAUGE_COLUMNS,
    REPLICATION_COLUMNS,
};
use crate::notify::{Message, Notifier, alert_message};
use crate::rates::{compute_rate, predecessor_id, rate_series};
use crate::report::{BriefReport, derived_metrics, parameter_changes};
use crate::rollup::{Bucket, DAY_SECONDS, rollup};
use crate::storage::{Metadata, SCHEMA_REVISION, SampleStore};
use crate::{Error, Result};

/// What a collection cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    /// Id of the stored sample; `None` when the timestamp was already taken.
    pub sample_id: Option<u64>,
    pub purged: usize,
    pub notices: usize,
    pub delivered: bool,
}

/// Everything a pipeline operation needs.
pub struct Context {
    pub settings: Settings,
    pub store: SampleStore,
    pub classification: Classification,
}

impl Context {
    /// Creates or upgrades the data directory and records this build in its
    /// metadata. Existing samples are kept.
    pub fn deploy(settings: Settings, now: i64) -> Result<Self> {
        let mut store = SampleStore::open(&settings.data_dir)?;

        let columns: Vec<String> = MONITORED_GLOBAL_VARIABLES
            .iter()
            .chain(REPLICATION_COLUMNS)
            .chain(OS_GAUGE_COLUMNS)
            .chain(OS_COUNTER_COLUMNS)
            .map(|s| s.to_string())
            .collect();
        store.upgrade_columns(&columns)?;

        let mut alerts = AlertStore::open(store.base_path())?;
        alerts.reconcile(store.oldest_id()?);
        alerts.save()?;

        let metadata = Metadata::current(now);
        metadata.save(store.base_path())?;
        info!(
            path = %store.base_path().display(),
            revision = metadata.revision,
            build = %metadata.build,
            "deployed"
        );

        Ok(Self {
            settings,
            store,
            classification: Classification::new(),
        })
    }

    /// Opens the data directory for collection or reporting.
    ///
    /// A directory without metadata is deployed first. One written by a
    /// newer layout, or by an older layout revision, must be redeployed
    /// explicitly.
    pub fn open(settings: Settings, now: i64) -> Result<Self> {
        let Some(metadata) = Metadata::load(&settings.data_dir)? else {
            info!(path = %settings.data_dir.display(), "no deployment found, deploying");
            return Self::deploy(settings, now);
        };

        if metadata.is_newer_than_binary() {
            return Err(Error::RedeployNeeded(format!(
                "{} was deployed by mycheckpoint {} (layout revision {}); upgrade this binary",
                settings.data_dir.display(),
                metadata.version,
                metadata.revision
            )));
        }
        if metadata.needs_redeploy() {
            if metadata.revision < SCHEMA_REVISION {
                warn!("data directory layout is out of date; run `mycheckpoint deploy`");
                return Err(Error::RedeployNeeded(format!(
                    "{} has layout revision {}",
                    settings.data_dir.display(),
                    metadata.revision
                )));
            }
            info!(from = %metadata.version, "binary version changed, refreshing deployment");
            return Self::deploy(settings, now);
        }

        let store = SampleStore::open(&settings.data_dir)?;
        Ok(Self {
            settings,
            store,
            classification: Classification::new(),
        })
    }

    fn host(&self) -> &str {
        &self.settings.mysql.host
    }

    /// Samples the server once at `now`, stores the sample, purges expired
    /// ones and evaluates alerts against the new sample.
    ///
    /// A sample whose timestamp is already stored ends the cycle early.
    pub fn run_cycle<S: StatusSource, F: FileSystem>(
        &mut self,
        collector: &mut Collector<S, F>,
        notifier: &dyn Notifier,
        now: i64,
    ) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();

        let values = collector.collect()?;
        let Some(snapshot) = self.store.append(now, &values)? else {
            info!(timestamp = now, "sample already recorded, nothing to do");
            return Ok(summary);
        };
        summary.sample_id = Some(snapshot.id);
        debug!(id = snapshot.id, columns = snapshot.values.len(), "sample stored");

        let horizon = Duration::days(i64::from(self.settings.purge_days));
        summary.purged = self.store.purge(horizon, now)?;

        let mut alerts = AlertStore::open(self.store.base_path())?;
        alerts.reconcile(self.store.oldest_id()?);

        if self.settings.skip_alerts {
            debug!("alerts skipped");
        } else if let Some(prev) = match predecessor_id(&snapshot) {
            Some(id) => self.store.get(id)?,
            None => None,
        } {
            let rate = compute_rate(&snapshot, &prev, &self.classification);
            let tick = Tick {
                sample_id: rate.id(),
                timestamp: rate.timestamp(),
                elapsed_seconds: rate.elapsed_seconds(),
                row: &rate,
            };
            let notices = evaluate_tick(&self.settings.conditions, &tick, &mut alerts);
            summary.notices = notices.len();

            if !notices.is_empty() {
                let message = alert_message(self.host(), &notices);
                match notifier.send(&message) {
                    Ok(()) => {
                        mark_notified(&mut alerts, &notices, now);
                        summary.delivered = true;
                    }
                    Err(e) => warn!(error = %e, "alert notification failed"),
                }
            }
        } else {
            debug!(id = snapshot.id, "no previous sample, alerts not evaluated");
        }

        alerts.save()?;
        Ok(summary)
    }

    /// Renders the brief report as of `now`.
    pub fn brief_report(&self, now: i64) -> Result<Message> {
        let since = Bucket::Day.start_of(now) - DAY_SECONDS;
        let snapshots = self.store.range(since, now + 1)?;
        let rates = rate_series(&snapshots, &self.classification);
        let hours = rollup(&rates, Bucket::Hour);
        let days = rollup(&rates, Bucket::Day);

        let changes: Vec<_> = parameter_changes(&snapshots, &self.classification)
            .into_iter()
            .filter(|c| c.timestamp >= now - DAY_SECONDS)
            .collect();

        let alerts = AlertStore::open(self.store.base_path())?;
        let open_alerts = alerts
            .pending_alerts()
            .filter(|a| !a.resolved)
            .filter_map(|a| {
                self.settings
                    .conditions
                    .iter()
                    .find(|c| c.id == a.condition_id)
                    .map(|c| (c, a))
            })
            .collect();
        let metrics = derived_metrics(&self.settings.metrics);

        Ok(BriefReport {
            host: self.host(),
            generated_at: now,
            latest: rates.last(),
            last_hour: hours.last(),
            last_day: days.last(),
            parameter_changes: &changes,
            open_alerts,
            metrics: &metrics,
        }
        .render())
    }

    /// Renders the brief report and hands it to `notifier`. Delivery
    /// failures are returned to the caller.
    pub fn email_brief_report(&self, notifier: &dyn Notifier, now: i64) -> Result<()> {
        let message = self.brief_report(now)?;
        match notifier.send(&message) {
            Ok(()) => {
                info!(subject = %message.subject, "brief report sent");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "brief report not delivered");
                Err(Error::Notify(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::alert::{AlertCondition, Severity};
    use crate::collector::{MockFs, MockSource, OsCollector};
    use crate::notify::NotifyError;
    use tempfile::{TempDir, tempdir};

    const T0: i64 = 1_700_000_040;

    /// Records messages; fails while `fail` is set.
    #[derive(Default)]
    struct Recorder {
        sent: RefCell<Vec<Message>>,
        fail: RefCell<bool>,
    }

    impl Notifier for Recorder {
        fn send(&self, message: &Message) -> Result<(), NotifyError> {
            if *self.fail.borrow() {
                return Err(NotifyError::NoRecipients);
            }
            self.sent.borrow_mut().push(message.clone());
            Ok(())
        }
    }

    fn settings(dir: &TempDir, delay: u32) -> Settings {
        Settings {
            data_dir: dir.path().join("data"),
            conditions: vec![AlertCondition {
                id: 1,
                enabled: true,
                condition: "threads_running > 20".to_string(),
                description: "Too many running threads".to_string(),
                severity: Severity::Warning,
                alert_delay_minutes: delay,
                repetitive_alert: false,
            }],
            ..Default::default()
        }
    }

    fn collector() -> Collector<MockSource> {
        Collector::new(
            MockSource::new()
                .with_status("Questions", "1000")
                .with_status("Threads_running", "30")
                .with_variable("max_connections", "151"),
        )
    }

    #[test]
    fn test_deploy_writes_metadata_and_columns() {
        let dir = tempdir().unwrap();
        let ctx = Context::deploy(settings(&dir, 0), T0).unwrap();
        let meta = Metadata::load(&dir.path().join("data")).unwrap().unwrap();
        assert_eq!(meta.revision, SCHEMA_REVISION);
        assert_eq!(meta.deployed_at, T0);
        assert!(ctx.store.columns().contains(&"max_connections".to_string()));
        assert!(ctx.store.columns().contains(&"seconds_behind_master".to_string()));
        assert!(ctx.store.is_empty());
    }

    #[test]
    fn test_open_fresh_directory_deploys() {
        let dir = tempdir().unwrap();
        Context::open(settings(&dir, 0), T0).unwrap();
        assert!(Metadata::load(&dir.path().join("data")).unwrap().is_some());
    }

    #[test]
    fn test_open_rejects_other_layout_revisions() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        Context::deploy(settings(&dir, 0), T0).unwrap();

        let mut meta = Metadata::load(&data).unwrap().unwrap();
        meta.revision = SCHEMA_REVISION + 1;
        meta.save(&data).unwrap();
        assert!(matches!(
            Context::open(settings(&dir, 0), T0),
            Err(Error::RedeployNeeded(_))
        ));

        meta.revision = 0;
        meta.save(&data).unwrap();
        assert!(matches!(
            Context::open(settings(&dir, 0), T0),
            Err(Error::RedeployNeeded(_))
        ));

        Context::deploy(settings(&dir, 0), T0).unwrap();
        assert!(Context::open(settings(&dir, 0), T0).is_ok());
    }

    #[test]
    fn test_duplicate_timestamp_is_skipped() {
        let dir = tempdir().unwrap();
        let mut ctx = Context::open(settings(&dir, 0), T0).unwrap();
        let mut c = collector();
        let notifier = Recorder::default();

        let first = ctx.run_cycle(&mut c, &notifier, T0).unwrap();
        assert_eq!(first.sample_id, Some(1));
        let again = ctx.run_cycle(&mut c, &notifier, T0).unwrap();
        assert_eq!(again, CycleSummary::default());
        assert_eq!(ctx.store.len().unwrap(), 1);
    }

    #[test]
    fn test_alert_fires_after_delay_and_resolves() {
        let dir = tempdir().unwrap();
        let mut ctx = Context::open(settings(&dir, 5), T0).unwrap();
        let mut c = collector();
        let notifier = Recorder::default();

        // First sample has no predecessor; ticks start with the second.
        for n in 0..5 {
            ctx.run_cycle(&mut c, &notifier, T0 + n * 60).unwrap();
        }
        assert!(notifier.sent.borrow().is_empty());

        let fired = ctx.run_cycle(&mut c, &notifier, T0 + 300).unwrap();
        assert_eq!(fired.notices, 1);
        assert!(fired.delivered);
        assert_eq!(notifier.sent.borrow().len(), 1);
        assert!(notifier.sent.borrow()[0].subject.contains("warning: 1 alert(s)"));

        ctx.run_cycle(&mut c, &notifier, T0 + 360).unwrap();
        assert_eq!(notifier.sent.borrow().len(), 1);

        c.source_mut().set_status("Threads_running", "2");
        let resolved = ctx.run_cycle(&mut c, &notifier, T0 + 420).unwrap();
        assert_eq!(resolved.notices, 1);
        assert!(notifier.sent.borrow()[1].subject.contains("resolved"));

        let alerts = AlertStore::open(ctx.store.base_path()).unwrap();
        assert_eq!(alerts.firings().len(), 2);
    }

    #[test]
    fn test_failed_delivery_is_retried_next_cycle() {
        let dir = tempdir().unwrap();
        let mut ctx = Context::open(settings(&dir, 0), T0).unwrap();
        let mut c = collector();
        let notifier = Recorder::default();
        *notifier.fail.borrow_mut() = true;

        ctx.run_cycle(&mut c, &notifier, T0).unwrap();
        let failed = ctx.run_cycle(&mut c, &notifier, T0 + 60).unwrap();
        assert_eq!(failed.notices, 1);
        assert!(!failed.delivered);

        *notifier.fail.borrow_mut() = false;
        let retried = ctx.run_cycle(&mut c, &notifier, T0 + 120).unwrap();
        assert!(retried.delivered);
        assert_eq!(notifier.sent.borrow().len(), 1);

        let quiet = ctx.run_cycle(&mut c, &notifier, T0 + 180).unwrap();
        assert_eq!(quiet.notices, 0);
    }

    #[test]
    fn test_skip_alerts() {
        let dir = tempdir().unwrap();
        let mut s = settings(&dir, 0);
        s.skip_alerts = true;
        let mut ctx = Context::open(s, T0).unwrap();
        let mut c = collector();
        let notifier = Recorder::default();
        ctx.run_cycle(&mut c, &notifier, T0).unwrap();
        let summary = ctx.run_cycle(&mut c, &notifier, T0 + 60).unwrap();
        assert_eq!(summary.notices, 0);
        assert!(notifier.sent.borrow().is_empty());
    }

    #[test]
    fn test_purge_drops_firings_keeps_open_episode() {
        let dir = tempdir().unwrap();
        let mut s = settings(&dir, 0);
        s.purge_days = 1;
        let mut ctx = Context::open(s, T0).unwrap();
        let mut c = collector();
        let notifier = Recorder::default();

        ctx.run_cycle(&mut c, &notifier, T0).unwrap();
        ctx.run_cycle(&mut c, &notifier, T0 + 60).unwrap();
        let alerts = AlertStore::open(ctx.store.base_path()).unwrap();
        assert_eq!(alerts.firings().len(), 1);
        assert!(alerts.pending(1).is_some());

        let later = ctx.run_cycle(&mut c, &notifier, T0 + 3 * DAY_SECONDS).unwrap();
        assert_eq!(later.purged, 2);
        assert_eq!(later.notices, 0);

        let alerts = AlertStore::open(ctx.store.base_path()).unwrap();
        assert!(alerts.firings().is_empty());
        let open = alerts.pending(1).unwrap();
        assert_eq!(open.start_sample_id, 3);
        assert_eq!(open.start_ts, T0 + 60);
        assert!(open.is_notified());
    }

    #[test]
    fn test_alert_open_across_purge_is_not_refired() {
        let dir = tempdir().unwrap();
        let mut s = settings(&dir, 0);
        s.purge_days = 1;
        let mut ctx = Context::open(s, T0).unwrap();
        let mut c = collector();
        let notifier = Recorder::default();
        let half_day = DAY_SECONDS / 2;

        for n in 0..5 {
            ctx.run_cycle(&mut c, &notifier, T0 + n * half_day).unwrap();
        }
        // Samples 1 and 2, including the episode's first, are gone by now.
        assert_eq!(ctx.store.oldest_id().unwrap(), Some(3));
        assert_eq!(notifier.sent.borrow().len(), 1);

        let alerts = AlertStore::open(ctx.store.base_path()).unwrap();
        let open = alerts.pending(1).unwrap();
        assert_eq!(open.start_sample_id, 3);
        assert_eq!(open.start_ts, T0 + half_day);
        assert_eq!(open.end_sample_id, 5);
    }

    #[test]
    fn test_cycle_with_os_metrics() {
        let dir = tempdir().unwrap();
        let mut ctx = Context::open(settings(&dir, 0), T0).unwrap();
        let mut c = collector().with_os(OsCollector::new(MockFs::typical_system()));
        let notifier = Recorder::default();

        ctx.run_cycle(&mut c, &notifier, T0).unwrap();
        let snapshot = ctx.store.get(1).unwrap().unwrap();
        assert_eq!(snapshot.value("os_loadavg_millis"), Some(520));
        assert_eq!(snapshot.value("os_root_mountpoint_usage_percent"), Some(60));
        assert!(ctx
            .store
            .columns()
            .contains(&"os_datadir_mountpoint_usage_percent".to_string()));
    }

    #[test]
    fn test_collect_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let mut ctx = Context::open(settings(&dir, 0), T0).unwrap();
        let mut c = collector();
        c.source_mut().offline = true;
        let err = ctx
            .run_cycle(&mut c, &Recorder::default(), T0)
            .unwrap_err();
        assert!(matches!(err, Error::Collect(_)));
        assert!(ctx.store.is_empty());
    }

    #[test]
    fn test_email_brief_report() {
        let dir = tempdir().unwrap();
        let mut ctx = Context::open(settings(&dir, 0), T0).unwrap();
        let mut c = collector();
        let notifier = Recorder::default();
        for n in 0..3 {
            c.source_mut()
                .set_status("Questions", &(1000 + n * 600).to_string());
            ctx.run_cycle(&mut c, &notifier, T0 + n * 60).unwrap();
        }
        notifier.sent.borrow_mut().clear();

        ctx.email_brief_report(&notifier, T0 + 180).unwrap();
        let sent = notifier.sent.borrow();
        assert_eq!(sent.len(), 1);
        let body = &sent[0].body;
        assert!(body.contains("Latest sample (#3"));
        assert!(body.contains("Open alerts\n  #1 [warning] Too many running threads"));

        *notifier.fail.borrow_mut() = true;
        drop(sent);
        assert!(matches!(
            ctx.email_brief_report(&notifier, T0 + 180),
            Err(Error::Notify(_))
        ));
    }
}

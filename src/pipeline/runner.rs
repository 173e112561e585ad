//! Run orchestration: one invocation of the alert engine.
//!
//! Flow:
//! 1. Mark the run as started and check the previous run committed
//! 2. Fetch every source concurrently (failures become zero records)
//! 3. Normalize, then dedupe against this run and the recent history
//! 4. Fuse into per-(location, category) aggregates
//! 5. Apply the decision state machine to the prior state
//! 6. Dispatch alerts
//! 7. Commit history and state in one transaction, then write the artifact
//!
//! No step after fetching can fail the run. Store failures degrade the run
//! (recorded in [`DegradedFlags`]) and the pipeline carries on with safe
//! defaults: an unreadable state means every key starts idle, and the run
//! then writes back only the keys it alerted on so stored cooldowns survive.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactWriter, DegradedFlags, RunArtifact};
use crate::config::{Policy, Settings};
use crate::locations::LocationRegistry;
use crate::notify::Dispatcher;
use crate::pipeline::decision::{self, AggregateDecision, AlertStateBook, DecisionOutcome};
use crate::pipeline::dedup::Deduplicator;
use crate::pipeline::fusion::FusionEngine;
use crate::pipeline::normalizer::Normalizer;
use crate::pipeline::types::{IncidentAggregate, IncidentKey, Signal};
use crate::sources::{self, SignalSource};
use crate::store::{AlertStore, RunRecord, SeenKey, StateWrite, SurgeSample};

/// Everything a run needs that outlives a single run.
pub struct AlertPipeline {
    registry: LocationRegistry,
    settings: Settings,
    policies: HashMap<String, Policy>,
    store: Arc<dyn AlertStore>,
    dispatcher: Dispatcher,
    artifacts: Option<ArtifactWriter>,
}

impl AlertPipeline {
    pub fn new(
        registry: LocationRegistry,
        settings: Settings,
        store: Arc<dyn AlertStore>,
        dispatcher: Dispatcher,
    ) -> Self {
        let policies = settings.policies(&registry);
        Self {
            registry,
            settings,
            policies,
            store,
            dispatcher,
            artifacts: None,
        }
    }

    /// Also write each run's artifact to disk.
    pub fn with_artifacts(mut self, writer: ArtifactWriter) -> Self {
        self.artifacts = Some(writer);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run once against the wall clock.
    pub async fn run(&self, sources: &[Box<dyn SignalSource>]) -> RunArtifact {
        self.run_at(sources, Utc::now()).await
    }

    /// Run once as of `now`. Always returns an artifact, even when nothing
    /// fires or the store is unavailable.
    pub async fn run_at(&self, sources: &[Box<dyn SignalSource>], now: DateTime<Utc>) -> RunArtifact {
        let clock = Instant::now();
        let run_id = Uuid::new_v4();
        let dry_run = self.settings.dry_run;
        let mut degraded = DegradedFlags::default();

        info!(run_id = %run_id, dry_run, sources = sources.len(), "Run started");

        // ── Bookkeeping ─────────────────────────────────────────────
        match self.store.latest_run(None).await {
            Ok(Some(prev)) if !prev.state_persisted && !prev.dry_run => {
                warn!(
                    run_id = %run_id,
                    previous = %prev.run_id,
                    "Previous run never committed its state; prior state may be stale"
                );
                degraded.prior_run_stale = true;
            }
            Ok(_) => {}
            Err(e) => warn!(run_id = %run_id, error = %e, "Could not read run history"),
        }
        if let Err(e) = self.store.begin_run(run_id, now, dry_run).await {
            warn!(run_id = %run_id, error = %e, "Could not record run start");
        }

        // ── Fetch ───────────────────────────────────────────────────
        let timeout = StdDuration::from_secs(self.settings.source_timeout_secs);
        let (records, outcomes) = sources::fetch_all(sources, timeout).await;

        // ── Normalize ───────────────────────────────────────────────
        let normalizer = Normalizer::new(&self.registry, &self.settings, &self.policies);
        let (signals, normalize) = normalizer.normalize(&records, now);
        let candidates = seen_keys(&signals);

        // ── Dedupe ──────────────────────────────────────────────────
        let history_since = now - Duration::hours(self.settings.dedupe.history_window_hours as i64);
        let recent = match self.store.recent_dedupe_keys(history_since).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Dedupe history unreadable, deduping within this run only");
                degraded.history_read = true;
                HashSet::new()
            }
        };
        let dedup = Deduplicator::new(Duration::minutes(
            self.settings.dedupe.near_duplicate_window_minutes as i64,
        ));
        let (signals, dedupe) = dedup.dedupe(signals, &recent);

        // ── Fuse ────────────────────────────────────────────────────
        let baselines = if self.policies.values().any(|p| p.surge_spike_factor.is_some()) {
            match self
                .store
                .surge_baselines(self.settings.thresholds.surge_baseline_runs)
                .await
            {
                Ok(b) => b,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Surge baseline unreadable, spike check skipped");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        let aggregates = FusionEngine::new(&self.policies)
            .with_baselines(&baselines)
            .fuse(&signals, now);

        // ── Decide ──────────────────────────────────────────────────
        let prior = match self.store.load_state().await {
            Ok(book) => book,
            Err(e) => {
                error!(
                    run_id = %run_id,
                    error = %e,
                    "Alert state unreadable, treating every location as idle"
                );
                degraded.state_read = true;
                AlertStateBook::default()
            }
        };
        let decided = decision::decide(&prior, &aggregates, &self.registry, &self.policies, now);
        let seen = settled_keys(candidates, &recent, &decided.decisions);

        // ── Dispatch ────────────────────────────────────────────────
        let deliveries = self.dispatcher.dispatch_all(&decided.alerts).await;
        for report in deliveries.iter().filter(|r| !r.delivered) {
            error!(
                run_id = %run_id,
                incident = %report.alert.title(),
                "Alert decided but undelivered"
            );
        }

        let finished_at = now + Duration::from_std(clock.elapsed()).unwrap_or_default();

        // ── Persist ─────────────────────────────────────────────────
        let record = RunRecord {
            run_id,
            started_at: now,
            finished_at,
            dry_run,
            degraded: degraded.any(),
            signals_in: normalize.accepted,
            signals_out: signals.len(),
            sources: outcomes.clone(),
            deliveries: deliveries.clone(),
            seen: if dry_run { Vec::new() } else { seen },
            surge_samples: if dry_run {
                Vec::new()
            } else {
                surge_samples(&aggregates)
            },
            state: match (dry_run, degraded.state_read) {
                (true, _) => None,
                (false, true) => Some(StateWrite::Merge(alerted_state(
                    &decided.state,
                    &decided.decisions,
                ))),
                (false, false) => Some(StateWrite::Replace(decided.state.clone())),
            },
        };
        if let Err(e) = self.store.persist_run(&record).await {
            error!(
                run_id = %run_id,
                error = %e,
                "Run results not persisted; the next run will see this run as stale"
            );
            degraded.state_write = true;
        } else if !dry_run {
            match self.store.prune_seen(history_since).await {
                Ok(n) if n > 0 => debug!(run_id = %run_id, pruned = n, "Dedupe history pruned"),
                Ok(_) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "Could not prune dedupe history"),
            }
        }

        let artifact = RunArtifact {
            run_id,
            started_at: now,
            finished_at,
            dry_run,
            degraded,
            sources: outcomes,
            normalize,
            dedupe,
            signals,
            aggregates,
            decisions: decided.decisions,
            alerts: deliveries,
            state: decided.state,
        };

        if let Some(writer) = &self.artifacts {
            if let Err(e) = writer.write(&artifact) {
                error!(run_id = %run_id, error = %e, "Run artifact not written");
            }
        }

        info!(
            run_id = %run_id,
            signals = artifact.signals.len(),
            aggregates = artifact.aggregates.len(),
            alerts = artifact.alerts.len(),
            undelivered = artifact.undelivered().count(),
            degraded = artifact.degraded.any(),
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "Run finished"
        );
        artifact
    }
}

/// Every distinct key normalized this run, including those dedupe removes.
fn seen_keys(signals: &[Signal]) -> Vec<SeenKey> {
    let mut keys: BTreeMap<&str, SeenKey> = BTreeMap::new();
    for s in signals {
        keys.entry(&s.dedupe_key).or_insert_with(|| SeenKey {
            dedupe_key: s.dedupe_key.clone(),
            location_id: s.location_id.clone(),
            category: s.category,
        });
    }
    keys.into_values().collect()
}

/// Surge publisher counts worth remembering; zero counts are skipped.
fn surge_samples(aggregates: &[IncidentAggregate]) -> Vec<SurgeSample> {
    aggregates
        .iter()
        .filter(|a| a.surge_publishers > 0)
        .map(|a| SurgeSample {
            location_id: a.location_id.clone(),
            category: a.category,
            publishers: a.surge_publishers,
        })
        .collect()
}

/// The part of `state` this run can vouch for without having read the prior
/// state: keys it alerted on.
fn alerted_state(state: &AlertStateBook, decisions: &[AggregateDecision]) -> AlertStateBook {
    let mut out = AlertStateBook::default();
    for d in decisions {
        if !matches!(d.outcome, DecisionOutcome::Emitted | DecisionOutcome::Escalated) {
            continue;
        }
        let key = IncidentKey {
            location_id: d.location_id.clone(),
            category: d.category,
        };
        if let Some(entry) = state.get(&key) {
            out.set(&key, entry.clone());
        }
    }
    out
}

/// Keys to record in dedupe history: those behind an eligible aggregate
/// (alerted, escalated or held by cooldown) and those history already knew.
/// Items behind an ineligible aggregate stay unrecorded so a later run can
/// still corroborate them.
fn settled_keys(
    candidates: Vec<SeenKey>,
    recent: &HashSet<String>,
    decisions: &[AggregateDecision],
) -> Vec<SeenKey> {
    let covered: BTreeSet<IncidentKey> = decisions
        .iter()
        .filter(|d| {
            matches!(
                d.outcome,
                DecisionOutcome::Emitted
                    | DecisionOutcome::Escalated
                    | DecisionOutcome::SuppressedCooldown
            )
        })
        .map(|d| IncidentKey {
            location_id: d.location_id.clone(),
            category: d.category,
        })
        .collect();

    candidates
        .into_iter()
        .filter(|k| {
            recent.contains(&k.dedupe_key)
                || covered.contains(&IncidentKey {
                    location_id: k.location_id.clone(),
                    category: k.category,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::error::{DatabaseError, StateReadError, StateWriteError};
    use crate::locations::Location;
    use crate::notify::{LogNotifier, Notifier, RetryPolicy};
    use crate::pipeline::decision::AlertPhase;
    use crate::pipeline::types::{OfficialRecord, RawRecord};
    use crate::sources::StaticSource;
    use crate::store::{LibSqlBackend, RunSummary};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn registry() -> LocationRegistry {
        LocationRegistry::from_locations(vec![Location::new("home", "Home", &["Springfield"])])
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(RetryPolicy {
            max_attempts: 1,
            base_backoff: StdDuration::from_millis(1),
        })
        .with_transport(
            "log",
            Some(Arc::new(LogNotifier::new("log").acknowledging()) as Arc<dyn Notifier>),
        )
    }

    fn evacuation_order(alert_id: &str) -> Vec<Box<dyn SignalSource>> {
        let record = RawRecord::OfficialWarning(OfficialRecord {
            location_id: Some("home".into()),
            agency: Some("nws".into()),
            alert_id: Some(alert_id.into()),
            event: Some("Evacuation Immediate".into()),
            severity: Some("Extreme".into()),
            headline: Some("Evacuate Springfield now".into()),
            ..Default::default()
        });
        vec![Box::new(StaticSource::new("nws", vec![record]))]
    }

    fn evacuation() -> Vec<Box<dyn SignalSource>> {
        evacuation_order("evac-1")
    }

    /// Wraps the in-memory store and fails selected operations.
    struct FaultyStore {
        inner: LibSqlBackend,
        fail_read: AtomicBool,
        fail_write: AtomicBool,
    }

    #[async_trait]
    impl AlertStore for FaultyStore {
        async fn begin_run(
            &self,
            run_id: Uuid,
            started_at: DateTime<Utc>,
            dry_run: bool,
        ) -> Result<(), DatabaseError> {
            self.inner.begin_run(run_id, started_at, dry_run).await
        }

        async fn load_state(&self) -> Result<AlertStateBook, StateReadError> {
            if self.fail_read.load(Ordering::SeqCst) {
                return Err(StateReadError::Unavailable("disk gone".into()));
            }
            self.inner.load_state().await
        }

        async fn state_as_of(
            &self,
            run_id: &str,
        ) -> Result<Option<AlertStateBook>, StateReadError> {
            self.inner.state_as_of(run_id).await
        }

        async fn recent_dedupe_keys(
            &self,
            since: DateTime<Utc>,
        ) -> Result<HashSet<String>, DatabaseError> {
            self.inner.recent_dedupe_keys(since).await
        }

        async fn persist_run(&self, record: &RunRecord) -> Result<(), StateWriteError> {
            if self.fail_write.load(Ordering::SeqCst) {
                return Err(StateWriteError::Persist {
                    run_id: record.run_id.to_string(),
                    reason: "read-only filesystem".into(),
                });
            }
            self.inner.persist_run(record).await
        }

        async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, DatabaseError> {
            self.inner.list_runs(limit).await
        }

        async fn latest_run(
            &self,
            exclude: Option<&str>,
        ) -> Result<Option<RunSummary>, DatabaseError> {
            self.inner.latest_run(exclude).await
        }

        async fn surge_baselines(
            &self,
            runs: usize,
        ) -> Result<HashMap<IncidentKey, f64>, DatabaseError> {
            self.inner.surge_baselines(runs).await
        }

        async fn prune_seen(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError> {
            self.inner.prune_seen(before).await
        }
    }

    async fn faulty(fail_read: bool, fail_write: bool) -> Arc<FaultyStore> {
        Arc::new(FaultyStore {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_read: AtomicBool::new(fail_read),
            fail_write: AtomicBool::new(fail_write),
        })
    }

    fn pipeline(store: Arc<dyn AlertStore>, dry_run: bool) -> AlertPipeline {
        let settings = Settings {
            dry_run,
            ..Settings::default()
        };
        AlertPipeline::new(registry(), settings, store, dispatcher())
    }

    #[tokio::test]
    async fn official_warning_alerts_and_commits_state() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let p = pipeline(store.clone(), false);

        let artifact = p.run_at(&evacuation(), t0()).await;
        assert_eq!(artifact.alerts.len(), 1);
        assert!(artifact.alerts[0].delivered);
        assert!(!artifact.degraded.any());

        let state = store.load_state().await.unwrap();
        assert_eq!(state, artifact.state);
        let runs = store.list_runs(5).await.unwrap();
        assert!(runs[0].state_persisted);
        assert_eq!(runs[0].alerts_emitted, 1);
    }

    #[tokio::test]
    async fn empty_run_still_produces_artifact() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());
        let p = pipeline(store, false).with_artifacts(ArtifactWriter::new(dir.path()));

        let artifact = p.run_at(&[], t0()).await;
        assert!(artifact.alerts.is_empty());
        assert_eq!(writer.read_latest().unwrap(), Some(artifact));
    }

    #[tokio::test]
    async fn unreadable_state_fails_open() {
        let store = faulty(true, false).await;
        let p = pipeline(store.clone(), false);

        let first = p.run_at(&evacuation(), t0()).await;
        assert!(first.degraded.state_read);
        assert_eq!(first.alerts.len(), 1);

        // The first run's cooldown is committed but cannot be read back, so a
        // new warning at the same severity alerts instead of being suppressed.
        let second = p
            .run_at(&evacuation_order("evac-2"), t0() + Duration::minutes(5))
            .await;
        assert!(second.degraded.state_read);
        assert_eq!(second.alerts.len(), 1);
        assert!(!store.inner.load_state().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_state_keeps_stored_cooldowns() {
        let store = faulty(false, false).await;
        let p = pipeline(store.clone(), false);

        p.run_at(&evacuation(), t0()).await;
        let committed = store.inner.load_state().await.unwrap();
        assert_eq!(committed.entries().count(), 1);

        store.fail_read.store(true, Ordering::SeqCst);
        let degraded = p.run_at(&[], t0() + Duration::minutes(5)).await;
        assert!(degraded.degraded.state_read);
        assert_eq!(store.inner.load_state().await.unwrap(), committed);
        let latest = store.inner.latest_run(None).await.unwrap().unwrap();
        assert!(latest.state_persisted);

        store.fail_read.store(false, Ordering::SeqCst);
        let third = p
            .run_at(&evacuation_order("evac-2"), t0() + Duration::minutes(10))
            .await;
        assert!(!third.degraded.any());
        assert!(third.alerts.is_empty());
        assert_eq!(third.decisions[0].outcome, DecisionOutcome::SuppressedCooldown);
    }

    #[tokio::test]
    async fn unreadable_state_writes_back_only_alerted_keys() {
        let store = faulty(false, false).await;
        let p = pipeline(store.clone(), false);
        p.run_at(&evacuation(), t0()).await;

        store.fail_read.store(true, Ordering::SeqCst);
        let later = t0() + Duration::minutes(5);
        let degraded = p.run_at(&evacuation_order("evac-2"), later).await;
        assert_eq!(degraded.alerts.len(), 1);

        let stored = store.inner.load_state().await.unwrap();
        let (_, entry) = stored.entries().next().unwrap();
        assert_eq!(stored.entries().count(), 1);
        assert_eq!(entry.phase, AlertPhase::Cooling);
        assert_eq!(entry.last_alert_at, Some(later));
    }

    #[tokio::test]
    async fn readable_state_suppresses_same_severity() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let p = pipeline(store, false);

        p.run_at(&evacuation(), t0()).await;
        let second = p
            .run_at(&evacuation_order("evac-2"), t0() + Duration::minutes(5))
            .await;
        assert!(second.alerts.is_empty());
        assert_eq!(second.decisions[0].outcome, DecisionOutcome::SuppressedCooldown);
    }

    #[tokio::test]
    async fn failed_write_marks_next_run_stale() {
        let store = faulty(false, true).await;
        let p = pipeline(store.clone(), false);

        let first = p.run_at(&evacuation(), t0()).await;
        assert!(first.degraded.state_write);
        assert_eq!(first.alerts.len(), 1, "alerts already decided are kept");

        let second = p.run_at(&[], t0() + Duration::minutes(5)).await;
        assert!(second.degraded.prior_run_stale);
    }

    #[tokio::test]
    async fn dry_run_leaves_store_untouched() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dry = pipeline(store.clone(), true);

        let artifact = dry.run_at(&evacuation(), t0()).await;
        assert_eq!(artifact.alerts.len(), 1);
        assert_eq!(artifact.state.entries().count(), 1);
        assert!(store.load_state().await.unwrap().is_empty());
        assert!(store.recent_dedupe_keys(t0() - Duration::hours(1)).await.unwrap().is_empty());

        // A real run afterwards is not suppressed by the dry run.
        let real = pipeline(store.clone(), false);
        let artifact = real.run_at(&evacuation(), t0() + Duration::minutes(1)).await;
        assert_eq!(artifact.alerts.len(), 1);
        let state = store.load_state().await.unwrap();
        let (_, entry) = state.entries().next().unwrap();
        assert_eq!(entry.phase, AlertPhase::Cooling);
    }

    #[tokio::test]
    async fn failing_source_does_not_stop_the_run() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let p = pipeline(store, false);
        let mut sources = evacuation();
        sources.push(Box::new(StaticSource::failing("news", "503")));

        let artifact = p.run_at(&sources, t0()).await;
        assert_eq!(artifact.sources.len(), 2);
        assert!(artifact.sources.iter().any(|s| !s.ok));
        assert_eq!(artifact.alerts.len(), 1);
    }
}

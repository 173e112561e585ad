//! libSQL backend: async `AlertStore` trait implementation.
//!
//! Supports local file and in-memory databases. A run's results are written
//! in a single transaction, so a crash mid-write leaves the previous state in
//! place.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, StateReadError, StateWriteError};
use crate::pipeline::decision::{AlertPhase, AlertStateBook, CategoryState};
use crate::pipeline::fusion::median;
use crate::pipeline::types::{Category, IncidentKey, Severity};
use crate::store::migrations;
use crate::store::traits::{AlertStore, RunRecord, RunSummary, StateWrite};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp so string comparison orders correctly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|ndt| ndt.and_utc())
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn phase_to_str(phase: AlertPhase) -> &'static str {
    match phase {
        AlertPhase::Idle => "idle",
        AlertPhase::Pending => "pending",
        AlertPhase::Active => "active",
        AlertPhase::Cooling => "cooling",
    }
}

fn str_to_phase(s: &str) -> Option<AlertPhase> {
    match s {
        "idle" => Some(AlertPhase::Idle),
        "pending" => Some(AlertPhase::Pending),
        "active" => Some(AlertPhase::Active),
        "cooling" => Some(AlertPhase::Cooling),
        _ => None,
    }
}

/// Map an `alert_state` row to its key and state.
///
/// Column order: 0:location_id, 1:category, 2:phase, 3:last_alert_at,
/// 4:last_severity, 5:cooldown_until
fn row_to_state(row: &libsql::Row) -> Result<(IncidentKey, CategoryState), String> {
    let location_id: String = row.get(0).map_err(|e| e.to_string())?;
    let category_str: String = row.get(1).map_err(|e| e.to_string())?;
    let phase_str: String = row.get(2).map_err(|e| e.to_string())?;
    let last_alert_str: Option<String> = row.get(3).ok();
    let last_severity: Option<i64> = row.get(4).ok();
    let cooldown_str: Option<String> = row.get(5).ok();

    let category = Category::from_label(&category_str)
        .ok_or_else(|| format!("unknown category {category_str:?}"))?;
    let phase = str_to_phase(&phase_str).ok_or_else(|| format!("unknown phase {phase_str:?}"))?;
    let last_severity = match last_severity {
        Some(level) => Some(Severity::new(level).ok_or_else(|| format!("bad severity {level}"))?),
        None => None,
    };
    let parse_ts = |s: Option<String>| -> Result<Option<DateTime<Utc>>, String> {
        match s {
            Some(s) => parse_datetime(&s)
                .map(Some)
                .ok_or_else(|| format!("bad timestamp {s:?}")),
            None => Ok(None),
        }
    };

    Ok((
        IncidentKey {
            location_id,
            category,
        },
        CategoryState {
            phase,
            last_alert_at: parse_ts(last_alert_str)?,
            last_severity,
            cooldown_until: parse_ts(cooldown_str)?,
        },
    ))
}

/// Column order: 0:location_id, 1:category, 2:publishers
fn row_to_sample(row: &libsql::Row) -> Result<(IncidentKey, i64), String> {
    let location_id: String = row.get(0).map_err(|e| e.to_string())?;
    let label: String = row.get(1).map_err(|e| e.to_string())?;
    let category =
        Category::from_label(&label).ok_or_else(|| format!("unknown category {label:?}"))?;
    let publishers: i64 = row.get(2).map_err(|e| e.to_string())?;
    Ok((
        IncidentKey {
            location_id,
            category,
        },
        publishers,
    ))
}

const RUN_COLUMNS: &str = "id, started_at, finished_at, dry_run, state_persisted, degraded, signals_in, signals_out, alerts_emitted, alerts_undelivered";

/// Map a `runs` row (RUN_COLUMNS order) to a summary.
fn row_to_run(row: &libsql::Row) -> Result<RunSummary, libsql::Error> {
    let started_str: String = row.get(1)?;
    let finished_str: Option<String> = row.get(2).ok();
    Ok(RunSummary {
        run_id: row.get(0)?,
        started_at: parse_datetime(&started_str).unwrap_or(DateTime::<Utc>::MIN_UTC),
        finished_at: finished_str.as_deref().and_then(parse_datetime),
        dry_run: row.get::<i64>(3)? != 0,
        state_persisted: row.get::<i64>(4)? != 0,
        degraded: row.get::<i64>(5)? != 0,
        signals_in: row.get(6)?,
        signals_out: row.get(7)?,
        alerts_emitted: row.get(8)?,
        alerts_undelivered: row.get(9)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl AlertStore for LibSqlBackend {
    async fn begin_run(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO runs (id, started_at, dry_run) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO NOTHING",
                params![run_id.to_string(), ts(started_at), dry_run as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("begin_run: {e}")))?;
        debug!(run_id = %run_id, "Run started");
        Ok(())
    }

    async fn load_state(&self) -> Result<AlertStateBook, StateReadError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT location_id, category, phase, last_alert_at, last_severity, cooldown_until
                 FROM alert_state ORDER BY location_id, category",
                (),
            )
            .await
            .map_err(|e| StateReadError::Unavailable(format!("load_state: {e}")))?;

        let mut book = AlertStateBook::default();
        loop {
            let row = rows
                .next()
                .await
                .map_err(|e| StateReadError::Unavailable(format!("load_state: {e}")))?;
            let Some(row) = row else { break };
            let (key, state) = row_to_state(&row).map_err(StateReadError::Corrupt)?;
            book.set(&key, state);
        }
        Ok(book)
    }

    async fn state_as_of(&self, run_id: &str) -> Result<Option<AlertStateBook>, StateReadError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state FROM alert_state_snapshots WHERE run_id = ?1",
                params![run_id],
            )
            .await
            .map_err(|e| StateReadError::Unavailable(format!("state_as_of: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| StateReadError::Corrupt(format!("state_as_of: {e}")))?;
                let book = serde_json::from_str(&json)
                    .map_err(|e| StateReadError::Corrupt(format!("snapshot {run_id}: {e}")))?;
                Ok(Some(book))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StateReadError::Unavailable(format!("state_as_of: {e}"))),
        }
    }

    async fn recent_dedupe_keys(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT dedupe_key FROM seen_signals WHERE last_seen_at >= ?1",
                params![ts(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_dedupe_keys: {e}")))?;

        let mut keys = HashSet::new();
        while let Ok(Some(row)) = rows.next().await {
            match row.get::<String>(0) {
                Ok(k) => {
                    keys.insert(k);
                }
                Err(e) => warn!("Skipping seen_signals row: {e}"),
            }
        }
        Ok(keys)
    }

    async fn persist_run(&self, record: &RunRecord) -> Result<(), StateWriteError> {
        let run_id = record.run_id.to_string();
        let fail = |stage: &str, e: String| StateWriteError::Persist {
            run_id: run_id.clone(),
            reason: format!("{stage}: {e}"),
        };

        let undelivered = record.deliveries.iter().filter(|d| !d.delivered).count();
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| fail("begin", e.to_string()))?;

        tx.execute(
            "INSERT INTO runs (id, started_at, finished_at, dry_run, state_persisted, degraded,
                signals_in, signals_out, alerts_emitted, alerts_undelivered)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                finished_at = excluded.finished_at,
                state_persisted = 1,
                degraded = excluded.degraded,
                signals_in = excluded.signals_in,
                signals_out = excluded.signals_out,
                alerts_emitted = excluded.alerts_emitted,
                alerts_undelivered = excluded.alerts_undelivered",
            params![
                run_id.clone(),
                ts(record.started_at),
                ts(record.finished_at),
                record.dry_run as i64,
                record.degraded as i64,
                record.signals_in as i64,
                record.signals_out as i64,
                record.deliveries.len() as i64,
                undelivered as i64,
            ],
        )
        .await
        .map_err(|e| fail("runs", e.to_string()))?;

        for source in &record.sources {
            tx.execute(
                "INSERT INTO source_fetches (run_id, source, ok, records, error, latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.clone(),
                    source.source.clone(),
                    source.ok as i64,
                    source.records as i64,
                    opt_text_owned(source.error.clone()),
                    source.latency_ms as i64,
                ],
            )
            .await
            .map_err(|e| fail("source_fetches", e.to_string()))?;
        }

        for report in &record.deliveries {
            let alert = &report.alert;
            let deliveries = serde_json::to_string(&report.deliveries)
                .map_err(|e| StateWriteError::Serialization(e.to_string()))?;
            tx.execute(
                "INSERT INTO alerts (id, run_id, location_id, category, severity, priority,
                    escalated, source_count, reason, emitted_at, delivered, deliveries)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    Uuid::new_v4().to_string(),
                    run_id.clone(),
                    alert.location_id.clone(),
                    alert.category.as_str(),
                    alert.severity.level() as i64,
                    alert.priority.label(),
                    alert.escalated as i64,
                    alert.source_count as i64,
                    alert.reason.clone(),
                    ts(alert.emitted_at),
                    report.delivered as i64,
                    deliveries,
                ],
            )
            .await
            .map_err(|e| fail("alerts", e.to_string()))?;
        }

        let seen_at = ts(record.started_at);
        for seen in &record.seen {
            tx.execute(
                "INSERT INTO seen_signals (dedupe_key, location_id, category, first_seen_at, last_seen_at, run_id)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5)
                 ON CONFLICT(dedupe_key) DO UPDATE SET
                    last_seen_at = excluded.last_seen_at,
                    run_id = excluded.run_id",
                params![
                    seen.dedupe_key.clone(),
                    seen.location_id.clone(),
                    seen.category.as_str(),
                    seen_at.clone(),
                    run_id.clone(),
                ],
            )
            .await
            .map_err(|e| fail("seen_signals", e.to_string()))?;
        }

        for sample in &record.surge_samples {
            tx.execute(
                "INSERT OR REPLACE INTO surge_samples (run_id, location_id, category, publishers, taken_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.clone(),
                    sample.location_id.clone(),
                    sample.category.as_str(),
                    sample.publishers as i64,
                    seen_at.clone(),
                ],
            )
            .await
            .map_err(|e| fail("surge_samples", e.to_string()))?;
        }

        if let Some(write) = &record.state {
            if matches!(write, StateWrite::Replace(_)) {
                tx.execute("DELETE FROM alert_state", ())
                    .await
                    .map_err(|e| fail("alert_state", e.to_string()))?;
            }
            let book = write.book();
            for (key, state) in book.entries() {
                tx.execute(
                    "INSERT INTO alert_state (location_id, category, phase, last_alert_at,
                        last_severity, cooldown_until, run_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(location_id, category) DO UPDATE SET
                        phase = excluded.phase,
                        last_alert_at = excluded.last_alert_at,
                        last_severity = excluded.last_severity,
                        cooldown_until = excluded.cooldown_until,
                        run_id = excluded.run_id",
                    params![
                        key.location_id.clone(),
                        key.category.as_str(),
                        phase_to_str(state.phase),
                        opt_text_owned(state.last_alert_at.map(ts)),
                        opt_int(state.last_severity.map(|s| s.level() as i64)),
                        opt_text_owned(state.cooldown_until.map(ts)),
                        run_id.clone(),
                    ],
                )
                .await
                .map_err(|e| fail("alert_state", e.to_string()))?;
            }

            if let StateWrite::Replace(book) = write {
                let snapshot = serde_json::to_string(book)
                    .map_err(|e| StateWriteError::Serialization(e.to_string()))?;
                tx.execute(
                    "INSERT OR REPLACE INTO alert_state_snapshots (run_id, taken_at, state)
                     VALUES (?1, ?2, ?3)",
                    params![run_id.clone(), ts(record.finished_at), snapshot],
                )
                .await
                .map_err(|e| fail("alert_state_snapshots", e.to_string()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| fail("commit", e.to_string()))?;

        info!(
            run_id = %run_id,
            alerts = record.deliveries.len(),
            seen = record.seen.len(),
            state_written = record.state.is_some(),
            "Run persisted"
        );
        Ok(())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_run(&row) {
                Ok(run) => runs.push(run),
                Err(e) => warn!("Skipping run row: {e}"),
            }
        }
        Ok(runs)
    }

    async fn latest_run(&self, exclude: Option<&str>) -> Result<Option<RunSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE (?1 IS NULL OR id != ?1)
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![opt_text_owned(exclude.map(str::to_string))],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_run(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_run: {e}"))),
        }
    }

    async fn surge_baselines(
        &self,
        runs: usize,
    ) -> Result<HashMap<IncidentKey, f64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT location_id, category, publishers FROM surge_samples
                 ORDER BY location_id, category, taken_at DESC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("surge_baselines: {e}")))?;

        let mut samples: HashMap<IncidentKey, Vec<usize>> = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_sample(&row) {
                Ok((key, publishers)) => {
                    let recent = samples.entry(key).or_default();
                    if recent.len() < runs {
                        recent.push(publishers.max(0) as usize);
                    }
                }
                Err(e) => warn!("Skipping surge_samples row: {e}"),
            }
        }

        Ok(samples
            .into_iter()
            .filter_map(|(key, recent)| median(&recent).map(|m| (key, m)))
            .collect())
    }

    async fn prune_seen(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM surge_samples WHERE taken_at < ?1",
                params![ts(before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_seen: {e}")))?;

        let count = self
            .conn()
            .execute(
                "DELETE FROM seen_signals WHERE last_seen_at < ?1",
                params![ts(before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_seen: {e}")))?;

        if count > 0 {
            debug!(count, "Pruned old dedupe history");
        }
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::notify::{ChannelDelivery, DeliveryReport, DeliveryStatus};
    use crate::pipeline::types::{Alert, Priority};
    use crate::sources::SourceOutcome;
    use crate::store::traits::{SeenKey, SurgeSample};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn key(category: Category) -> IncidentKey {
        IncidentKey {
            location_id: "home".into(),
            category,
        }
    }

    fn cooling_book(at: DateTime<Utc>) -> AlertStateBook {
        let mut book = AlertStateBook::default();
        book.set(
            &key(Category::Hazmat),
            CategoryState {
                phase: AlertPhase::Cooling,
                last_alert_at: Some(at),
                last_severity: Some(Severity::WATCH),
                cooldown_until: Some(at + Duration::minutes(120)),
            },
        );
        book
    }

    fn record(started_at: DateTime<Utc>, state: Option<AlertStateBook>, seen: &[&str]) -> RunRecord {
        RunRecord {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at + Duration::seconds(3),
            dry_run: state.is_none(),
            degraded: false,
            signals_in: 4,
            signals_out: 2,
            sources: vec![SourceOutcome {
                source: "nws".into(),
                ok: true,
                records: 4,
                error: None,
                latency_ms: 12,
            }],
            deliveries: vec![DeliveryReport {
                alert: Alert {
                    location_id: "home".into(),
                    location_name: "Home".into(),
                    category: Category::Hazmat,
                    severity: Severity::WATCH,
                    source_count: 2,
                    reason: "confirmed".into(),
                    priority: Priority::Normal,
                    escalated: false,
                    emitted_at: started_at,
                },
                deliveries: vec![ChannelDelivery {
                    transport: "email".into(),
                    status: DeliveryStatus::Failed,
                    attempts: 3,
                    error: Some("gave up".into()),
                }],
                delivered: false,
            }],
            seen: seen
                .iter()
                .map(|k| SeenKey {
                    dedupe_key: k.to_string(),
                    location_id: "home".into(),
                    category: Category::Hazmat,
                })
                .collect(),
            surge_samples: Vec::new(),
            state: state.map(StateWrite::Replace),
        }
    }

    #[tokio::test]
    async fn empty_store_has_empty_state() {
        let db = test_db().await;
        assert!(db.load_state().await.unwrap().is_empty());
        assert!(db.latest_run(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persisted_state_round_trips() {
        let db = test_db().await;
        let rec = record(t0(), Some(cooling_book(t0())), &["k1"]);
        db.begin_run(rec.run_id, rec.started_at, false).await.unwrap();
        db.persist_run(&rec).await.unwrap();

        let loaded = db.load_state().await.unwrap();
        assert_eq!(loaded, cooling_book(t0()));
    }

    #[tokio::test]
    async fn state_as_of_returns_each_runs_snapshot() {
        let db = test_db().await;
        let first = record(t0(), Some(cooling_book(t0())), &[]);
        db.persist_run(&first).await.unwrap();

        let later = t0() + Duration::hours(1);
        let second = record(later, Some(cooling_book(later)), &[]);
        db.persist_run(&second).await.unwrap();

        let as_of_first = db
            .state_as_of(&first.run_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(as_of_first, cooling_book(t0()));
        assert_eq!(db.load_state().await.unwrap(), cooling_book(later));
        assert!(db.state_as_of("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dry_run_leaves_state_untouched() {
        let db = test_db().await;
        db.persist_run(&record(t0(), Some(cooling_book(t0())), &[]))
            .await
            .unwrap();
        let dry = record(t0() + Duration::hours(1), None, &[]);
        db.persist_run(&dry).await.unwrap();

        assert_eq!(db.load_state().await.unwrap(), cooling_book(t0()));
        assert!(db.state_as_of(&dry.run_id.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merged_state_keeps_untouched_rows() {
        let db = test_db().await;
        db.persist_run(&record(t0(), Some(cooling_book(t0())), &[]))
            .await
            .unwrap();

        let later = t0() + Duration::minutes(30);
        let mut update = AlertStateBook::default();
        update.set(
            &key(Category::Evacuation),
            CategoryState {
                phase: AlertPhase::Cooling,
                last_alert_at: Some(later),
                last_severity: Some(Severity::URGENT),
                cooldown_until: Some(later + Duration::minutes(60)),
            },
        );
        let mut merge = record(later, None, &[]);
        merge.dry_run = false;
        merge.state = Some(StateWrite::Merge(update.clone()));
        db.persist_run(&merge).await.unwrap();

        let loaded = db.load_state().await.unwrap();
        assert_eq!(loaded.get(&key(Category::Hazmat)), cooling_book(t0()).get(&key(Category::Hazmat)));
        assert_eq!(loaded.get(&key(Category::Evacuation)), update.get(&key(Category::Evacuation)));
        assert!(db.state_as_of(&merge.run_id.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn surge_baseline_is_median_of_recent_runs() {
        let db = test_db().await;
        for (i, publishers) in [9, 2, 4, 6].into_iter().enumerate() {
            let mut rec = record(t0() + Duration::minutes(15 * i as i64), None, &[]);
            rec.surge_samples = vec![SurgeSample {
                location_id: "home".into(),
                category: Category::Hazmat,
                publishers,
            }];
            db.persist_run(&rec).await.unwrap();
        }

        // Last three runs: 2, 4, 6
        let baselines = db.surge_baselines(3).await.unwrap();
        assert_eq!(baselines.get(&key(Category::Hazmat)), Some(&4.0));
        assert!(!baselines.contains_key(&key(Category::Outage)));

        db.prune_seen(t0() + Duration::hours(2)).await.unwrap();
        assert!(db.surge_baselines(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_keys_respect_window() {
        let db = test_db().await;
        db.persist_run(&record(t0(), None, &["old"])).await.unwrap();
        db.persist_run(&record(t0() + Duration::hours(30), None, &["new"]))
            .await
            .unwrap();

        let keys = db
            .recent_dedupe_keys(t0() + Duration::hours(10))
            .await
            .unwrap();
        assert!(keys.contains("new"));
        assert!(!keys.contains("old"));
    }

    #[tokio::test]
    async fn seeing_a_key_again_refreshes_it() {
        let db = test_db().await;
        db.persist_run(&record(t0(), None, &["k"])).await.unwrap();
        db.persist_run(&record(t0() + Duration::hours(20), None, &["k"]))
            .await
            .unwrap();
        let keys = db
            .recent_dedupe_keys(t0() + Duration::hours(19))
            .await
            .unwrap();
        assert!(keys.contains("k"));
    }

    #[tokio::test]
    async fn unpersisted_run_is_visible_as_stale() {
        let db = test_db().await;
        let id = Uuid::new_v4();
        db.begin_run(id, t0(), false).await.unwrap();

        let latest = db.latest_run(None).await.unwrap().unwrap();
        assert_eq!(latest.run_id, id.to_string());
        assert!(!latest.state_persisted);
        assert!(latest.finished_at.is_none());
        assert!(db.latest_run(Some(&id.to_string())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_runs_newest_first_with_counts() {
        let db = test_db().await;
        let a = record(t0(), None, &[]);
        let b = record(t0() + Duration::hours(1), None, &[]);
        db.persist_run(&a).await.unwrap();
        db.persist_run(&b).await.unwrap();

        let runs = db.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, b.run_id.to_string());
        assert_eq!(runs[0].alerts_emitted, 1);
        assert_eq!(runs[0].alerts_undelivered, 1);
        assert!(runs[0].state_persisted);
        assert_eq!(db.list_runs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_removes_old_keys() {
        let db = test_db().await;
        db.persist_run(&record(t0(), None, &["a", "b"])).await.unwrap();
        let removed = db.prune_seen(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn corrupt_state_row_is_a_read_error() {
        let db = test_db().await;
        db.conn()
            .execute(
                "INSERT INTO alert_state (location_id, category, phase, run_id)
                 VALUES ('home', 'zombies', 'idle', 'r1')",
                (),
            )
            .await
            .unwrap();
        let err = db.load_state().await.unwrap_err();
        assert!(matches!(err, StateReadError::Corrupt(_)));
    }
}

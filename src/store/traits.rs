//! `AlertStore` trait: single async interface for cross-run persistence.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DatabaseError, StateReadError, StateWriteError};
use crate::notify::DeliveryReport;
use crate::pipeline::decision::AlertStateBook;
use crate::pipeline::types::{Category, IncidentKey};
use crate::sources::SourceOutcome;

/// A dedupe key observed during a run. Recorded at the run's start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenKey {
    pub dedupe_key: String,
    pub location_id: String,
    pub category: Category,
}

/// Distinct surge publishers one run counted for one key. Feeds the rolling
/// surge baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurgeSample {
    pub location_id: String,
    pub category: Category,
    pub publishers: usize,
}

/// Everything a finished run writes, in one atomic unit.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    /// State was read from a fallback because the store failed.
    pub degraded: bool,
    pub signals_in: usize,
    pub signals_out: usize,
    pub sources: Vec<SourceOutcome>,
    pub deliveries: Vec<DeliveryReport>,
    pub seen: Vec<SeenKey>,
    pub surge_samples: Vec<SurgeSample>,
    /// New alert state. `None` leaves the stored state untouched (dry run).
    pub state: Option<StateWrite>,
}

/// How a run's alert state reaches the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StateWrite {
    /// The complete next state. Stored rows are replaced and a snapshot is taken.
    Replace(AlertStateBook),
    /// Only these keys are upserted; every other stored row is kept. Used when
    /// the run could not read the stored state. No snapshot is taken.
    Merge(AlertStateBook),
}

impl StateWrite {
    pub fn book(&self) -> &AlertStateBook {
        match self {
            Self::Replace(book) | Self::Merge(book) => book,
        }
    }
}

/// One row of run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    /// False when the run never committed its results.
    pub state_persisted: bool,
    pub degraded: bool,
    pub signals_in: i64,
    pub signals_out: i64,
    pub alerts_emitted: i64,
    pub alerts_undelivered: i64,
}

/// Backend-agnostic persistence for alert state and run history.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Record that a run has started. The row stays unpersisted until
    /// [`AlertStore::persist_run`] commits.
    async fn begin_run(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<(), DatabaseError>;

    /// Current alert state.
    async fn load_state(&self) -> Result<AlertStateBook, StateReadError>;

    /// Alert state as committed by `run_id`, if that run persisted state.
    async fn state_as_of(&self, run_id: &str) -> Result<Option<AlertStateBook>, StateReadError>;

    /// Dedupe keys last seen at or after `since`.
    async fn recent_dedupe_keys(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, DatabaseError>;

    /// Commit a finished run: history, deliveries, seen keys and state, plus a
    /// state snapshot when the state is replaced. All or nothing.
    async fn persist_run(&self, record: &RunRecord) -> Result<(), StateWriteError>;

    /// Most recent runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, DatabaseError>;

    /// The most recently started run, excluding `exclude`.
    async fn latest_run(&self, exclude: Option<&str>) -> Result<Option<RunSummary>, DatabaseError>;

    /// Median surge publisher count per key over each key's last `runs`
    /// samples. Keys with no samples are absent.
    async fn surge_baselines(
        &self,
        runs: usize,
    ) -> Result<HashMap<IncidentKey, f64>, DatabaseError>;

    /// Forget dedupe keys and surge samples older than `before`. Returns the
    /// dedupe rows removed.
    async fn prune_seen(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError>;
}

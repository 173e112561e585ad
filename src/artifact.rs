//! Per-run audit artifact.
//!
//! One JSON document per run under `{data_dir}/runs/`, plus a copy at
//! `{data_dir}/latest_run.json`. Both are written to a temporary file in the
//! target directory and renamed into place, so readers never see a partial
//! document.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;
use uuid::Uuid;

use crate::error::ArtifactError;
use crate::notify::DeliveryReport;
use crate::pipeline::decision::{AggregateDecision, AlertStateBook};
use crate::pipeline::dedup::DedupReport;
use crate::pipeline::normalizer::NormalizeReport;
use crate::pipeline::types::{IncidentAggregate, Signal};
use crate::sources::SourceOutcome;

/// Conditions under which the run's results should not be fully trusted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DegradedFlags {
    /// Prior state could not be read; every key started from idle.
    pub state_read: bool,
    /// This run's state could not be committed.
    pub state_write: bool,
    /// The previous run never committed its state.
    pub prior_run_stale: bool,
    /// Dedupe history could not be read.
    pub history_read: bool,
}

impl DegradedFlags {
    pub fn any(&self) -> bool {
        self.state_read || self.state_write || self.prior_run_stale || self.history_read
    }
}

/// Full audit record of one run. Produced even when no alert fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub degraded: DegradedFlags,
    pub sources: Vec<SourceOutcome>,
    pub normalize: NormalizeReport,
    pub dedupe: DedupReport,
    /// Signals that survived dedupe.
    pub signals: Vec<Signal>,
    pub aggregates: Vec<IncidentAggregate>,
    pub decisions: Vec<AggregateDecision>,
    pub alerts: Vec<DeliveryReport>,
    pub state: AlertStateBook,
}

impl RunArtifact {
    /// Alerts decided this run that no suitable transport accepted.
    pub fn undelivered(&self) -> impl Iterator<Item = &DeliveryReport> {
        self.alerts.iter().filter(|r| !r.delivered)
    }
}

/// Writes artifacts under a data directory.
pub struct ArtifactWriter {
    data_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.data_dir.join("latest_run.json")
    }

    pub fn run_path(&self, run_id: &Uuid) -> PathBuf {
        self.data_dir.join("runs").join(format!("{run_id}.json"))
    }

    /// Write the artifact and refresh `latest_run.json`. Returns the
    /// per-run path.
    pub fn write(&self, artifact: &RunArtifact) -> Result<PathBuf, ArtifactError> {
        let json = serde_json::to_vec_pretty(artifact)?;
        let run_path = self.run_path(&artifact.run_id);
        write_atomic(&run_path, &json)?;
        write_atomic(&self.latest_path(), &json)?;
        debug!(path = %run_path.display(), "Run artifact written");
        Ok(run_path)
    }

    /// Read back the latest artifact, if any.
    pub fn read_latest(&self) -> Result<Option<RunArtifact>, ArtifactError> {
        let path = self.latest_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ArtifactError::Persist {
        path: path.display().to_string(),
        reason: e.error.to_string(),
    })?;
    Ok(())
}

//! Raw record sources.
//!
//! Fetching and parsing feeds happens outside this crate; the fetchers drop
//! their output as JSON files into the inbox directory. Each file is one
//! [`SignalSource`]. Sources are fetched concurrently and a failure in one
//! never affects another: it is logged and counts as zero records.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SourceFetchError;
use crate::pipeline::types::RawRecord;

/// A producer of raw records for one run.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Stable name used in logs and the run record.
    fn name(&self) -> &str;

    /// Fetch this run's records.
    async fn fetch(&self) -> Result<Vec<RawRecord>, SourceFetchError>;
}

/// Result of fetching one source, kept for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source: String,
    pub ok: bool,
    pub records: usize,
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Fetch every source concurrently, each bounded by `timeout`.
///
/// Records come back in source order so the downstream pipeline sees a
/// stable input for a given set of sources.
pub async fn fetch_all(
    sources: &[Box<dyn SignalSource>],
    timeout: Duration,
) -> (Vec<RawRecord>, Vec<SourceOutcome>) {
    let futures: Vec<_> = sources
        .iter()
        .map(|source| async move {
            let start = Instant::now();
            let result = match tokio::time::timeout(timeout, source.fetch()).await {
                Ok(r) => r,
                Err(_) => Err(SourceFetchError::Timeout {
                    source_name: source.name().to_string(),
                    timeout,
                }),
            };
            (source.name().to_string(), result, start.elapsed())
        })
        .collect();

    let mut records = Vec::new();
    let mut outcomes = Vec::with_capacity(sources.len());
    for (name, result, elapsed) in join_all(futures).await {
        let latency_ms = elapsed.as_millis() as u64;
        match result {
            Ok(batch) => {
                debug!(source = %name, records = batch.len(), latency_ms, "Source fetched");
                outcomes.push(SourceOutcome {
                    source: name,
                    ok: true,
                    records: batch.len(),
                    error: None,
                    latency_ms,
                });
                records.extend(batch);
            }
            Err(e) => {
                warn!(source = %name, error = %e, latency_ms, "Source fetch failed, continuing without it");
                outcomes.push(SourceOutcome {
                    source: name,
                    ok: false,
                    records: 0,
                    error: Some(e.to_string()),
                    latency_ms,
                });
            }
        }
    }
    (records, outcomes)
}

// ── Inbox files ─────────────────────────────────────────────────────

/// One JSON file in the inbox directory.
///
/// The file holds either an array of records or `{"records": [...]}`.
/// Records that do not deserialize are skipped with a warning; a file that
/// is not JSON at all is a [`SourceFetchError::Malformed`].
pub struct InboxFileSource {
    name: String,
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InboxPayload {
    Bare(Vec<serde_json::Value>),
    Wrapped { records: Vec<serde_json::Value> },
}

impl InboxFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "inbox".to_string());
        Self { name, path }
    }

    /// One source per `*.json` file in `dir`, sorted by file name.
    ///
    /// A missing directory yields no sources.
    pub fn discover(dir: &Path) -> Vec<Box<dyn SignalSource>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Inbox directory unreadable, no sources this run");
                return Vec::new();
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        paths
            .into_iter()
            .map(|p| Box::new(InboxFileSource::new(p)) as Box<dyn SignalSource>)
            .collect()
    }
}

#[async_trait]
impl SignalSource for InboxFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>, SourceFetchError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceFetchError::Transport {
                source_name: self.name.clone(),
                reason: e.to_string(),
            })?;
        let payload: InboxPayload =
            serde_json::from_str(&text).map_err(|e| SourceFetchError::Malformed {
                source_name: self.name.clone(),
                reason: e.to_string(),
            })?;
        let values = match payload {
            InboxPayload::Bare(v) | InboxPayload::Wrapped { records: v } => v,
        };

        let mut records = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            match serde_json::from_value::<RawRecord>(value) {
                Ok(r) => records.push(r),
                Err(e) => {
                    warn!(source = %self.name, index, error = %e, "Skipping undecodable record");
                }
            }
        }
        Ok(records)
    }
}

// ── In-memory ───────────────────────────────────────────────────────

/// Fixed records or a fixed failure. Used for replays and tests.
pub struct StaticSource {
    name: String,
    result: Result<Vec<RawRecord>, String>,
    delay: Option<Duration>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            name: name.into(),
            result: Ok(records),
            delay: None,
        }
    }

    /// A source whose every fetch fails with a transport error.
    pub fn failing(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: Err(reason.into()),
            delay: None,
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl SignalSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>, SourceFetchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result
            .clone()
            .map_err(|reason| SourceFetchError::Transport {
                source_name: self.name.clone(),
                reason,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{NewsRecord, OfficialRecord};

    fn official() -> RawRecord {
        RawRecord::OfficialWarning(OfficialRecord {
            agency: Some("nws".into()),
            alert_id: Some("A1".into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn failing_source_does_not_block_others() {
        let sources: Vec<Box<dyn SignalSource>> = vec![
            Box::new(StaticSource::new("ok", vec![official()])),
            Box::new(StaticSource::failing("broken", "connection reset")),
        ];
        let (records, outcomes) = fetch_all(&sources, Duration::from_secs(5)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert!(outcomes[1].error.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let sources: Vec<Box<dyn SignalSource>> = vec![
            Box::new(StaticSource::new("slow", vec![official()]).with_delay(Duration::from_secs(5))),
            Box::new(StaticSource::new("fast", vec![official(), official()])),
        ];
        let (records, outcomes) = fetch_all(&sources, Duration::from_millis(50)).await;
        assert_eq!(records.len(), 2);
        assert!(!outcomes[0].ok);
        assert!(outcomes[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn inbox_file_reads_both_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let bare = serde_json::json!([
            {"source_kind": "official_warning", "agency": "nws", "alert_id": "X"},
            {"source_kind": "mystery"}
        ]);
        let wrapped = serde_json::json!({
            "records": [{"source_kind": "news_item", "title": "Road closed"}]
        });
        std::fs::write(dir.path().join("a_nws.json"), bare.to_string()).unwrap();
        std::fs::write(dir.path().join("b_news.json"), wrapped.to_string()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let sources = InboxFileSource::discover(dir.path());
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name(), "a_nws");

        let (records, outcomes) = fetch_all(&sources, Duration::from_secs(5)).await;
        assert_eq!(records.len(), 2);
        assert!(outcomes.iter().all(|o| o.ok));
        assert!(matches!(records[1], RawRecord::NewsItem(NewsRecord { .. })));
    }

    #[tokio::test]
    async fn malformed_inbox_file_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = InboxFileSource::new(&path).fetch().await.unwrap_err();
        assert!(matches!(err, SourceFetchError::Malformed { .. }));
    }

    #[test]
    fn missing_inbox_dir_yields_no_sources() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InboxFileSource::discover(&dir.path().join("nope")).is_empty());
    }
}

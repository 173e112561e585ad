//! Error types for Prepper Alerts.

use std::time::Duration;

/// Top-level error type for the alert pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceFetchError),

    #[error("State read error: {0}")]
    StateRead(#[from] StateReadError),

    #[error("State write error: {0}")]
    StateWrite(#[from] StateWriteError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Configuration loading errors (whole-file problems).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("No valid locations remain after validation ({rejected} rejected)")]
    EmptyRegistry { rejected: usize },
}

/// Validation failure for a single location or settings field.
///
/// Never fatal on its own: the offending entry is dropped and reported.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("location #{index}: missing or empty id")]
    MissingId { index: usize },

    #[error("location {id}: duplicate id")]
    DuplicateId { id: String },

    #[error("location {id}: {field} out of range ({value})")]
    OutOfRange {
        id: String,
        field: &'static str,
        value: f64,
    },

    #[error("location {id}: no matching terms")]
    NoTerms { id: String },

    #[error("{scope}: invalid {field}: {reason}")]
    InvalidField {
        scope: String,
        field: String,
        reason: String,
    },
}

/// Per-source fetch failure. Treated as zero signals from that source.
#[derive(Debug, thiserror::Error)]
pub enum SourceFetchError {
    #[error("source {source_name} timed out after {timeout:?}")]
    Timeout {
        source_name: String,
        timeout: Duration,
    },

    #[error("source {source_name} transport error: {reason}")]
    Transport { source_name: String, reason: String },

    #[error("source {source_name} returned malformed payload: {reason}")]
    Malformed { source_name: String, reason: String },
}

/// Per-item classification failure at the normalizer boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassificationError {
    #[error("item carries no classification")]
    Unclassified,

    #[error("classified as not relevant")]
    NotRelevant,

    #[error("confidence {confidence:.2} below minimum {minimum:.2}")]
    LowConfidence { confidence: f64, minimum: f64 },

    #[error("unrecognised category {0:?}")]
    UnknownCategory(String),

    #[error("category {0} not allowed for location")]
    CategoryNotAllowed(String),

    #[error("severity {0} outside 1..=3")]
    SeverityOutOfRange(i64),

    #[error("unrecognised agency severity {0:?}")]
    UnknownAgencySeverity(String),

    #[error("no matching location")]
    NoLocationMatch,

    #[error("publisher {0} not allow-listed")]
    PublisherNotAllowed(String),

    #[error("record missing required field {0}")]
    MissingField(&'static str),
}

impl ClassificationError {
    /// Stable label used as a counter key in the normalize report.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unclassified => "unclassified",
            Self::NotRelevant => "not_relevant",
            Self::LowConfidence { .. } => "low_confidence",
            Self::UnknownCategory(_) => "unknown_category",
            Self::CategoryNotAllowed(_) => "category_not_allowed",
            Self::SeverityOutOfRange(_) => "severity_out_of_range",
            Self::UnknownAgencySeverity(_) => "unknown_agency_severity",
            Self::NoLocationMatch => "no_location_match",
            Self::PublisherNotAllowed(_) => "publisher_not_allowed",
            Self::MissingField(_) => "missing_field",
        }
    }
}

/// Persisted alert state could not be read. The run degrades to empty state.
#[derive(Debug, thiserror::Error)]
pub enum StateReadError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("state snapshot corrupt: {0}")]
    Corrupt(String),
}

/// Persisted alert state could not be written. Fatal for persistence only.
#[derive(Debug, thiserror::Error)]
pub enum StateWriteError {
    #[error("failed to persist state for run {run_id}: {reason}")]
    Persist { run_id: String, reason: String },

    #[error("failed to serialize state: {0}")]
    Serialization(String),
}

/// libSQL backend errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// A single transport attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("transport {transport} rejected alert: {reason}")]
    Rejected { transport: String, reason: String },

    #[error("transport {transport} request failed: {reason}")]
    RequestFailed { transport: String, reason: String },

    #[error("transport {transport} gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        transport: String,
        attempts: u32,
        last_error: String,
    },
}

/// Run artifact could not be written.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to persist {path}: {reason}")]
    Persist { path: String, reason: String },
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

//! Shared types for the signal fusion pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Severity ────────────────────────────────────────────────────────

/// Ordinal severity, 1 (informational) through 3 (urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Severity(u8);

impl Severity {
    pub const INFO: Severity = Severity(1);
    pub const WATCH: Severity = Severity(2);
    pub const URGENT: Severity = Severity(3);

    /// Build a severity from an integer; `None` outside 1..=3.
    pub fn new(level: i64) -> Option<Self> {
        match level {
            1..=3 => Some(Severity(level as u8)),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Severity::new(value as i64).ok_or_else(|| format!("severity {value} outside 1..=3"))
    }
}

impl From<Severity> for u8 {
    fn from(s: Severity) -> u8 {
        s.0
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Category ────────────────────────────────────────────────────────

/// Closed set of hazard classes. Unrecognised labels are rejected at the
/// normalizer and never travel further down the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SevereWeather,
    Evacuation,
    Hazmat,
    Lockdown,
    Outage,
    Disaster,
    PublicHealth,
    Crime,
    Earthquake,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::SevereWeather,
        Category::Evacuation,
        Category::Hazmat,
        Category::Lockdown,
        Category::Outage,
        Category::Disaster,
        Category::PublicHealth,
        Category::Crime,
        Category::Earthquake,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SevereWeather => "severe_weather",
            Self::Evacuation => "evacuation",
            Self::Hazmat => "hazmat",
            Self::Lockdown => "lockdown",
            Self::Outage => "outage",
            Self::Disaster => "disaster",
            Self::PublicHealth => "public_health",
            Self::Crime => "crime",
            Self::Earthquake => "earthquake",
        }
    }

    /// Parse a loosely-formatted label from a classifier or config file.
    ///
    /// Accepts the canonical snake_case names plus a few common spellings.
    pub fn from_label(label: &str) -> Option<Self> {
        let key: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let c = match key.as_str() {
            "severe_weather" | "weather" | "storm" => Self::SevereWeather,
            "evacuation" | "evacuations" => Self::Evacuation,
            "hazmat" | "chemical_spill" | "hazardous_materials" => Self::Hazmat,
            "lockdown" | "shelter_in_place" => Self::Lockdown,
            "outage" | "infrastructure_outage" | "power_outage" => Self::Outage,
            "disaster" | "wildfire" | "fire" | "flood" => Self::Disaster,
            "public_health" | "health" | "air_quality" => Self::PublicHealth,
            "crime" | "violence" | "civil_unrest" => Self::Crime,
            "earthquake" | "quake" => Self::Earthquake,
            _ => return None,
        };
        Some(c)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Raw boundary records ────────────────────────────────────────────

/// Raw record handed over by the external fetchers, tagged with its kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source_kind", rename_all = "snake_case")]
pub enum RawRecord {
    OfficialWarning(OfficialRecord),
    NewsItem(NewsRecord),
}

/// An official agency warning in the agency's own vocabulary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfficialRecord {
    /// Issuing agency ("nws", "usgs", ...).
    pub agency: Option<String>,
    /// Agency-native identifier of the alert.
    pub alert_id: Option<String>,
    /// Location the fetcher queried for.
    pub location_id: Option<String>,
    /// Event name ("Tornado Warning").
    pub event: Option<String>,
    /// Explicit category label, if the fetcher already knows it.
    pub category: Option<String>,
    /// CAP severity word ("Extreme", "Severe", "Moderate", "Minor").
    pub severity: Option<String>,
    /// Earthquake magnitude, for seismic feeds.
    pub magnitude: Option<f64>,
    pub headline: Option<String>,
    pub area_desc: Option<String>,
    pub url: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

/// A news item together with the external classification verdict.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewsRecord {
    pub title: Option<String>,
    pub url: Option<String>,
    pub publisher: Option<String>,
    pub summary: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Location hint from the search that found this item.
    pub location_id: Option<String>,
    pub classification: Option<NewsClassification>,
}

/// Output of the external classification step, still loosely typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsClassification {
    pub relevant: bool,
    pub category: String,
    pub severity: i64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

fn default_confidence() -> f64 {
    1.0
}

// ── Canonical signal ────────────────────────────────────────────────

/// Where a signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    OfficialWarning,
    NewsItem,
}

/// One normalized observation about a location/category/severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub source_kind: SourceKind,
    pub location_id: String,
    pub category: Category,
    pub severity: Severity,
    /// Agency or publisher; distinct values count as distinct sources.
    pub publisher_or_agency: String,
    pub observed_at: DateTime<Utc>,
    pub dedupe_key: String,
    /// Short human-readable title for the audit trail.
    pub title: String,
    pub url: Option<String>,
}

impl Signal {
    pub fn is_official(&self) -> bool {
        self.source_kind == SourceKind::OfficialWarning
    }

    /// Key of the incident aggregate this signal contributes to.
    pub fn incident_key(&self) -> IncidentKey {
        IncidentKey {
            location_id: self.location_id.clone(),
            category: self.category,
        }
    }
}

// ── Aggregates ──────────────────────────────────────────────────────

/// (location, category) pair identifying an incident.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IncidentKey {
    pub location_id: String,
    pub category: Category,
}

impl fmt::Display for IncidentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.location_id, self.category)
    }
}

/// Per-run roll-up of surviving signals for one (location, category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentAggregate {
    pub location_id: String,
    pub category: Category,
    /// Distinct publishers/agencies across all signals.
    pub distinct_sources: usize,
    /// Distinct news publishers inside the surge lookback window.
    pub surge_publishers: usize,
    /// Median surge publisher count of recent runs, when the spike check is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surge_baseline: Option<f64>,
    /// Distinct sources reporting at or above the confirmation floor.
    pub serious_sources: usize,
    pub max_severity: Severity,
    pub signal_count: usize,
    pub official_present: bool,
    pub surging: bool,
    pub confirmed: bool,
    pub official_sufficient: bool,
    pub eligible: bool,
    /// Why the aggregate is (or is not) eligible.
    pub reason: String,
}

impl IncidentAggregate {
    pub fn key(&self) -> IncidentKey {
        IncidentKey {
            location_id: self.location_id.clone(),
            category: self.category,
        }
    }
}

// ── Output alert ────────────────────────────────────────────────────

/// Delivery priority for an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Best-effort delivery.
    Normal,
    /// Repeating, acknowledgeable delivery.
    Emergency,
}

impl Priority {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Emergency => "emergency",
        }
    }
}

/// A finalized alert. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub location_id: String,
    pub location_name: String,
    pub category: Category,
    pub severity: Severity,
    pub source_count: usize,
    pub reason: String,
    pub priority: Priority,
    pub escalated: bool,
    pub emitted_at: DateTime<Utc>,
}

impl Alert {
    /// One-line title used by transports.
    pub fn title(&self) -> String {
        format!(
            "[{}] {} severity {}",
            self.location_id.to_uppercase(),
            self.category,
            self.severity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bounds() {
        assert!(Severity::new(0).is_none());
        assert!(Severity::new(4).is_none());
        assert_eq!(Severity::new(3), Some(Severity::URGENT));
        assert!(Severity::URGENT > Severity::WATCH);
    }

    #[test]
    fn severity_rejects_out_of_range_json() {
        let ok: Severity = serde_json::from_str("2").unwrap();
        assert_eq!(ok, Severity::WATCH);
        assert!(serde_json::from_str::<Severity>("7").is_err());
    }

    #[test]
    fn category_labels_roundtrip() {
        for c in Category::ALL {
            assert_eq!(Category::from_label(c.as_str()), Some(c));
        }
    }

    #[test]
    fn category_accepts_loose_spellings() {
        assert_eq!(
            Category::from_label("Severe Weather"),
            Some(Category::SevereWeather)
        );
        assert_eq!(
            Category::from_label("shelter-in-place"),
            Some(Category::Lockdown)
        );
        assert_eq!(Category::from_label("sports"), None);
        assert_eq!(Category::from_label(""), None);
    }

    #[test]
    fn raw_record_tagged_by_kind() {
        let json = serde_json::json!({
            "source_kind": "news_item",
            "title": "Chemical spill closes I-5",
            "url": "https://example.com/a",
            "classification": {
                "relevant": true,
                "category": "hazmat",
                "severity": 3
            }
        });
        let rec: RawRecord = serde_json::from_value(json).unwrap();
        match rec {
            RawRecord::NewsItem(n) => {
                let c = n.classification.unwrap();
                assert_eq!(c.severity, 3);
                assert_eq!(c.confidence, 1.0);
            }
            other => panic!("Expected NewsItem, got {:?}", other),
        }
    }

    #[test]
    fn alert_title_format() {
        let alert = Alert {
            location_id: "home".into(),
            location_name: "Home".into(),
            category: Category::Hazmat,
            severity: Severity::URGENT,
            source_count: 2,
            reason: "confirmed".into(),
            priority: Priority::Emergency,
            escalated: false,
            emitted_at: Utc::now(),
        };
        assert_eq!(alert.title(), "[HOME] hazmat severity 3");
    }
}

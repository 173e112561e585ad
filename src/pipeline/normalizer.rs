//! Signal normalizer: turns raw official and classified-news records into
//! canonical [`Signal`]s.
//!
//! This is the only place loosely-typed input is accepted. Anything that
//! cannot be mapped onto a known location, a known category and a 1..=3
//! severity is dropped here and counted in the [`NormalizeReport`]; nothing
//! downstream ever sees an unmatched or unrecognised item.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{Policy, Settings};
use crate::error::ClassificationError;
use crate::locations::{Location, LocationRegistry};
use crate::pipeline::types::{
    Category, NewsRecord, OfficialRecord, RawRecord, Severity, Signal, SourceKind,
};

/// Counters describing what the normalizer accepted and why it dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizeReport {
    pub official_in: usize,
    pub news_in: usize,
    pub accepted: usize,
    /// Drop reason label → count.
    pub dropped: BTreeMap<String, usize>,
}

impl NormalizeReport {
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }

    fn drop(&mut self, err: &ClassificationError) {
        *self.dropped.entry(err.label().to_string()).or_default() += 1;
    }
}

/// Normalizes one run's raw records against the registry and settings.
pub struct Normalizer<'a> {
    registry: &'a LocationRegistry,
    policies: &'a HashMap<String, Policy>,
    allowlist: Vec<String>,
}

impl<'a> Normalizer<'a> {
    pub fn new(
        registry: &'a LocationRegistry,
        settings: &Settings,
        policies: &'a HashMap<String, Policy>,
    ) -> Self {
        let allowlist = settings
            .safety
            .allowlist_domains
            .iter()
            .map(|d| d.trim().trim_start_matches("www.").to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self {
            registry,
            policies,
            allowlist,
        }
    }

    /// Normalize a batch. Never fails: bad records are skipped and counted.
    pub fn normalize(
        &self,
        records: &[RawRecord],
        now: DateTime<Utc>,
    ) -> (Vec<Signal>, NormalizeReport) {
        let mut report = NormalizeReport::default();
        let mut signals = Vec::with_capacity(records.len());

        for record in records {
            let result = match record {
                RawRecord::OfficialWarning(rec) => {
                    report.official_in += 1;
                    self.official(rec, now)
                }
                RawRecord::NewsItem(rec) => {
                    report.news_in += 1;
                    self.news(rec, now)
                }
            };
            match result {
                Ok(signal) => {
                    report.accepted += 1;
                    signals.push(signal);
                }
                Err(e) => {
                    debug!(reason = %e, "Dropping record at normalizer");
                    report.drop(&e);
                }
            }
        }

        (signals, report)
    }

    fn policy(&self, location: &Location) -> Policy {
        self.policies
            .get(&location.id)
            .cloned()
            .unwrap_or_else(Policy::defaults)
    }

    fn official(
        &self,
        rec: &OfficialRecord,
        now: DateTime<Utc>,
    ) -> Result<Signal, ClassificationError> {
        let location = rec
            .location_id
            .as_deref()
            .and_then(|id| self.registry.get(id))
            .ok_or(ClassificationError::NoLocationMatch)?;
        let policy = self.policy(location);

        let agency = non_empty(rec.agency.as_deref())
            .ok_or(ClassificationError::MissingField("agency"))?
            .to_lowercase();

        let severity = match (rec.magnitude, rec.severity.as_deref()) {
            (Some(mag), _) => magnitude_severity(mag, &policy),
            (None, Some(word)) => cap_severity(word)?,
            (None, None) => return Err(ClassificationError::MissingField("severity")),
        };

        let category = match non_empty(rec.category.as_deref()) {
            Some(label) => Category::from_label(label)
                .ok_or_else(|| ClassificationError::UnknownCategory(label.to_string()))?,
            None if rec.magnitude.is_some() => Category::Earthquake,
            None => infer_official_category(rec.event.as_deref().unwrap_or_default()),
        };
        if !policy.allowed_categories.contains(&category) {
            return Err(ClassificationError::CategoryNotAllowed(
                category.to_string(),
            ));
        }

        // Seismic feeds are already radius-filtered by the fetcher; place
        // strings like "12 km NE of X" rarely name the location itself.
        if rec.magnitude.is_none() {
            let area_text = format!(
                "{} {}",
                rec.area_desc.as_deref().unwrap_or_default(),
                rec.headline.as_deref().unwrap_or_default()
            );
            if !area_text.trim().is_empty() && !location.matches_text(&area_text) {
                return Err(ClassificationError::NoLocationMatch);
            }
        }

        let title = non_empty(rec.headline.as_deref())
            .or_else(|| non_empty(rec.event.as_deref()))
            .unwrap_or("Official warning")
            .to_string();

        let dedupe_key = match non_empty(rec.alert_id.as_deref()) {
            Some(alert_id) => format!(
                "official:{}:{}:{}",
                location.id,
                agency,
                alert_id.to_lowercase()
            ),
            None => format!(
                "official:{}:{}:{}",
                location.id,
                agency,
                digest(&format!(
                    "{}|{}",
                    rec.event.as_deref().unwrap_or_default(),
                    rec.headline.as_deref().unwrap_or_default()
                ))
            ),
        };

        Ok(Signal {
            source_kind: SourceKind::OfficialWarning,
            location_id: location.id.clone(),
            category,
            severity,
            publisher_or_agency: agency,
            observed_at: rec.observed_at.unwrap_or(now),
            dedupe_key,
            title,
            url: rec.url.clone(),
        })
    }

    fn news(&self, rec: &NewsRecord, now: DateTime<Utc>) -> Result<Signal, ClassificationError> {
        let class = rec
            .classification
            .as_ref()
            .ok_or(ClassificationError::Unclassified)?;
        if !class.relevant {
            return Err(ClassificationError::NotRelevant);
        }

        let title = non_empty(rec.title.as_deref())
            .or_else(|| non_empty(rec.url.as_deref()))
            .ok_or(ClassificationError::MissingField("title"))?
            .to_string();

        let location = match rec.location_id.as_deref().and_then(|id| self.registry.get(id)) {
            Some(l) => l,
            None => {
                let text = format!("{} {}", title, rec.summary.as_deref().unwrap_or_default());
                self.registry
                    .match_text(&text)
                    .ok_or(ClassificationError::NoLocationMatch)?
            }
        };
        let policy = self.policy(location);

        if class.confidence < policy.news_min_confidence {
            return Err(ClassificationError::LowConfidence {
                confidence: class.confidence,
                minimum: policy.news_min_confidence,
            });
        }

        let category = Category::from_label(&class.category)
            .ok_or_else(|| ClassificationError::UnknownCategory(class.category.clone()))?;
        if !policy.allowed_categories.contains(&category) {
            return Err(ClassificationError::CategoryNotAllowed(
                category.to_string(),
            ));
        }

        let severity = Severity::new(class.severity)
            .ok_or(ClassificationError::SeverityOutOfRange(class.severity))?;

        let publisher = non_empty(rec.publisher.as_deref())
            .map(|p| p.trim().trim_start_matches("www.").to_lowercase())
            .or_else(|| rec.url.as_deref().and_then(url_host))
            .ok_or(ClassificationError::MissingField("publisher"))?;
        if !self.publisher_allowed(&publisher) {
            return Err(ClassificationError::PublisherNotAllowed(publisher));
        }

        let identity = match rec.url.as_deref().and_then(canonical_url) {
            Some(url) => url,
            None => normalize_title(&title),
        };
        let dedupe_key = format!("news:{}:{}", location.id, digest(&identity));

        Ok(Signal {
            source_kind: SourceKind::NewsItem,
            location_id: location.id.clone(),
            category,
            severity,
            publisher_or_agency: publisher,
            observed_at: rec.published_at.unwrap_or(now),
            dedupe_key,
            title,
            url: rec.url.clone(),
        })
    }

    fn publisher_allowed(&self, publisher: &str) -> bool {
        self.allowlist.is_empty()
            || self
                .allowlist
                .iter()
                .any(|d| publisher == d || publisher.ends_with(&format!(".{d}")))
    }
}

// ── Agency vocabularies ─────────────────────────────────────────────

/// CAP severity words onto the 1..=3 scale. `Unknown` is not invented.
fn cap_severity(word: &str) -> Result<Severity, ClassificationError> {
    match word.trim().to_ascii_lowercase().as_str() {
        "extreme" | "severe" => Ok(Severity::URGENT),
        "moderate" => Ok(Severity::WATCH),
        "minor" => Ok(Severity::INFO),
        _ => Err(ClassificationError::UnknownAgencySeverity(word.to_string())),
    }
}

fn magnitude_severity(mag: f64, policy: &Policy) -> Severity {
    if mag >= policy.quake.emergency {
        Severity::URGENT
    } else if mag >= policy.quake.normal {
        Severity::WATCH
    } else {
        Severity::INFO
    }
}

fn infer_official_category(event: &str) -> Category {
    let e = event.to_ascii_lowercase();
    if e.contains("evacuation") {
        Category::Evacuation
    } else if e.contains("hazardous materials") || e.contains("hazmat") {
        Category::Hazmat
    } else if e.contains("shelter in place") || e.contains("law enforcement") {
        Category::Lockdown
    } else if e.contains("civil danger") || e.contains("civil emergency") || e.contains("fire") {
        Category::Disaster
    } else if e.contains("earthquake") {
        Category::Earthquake
    } else if e.contains("air quality") {
        Category::PublicHealth
    } else {
        Category::SevereWeather
    }
}

// ── Dedupe key helpers ──────────────────────────────────────────────

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn digest(input: &str) -> String {
    let hash = format!("{:x}", Sha256::digest(input.as_bytes()));
    hash[..16].to_string()
}

fn url_host(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_lowercase();
    Some(host.trim_start_matches("www.").to_string())
}

/// Scheme, `www.`, query, fragment and trailing slash removed.
fn canonical_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_lowercase();
    let host = host.trim_start_matches("www.");
    let path = url.path().trim_end_matches('/');
    Some(format!("{host}{path}"))
}

/// Lower-cased, punctuation collapsed to single spaces.
fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

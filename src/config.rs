//! Configuration types.
//!
//! `settings.yaml` holds global thresholds with optional per-location
//! overrides. Every field has a default, so a partial file is valid.
//! Category sets and per-location overrides are validated entry by entry:
//! a bad entry is dropped with a warning, never the whole file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{self, ConfigError, ConfigValidationError};
use crate::locations::{Location, LocationRegistry};
use crate::pipeline::types::{Category, Severity};

// ── Paths ───────────────────────────────────────────────────────────

/// Filesystem layout for one installation.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Build from `PREPPER_CONFIG_DIR` / `PREPPER_DATA_DIR`, with CLI overrides.
    pub fn from_env(config_dir: Option<PathBuf>, data_dir: Option<PathBuf>) -> Self {
        let config_dir = config_dir
            .or_else(|| std::env::var("PREPPER_CONFIG_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./config"));
        let data_dir = data_dir
            .or_else(|| std::env::var("PREPPER_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./data"));
        Self {
            config_dir,
            data_dir,
        }
    }

    pub fn locations_file(&self) -> PathBuf {
        self.config_dir.join("locations.yaml")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.yaml")
    }

    pub fn database_file(&self) -> PathBuf {
        self.data_dir.join("alerts.db")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir.join("inbox")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }
}

/// Registry and settings for one run, plus every entry that was dropped.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub registry: LocationRegistry,
    pub settings: Settings,
    pub problems: Vec<ConfigValidationError>,
}

impl LoadedConfig {
    /// Load both files. Fails only when a file is unreadable or no location
    /// survives validation.
    pub fn load(paths: &AppPaths) -> error::Result<Self> {
        let (registry, mut problems) = LocationRegistry::load(&paths.locations_file())?;
        let (settings, settings_problems) = Settings::load(&paths.settings_file())?;
        problems.extend(settings_problems);
        Ok(Self {
            registry,
            settings,
            problems,
        })
    }
}

// ── Threshold groups ────────────────────────────────────────────────

/// Fusion thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Distinct news publishers needed to mark an aggregate as surging.
    pub surge_publishers: usize,
    /// Only news observed within this window counts toward a surge.
    pub surge_lookback_minutes: i64,
    /// When set, a surge also needs this many times the median publisher
    /// count of recent runs. Off by default.
    pub surge_spike_factor: Option<f64>,
    /// Recent runs that make up the surge baseline.
    pub surge_baseline_runs: usize,
    /// Minimum severity for a source to count toward confirmation.
    pub confirmation_floor: Severity,
    /// Distinct sources at or above the floor needed to confirm.
    pub confirmation_sources: usize,
    /// A single official warning at or above this is sufficient alone.
    pub official_floor: Severity,
    /// Classified news below this confidence is dropped.
    pub news_min_confidence: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            surge_publishers: 3,
            surge_lookback_minutes: 120,
            surge_spike_factor: None,
            surge_baseline_runs: 12,
            confirmation_floor: Severity::WATCH,
            confirmation_sources: 2,
            official_floor: Severity::URGENT,
            news_min_confidence: 0.6,
        }
    }
}

/// Cooldown length per alerted severity. Higher severity cools down faster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownMinutes {
    pub severity_1: i64,
    pub severity_2: i64,
    pub severity_3: i64,
}

impl Default for CooldownMinutes {
    fn default() -> Self {
        Self {
            severity_1: 240,
            severity_2: 120,
            severity_3: 60,
        }
    }
}

impl CooldownMinutes {
    pub fn for_severity(&self, severity: Severity) -> Duration {
        let minutes = match severity.level() {
            1 => self.severity_1,
            2 => self.severity_2,
            _ => self.severity_3,
        };
        Duration::minutes(minutes)
    }
}

/// Dedupe windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeSettings {
    /// Same location/category/publisher within this window collapse.
    pub near_duplicate_window_minutes: i64,
    /// Keys recorded by prior runs within this window are suppressed.
    pub history_window_hours: i64,
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self {
            near_duplicate_window_minutes: 30,
            history_window_hours: 24,
        }
    }
}

/// Outbound notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub use_email: bool,
    pub use_push: bool,
    /// Attempts per transport before the alert is recorded undelivered.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    /// Emergency push: re-notify every N seconds until acknowledged.
    pub emergency_retry_secs: u32,
    /// Emergency push: stop re-notifying after N seconds.
    pub emergency_expire_secs: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            use_email: true,
            use_push: true,
            max_attempts: 3,
            base_backoff_ms: 500,
            emergency_retry_secs: 60,
            emergency_expire_secs: 3600,
        }
    }
}

/// Publisher allow-list. Empty means any publisher is accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    pub allowlist_domains: Vec<String>,
}

/// Optional overrides for a single location. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocationOverrides {
    pub surge_publishers: Option<usize>,
    pub surge_lookback_minutes: Option<i64>,
    pub surge_spike_factor: Option<f64>,
    pub confirmation_floor: Option<Severity>,
    pub confirmation_sources: Option<usize>,
    pub official_floor: Option<Severity>,
    pub news_min_confidence: Option<f64>,
    pub cooldown_severity_1: Option<i64>,
    pub cooldown_severity_2: Option<i64>,
    pub cooldown_severity_3: Option<i64>,
    pub emergency_categories: Option<BTreeSet<Category>>,
    pub allowed_categories: Option<BTreeSet<Category>>,
    pub quake_min_mag_normal: Option<f64>,
    pub quake_min_mag_emergency: Option<f64>,
}

impl LocationOverrides {
    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn merged_with(&self, other: &LocationOverrides) -> LocationOverrides {
        LocationOverrides {
            surge_publishers: other.surge_publishers.or(self.surge_publishers),
            surge_lookback_minutes: other.surge_lookback_minutes.or(self.surge_lookback_minutes),
            surge_spike_factor: other.surge_spike_factor.or(self.surge_spike_factor),
            confirmation_floor: other.confirmation_floor.or(self.confirmation_floor),
            confirmation_sources: other.confirmation_sources.or(self.confirmation_sources),
            official_floor: other.official_floor.or(self.official_floor),
            news_min_confidence: other.news_min_confidence.or(self.news_min_confidence),
            cooldown_severity_1: other.cooldown_severity_1.or(self.cooldown_severity_1),
            cooldown_severity_2: other.cooldown_severity_2.or(self.cooldown_severity_2),
            cooldown_severity_3: other.cooldown_severity_3.or(self.cooldown_severity_3),
            emergency_categories: other
                .emergency_categories
                .clone()
                .or_else(|| self.emergency_categories.clone()),
            allowed_categories: other
                .allowed_categories
                .clone()
                .or_else(|| self.allowed_categories.clone()),
            quake_min_mag_normal: other.quake_min_mag_normal.or(self.quake_min_mag_normal),
            quake_min_mag_emergency: other
                .quake_min_mag_emergency
                .or(self.quake_min_mag_emergency),
        }
    }

    /// Reject nonsensical values. `scope` names the owner in messages.
    pub fn validate(&self, scope: &str) -> Result<(), ConfigValidationError> {
        let invalid = |field: &str, reason: String| ConfigValidationError::InvalidField {
            scope: scope.to_string(),
            field: field.to_string(),
            reason,
        };
        if let Some(0) = self.surge_publishers {
            return Err(invalid("surge_publishers", "must be positive".into()));
        }
        if let Some(0) = self.confirmation_sources {
            return Err(invalid("confirmation_sources", "must be positive".into()));
        }
        for (field, value) in [
            ("surge_lookback_minutes", self.surge_lookback_minutes),
            ("cooldown_severity_1", self.cooldown_severity_1),
            ("cooldown_severity_2", self.cooldown_severity_2),
            ("cooldown_severity_3", self.cooldown_severity_3),
        ] {
            if let Some(v) = value {
                if v <= 0 {
                    return Err(invalid(field, format!("must be positive, got {v}")));
                }
            }
        }
        if let Some(f) = self.surge_spike_factor {
            if f.is_nan() || f < 1.0 {
                return Err(invalid("surge_spike_factor", format!("must be >= 1, got {f}")));
            }
        }
        if let Some(c) = self.news_min_confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(invalid("news_min_confidence", format!("{c} outside 0..=1")));
            }
        }
        if let (Some(normal), Some(emergency)) =
            (self.quake_min_mag_normal, self.quake_min_mag_emergency)
        {
            if emergency < normal {
                return Err(invalid(
                    "quake_min_mag_emergency",
                    "must be >= quake_min_mag_normal".into(),
                ));
            }
        }
        Ok(())
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Global settings loaded from `settings.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub thresholds: Thresholds,
    pub cooldowns: CooldownMinutes,
    pub emergency_categories: BTreeSet<Category>,
    pub allowed_categories: BTreeSet<Category>,
    pub dedupe: DedupeSettings,
    pub dispatch: DispatchSettings,
    pub safety: SafetySettings,
    pub dry_run: bool,
    /// Per-source fetch timeout.
    pub source_timeout_secs: u64,
    pub per_location: BTreeMap<String, LocationOverrides>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            cooldowns: CooldownMinutes::default(),
            emergency_categories: [
                Category::Evacuation,
                Category::Hazmat,
                Category::Lockdown,
                Category::Disaster,
                Category::SevereWeather,
                Category::Earthquake,
            ]
            .into_iter()
            .collect(),
            allowed_categories: Category::ALL.into_iter().collect(),
            dedupe: DedupeSettings::default(),
            dispatch: DispatchSettings::default(),
            safety: SafetySettings::default(),
            dry_run: false,
            source_timeout_secs: 20,
            per_location: BTreeMap::new(),
        }
    }
}

/// On-disk shape. Category labels and overrides stay loose until validated.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    thresholds: Option<Thresholds>,
    cooldowns: Option<CooldownMinutes>,
    emergency_categories: Option<Vec<String>>,
    allowed_categories: Option<Vec<String>>,
    dedupe: Option<DedupeSettings>,
    dispatch: Option<DispatchSettings>,
    safety: Option<SafetySettings>,
    dry_run: Option<bool>,
    source_timeout_secs: Option<u64>,
    per_location: BTreeMap<String, serde_yaml::Value>,
}

impl Settings {
    /// Load and validate `settings.yaml`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<(Self, Vec<ConfigValidationError>), ConfigError> {
        if !path.exists() {
            warn!(path = %path.display(), "Settings file not found, using defaults");
            return Ok((Self::default(), Vec::new()));
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml_str(&text).map_err(|reason| ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        })
    }

    /// Parse settings from YAML text.
    ///
    /// Returns the settings plus every entry-level problem that was dropped.
    pub fn from_yaml_str(text: &str) -> Result<(Self, Vec<ConfigValidationError>), String> {
        let file: SettingsFile = if text.trim().is_empty() {
            SettingsFile::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| e.to_string())?
        };
        let defaults = Settings::default();
        let mut problems = Vec::new();

        let thresholds = file.thresholds.unwrap_or(defaults.thresholds);
        let threshold_check = LocationOverrides {
            surge_publishers: Some(thresholds.surge_publishers),
            surge_lookback_minutes: Some(thresholds.surge_lookback_minutes),
            surge_spike_factor: thresholds.surge_spike_factor,
            confirmation_sources: Some(thresholds.confirmation_sources),
            news_min_confidence: Some(thresholds.news_min_confidence),
            ..Default::default()
        };
        let thresholds = match threshold_check.validate("thresholds") {
            Ok(()) => thresholds,
            Err(e) => {
                warn!(error = %e, "Invalid thresholds, falling back to defaults");
                problems.push(e);
                Thresholds::default()
            }
        };

        let cooldowns = file.cooldowns.unwrap_or(defaults.cooldowns);
        let cooldown_check = LocationOverrides {
            cooldown_severity_1: Some(cooldowns.severity_1),
            cooldown_severity_2: Some(cooldowns.severity_2),
            cooldown_severity_3: Some(cooldowns.severity_3),
            ..Default::default()
        };
        let cooldowns = match cooldown_check.validate("cooldowns") {
            Ok(()) => cooldowns,
            Err(e) => {
                warn!(error = %e, "Invalid cooldowns, falling back to defaults");
                problems.push(e);
                CooldownMinutes::default()
            }
        };

        let emergency_categories = match file.emergency_categories {
            Some(labels) => parse_categories("emergency_categories", &labels, &mut problems),
            None => defaults.emergency_categories,
        };
        let allowed_categories = match file.allowed_categories {
            Some(labels) => parse_categories("allowed_categories", &labels, &mut problems),
            None => defaults.allowed_categories,
        };

        let mut per_location = BTreeMap::new();
        for (id, value) in file.per_location {
            let scope = format!("per_location.{id}");
            let parsed = serde_yaml::from_value::<LocationOverrides>(value)
                .map_err(|e| ConfigValidationError::InvalidField {
                    scope: scope.clone(),
                    field: "overrides".into(),
                    reason: e.to_string(),
                })
                .and_then(|o| o.validate(&scope).map(|()| o));
            match parsed {
                Ok(o) => {
                    per_location.insert(id, o);
                }
                Err(e) => {
                    warn!(location = %id, error = %e, "Dropping invalid per-location overrides");
                    problems.push(e);
                }
            }
        }

        let settings = Settings {
            thresholds,
            cooldowns,
            emergency_categories,
            allowed_categories,
            dedupe: file.dedupe.unwrap_or(defaults.dedupe),
            dispatch: file.dispatch.unwrap_or(defaults.dispatch),
            safety: file.safety.unwrap_or(defaults.safety),
            dry_run: file.dry_run.unwrap_or(defaults.dry_run),
            source_timeout_secs: file
                .source_timeout_secs
                .unwrap_or(defaults.source_timeout_secs)
                .max(1),
            per_location,
        };
        Ok((settings, problems))
    }

    /// Resolve policies for every location in the registry.
    pub fn policies(&self, registry: &LocationRegistry) -> HashMap<String, Policy> {
        registry
            .iter()
            .map(|l| (l.id.clone(), self.policy_for(l, registry.quake_floors())))
            .collect()
    }

    /// Resolve the effective policy for one location.
    ///
    /// Precedence: settings `per_location` > location record overrides >
    /// global settings > registry defaults.
    pub fn policy_for(&self, location: &Location, quake: &QuakeFloors) -> Policy {
        let layered = match self.per_location.get(&location.id) {
            Some(o) => location.overrides.merged_with(o),
            None => location.overrides.clone(),
        };
        let t = &self.thresholds;
        Policy {
            surge_publishers: layered.surge_publishers.unwrap_or(t.surge_publishers),
            surge_lookback: Duration::minutes(
                layered
                    .surge_lookback_minutes
                    .unwrap_or(t.surge_lookback_minutes),
            ),
            surge_spike_factor: layered.surge_spike_factor.or(t.surge_spike_factor),
            confirmation_floor: layered.confirmation_floor.unwrap_or(t.confirmation_floor),
            confirmation_sources: layered
                .confirmation_sources
                .unwrap_or(t.confirmation_sources),
            official_floor: layered.official_floor.unwrap_or(t.official_floor),
            news_min_confidence: layered.news_min_confidence.unwrap_or(t.news_min_confidence),
            cooldowns: CooldownMinutes {
                severity_1: layered
                    .cooldown_severity_1
                    .unwrap_or(self.cooldowns.severity_1),
                severity_2: layered
                    .cooldown_severity_2
                    .unwrap_or(self.cooldowns.severity_2),
                severity_3: layered
                    .cooldown_severity_3
                    .unwrap_or(self.cooldowns.severity_3),
            },
            emergency_categories: layered
                .emergency_categories
                .unwrap_or_else(|| self.emergency_categories.clone()),
            allowed_categories: layered
                .allowed_categories
                .unwrap_or_else(|| self.allowed_categories.clone()),
            quake: QuakeFloors {
                normal: layered.quake_min_mag_normal.unwrap_or(quake.normal),
                emergency: layered.quake_min_mag_emergency.unwrap_or(quake.emergency),
            },
        }
    }
}

fn parse_categories(
    field: &str,
    labels: &[String],
    problems: &mut Vec<ConfigValidationError>,
) -> BTreeSet<Category> {
    let mut set = BTreeSet::new();
    for label in labels {
        match Category::from_label(label) {
            Some(c) => {
                set.insert(c);
            }
            None => {
                warn!(field, label = %label, "Ignoring unknown category");
                problems.push(ConfigValidationError::InvalidField {
                    scope: "settings".into(),
                    field: field.to_string(),
                    reason: format!("unknown category {label:?}"),
                });
            }
        }
    }
    set
}

/// Earthquake magnitude floors used to map magnitude onto severity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuakeFloors {
    pub normal: f64,
    pub emergency: f64,
}

impl Default for QuakeFloors {
    fn default() -> Self {
        Self {
            normal: 3.5,
            emergency: 5.0,
        }
    }
}

/// Fully-resolved thresholds for one location.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub surge_publishers: usize,
    pub surge_lookback: Duration,
    /// `None` disables the baseline check on surges.
    pub surge_spike_factor: Option<f64>,
    pub confirmation_floor: Severity,
    pub confirmation_sources: usize,
    pub official_floor: Severity,
    pub news_min_confidence: f64,
    pub cooldowns: CooldownMinutes,
    pub emergency_categories: BTreeSet<Category>,
    pub allowed_categories: BTreeSet<Category>,
    pub quake: QuakeFloors,
}

impl Policy {
    /// Policy built purely from global defaults.
    pub fn defaults() -> Self {
        let s = Settings::default();
        Self {
            surge_publishers: s.thresholds.surge_publishers,
            surge_lookback: Duration::minutes(s.thresholds.surge_lookback_minutes),
            surge_spike_factor: s.thresholds.surge_spike_factor,
            confirmation_floor: s.thresholds.confirmation_floor,
            confirmation_sources: s.thresholds.confirmation_sources,
            official_floor: s.thresholds.official_floor,
            news_min_confidence: s.thresholds.news_min_confidence,
            cooldowns: s.cooldowns,
            emergency_categories: s.emergency_categories,
            allowed_categories: s.allowed_categories,
            quake: QuakeFloors::default(),
        }
    }
}

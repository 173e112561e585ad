//! Location registry: the monitored places and the terms that identify them.
//!
//! Loaded once per run from `locations.yaml`. Each entry is validated on its
//! own; a bad entry is dropped with a warning and the rest load normally.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{LocationOverrides, QuakeFloors};
use crate::error::{ConfigError, ConfigValidationError};

/// A monitored location. Immutable within a run.
#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
    pub county: Option<String>,
    /// Place names and aliases.
    pub terms: Vec<String>,
    /// Named roads and highways.
    pub roads: Vec<String>,
    pub overrides: LocationOverrides,
    #[serde(skip)]
    matcher: Option<Regex>,
}

impl Location {
    /// Every term that identifies this location, lower-cased and deduplicated.
    pub fn matching_terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = std::iter::once(self.name.as_str())
            .chain(self.county.as_deref())
            .chain(self.terms.iter().map(String::as_str))
            .chain(self.roads.iter().map(String::as_str))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        terms.sort();
        terms.dedup();
        terms
    }

    /// Whether any matching term appears in `text` on word boundaries.
    pub fn matches_text(&self, text: &str) -> bool {
        match &self.matcher {
            Some(re) => re.is_match(text),
            None => false,
        }
    }

    fn build_matcher(&mut self) {
        let terms = self.matching_terms();
        if terms.is_empty() {
            self.matcher = None;
            return;
        }
        let alternation = terms
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        self.matcher = Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).ok();
    }
}

/// On-disk location entry. Everything optional so validation can report
/// precisely what is wrong instead of failing the whole file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLocation {
    id: Option<String>,
    #[serde(alias = "label")]
    name: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    radius_km: Option<f64>,
    county: Option<String>,
    #[serde(alias = "geo_terms")]
    terms: Vec<String>,
    roads: Vec<String>,
    overrides: Option<serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LocationsFile {
    locations: Vec<serde_yaml::Value>,
    defaults: Option<RawDefaults>,
}

#[derive(Debug, Deserialize)]
struct RawDefaults {
    #[serde(default = "default_quake_normal")]
    quake_min_mag_normal: f64,
    #[serde(default = "default_quake_emergency")]
    quake_min_mag_emergency: f64,
}

fn default_quake_normal() -> f64 {
    QuakeFloors::default().normal
}

fn default_quake_emergency() -> f64 {
    QuakeFloors::default().emergency
}

const DEFAULT_RADIUS_KM: f64 = 50.0;

/// Ordered collection of validated locations.
#[derive(Debug, Clone)]
pub struct LocationRegistry {
    locations: Vec<Location>,
    index: HashMap<String, usize>,
    quake: QuakeFloors,
}

impl LocationRegistry {
    /// Load `locations.yaml`, dropping invalid entries.
    pub fn load(path: &Path) -> Result<(Self, Vec<ConfigValidationError>), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let result = Self::from_yaml_str(&text).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })?;
        info!(
            path = %path.display(),
            locations = result.0.len(),
            rejected = result.1.len(),
            "Location registry loaded"
        );
        Ok(result)
    }

    /// Parse a registry from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<(Self, Vec<ConfigValidationError>), ConfigError> {
        let file: LocationsFile = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<locations>".into(),
            reason: e.to_string(),
        })?;

        let quake = match file.defaults {
            Some(d) if d.quake_min_mag_emergency >= d.quake_min_mag_normal => QuakeFloors {
                normal: d.quake_min_mag_normal,
                emergency: d.quake_min_mag_emergency,
            },
            Some(_) => {
                warn!("Emergency quake magnitude below normal, using defaults");
                QuakeFloors::default()
            }
            None => QuakeFloors::default(),
        };

        let mut problems = Vec::new();
        let mut locations = Vec::new();
        let mut index = HashMap::new();

        for (i, value) in file.locations.into_iter().enumerate() {
            let validated = serde_yaml::from_value::<RawLocation>(value)
                .map_err(|e| ConfigValidationError::InvalidField {
                    scope: format!("location #{i}"),
                    field: "entry".into(),
                    reason: e.to_string(),
                })
                .and_then(|raw| validate_location(i, raw));

            match validated {
                Ok(location) => {
                    if index.contains_key(&location.id) {
                        let e = ConfigValidationError::DuplicateId {
                            id: location.id.clone(),
                        };
                        warn!(error = %e, "Dropping location");
                        problems.push(e);
                        continue;
                    }
                    index.insert(location.id.clone(), locations.len());
                    locations.push(location);
                }
                Err(e) => {
                    warn!(error = %e, "Dropping location");
                    problems.push(e);
                }
            }
        }

        if locations.is_empty() {
            return Err(ConfigError::EmptyRegistry {
                rejected: problems.len(),
            });
        }

        Ok((
            Self {
                locations,
                index,
                quake,
            },
            problems,
        ))
    }

    /// Build a registry directly (tests and embedding callers).
    pub fn from_locations(locations: Vec<Location>) -> Self {
        let mut index = HashMap::new();
        let mut kept = Vec::new();
        for mut location in locations {
            if index.contains_key(&location.id) {
                continue;
            }
            location.build_matcher();
            index.insert(location.id.clone(), kept.len());
            kept.push(location);
        }
        Self {
            locations: kept,
            index,
            quake: QuakeFloors::default(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Location> {
        self.index.get(id).map(|&i| &self.locations[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Location> {
        self.locations.iter()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn quake_floors(&self) -> &QuakeFloors {
        &self.quake
    }

    /// First location, in registry order, whose terms appear in `text`.
    pub fn match_text(&self, text: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.matches_text(text))
    }
}

impl Location {
    /// Convenience constructor with no coordinates or overrides.
    pub fn new(id: &str, name: &str, terms: &[&str]) -> Self {
        let mut location = Self {
            id: id.to_string(),
            name: name.to_string(),
            lat: 0.0,
            lon: 0.0,
            radius_km: DEFAULT_RADIUS_KM,
            county: None,
            terms: terms.iter().map(|t| t.to_string()).collect(),
            roads: Vec::new(),
            overrides: LocationOverrides::default(),
            matcher: None,
        };
        location.build_matcher();
        location
    }
}

fn validate_location(index: usize, raw: RawLocation) -> Result<Location, ConfigValidationError> {
    let id = raw
        .id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(ConfigValidationError::MissingId { index })?;

    let lat = raw.lat.unwrap_or(f64::NAN);
    if !(-90.0..=90.0).contains(&lat) {
        return Err(ConfigValidationError::OutOfRange {
            id,
            field: "lat",
            value: lat,
        });
    }
    let lon = raw.lon.unwrap_or(f64::NAN);
    if !(-180.0..=180.0).contains(&lon) {
        return Err(ConfigValidationError::OutOfRange {
            id,
            field: "lon",
            value: lon,
        });
    }
    let radius_km = raw.radius_km.unwrap_or(DEFAULT_RADIUS_KM);
    if radius_km <= 0.0 || radius_km.is_nan() {
        return Err(ConfigValidationError::OutOfRange {
            id,
            field: "radius_km",
            value: radius_km,
        });
    }

    let overrides = match raw.overrides {
        Some(value) => {
            let scope = format!("location {id}");
            let o: LocationOverrides =
                serde_yaml::from_value(value).map_err(|e| ConfigValidationError::InvalidField {
                    scope: scope.clone(),
                    field: "overrides".into(),
                    reason: e.to_string(),
                })?;
            o.validate(&scope)?;
            o
        }
        None => LocationOverrides::default(),
    };

    let name = raw
        .name
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| id.clone());

    let mut location = Location {
        id,
        name,
        lat,
        lon,
        radius_km,
        county: raw.county.filter(|c| !c.trim().is_empty()),
        terms: raw.terms,
        roads: raw.roads,
        overrides,
        matcher: None,
    };
    location.build_matcher();
    if location.matcher.is_none() {
        return Err(ConfigValidationError::NoTerms { id: location.id });
    }
    Ok(location)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
defaults:
  quake_min_mag_normal: 3.0
  quake_min_mag_emergency: 4.5
locations:
  - id: home
    name: Springfield
    lat: 44.05
    lon: -123.02
    county: Lane County
    terms: [springfield, thurston]
    roads: [I-5, OR-126]
  - id: work
    label: Eugene
    lat: 44.05
    lon: -123.09
  - id: bad
    lat: 120.0
    lon: 0.0
  - name: no id here
    lat: 1.0
    lon: 1.0
  - id: home
    lat: 1.0
    lon: 1.0
"#;

    #[test]
    fn invalid_entries_are_dropped_individually() {
        let (registry, problems) = LocationRegistry::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(problems.len(), 3);
        assert!(registry.get("home").is_some());
        assert!(registry.get("work").is_some());
        assert!(registry.get("bad").is_none());
        assert!(problems
            .iter()
            .any(|p| matches!(p, ConfigValidationError::DuplicateId { .. })));
    }

    #[test]
    fn registry_order_is_preserved() {
        let (registry, _) = LocationRegistry::from_yaml_str(SAMPLE).unwrap();
        let ids: Vec<&str> = registry.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["home", "work"]);
    }

    #[test]
    fn defaults_are_read() {
        let (registry, _) = LocationRegistry::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(registry.quake_floors().normal, 3.0);
        assert_eq!(registry.quake_floors().emergency, 4.5);
    }

    #[test]
    fn label_alias_sets_name() {
        let (registry, _) = LocationRegistry::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(registry.get("work").unwrap().name, "Eugene");
    }

    #[test]
    fn empty_registry_is_an_error() {
        let yaml = "locations:\n  - id: x\n    lat: 999\n    lon: 0\n";
        let err = LocationRegistry::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRegistry { rejected: 1 }));
    }

    #[test]
    fn matches_terms_on_word_boundaries() {
        let (registry, _) = LocationRegistry::from_yaml_str(SAMPLE).unwrap();
        let home = registry.get("home").unwrap();
        assert!(home.matches_text("Crash closes I-5 near downtown"));
        assert!(home.matches_text("Fire in LANE COUNTY spreads"));
        assert!(!home.matches_text("Springfieldian bakery opens"));
    }

    #[test]
    fn match_text_uses_registry_order() {
        let registry = LocationRegistry::from_locations(vec![
            Location::new("a", "Alpha", &["river"]),
            Location::new("b", "Beta", &["river"]),
        ]);
        assert_eq!(registry.match_text("river flooding").unwrap().id, "a");
        assert!(registry.match_text("nothing relevant").is_none());
    }

    #[test]
    fn bad_overrides_reject_only_that_location() {
        let yaml = r#"
locations:
  - id: a
    lat: 1
    lon: 1
    overrides:
      surge_publishers: 0
  - id: b
    lat: 1
    lon: 1
    overrides:
      surge_publishers: 5
"#;
        let (registry, problems) = LocationRegistry::from_yaml_str(yaml).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(problems.len(), 1);
        assert_eq!(
            registry.get("b").unwrap().overrides.surge_publishers,
            Some(5)
        );
    }

    #[test]
    fn shipped_locations_file_is_valid() {
        let (registry, problems) =
            LocationRegistry::from_yaml_str(include_str!("../config/locations.yaml")).unwrap();
        assert!(problems.is_empty(), "{problems:?}");
        assert_eq!(registry.len(), 2);
        assert!(registry.match_text("Road closures on I-280 near Daly City").is_some());
    }
}

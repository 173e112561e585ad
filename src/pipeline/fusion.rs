//! Fusion engine: rolls deduplicated signals up into one
//! [`IncidentAggregate`] per (location, category) and decides eligibility.
//!
//! Three independent paths:
//! - **official**: one official warning at or above the official floor
//! - **confirmed**: N distinct sources at or above the confirmation floor
//! - **surge**: M distinct news publishers inside the lookback window
//!
//! Surge alone never makes an aggregate eligible; it also needs at least one
//! source at or above the confirmation floor. With a spike factor configured,
//! a surge must also exceed the median publisher count of recent runs by that
//! factor. No baseline yet means the check passes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::Policy;
use crate::pipeline::types::{IncidentAggregate, IncidentKey, Severity, Signal};

pub struct FusionEngine<'a> {
    policies: &'a HashMap<String, Policy>,
    baselines: Option<&'a HashMap<IncidentKey, f64>>,
    fallback: Policy,
}

impl<'a> FusionEngine<'a> {
    pub fn new(policies: &'a HashMap<String, Policy>) -> Self {
        Self {
            policies,
            baselines: None,
            fallback: Policy::defaults(),
        }
    }

    /// Median surge publisher counts from recent runs, per key.
    pub fn with_baselines(mut self, baselines: &'a HashMap<IncidentKey, f64>) -> Self {
        self.baselines = Some(baselines);
        self
    }

    /// Build aggregates for every (location, category) present in `signals`.
    ///
    /// Returned in key order so runs over the same input are identical.
    pub fn fuse(&self, signals: &[Signal], now: DateTime<Utc>) -> Vec<IncidentAggregate> {
        let mut grouped: BTreeMap<IncidentKey, Vec<&Signal>> = BTreeMap::new();
        for signal in signals {
            grouped.entry(signal.incident_key()).or_default().push(signal);
        }

        grouped
            .into_iter()
            .map(|(key, group)| {
                let policy = self.policies.get(&key.location_id).unwrap_or(&self.fallback);
                let baseline = policy
                    .surge_spike_factor
                    .and_then(|_| self.baselines?.get(&key).copied());
                let aggregate = aggregate(&key, &group, policy, baseline, now);
                debug!(
                    incident = %key,
                    sources = aggregate.distinct_sources,
                    max_severity = %aggregate.max_severity,
                    eligible = aggregate.eligible,
                    "Fused incident"
                );
                aggregate
            })
            .collect()
    }
}

/// Median of `samples`; `None` when empty.
pub fn median(samples: &[usize]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 1 {
        sorted[mid] as f64
    } else {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    })
}

fn aggregate(
    key: &IncidentKey,
    signals: &[&Signal],
    policy: &Policy,
    baseline: Option<f64>,
    now: DateTime<Utc>,
) -> IncidentAggregate {
    let lookback_start = now - policy.surge_lookback;

    let all_sources: BTreeSet<&str> = signals
        .iter()
        .map(|s| s.publisher_or_agency.as_str())
        .collect();
    let surge_publishers: BTreeSet<&str> = signals
        .iter()
        .filter(|s| !s.is_official() && s.observed_at >= lookback_start)
        .map(|s| s.publisher_or_agency.as_str())
        .collect();
    let serious_sources: BTreeSet<&str> = signals
        .iter()
        .filter(|s| s.severity >= policy.confirmation_floor)
        .map(|s| s.publisher_or_agency.as_str())
        .collect();

    let max_severity = signals
        .iter()
        .map(|s| s.severity)
        .max()
        .unwrap_or(Severity::INFO);
    let official_present = signals.iter().any(|s| s.is_official());
    let official_sufficient = signals
        .iter()
        .any(|s| s.is_official() && s.severity >= policy.official_floor);

    let spiking = match (policy.surge_spike_factor, baseline) {
        (Some(factor), Some(median)) if median > 0.0 => {
            surge_publishers.len() as f64 >= median * factor
        }
        _ => true,
    };
    let surging = surge_publishers.len() >= policy.surge_publishers && spiking;
    let confirmed = serious_sources.len() >= policy.confirmation_sources;
    let surge_backed = surging && !serious_sources.is_empty();
    let eligible = official_sufficient || confirmed || surge_backed;

    let reason = if official_sufficient {
        format!(
            "official warning at severity {} (floor {})",
            max_severity, policy.official_floor
        )
    } else if confirmed {
        format!(
            "confirmed by {} independent sources at severity >= {}",
            serious_sources.len(),
            policy.confirmation_floor
        )
    } else if surge_backed {
        format!(
            "surge: {} publishers within {} min, {} at severity >= {}",
            surge_publishers.len(),
            policy.surge_lookback.num_minutes(),
            serious_sources.len(),
            policy.confirmation_floor
        )
    } else if surge_publishers.len() >= policy.surge_publishers && !spiking {
        format!(
            "{} publishers is within the usual volume (median {:.1})",
            surge_publishers.len(),
            baseline.unwrap_or_default()
        )
    } else if surging {
        format!(
            "surge of {} publishers but none at severity >= {}",
            surge_publishers.len(),
            policy.confirmation_floor
        )
    } else {
        format!(
            "unconfirmed: {} of {} sources at severity >= {}",
            serious_sources.len(),
            policy.confirmation_sources,
            policy.confirmation_floor
        )
    };

    IncidentAggregate {
        location_id: key.location_id.clone(),
        category: key.category,
        distinct_sources: all_sources.len(),
        surge_publishers: surge_publishers.len(),
        surge_baseline: baseline,
        serious_sources: serious_sources.len(),
        max_severity,
        signal_count: signals.len(),
        official_present,
        surging,
        confirmed,
        official_sufficient,
        eligible,
        reason,
    }
}

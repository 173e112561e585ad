//! Alert decision and cooldown state machine.
//!
//! Per (location, category):
//!
//! ```text
//!   Idle ──eligible──▶ Active ──▶ Cooling ──expiry──▶ Idle
//!    │                   ▲           │
//!    └─ineligible─▶ Pending          └─severity rises─▶ Active
//! ```
//!
//! `Active` only exists for the duration of a run: an emitted alert always
//! lands in `Cooling` before the state is persisted. All mutation happens in
//! [`decide`], which takes the prior [`AlertStateBook`] by reference and
//! returns the next one alongside the emitted alerts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::Policy;
use crate::locations::LocationRegistry;
use crate::pipeline::types::{
    Alert, Category, IncidentAggregate, IncidentKey, Priority, Severity,
};

// ── Phase ───────────────────────────────────────────────────────────

/// Alert phase for one (location, category).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPhase {
    /// No recent alert.
    #[default]
    Idle,
    /// Signals seen but not yet eligible.
    Pending,
    /// Alert emitted this run.
    Active,
    /// Suppressing repeats until `cooldown_until`.
    Cooling,
}

impl AlertPhase {
    /// Check if this phase allows transitioning to another phase.
    pub fn can_transition_to(&self, target: AlertPhase) -> bool {
        use AlertPhase::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Pending) | (Idle, Active) |
            // From Pending
            (Pending, Active) | (Pending, Idle) |
            // From Active
            (Active, Cooling) |
            // From Cooling (escalation, expiry, expiry with new weak signals)
            (Cooling, Active) | (Cooling, Idle) | (Cooling, Pending)
        )
    }
}

impl fmt::Display for AlertPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Cooling => "cooling",
        };
        write!(f, "{s}")
    }
}

// ── Persisted state ─────────────────────────────────────────────────

/// State for one category at one location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryState {
    pub phase: AlertPhase,
    pub last_alert_at: Option<DateTime<Utc>>,
    /// Severity of the last emitted alert; the active escalation level.
    pub last_severity: Option<Severity>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl CategoryState {
    /// Move to `target`, rejecting transitions outside the table.
    pub fn transition_to(&mut self, target: AlertPhase) -> Result<(), String> {
        if !self.phase.can_transition_to(target) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.phase, target
            ));
        }
        self.phase = target;
        Ok(())
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// All category states for one location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationAlertState {
    pub categories: BTreeMap<Category, CategoryState>,
}

/// Keyed alert state for every location, passed into and out of each run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStateBook {
    pub locations: BTreeMap<String, LocationAlertState>,
}

impl AlertStateBook {
    pub fn get(&self, key: &IncidentKey) -> Option<&CategoryState> {
        self.locations
            .get(&key.location_id)
            .and_then(|l| l.categories.get(&key.category))
    }

    pub fn set(&mut self, key: &IncidentKey, state: CategoryState) {
        self.locations
            .entry(key.location_id.clone())
            .or_default()
            .categories
            .insert(key.category, state);
    }

    pub fn remove(&mut self, key: &IncidentKey) {
        if let Some(location) = self.locations.get_mut(&key.location_id) {
            location.categories.remove(&key.category);
            if location.categories.is_empty() {
                self.locations.remove(&key.location_id);
            }
        }
    }

    /// Every (key, state) pair in deterministic order.
    pub fn entries(&self) -> impl Iterator<Item = (IncidentKey, &CategoryState)> {
        self.locations.iter().flat_map(|(loc, l)| {
            l.categories.iter().map(move |(cat, s)| {
                (
                    IncidentKey {
                        location_id: loc.clone(),
                        category: *cat,
                    },
                    s,
                )
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.locations.values().all(|l| l.categories.is_empty())
    }
}

// ── Decisions ───────────────────────────────────────────────────────

/// What happened to one key this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Eligible and outside cooldown; alert emitted.
    Emitted,
    /// Eligible inside cooldown with a higher severity; alert re-emitted.
    Escalated,
    /// Eligible but inside cooldown at the same or lower severity.
    SuppressedCooldown,
    /// Aggregate did not meet any eligibility path.
    Ineligible,
    /// Quiet key whose cooldown elapsed.
    Expired,
    /// Quiet key that was pending and went away.
    Cleared,
}

/// Audit record explaining the fate of one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDecision {
    pub location_id: String,
    pub category: Category,
    pub outcome: DecisionOutcome,
    pub from: AlertPhase,
    pub to: AlertPhase,
    pub severity: Option<Severity>,
    pub reason: String,
}

/// Result of one pass of the state machine.
#[derive(Debug, Clone, Default)]
pub struct DecisionOutput {
    pub state: AlertStateBook,
    pub alerts: Vec<Alert>,
    pub decisions: Vec<AggregateDecision>,
}

/// Priority is a function of (severity, category) only.
pub fn priority_for(
    severity: Severity,
    category: Category,
    emergency_categories: &BTreeSet<Category>,
) -> Priority {
    if severity >= Severity::URGENT && emergency_categories.contains(&category) {
        Priority::Emergency
    } else {
        Priority::Normal
    }
}

/// Apply this run's aggregates to the prior state.
///
/// Pure: the same prior state, aggregates and `now` always give the same
/// output.
pub fn decide(
    prior: &AlertStateBook,
    aggregates: &[IncidentAggregate],
    registry: &LocationRegistry,
    policies: &HashMap<String, Policy>,
    now: DateTime<Utc>,
) -> DecisionOutput {
    let fallback = Policy::defaults();
    let mut out = DecisionOutput {
        state: prior.clone(),
        ..Default::default()
    };
    let mut seen = BTreeSet::new();

    let mut ordered: Vec<&IncidentAggregate> = aggregates.iter().collect();
    ordered.sort_by_key(|a| a.key());

    for agg in ordered {
        let key = agg.key();
        seen.insert(key.clone());
        let policy = policies.get(&key.location_id).unwrap_or(&fallback);
        let mut state = prior.get(&key).cloned().unwrap_or_default();
        let from = state.phase;
        let severity = agg.max_severity;
        if state.phase == AlertPhase::Active {
            // Left over from an interrupted run.
            apply(&mut state, &key, AlertPhase::Cooling);
        }

        let (outcome, reason) = if !agg.eligible {
            if !state.in_cooldown(now) && state.phase != AlertPhase::Pending {
                apply(&mut state, &key, AlertPhase::Pending);
            }
            (DecisionOutcome::Ineligible, agg.reason.clone())
        } else if state.in_cooldown(now) {
            let escalates = state.last_severity.is_none_or(|prev| severity > prev);
            if escalates {
                let reason = format!(
                    "escalated from severity {} to {}: {}",
                    state
                        .last_severity
                        .map_or_else(|| "none".to_string(), |s| s.to_string()),
                    severity,
                    agg.reason
                );
                (DecisionOutcome::Escalated, reason)
            } else {
                let until = state
                    .cooldown_until
                    .map_or_else(String::new, |u| u.to_rfc3339());
                (
                    DecisionOutcome::SuppressedCooldown,
                    format!("cooldown until {until}, severity {severity} not above last alert"),
                )
            }
        } else {
            (DecisionOutcome::Emitted, agg.reason.clone())
        };

        if matches!(outcome, DecisionOutcome::Emitted | DecisionOutcome::Escalated) {
            apply(&mut state, &key, AlertPhase::Active);
            let alert = Alert {
                location_id: key.location_id.clone(),
                location_name: registry
                    .get(&key.location_id)
                    .map(|l| l.name.clone())
                    .unwrap_or_else(|| key.location_id.clone()),
                category: key.category,
                severity,
                source_count: agg.distinct_sources,
                reason: reason.clone(),
                priority: priority_for(severity, key.category, &policy.emergency_categories),
                escalated: outcome == DecisionOutcome::Escalated,
                emitted_at: now,
            };
            info!(
                incident = %key,
                severity = %severity,
                priority = alert.priority.label(),
                escalated = alert.escalated,
                "Alert decided"
            );
            out.alerts.push(alert);

            state.last_alert_at = Some(now);
            state.last_severity = Some(severity);
            state.cooldown_until = Some(now + policy.cooldowns.for_severity(severity));
            apply(&mut state, &key, AlertPhase::Cooling);
        }

        out.decisions.push(AggregateDecision {
            location_id: key.location_id.clone(),
            category: key.category,
            outcome,
            from,
            to: state.phase,
            severity: Some(severity),
            reason,
        });
        out.state.set(&key, state);
    }

    // Keys with no aggregate this run.
    for (key, state) in prior.entries() {
        if seen.contains(&key) {
            continue;
        }
        let mut next = state.clone();
        if next.phase == AlertPhase::Active {
            apply(&mut next, &key, AlertPhase::Cooling);
        }
        let outcome = match next.phase {
            AlertPhase::Cooling if !next.in_cooldown(now) => DecisionOutcome::Expired,
            AlertPhase::Pending => DecisionOutcome::Cleared,
            // Already idle last run and quiet again: nothing left to remember.
            AlertPhase::Idle if !next.in_cooldown(now) => {
                out.state.remove(&key);
                continue;
            }
            _ => {
                if next != *state {
                    out.state.set(&key, next);
                }
                continue;
            }
        };
        apply(&mut next, &key, AlertPhase::Idle);
        out.decisions.push(AggregateDecision {
            location_id: key.location_id.clone(),
            category: key.category,
            outcome,
            from: state.phase,
            to: next.phase,
            severity: None,
            reason: match outcome {
                DecisionOutcome::Expired => "cooldown elapsed with no new signals".into(),
                _ => "no signals this run".into(),
            },
        });
        out.state.set(&key, next);
    }

    out
}

fn apply(state: &mut CategoryState, key: &IncidentKey, target: AlertPhase) {
    if let Err(e) = state.transition_to(target) {
        error!(incident = %key, error = %e, "Rejected alert state transition");
    }
}

//! Deduplicator: collapses repeated observations of the same real-world item.
//!
//! Three passes, in order:
//! 1. keys already recorded by a prior run inside the history window are dropped
//! 2. signals sharing a `dedupe_key` collapse to one
//! 3. same location, category and publisher within the near-duplicate window
//!    collapse to one (publishers re-issuing an item under a new URL)
//!
//! When two duplicates disagree, the fresher one wins; on equal timestamps the
//! higher severity wins. Values are never averaged.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::types::{Category, Signal};

/// What each dedupe pass removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupReport {
    pub input: usize,
    pub history_suppressed: usize,
    pub exact_duplicates: usize,
    pub near_duplicates: usize,
    pub output: usize,
}

/// Stateless deduplicator; history is passed in per call.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    near_window: Duration,
}

impl Deduplicator {
    pub fn new(near_window: Duration) -> Self {
        Self { near_window }
    }

    /// Remove duplicates from one run's signals.
    ///
    /// Output order is deterministic: location, category, time, key.
    pub fn dedupe(
        &self,
        signals: Vec<Signal>,
        recent_keys: &HashSet<String>,
    ) -> (Vec<Signal>, DedupReport) {
        let mut report = DedupReport {
            input: signals.len(),
            ..Default::default()
        };

        // Pass 1: cross-run history.
        let fresh: Vec<Signal> = signals
            .into_iter()
            .filter(|s| {
                let seen = recent_keys.contains(&s.dedupe_key);
                if seen {
                    report.history_suppressed += 1;
                    debug!(key = %s.dedupe_key, "Suppressed by recent history");
                }
                !seen
            })
            .collect();

        // Pass 2: identical keys.
        let mut by_key: BTreeMap<String, Signal> = BTreeMap::new();
        for signal in fresh {
            match by_key.get_mut(&signal.dedupe_key) {
                Some(existing) => {
                    report.exact_duplicates += 1;
                    if preferred(&signal, existing) {
                        *existing = signal;
                    }
                }
                None => {
                    by_key.insert(signal.dedupe_key.clone(), signal);
                }
            }
        }

        // Pass 3: near-duplicates from the same publisher.
        let mut groups: BTreeMap<(String, Category, String), Vec<Signal>> = BTreeMap::new();
        for signal in by_key.into_values() {
            groups
                .entry((
                    signal.location_id.clone(),
                    signal.category,
                    signal.publisher_or_agency.clone(),
                ))
                .or_default()
                .push(signal);
        }

        let mut out = Vec::new();
        for (_, mut group) in groups {
            group.sort_by(|a, b| {
                a.observed_at
                    .cmp(&b.observed_at)
                    .then_with(|| a.dedupe_key.cmp(&b.dedupe_key))
            });
            let mut iter = group.into_iter();
            let Some(first) = iter.next() else {
                continue;
            };
            // Windows are anchored at the first item of each cluster, not chained.
            let mut group_start = first.observed_at;
            let mut winner = first;
            for signal in iter {
                if signal.observed_at - group_start <= self.near_window {
                    report.near_duplicates += 1;
                    if preferred(&signal, &winner) {
                        winner = signal;
                    }
                } else {
                    group_start = signal.observed_at;
                    out.push(std::mem::replace(&mut winner, signal));
                }
            }
            out.push(winner);
        }

        out.sort_by(|a, b| {
            (&a.location_id, a.category, a.observed_at, &a.dedupe_key).cmp(&(
                &b.location_id,
                b.category,
                b.observed_at,
                &b.dedupe_key,
            ))
        });
        report.output = out.len();
        (out, report)
    }
}

/// Whether `candidate` should replace `current` as the surviving duplicate.
fn preferred(candidate: &Signal, current: &Signal) -> bool {
    let rank = |s: &Signal| (s.observed_at, s.severity, Reverse(s.dedupe_key.clone()));
    rank(candidate) > rank(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    use crate::pipeline::types::{Severity, SourceKind};

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn sig(key: &str, publisher: &str, sev: Severity, at: DateTime<Utc>) -> Signal {
        Signal {
            source_kind: SourceKind::NewsItem,
            location_id: "home".into(),
            category: Category::Hazmat,
            severity: sev,
            publisher_or_agency: publisher.into(),
            observed_at: at,
            dedupe_key: key.into(),
            title: key.into(),
            url: None,
        }
    }

    fn dedup() -> Deduplicator {
        Deduplicator::new(Duration::minutes(30))
    }

    #[test]
    fn identical_keys_count_once() {
        let (out, report) = dedup().dedupe(
            vec![
                sig("k1", "a.com", Severity::WATCH, t(0)),
                sig("k1", "a.com", Severity::WATCH, t(0)),
            ],
            &HashSet::new(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(report.exact_duplicates, 1);
    }

    #[test]
    fn fresher_duplicate_wins() {
        let (out, _) = dedup().dedupe(
            vec![
                sig("k1", "a.com", Severity::URGENT, t(0)),
                sig("k1", "b.com", Severity::INFO, t(5)),
            ],
            &HashSet::new(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::INFO);
        assert_eq!(out[0].observed_at, t(5));
    }

    #[test]
    fn equal_time_prefers_higher_severity() {
        let (out, _) = dedup().dedupe(
            vec![
                sig("k1", "a.com", Severity::INFO, t(0)),
                sig("k1", "a.com", Severity::URGENT, t(0)),
                sig("k1", "a.com", Severity::WATCH, t(0)),
            ],
            &HashSet::new(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::URGENT);
    }

    #[test]
    fn history_keys_are_suppressed() {
        let history: HashSet<String> = ["k1".to_string()].into_iter().collect();
        let (out, report) = dedup().dedupe(
            vec![
                sig("k1", "a.com", Severity::URGENT, t(0)),
                sig("k2", "b.com", Severity::URGENT, t(0)),
            ],
            &history,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dedupe_key, "k2");
        assert_eq!(report.history_suppressed, 1);
    }

    #[test]
    fn same_publisher_within_window_collapses() {
        let (out, report) = dedup().dedupe(
            vec![
                sig("k1", "a.com", Severity::WATCH, t(0)),
                sig("k2", "a.com", Severity::WATCH, t(20)),
                sig("k3", "a.com", Severity::WATCH, t(45)),
            ],
            &HashSet::new(),
        );
        // k3 is 45 minutes after k1, so it starts a new cluster
        let keys: Vec<&str> = out.iter().map(|s| s.dedupe_key.as_str()).collect();
        assert_eq!(keys, vec!["k2", "k3"]);
        assert_eq!(report.near_duplicates, 1);
    }

    #[test]
    fn evenly_spaced_items_do_not_chain_past_window() {
        let (out, report) = dedup().dedupe(
            vec![
                sig("k1", "a.com", Severity::URGENT, t(0)),
                sig("k2", "a.com", Severity::INFO, t(25)),
                sig("k3", "a.com", Severity::INFO, t(50)),
                sig("k4", "a.com", Severity::INFO, t(75)),
            ],
            &HashSet::new(),
        );
        let keys: Vec<&str> = out.iter().map(|s| s.dedupe_key.as_str()).collect();
        assert_eq!(keys, vec!["k2", "k4"]);
        assert_eq!(report.near_duplicates, 2);
    }

    #[test]
    fn same_publisher_outside_window_survives() {
        let (out, _) = dedup().dedupe(
            vec![
                sig("k1", "a.com", Severity::WATCH, t(0)),
                sig("k2", "a.com", Severity::WATCH, t(90)),
            ],
            &HashSet::new(),
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn different_publishers_are_not_near_duplicates() {
        let (out, _) = dedup().dedupe(
            vec![
                sig("k1", "a.com", Severity::WATCH, t(0)),
                sig("k2", "b.com", Severity::WATCH, t(1)),
            ],
            &HashSet::new(),
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn output_is_deterministic_regardless_of_input_order() {
        let a = vec![
            sig("k2", "b.com", Severity::WATCH, t(3)),
            sig("k1", "a.com", Severity::WATCH, t(1)),
            sig("k3", "c.com", Severity::URGENT, t(2)),
        ];
        let mut b = a.clone();
        b.reverse();
        let (out_a, _) = dedup().dedupe(a, &HashSet::new());
        let (out_b, _) = dedup().dedupe(b, &HashSet::new());
        assert_eq!(out_a, out_b);
    }
}

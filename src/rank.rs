//! Windowed per-owner activity ranking over registry slots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::OwnerId;

/// Trailing window used when the caller passes a non-positive value.
pub(crate) const DEFAULT_WINDOW_SECONDS: i64 = 30;

/// Upper bound for any ranking window.
pub(crate) const MAX_RANK_WINDOW_SECONDS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ActiveTaskCount {
    #[serde(rename = "user_id")]
    pub(crate) owner_id: OwnerId,
    #[serde(rename = "username")]
    pub(crate) owner_name: String,
    pub(crate) active_slots: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RegistryStats {
    pub(crate) total_slots: usize,
    pub(crate) active_slots: usize,
    pub(crate) max_global_slots: usize,
    #[serde(rename = "max_user_slots")]
    pub(crate) max_owner_slots: usize,
    #[serde(rename = "active_users")]
    pub(crate) active_owners: usize,
    pub(crate) window_seconds: i64,
}

pub(crate) fn effective_window(window_seconds: i64) -> i64 {
    if window_seconds <= 0 {
        DEFAULT_WINDOW_SECONDS
    } else {
        window_seconds.min(MAX_RANK_WINDOW_SECONDS)
    }
}

/// Collects per-owner counts in first-seen order.
///
/// Ordering contract of [`RankAccumulator::finish`]: count descending, ties keep
/// the order in which owners were first added. The reported name is the one
/// carried by the first slot added for that owner.
#[derive(Debug, Default)]
pub(crate) struct RankAccumulator {
    entries: Vec<ActiveTaskCount>,
    positions: HashMap<OwnerId, usize>,
}

impl RankAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, owner_id: OwnerId, owner_name: &str) {
        match self.positions.get(&owner_id) {
            Some(&pos) => self.entries[pos].active_slots += 1,
            None => {
                self.positions.insert(owner_id, self.entries.len());
                self.entries.push(ActiveTaskCount {
                    owner_id,
                    owner_name: owner_name.to_string(),
                    active_slots: 1,
                });
            }
        }
    }

    pub(crate) fn finish(self, limit: Option<usize>) -> Vec<ActiveTaskCount> {
        let mut ranked = self.entries;
        // Vec::sort_by is stable, which pins the tie-break to first-seen order.
        ranked.sort_by(|a, b| b.active_slots.cmp(&a.active_slots));
        if let Some(limit) = limit {
            ranked.truncate(limit);
        }
        ranked
    }
}

pub(crate) fn filter_threshold(rank: Vec<ActiveTaskCount>, threshold: usize) -> Vec<ActiveTaskCount> {
    rank.into_iter()
        .filter(|entry| entry.active_slots >= threshold)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_window() {
        assert_eq!(effective_window(0), DEFAULT_WINDOW_SECONDS);
        assert_eq!(effective_window(-5), DEFAULT_WINDOW_SECONDS);
        assert_eq!(effective_window(45), 45);
        assert_eq!(effective_window(86_400), MAX_RANK_WINDOW_SECONDS);
    }

    #[test]
    fn test_descending_with_stable_ties() {
        let mut acc = RankAccumulator::new();
        acc.add(7, "seven");
        acc.add(3, "three");
        acc.add(9, "nine");
        acc.add(9, "nine");
        acc.add(3, "three");
        acc.add(5, "five");

        let ranked = acc.finish(None);
        let ids: Vec<OwnerId> = ranked.iter().map(|r| r.owner_id).collect();
        assert_eq!(ids, vec![3, 9, 7, 5]);
        assert_eq!(ranked[0].active_slots, 2);
        assert_eq!(ranked[3].active_slots, 1);
    }

    #[test]
    fn test_first_name_wins() {
        let mut acc = RankAccumulator::new();
        acc.add(1, "first");
        acc.add(1, "second");
        acc.add(1, "third");
        let ranked = acc.finish(None);
        assert_eq!(ranked[0].owner_name, "first");
        assert_eq!(ranked[0].active_slots, 3);
    }

    #[test]
    fn test_limit_and_threshold() {
        let mut acc = RankAccumulator::new();
        for (owner, count) in [(1, 6), (2, 2), (3, 5)] {
            for _ in 0..count {
                acc.add(owner, "u");
            }
        }
        let ranked = acc.finish(None);
        assert_eq!(ranked.len(), 3);

        let high = filter_threshold(ranked.clone(), 5);
        let ids: Vec<OwnerId> = high.iter().map(|r| r.owner_id).collect();
        assert_eq!(ids, vec![1, 3]);

        let mut acc = RankAccumulator::new();
        acc.add(1, "a");
        acc.add(2, "b");
        assert_eq!(acc.finish(Some(1)).len(), 1);
    }

    #[test]
    fn test_serialized_field_names() {
        let entry = ActiveTaskCount {
            owner_id: 4,
            owner_name: "dora".into(),
            active_slots: 2,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["user_id"], 4);
        assert_eq!(json["username"], "dora");
        assert_eq!(json["active_slots"], 2);
    }
}

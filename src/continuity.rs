use crate::fingerprint::Fingerprint;

/// Number of finest covered levels of the incoming payload that are compared.
pub(crate) const MATCH_DEPTH: usize = 2;

/// Does `incoming` continue the lineage recorded in `existing`?
///
/// Only levels `[incoming.max_level + 1 - MATCH_DEPTH, incoming.max_level]` are
/// inspected, and a level counts only if `existing` also reached it. A short
/// shared prefix (e.g. identical system instructions) never matches on its own.
///
/// If the existing payload stopped short of those levels no match is possible,
/// even for a genuine continuation that crossed a level boundary between polls.
/// Alert thresholds downstream are tuned against this behaviour; keep it.
pub(crate) fn continues(existing: &Fingerprint, incoming: &Fingerprint) -> bool {
    let start = (incoming.max_level + 1).saturating_sub(MATCH_DEPTH);
    (start..=incoming.max_level)
        .any(|lvl| lvl <= existing.max_level && existing.levels[lvl] == incoming.levels[lvl])
}

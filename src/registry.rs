//! Fixed-capacity registry of active task slots.
//!
//! Slots live in an arena that only grows up to `global_slots` and is then
//! recycled in place. Two intrusive doubly-linked lists are threaded through
//! the arena:
//!   - the global recency list (head = least recently touched, tail = most recent)
//!   - one list per owner, in the order slots were assigned to that owner
//!
//! Every unlink/relink is O(1); the only linear work on the write path is the
//! per-owner match scan, bounded by `owner_slots`.
//!
//! Thread-safe via a single `parking_lot::RwLock`: `record_task` takes it
//! exclusively, all read paths take it shared.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::continuity::continues;
use crate::fingerprint::Fingerprint;
use crate::observation::TaskObservation;
use crate::rank::{
    ActiveTaskCount, DEFAULT_WINDOW_SECONDS, RankAccumulator, RegistryStats, effective_window,
    filter_threshold,
};

pub(crate) type OwnerId = i64;

type SlotIdx = usize;

pub(crate) const DEFAULT_GLOBAL_SLOTS: usize = 1000;
pub(crate) const DEFAULT_OWNER_SLOTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RegistryLimits {
    #[serde(default = "default_global_slots")]
    pub(crate) global_slots: usize,
    #[serde(default = "default_owner_slots")]
    pub(crate) owner_slots: usize,
}

fn default_global_slots() -> usize {
    DEFAULT_GLOBAL_SLOTS
}

fn default_owner_slots() -> usize {
    DEFAULT_OWNER_SLOTS
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            global_slots: DEFAULT_GLOBAL_SLOTS,
            owner_slots: DEFAULT_OWNER_SLOTS,
        }
    }
}

impl RegistryLimits {
    /// Both capacities raised to at least one. A zero global capacity would
    /// leave the arena with no recency head to evict and let it grow forever.
    fn clamped(self) -> Self {
        Self {
            global_slots: self.global_slots.max(1),
            owner_slots: self.owner_slots.max(1),
        }
    }
}

/// What `record_task_at` did with the observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordOutcome {
    /// Continued an existing slot of the same owner.
    Continued { slot: SlotIdx },
    /// Owner was at its cap; its oldest slot was overwritten.
    ReplacedOwnOldest { slot: SlotIdx },
    /// Arena was full; the least recently touched slot was taken over.
    EvictedLru { slot: SlotIdx, previous_owner: OwnerId },
    /// A fresh arena position was allocated.
    Allocated { slot: SlotIdx },
}

#[cfg(test)]
impl RecordOutcome {
    pub(crate) fn slot(&self) -> SlotIdx {
        match *self {
            Self::Continued { slot }
            | Self::ReplacedOwnOldest { slot }
            | Self::EvictedLru { slot, .. }
            | Self::Allocated { slot } => slot,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    owner_id: OwnerId,
    owner_name: String,
    updated_at: i64,
    fingerprint: Fingerprint,
    lru_prev: Option<SlotIdx>,
    lru_next: Option<SlotIdx>,
    owner_prev: Option<SlotIdx>,
    owner_next: Option<SlotIdx>,
}

#[derive(Debug, Clone, Copy, Default)]
struct OwnerList {
    head: Option<SlotIdx>,
    tail: Option<SlotIdx>,
    len: usize,
}

#[derive(Debug)]
struct SlotTable {
    slots: Vec<Slot>,
    owners: HashMap<OwnerId, OwnerList>,
    lru_head: Option<SlotIdx>,
    lru_tail: Option<SlotIdx>,
    limits: RegistryLimits,
}

impl SlotTable {
    fn new(limits: RegistryLimits) -> Self {
        Self {
            slots: Vec::with_capacity(limits.global_slots),
            owners: HashMap::new(),
            lru_head: None,
            lru_tail: None,
            limits,
        }
    }

    // ── recency list ─────────────────────────────────────────────────

    fn lru_unlink(&mut self, idx: SlotIdx) {
        let (prev, next) = {
            let slot = &self.slots[idx];
            (slot.lru_prev, slot.lru_next)
        };
        match prev {
            Some(p) => self.slots[p].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.slots[n].lru_prev = prev,
            None => self.lru_tail = prev,
        }
        let slot = &mut self.slots[idx];
        slot.lru_prev = None;
        slot.lru_next = None;
    }

    fn lru_push_back(&mut self, idx: SlotIdx) {
        let old_tail = self.lru_tail;
        {
            let slot = &mut self.slots[idx];
            slot.lru_prev = old_tail;
            slot.lru_next = None;
        }
        match old_tail {
            Some(t) => self.slots[t].lru_next = Some(idx),
            None => self.lru_head = Some(idx),
        }
        self.lru_tail = Some(idx);
    }

    fn touch(&mut self, idx: SlotIdx) {
        if self.lru_tail == Some(idx) {
            return;
        }
        self.lru_unlink(idx);
        self.lru_push_back(idx);
    }

    // ── per-owner lists ──────────────────────────────────────────────

    fn owner_push_back(&mut self, owner_id: OwnerId, idx: SlotIdx) {
        let list = self.owners.entry(owner_id).or_default();
        let old_tail = list.tail;
        list.tail = Some(idx);
        if list.head.is_none() {
            list.head = Some(idx);
        }
        list.len += 1;

        if let Some(t) = old_tail {
            self.slots[t].owner_next = Some(idx);
        }
        let slot = &mut self.slots[idx];
        slot.owner_prev = old_tail;
        slot.owner_next = None;
    }

    fn owner_unlink(&mut self, owner_id: OwnerId, idx: SlotIdx) {
        let (prev, next) = {
            let slot = &self.slots[idx];
            (slot.owner_prev, slot.owner_next)
        };
        if let Some(p) = prev {
            self.slots[p].owner_next = next;
        }
        if let Some(n) = next {
            self.slots[n].owner_prev = prev;
        }
        {
            let slot = &mut self.slots[idx];
            slot.owner_prev = None;
            slot.owner_next = None;
        }

        let Some(list) = self.owners.get_mut(&owner_id) else {
            return;
        };
        if list.head == Some(idx) {
            list.head = next;
        }
        if list.tail == Some(idx) {
            list.tail = prev;
        }
        list.len -= 1;
        if list.len == 0 {
            self.owners.remove(&owner_id);
        }
    }

    fn owner_slots(&self, owner_id: OwnerId) -> OwnerSlots<'_> {
        OwnerSlots {
            table: self,
            cursor: self.owners.get(&owner_id).and_then(|list| list.head),
        }
    }

    fn owner_len(&self, owner_id: OwnerId) -> usize {
        self.owners.get(&owner_id).map_or(0, |list| list.len)
    }

    // ── state machine ────────────────────────────────────────────────

    fn overwrite(&mut self, idx: SlotIdx, owner_name: &str, now: i64, fingerprint: Fingerprint) {
        let slot = &mut self.slots[idx];
        slot.updated_at = now;
        slot.fingerprint = fingerprint;
        if slot.owner_name != owner_name {
            slot.owner_name = owner_name.to_string();
        }
    }

    fn record(
        &mut self,
        owner_id: OwnerId,
        owner_name: &str,
        payload: &[u8],
        now: i64,
    ) -> RecordOutcome {
        let fingerprint = Fingerprint::compute(payload);

        let matched = self
            .owner_slots(owner_id)
            .find(|&idx| continues(&self.slots[idx].fingerprint, &fingerprint));
        if let Some(idx) = matched {
            self.overwrite(idx, owner_name, now, fingerprint);
            self.touch(idx);
            return RecordOutcome::Continued { slot: idx };
        }

        if self.owner_len(owner_id) >= self.limits.owner_slots {
            // Strict `<` keeps the earliest list position on equal timestamps.
            let oldest = self
                .owner_slots(owner_id)
                .fold(None::<SlotIdx>, |best, idx| match best {
                    Some(b) if self.slots[b].updated_at <= self.slots[idx].updated_at => Some(b),
                    _ => Some(idx),
                });
            if let Some(idx) = oldest {
                self.overwrite(idx, owner_name, now, fingerprint);
                self.touch(idx);
                return RecordOutcome::ReplacedOwnOldest { slot: idx };
            }
        }

        if self.slots.len() >= self.limits.global_slots {
            if let Some(idx) = self.lru_head {
                let previous_owner = self.slots[idx].owner_id;
                if previous_owner != owner_id {
                    self.owner_unlink(previous_owner, idx);
                    self.slots[idx].owner_id = owner_id;
                    self.owner_push_back(owner_id, idx);
                }
                self.overwrite(idx, owner_name, now, fingerprint);
                self.touch(idx);
                tracing::trace!(slot = idx, previous_owner, owner_id, "evicted least recent slot");
                return RecordOutcome::EvictedLru {
                    slot: idx,
                    previous_owner,
                };
            }
        }

        let idx = self.slots.len();
        self.slots.push(Slot {
            owner_id,
            owner_name: owner_name.to_string(),
            updated_at: now,
            fingerprint,
            lru_prev: None,
            lru_next: None,
            owner_prev: None,
            owner_next: None,
        });
        self.owner_push_back(owner_id, idx);
        self.lru_push_back(idx);
        RecordOutcome::Allocated { slot: idx }
    }

    // ── read paths ───────────────────────────────────────────────────

    fn rank(&self, window_seconds: i64, limit: Option<usize>, now: i64) -> Vec<ActiveTaskCount> {
        let cutoff = now - effective_window(window_seconds);
        let mut acc = RankAccumulator::new();
        for slot in self.slots.iter().filter(|s| s.updated_at >= cutoff) {
            acc.add(slot.owner_id, &slot.owner_name);
        }
        acc.finish(limit)
    }

    fn stats(&self, now: i64) -> RegistryStats {
        let cutoff = now - DEFAULT_WINDOW_SECONDS;
        RegistryStats {
            total_slots: self.slots.len(),
            active_slots: self.slots.iter().filter(|s| s.updated_at >= cutoff).count(),
            max_global_slots: self.limits.global_slots,
            max_owner_slots: self.limits.owner_slots,
            active_owners: self.owners.len(),
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }
}

struct OwnerSlots<'a> {
    table: &'a SlotTable,
    cursor: Option<SlotIdx>,
}

impl Iterator for OwnerSlots<'_> {
    type Item = SlotIdx;

    fn next(&mut self) -> Option<SlotIdx> {
        let idx = self.cursor?;
        self.cursor = self.table.slots[idx].owner_next;
        Some(idx)
    }
}

/// Process-wide registry handle. Build once at startup and share as `Arc<SlotRegistry>`.
#[derive(Debug)]
pub(crate) struct SlotRegistry {
    inner: RwLock<SlotTable>,
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}

impl SlotRegistry {
    pub(crate) fn new(limits: RegistryLimits) -> Self {
        Self {
            inner: RwLock::new(SlotTable::new(limits.clamped())),
        }
    }

    /// Record one task observation. Callers must have rejected `owner_id <= 0`.
    pub(crate) fn record_task(&self, owner_id: OwnerId, owner_name: &str, payload: &[u8]) {
        let _ = self.record_task_at(owner_id, owner_name, payload, Utc::now().timestamp());
    }

    pub(crate) fn record_task_at(
        &self,
        owner_id: OwnerId,
        owner_name: &str,
        payload: &[u8],
        now: i64,
    ) -> RecordOutcome {
        debug_assert!(owner_id > 0, "owner ids must be validated by the caller");
        self.inner.write().record(owner_id, owner_name, payload, now)
    }

    pub(crate) fn observe(&self, observation: &TaskObservation) {
        self.record_task(
            observation.owner_id(),
            observation.owner_name(),
            observation.payload(),
        );
    }

    pub(crate) fn active_task_rank(
        &self,
        window_seconds: i64,
        limit: Option<usize>,
    ) -> Vec<ActiveTaskCount> {
        self.active_task_rank_at(window_seconds, limit, Utc::now().timestamp())
    }

    pub(crate) fn active_task_rank_at(
        &self,
        window_seconds: i64,
        limit: Option<usize>,
        now: i64,
    ) -> Vec<ActiveTaskCount> {
        self.inner.read().rank(window_seconds, limit, now)
    }

    pub(crate) fn stats(&self) -> RegistryStats {
        self.stats_at(Utc::now().timestamp())
    }

    pub(crate) fn stats_at(&self, now: i64) -> RegistryStats {
        self.inner.read().stats(now)
    }

    pub(crate) fn high_active_users_at(
        &self,
        window_seconds: i64,
        threshold: usize,
        now: i64,
    ) -> Vec<ActiveTaskCount> {
        filter_threshold(self.active_task_rank_at(window_seconds, None, now), threshold)
    }
}

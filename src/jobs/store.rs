// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory job store and its persisted snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::entry::{Entry, EntryParams, EntryState};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The durable document: every entry in display order plus the pending queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Version for future migrations
    #[serde(default)]
    pub version: u32,
    /// When the snapshot was last written
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub queue: Vec<Uuid>,
}

/// Ordered entries plus the ordered queue of pending ids.
///
/// The queue holds each id at most once. Ids whose entry was deleted are
/// tolerated and dropped when they reach the head.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStore {
    entries: Vec<Entry>,
    queue: Vec<Uuid>,
}

impl Default for JobStore {
    /// A single `Creating` template and an empty queue.
    fn default() -> Self {
        Self {
            entries: vec![Entry::prototype(EntryParams::default())],
            queue: Vec::new(),
        }
    }
}

impl JobStore {
    /// Rebuild from a snapshot, dropping dangling and duplicate queue ids.
    pub fn from_snapshot(snapshot: PersistedSnapshot) -> Self {
        let mut store = Self {
            entries: snapshot.entries,
            queue: Vec::with_capacity(snapshot.queue.len()),
        };
        for id in snapshot.queue {
            if store.get(id).is_none() {
                debug!(%id, "dropping dangling queue id from snapshot");
                continue;
            }
            if !store.queue.contains(&id) {
                store.queue.push(id);
            }
        }
        store
    }

    pub fn to_snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            last_saved: None,
            entries: self.entries.clone(),
            queue: self.queue.clone(),
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn queue(&self) -> &[Uuid] {
        &self.queue
    }

    pub fn get(&self, id: Uuid) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id() == id)
    }

    fn index_of(&self, id: Uuid) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == id)
    }

    /// Insert at the end, or replace in place if the id already exists.
    pub fn upsert(&mut self, entry: Entry) {
        match self.index_of(entry.id()) {
            Some(idx) => self.entries[idx] = entry,
            None => self.entries.push(entry),
        }
    }

    /// Insert directly after `anchor`, or at the end if `anchor` is unknown.
    pub fn insert_after(&mut self, anchor: Uuid, entry: Entry) {
        match self.index_of(anchor) {
            Some(idx) => self.entries.insert(idx + 1, entry),
            None => self.entries.push(entry),
        }
    }

    /// Remove an entry and its queue slot.
    pub fn remove(&mut self, id: Uuid) -> Option<Entry> {
        self.remove_from_queue(id);
        let idx = self.index_of(id)?;
        Some(self.entries.remove(idx))
    }

    /// Append to the queue tail. Returns the id's queue position.
    pub fn push_queue(&mut self, id: Uuid) -> usize {
        match self.queue_position(id) {
            Some(pos) => pos,
            None => {
                self.queue.push(id);
                self.queue.len() - 1
            }
        }
    }

    pub fn remove_from_queue(&mut self, id: Uuid) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| *q != id);
        before != self.queue.len()
    }

    pub fn queue_position(&self, id: Uuid) -> Option<usize> {
        self.queue.iter().position(|q| *q == id)
    }

    /// Move `id` to the head, keeping everything else in order.
    pub fn move_to_front(&mut self, id: Uuid) -> bool {
        let Some(pos) = self.queue_position(id) else {
            return false;
        };
        let id = self.queue.remove(pos);
        self.queue.insert(0, id);
        true
    }

    /// True if some queued id resolves to an entry waiting for dispatch.
    pub fn has_dispatchable(&self) -> bool {
        self.queue
            .iter()
            .any(|id| matches!(self.get(*id).map(|e| e.state()), Some(EntryState::Queued)))
    }

    /// Drop head ids that are dangling or no longer belong in the queue and
    /// return the first id waiting for dispatch. Returns the number of ids
    /// dropped alongside.
    pub fn next_dispatchable(&mut self) -> (Option<Uuid>, usize) {
        let mut dropped = 0;
        while let Some(&head) = self.queue.first() {
            match self.get(head).map(|e| e.state()) {
                Some(EntryState::Queued) => return (Some(head), dropped),
                Some(state) if state.stays_in_queue() => {
                    // Rendering at the head outside a dispatch: restart it.
                    if let Some(entry) = self.get_mut(head) {
                        entry.state = EntryState::Queued;
                    }
                    return (Some(head), dropped);
                }
                Some(state) => {
                    debug!(id = %head, state = state.label(), "dropping finished id from queue head");
                }
                None => debug!(id = %head, "dropping dangling id from queue head"),
            }
            self.queue.remove(0);
            dropped += 1;
        }
        (None, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(prompt: &str) -> Entry {
        Entry::new(EntryParams::new(prompt))
    }

    #[test]
    fn test_default_has_single_prototype() {
        let store = JobStore::default();
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.entries()[0].state(), EntryState::Creating);
        assert!(store.queue().is_empty());
        assert!(!store.has_dispatchable());
    }

    #[test]
    fn test_push_queue_is_idempotent() {
        let mut store = JobStore::default();
        let a = queued("a");
        let id = a.id();
        store.upsert(a);
        assert_eq!(store.push_queue(id), 0);
        assert_eq!(store.push_queue(id), 0);
        assert_eq!(store.queue(), &[id]);
    }

    #[test]
    fn test_move_to_front_preserves_relative_order() {
        let mut store = JobStore::default();
        let ids: Vec<Uuid> = ["a", "b", "c", "d"]
            .iter()
            .map(|p| {
                let e = queued(p);
                let id = e.id();
                store.upsert(e);
                store.push_queue(id);
                id
            })
            .collect();

        assert!(store.move_to_front(ids[2]));
        assert_eq!(store.queue(), &[ids[2], ids[0], ids[1], ids[3]]);

        assert!(!store.move_to_front(Uuid::new_v4()));
        assert_eq!(store.queue(), &[ids[2], ids[0], ids[1], ids[3]]);
    }

    #[test]
    fn test_next_dispatchable_skips_dangling_and_finished() {
        let mut store = JobStore::default();
        let mut done = queued("done");
        done.state = EntryState::Done;
        let pending = queued("pending");
        let (done_id, pending_id) = (done.id(), pending.id());
        store.upsert(done);
        store.upsert(pending);

        store.push_queue(Uuid::new_v4());
        store.push_queue(done_id);
        store.push_queue(pending_id);

        let (next, dropped) = store.next_dispatchable();
        assert_eq!(next, Some(pending_id));
        assert_eq!(dropped, 2);
        assert_eq!(store.queue(), &[pending_id]);
    }

    #[test]
    fn test_insert_after_anchor() {
        let mut store = JobStore::default();
        let a = queued("a");
        let b = queued("b");
        let (a_id, b_id) = (a.id(), b.id());
        store.upsert(a);
        store.upsert(b);

        let variant = queued("a'");
        let variant_id = variant.id();
        store.insert_after(a_id, variant);

        let order: Vec<Uuid> = store.entries().iter().skip(1).map(|e| e.id()).collect();
        assert_eq!(order, vec![a_id, variant_id, b_id]);
    }

    #[test]
    fn test_snapshot_round_trip_drops_dangling() {
        let mut store = JobStore::default();
        let a = queued("a");
        let b = queued("b");
        let (a_id, b_id) = (a.id(), b.id());
        store.upsert(a);
        store.upsert(b);
        store.push_queue(b_id);

        let mut snapshot = store.to_snapshot();
        let ghost = Uuid::new_v4();
        snapshot.queue.insert(0, ghost);
        snapshot.queue.push(b_id);

        let json = serde_json::to_string(&snapshot).expect("serialize");
        let loaded: PersistedSnapshot = serde_json::from_str(&json).expect("deserialize");
        let restored = JobStore::from_snapshot(loaded);

        assert_eq!(restored.entries(), store.entries());
        assert_eq!(restored.queue(), &[b_id]);
        assert!(restored.get(a_id).is_some());
    }

    #[test]
    fn test_remove_clears_queue_slot() {
        let mut store = JobStore::default();
        let a = queued("a");
        let id = a.id();
        store.upsert(a);
        store.push_queue(id);

        assert!(store.remove(id).is_some());
        assert!(store.queue().is_empty());
        assert!(store.remove(id).is_none());
    }
}

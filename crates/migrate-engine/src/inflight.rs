//! The in-flight table: an emigration's exclusive authority on whether an
//! `INSERT` is outstanding.
//!
//! Absence of an `insert_id` means "acked or never sent" (spec.md
//! invariant 4). Touched by the emigration's own worker while streaming
//! and retransmitting, and by the ack dispatcher on `INSERT_ACK` --
//! modeled here as a striped concurrent map (`DashMap`), the same
//! structure the teacher uses for its registries.

use std::time::Instant;

use dashmap::DashMap;
use migrate_types::{InsertId, MigrationMessage};

/// One outstanding `INSERT`: the message to retransmit and when it was
/// last put on the wire.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub message: MigrationMessage,
    pub last_xmit: Instant,
}

/// Per-emigration map of `insert_id -> (message, last-xmit)`.
#[derive(Debug, Default)]
pub struct InFlightTable {
    entries: DashMap<InsertId, InFlightEntry>,
}

impl InFlightTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, insert_id: InsertId, message: MigrationMessage) {
        self.entries.insert(
            insert_id,
            InFlightEntry {
                message,
                last_xmit: Instant::now(),
            },
        );
    }

    /// Removes the entry for `insert_id`, if present. Called when an
    /// `INSERT_ACK` for it arrives.
    pub fn remove(&self, insert_id: InsertId) -> Option<InFlightEntry> {
        self.entries.remove(&insert_id).map(|(_, e)| e)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumps the last-xmit timestamp for `insert_id`, e.g. after a
    /// successful retransmit.
    pub fn touch(&self, insert_id: InsertId) {
        if let Some(mut e) = self.entries.get_mut(&insert_id) {
            e.last_xmit = Instant::now();
        }
    }

    /// Returns every entry whose last-xmit predates `deadline`, i.e. is
    /// due for retransmission.
    #[must_use]
    pub fn due_for_retransmit(&self, deadline: Instant) -> Vec<(InsertId, MigrationMessage)> {
        self.entries
            .iter()
            .filter(|e| e.last_xmit < deadline)
            .map(|e| (*e.key(), e.message.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrate_types::{ClusterKey, DonePayload, EmigId};
    use std::time::Duration;

    fn msg(emig_id: u32) -> MigrationMessage {
        MigrationMessage::Done(DonePayload {
            emig_id: EmigId(emig_id),
            cluster_key: ClusterKey(1),
        })
    }

    #[test]
    fn insert_then_remove_clears_entry() {
        let table = InFlightTable::new();
        table.insert(InsertId(1), msg(1));
        assert_eq!(table.len(), 1);
        assert!(table.remove(InsertId(1)).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn remove_unknown_id_is_none() {
        let table = InFlightTable::new();
        assert!(table.remove(InsertId(99)).is_none());
    }

    #[test]
    fn due_for_retransmit_only_returns_stale_entries() {
        let table = InFlightTable::new();
        table.insert(InsertId(1), msg(1));
        std::thread::sleep(Duration::from_millis(5));
        let deadline = Instant::now();
        table.insert(InsertId(2), msg(2));

        let due = table.due_for_retransmit(deadline);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, InsertId(1));
    }

    #[test]
    fn touch_updates_last_xmit_so_entry_is_no_longer_due() {
        let table = InFlightTable::new();
        table.insert(InsertId(1), msg(1));
        std::thread::sleep(Duration::from_millis(5));
        let deadline = Instant::now();
        table.touch(InsertId(1));

        assert!(table.due_for_retransmit(deadline).is_empty());
    }
}

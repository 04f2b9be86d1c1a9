//! RIFL-style dedup ledger.
//!
//! Tracks which (client, request) pairs have been applied so that a client
//! retry, or a witness replay after a crash, never re-applies a write. Per
//! client the ledger keeps an acked-through watermark plus the set of
//! request ids applied out of order above it, which keeps duplicate checks
//! O(1) for the common in-order case.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use vigil_witness::witness::{ClientId, DedupLedger, RequestId};

#[derive(Debug, Default)]
struct ClientRecord {
    /// Every request id at or below this has been applied. Request ids are
    /// issued from 1, so 0 means none.
    acked_through: u64,
    /// Applied request ids above `acked_through`.
    out_of_order: BTreeSet<u64>,
    /// Set when the client id was retired or reassigned; records still
    /// claiming it are identity collisions.
    retired: bool,
}

impl ClientRecord {
    fn note_applied(&mut self, request_id: RequestId) {
        if request_id <= self.acked_through {
            return;
        }
        if request_id == self.acked_through + 1 {
            self.acked_through = request_id;
            // Drain any out-of-order ids now contiguous with the watermark.
            while self.out_of_order.remove(&(self.acked_through + 1)) {
                self.acked_through += 1;
            }
        } else {
            self.out_of_order.insert(request_id);
        }
    }

    fn applied(&self, request_id: RequestId) -> bool {
        request_id <= self.acked_through || self.out_of_order.contains(&request_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    clients: RwLock<HashMap<ClientId, ClientRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the (client, request) pair has been applied.
    pub fn record_applied(&self, client_id: ClientId, request_id: RequestId) {
        let mut guard = self.clients.write().expect("dedup ledger lock");
        guard.entry(client_id).or_default().note_applied(request_id);
    }

    /// Retire a client id so later records claiming it fail the collision
    /// check (the id has been handed to a different issuer).
    pub fn retire_client(&self, client_id: ClientId) {
        let mut guard = self.clients.write().expect("dedup ledger lock");
        guard.entry(client_id).or_default().retired = true;
    }
}

impl DedupLedger for InMemoryLedger {
    fn collision_check(&self, client_id: ClientId) -> bool {
        let guard = self.clients.read().expect("dedup ledger lock");
        guard.get(&client_id).map_or(true, |record| !record.retired)
    }

    fn is_duplicate(&self, client_id: ClientId, request_id: RequestId) -> bool {
        let guard = self.clients.read().expect("dedup ledger lock");
        guard
            .get(&client_id)
            .is_some_and(|record| record.applied(request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_pairs_are_not_duplicates() {
        let ledger = InMemoryLedger::new();
        assert!(!ledger.is_duplicate(1, 1));
        assert!(ledger.collision_check(1));
    }

    #[test]
    fn applied_pairs_become_duplicates() {
        let ledger = InMemoryLedger::new();
        ledger.record_applied(1, 1);
        ledger.record_applied(1, 2);
        assert!(ledger.is_duplicate(1, 1));
        assert!(ledger.is_duplicate(1, 2));
        assert!(!ledger.is_duplicate(1, 3));
        assert!(!ledger.is_duplicate(2, 1));
    }

    #[test]
    fn out_of_order_applies_are_tracked_and_drained() {
        let ledger = InMemoryLedger::new();
        ledger.record_applied(5, 1);
        ledger.record_applied(5, 4);
        assert!(ledger.is_duplicate(5, 4));
        assert!(!ledger.is_duplicate(5, 2));
        assert!(!ledger.is_duplicate(5, 3));

        // Filling the gap drains the out-of-order set into the watermark.
        ledger.record_applied(5, 2);
        ledger.record_applied(5, 3);
        for request in 1..=4 {
            assert!(ledger.is_duplicate(5, request));
        }
        let guard = ledger.clients.read().unwrap();
        assert!(guard.get(&5).unwrap().out_of_order.is_empty());
        assert_eq!(guard.get(&5).unwrap().acked_through, 4);
    }

    #[test]
    fn retired_clients_fail_the_collision_check() {
        let ledger = InMemoryLedger::new();
        ledger.record_applied(9, 1);
        assert!(ledger.collision_check(9));
        ledger.retire_client(9);
        assert!(!ledger.collision_check(9));
        // Duplicate tracking for the retired id is unaffected.
        assert!(ledger.is_duplicate(9, 1));
    }
}

//! Request banks: subscriptions addressable by content and by deadline.
//!
//! A bank couples one [`TimeoutHeap`] with one content index so that every
//! subscription is reachable both by its key set (dispatch fan-out,
//! idempotent re-subscription) and by its expiry time (timeout sweep). The
//! bank is the single mutator of both structures; heap handles never leave
//! it, and every mutation updates heap, index, and quota ledger before
//! returning.

pub mod patterns;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::heap::{NodeId, TimeoutHeap};
use crate::ledger::QuotaLedger;
use crate::protocol::{ClientId, Timestamp};

pub use patterns::{
    AllBank, AllIndex, HostVarBank, HostVarIndex, HostVarRevBank, HostVarRevIndex, SingleKeyBank,
    SingleKeyIndex, VarRevBank, VarRevIndex,
};

/// Client set subscribed to one content key. Iteration yields client ids in
/// ascending order, which fixes the delivery order downstream.
pub type SubscriptionMap = BTreeMap<ClientId, NodeId>;

/// Heap payload: enough to find the content-index entry again, plus the
/// quota bucket the subscription was charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<K> {
    pub key_set: K,
    pub client_id: ClientId,
    pub remote: bool,
}

/// Content-index strategy for one subscription pattern.
///
/// Implementations own the key → [`SubscriptionMap`] layout; the generic
/// bank supplies the heap and ledger coupling. An emptied map must be
/// dropped, never retained, so that key-presence queries stay honest.
pub trait ContentIndex {
    type KeySet: Copy + PartialEq + fmt::Debug;

    fn get(&self, key_set: Self::KeySet) -> Option<&SubscriptionMap>;

    fn get_or_insert(&mut self, key_set: Self::KeySet) -> &mut SubscriptionMap;

    /// Removes one client's entry, dropping the map if it empties.
    fn remove_entry(&mut self, key_set: Self::KeySet, client: ClientId) -> Option<NodeId>;

    /// Removes and returns the whole map for a key.
    fn take_map(&mut self, key_set: Self::KeySet) -> Option<SubscriptionMap>;
}

/// Outcome of [`RequestBank::add`]. Quota refusals are reported as an error
/// and leave all state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// A new subscription was admitted and charged to the ledger.
    Inserted,
    /// An identical subscription already existed; only its deadline moved.
    Refreshed,
}

#[derive(Debug)]
pub struct RequestBank<I: ContentIndex> {
    heap: TimeoutHeap<Timestamp, Entry<I::KeySet>>,
    index: I,
}

impl<I: ContentIndex> RequestBank<I> {
    pub fn new(index: I) -> Self {
        Self {
            heap: TimeoutHeap::new(),
            index,
        }
    }

    /// Admits a subscription, or refreshes the deadline of an identical one.
    pub fn add(
        &mut self,
        key_set: I::KeySet,
        client_id: ClientId,
        deadline: Timestamp,
        remote: bool,
        ledger: &mut QuotaLedger,
    ) -> Result<AddResult> {
        if let Some(&handle) = self.index.get(key_set).and_then(|map| map.get(&client_id)) {
            let entry = self.heap.item(handle);
            assert_eq!(
                (entry.key_set, entry.client_id),
                (key_set, client_id),
                "content index out of step with heap payload"
            );
            self.heap.alter_key(handle, deadline);
            return Ok(AddResult::Refreshed);
        }

        ledger.try_charge(client_id, remote)?;
        let handle = self.heap.insert(
            deadline,
            Entry {
                key_set,
                client_id,
                remote,
            },
        );
        self.index.get_or_insert(key_set).insert(client_id, handle);
        Ok(AddResult::Inserted)
    }

    /// Deadline of the subscription expiring first.
    pub fn minimum_deadline(&self) -> Result<Timestamp> {
        self.heap.min_key()
    }

    /// Drains every subscription with a deadline at or before `now`.
    pub fn pop_expired(
        &mut self,
        now: Timestamp,
        ledger: &mut QuotaLedger,
    ) -> Vec<(I::KeySet, ClientId)> {
        let mut drained = Vec::new();
        while let Ok(deadline) = self.heap.min_key() {
            if deadline > now {
                break;
            }
            let min = self.heap.min().expect("nonempty heap lost its minimum");
            let entry = *self.heap.item(min);
            let handle = self
                .index
                .remove_entry(entry.key_set, entry.client_id)
                .unwrap_or_else(|| {
                    panic!(
                        "expired subscription {:?}/{} missing from content index",
                        entry.key_set, entry.client_id
                    )
                });
            assert_eq!(handle, min, "content index handle is not the heap minimum");
            ledger.release(entry.client_id, entry.remote);
            let _ = self.heap.extract_min();
            drained.push((entry.key_set, entry.client_id));
        }
        drained
    }

    /// Retires every subscription for `key_set` (data delivered), returning
    /// the client list in ascending id order.
    pub fn remove_by_key(&mut self, key_set: I::KeySet, ledger: &mut QuotaLedger) -> Vec<ClientId> {
        let Some(map) = self.index.take_map(key_set) else {
            return Vec::new();
        };
        let mut clients = Vec::with_capacity(map.len());
        for (client_id, handle) in map {
            let entry = *self.heap.item(handle);
            assert_eq!(
                entry.client_id, client_id,
                "content index client does not match heap payload"
            );
            ledger.release(client_id, entry.remote);
            self.heap.remove(handle);
            clients.push(client_id);
        }
        clients
    }

    /// Retires a single client's subscription. Returns false if none
    /// existed.
    pub fn remove(
        &mut self,
        key_set: I::KeySet,
        client_id: ClientId,
        ledger: &mut QuotaLedger,
    ) -> bool {
        match self.index.remove_entry(key_set, client_id) {
            Some(handle) => {
                let entry = *self.heap.item(handle);
                ledger.release(client_id, entry.remote);
                self.heap.remove(handle);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key_set: I::KeySet, client_id: ClientId) -> bool {
        self.index
            .get(key_set)
            .is_some_and(|map| map.contains_key(&client_id))
    }

    pub fn contains_key(&self, key_set: I::KeySet) -> bool {
        self.index.get(key_set).is_some()
    }

    /// Clients subscribed to `key_set`, in ascending id order.
    pub fn subscribers(&self, key_set: I::KeySet) -> Vec<ClientId> {
        match self.index.get(key_set) {
            Some(map) => map.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> (SingleKeyBank, QuotaLedger) {
        (
            RequestBank::new(SingleKeyIndex::with_capacity(32)),
            QuotaLedger::new(8, 4, 4),
        )
    }

    #[test]
    fn add_then_lookup() {
        let (mut bank, mut ledger) = bank();
        let result = bank.add(5, 1, 100, false, &mut ledger).expect("add");
        assert_eq!(result, AddResult::Inserted);
        assert!(bank.contains(5, 1));
        assert!(bank.contains_key(5));
        assert!(!bank.contains(5, 2));
        assert_eq!(bank.subscribers(5), vec![1]);
        assert_eq!(ledger.outstanding(1), (1, 0));
    }

    #[test]
    fn re_add_refreshes_without_new_charge() {
        let (mut bank, mut ledger) = bank();
        bank.add(5, 1, 100, false, &mut ledger).expect("add");
        let result = bank.add(5, 1, 50, false, &mut ledger).expect("re-add");
        assert_eq!(result, AddResult::Refreshed);
        assert_eq!(bank.len(), 1);
        assert_eq!(bank.minimum_deadline().expect("deadline"), 50);
        assert_eq!(ledger.outstanding(1), (1, 0));
    }

    #[test]
    fn refresh_can_extend_the_deadline() {
        let (mut bank, mut ledger) = bank();
        bank.add(5, 1, 100, false, &mut ledger).expect("add");
        bank.add(9, 2, 150, false, &mut ledger).expect("add");
        bank.add(5, 1, 400, false, &mut ledger).expect("refresh");
        assert_eq!(bank.minimum_deadline().expect("deadline"), 150);
    }

    #[test]
    fn quota_rejection_leaves_state_untouched() {
        let (mut bank, mut ledger) = bank();
        for key in 0..4 {
            bank.add(key, 1, 100 + u64::from(key), false, &mut ledger)
                .expect("under cap");
        }
        let err = bank.add(9, 1, 500, false, &mut ledger).expect_err("over cap");
        assert_eq!(
            err,
            crate::error::Error::QuotaExceeded {
                client: 1,
                remote: false
            }
        );
        assert_eq!(bank.len(), 4);
        assert!(!bank.contains(9, 1));
        assert_eq!(ledger.outstanding(1), (4, 0));
    }

    #[test]
    fn pop_expired_takes_the_boundary_inclusive() {
        let (mut bank, mut ledger) = bank();
        bank.add(1, 1, 100, false, &mut ledger).expect("add");
        bank.add(2, 2, 200, false, &mut ledger).expect("add");
        bank.add(3, 3, 300, false, &mut ledger).expect("add");
        let drained = bank.pop_expired(200, &mut ledger);
        assert_eq!(drained, vec![(1, 1), (2, 2)]);
        assert!(!bank.contains_key(1));
        assert!(!bank.contains_key(2));
        assert!(bank.contains(3, 3));
        assert_eq!(ledger.outstanding(1), (0, 0));
        assert_eq!(ledger.outstanding(2), (0, 0));
        assert_eq!(ledger.outstanding(3), (1, 0));
    }

    #[test]
    fn remove_by_key_returns_clients_in_order() {
        let (mut bank, mut ledger) = bank();
        bank.add(7, 3, 100, false, &mut ledger).expect("add");
        bank.add(7, 1, 200, true, &mut ledger).expect("add");
        bank.add(7, 2, 300, false, &mut ledger).expect("add");
        bank.add(8, 4, 400, false, &mut ledger).expect("add");
        let clients = bank.remove_by_key(7, &mut ledger);
        assert_eq!(clients, vec![1, 2, 3]);
        assert!(!bank.contains_key(7));
        assert!(bank.contains(8, 4));
        assert_eq!(ledger.outstanding(1), (0, 0));
        assert_eq!(bank.len(), 1);
        assert!(bank.remove_by_key(7, &mut ledger).is_empty());
    }

    #[test]
    fn remove_single_entry() {
        let (mut bank, mut ledger) = bank();
        bank.add(7, 1, 100, false, &mut ledger).expect("add");
        bank.add(7, 2, 200, false, &mut ledger).expect("add");
        assert!(bank.remove(7, 1, &mut ledger));
        assert!(!bank.remove(7, 1, &mut ledger));
        assert_eq!(bank.subscribers(7), vec![2]);
        assert_eq!(ledger.outstanding(1), (0, 0));
    }

    #[test]
    fn minimum_deadline_on_empty_bank() {
        let (bank, _ledger) = bank();
        assert_eq!(bank.minimum_deadline(), Err(crate::error::Error::Empty));
    }
}

//! Content-index layouts for the six subscription patterns.
//!
//! Single-key patterns (host, variable) go straight into a bucket index.
//! Composite patterns bucket on the variable id, which is the densest of
//! the key fields, and keep the remaining fields in an ordered map inside
//! the bucket cell. Emptied maps are evicted at every level so that
//! key-presence queries never see ghosts.

use std::collections::BTreeMap;

use crate::heap::NodeId;
use crate::index::BucketIndex;
use crate::protocol::{ClientId, NodeAddress, Revision, VariableId};

use super::{ContentIndex, RequestBank, SubscriptionMap};

/// Total-coverage pattern: one map holds every promiscuous subscriber.
pub type AllBank = RequestBank<AllIndex>;

/// Single-key patterns (by host, or by variable).
pub type SingleKeyBank = RequestBank<SingleKeyIndex>;

/// (host, variable) pattern subscriptions.
pub type HostVarBank = RequestBank<HostVarIndex>;

/// (variable, revision) one-shot subscriptions, any host.
pub type VarRevBank = RequestBank<VarRevIndex>;

/// (host, variable, revision) one-shot subscriptions to remote hosts.
pub type HostVarRevBank = RequestBank<HostVarRevIndex>;

#[derive(Debug, Default)]
pub struct AllIndex {
    map: SubscriptionMap,
}

impl AllIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentIndex for AllIndex {
    type KeySet = ();

    fn get(&self, _key_set: ()) -> Option<&SubscriptionMap> {
        if self.map.is_empty() {
            None
        } else {
            Some(&self.map)
        }
    }

    fn get_or_insert(&mut self, _key_set: ()) -> &mut SubscriptionMap {
        &mut self.map
    }

    fn remove_entry(&mut self, _key_set: (), client: ClientId) -> Option<NodeId> {
        self.map.remove(&client)
    }

    fn take_map(&mut self, _key_set: ()) -> Option<SubscriptionMap> {
        if self.map.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.map))
        }
    }
}

#[derive(Debug)]
pub struct SingleKeyIndex {
    index: BucketIndex<SubscriptionMap>,
}

impl SingleKeyIndex {
    pub fn with_capacity(desired: u32) -> Self {
        Self {
            index: BucketIndex::with_capacity(desired),
        }
    }
}

impl ContentIndex for SingleKeyIndex {
    type KeySet = u32;

    fn get(&self, key: u32) -> Option<&SubscriptionMap> {
        self.index.get(key)
    }

    fn get_or_insert(&mut self, key: u32) -> &mut SubscriptionMap {
        self.index.get_or_insert_with(key, SubscriptionMap::new)
    }

    fn remove_entry(&mut self, key: u32, client: ClientId) -> Option<NodeId> {
        let map = self.index.get_mut(key)?;
        let handle = map.remove(&client)?;
        if map.is_empty() {
            self.index.remove(key);
        }
        Some(handle)
    }

    fn take_map(&mut self, key: u32) -> Option<SubscriptionMap> {
        self.index.remove(key)
    }
}

#[derive(Debug)]
pub struct HostVarIndex {
    index: BucketIndex<BTreeMap<NodeAddress, SubscriptionMap>>,
}

impl HostVarIndex {
    pub fn with_capacity(desired: u32) -> Self {
        Self {
            index: BucketIndex::with_capacity(desired),
        }
    }
}

impl ContentIndex for HostVarIndex {
    type KeySet = (NodeAddress, VariableId);

    fn get(&self, (host, var): Self::KeySet) -> Option<&SubscriptionMap> {
        self.index.get(var)?.get(&host)
    }

    fn get_or_insert(&mut self, (host, var): Self::KeySet) -> &mut SubscriptionMap {
        self.index
            .get_or_insert_with(var, BTreeMap::new)
            .entry(host)
            .or_default()
    }

    fn remove_entry(&mut self, (host, var): Self::KeySet, client: ClientId) -> Option<NodeId> {
        let inner = self.index.get_mut(var)?;
        let map = inner.get_mut(&host)?;
        let handle = map.remove(&client)?;
        if map.is_empty() {
            inner.remove(&host);
            if inner.is_empty() {
                self.index.remove(var);
            }
        }
        Some(handle)
    }

    fn take_map(&mut self, (host, var): Self::KeySet) -> Option<SubscriptionMap> {
        let inner = self.index.get_mut(var)?;
        let map = inner.remove(&host);
        if inner.is_empty() {
            self.index.remove(var);
        }
        map
    }
}

#[derive(Debug)]
pub struct VarRevIndex {
    index: BucketIndex<BTreeMap<Revision, SubscriptionMap>>,
}

impl VarRevIndex {
    pub fn with_capacity(desired: u32) -> Self {
        Self {
            index: BucketIndex::with_capacity(desired),
        }
    }
}

impl ContentIndex for VarRevIndex {
    type KeySet = (VariableId, Revision);

    fn get(&self, (var, rev): Self::KeySet) -> Option<&SubscriptionMap> {
        self.index.get(var)?.get(&rev)
    }

    fn get_or_insert(&mut self, (var, rev): Self::KeySet) -> &mut SubscriptionMap {
        self.index
            .get_or_insert_with(var, BTreeMap::new)
            .entry(rev)
            .or_default()
    }

    fn remove_entry(&mut self, (var, rev): Self::KeySet, client: ClientId) -> Option<NodeId> {
        let inner = self.index.get_mut(var)?;
        let map = inner.get_mut(&rev)?;
        let handle = map.remove(&client)?;
        if map.is_empty() {
            inner.remove(&rev);
            if inner.is_empty() {
                self.index.remove(var);
            }
        }
        Some(handle)
    }

    fn take_map(&mut self, (var, rev): Self::KeySet) -> Option<SubscriptionMap> {
        let inner = self.index.get_mut(var)?;
        let map = inner.remove(&rev);
        if inner.is_empty() {
            self.index.remove(var);
        }
        map
    }
}

#[derive(Debug)]
pub struct HostVarRevIndex {
    index: BucketIndex<BTreeMap<(NodeAddress, Revision), SubscriptionMap>>,
}

impl HostVarRevIndex {
    pub fn with_capacity(desired: u32) -> Self {
        Self {
            index: BucketIndex::with_capacity(desired),
        }
    }
}

impl ContentIndex for HostVarRevIndex {
    type KeySet = (NodeAddress, VariableId, Revision);

    fn get(&self, (host, var, rev): Self::KeySet) -> Option<&SubscriptionMap> {
        self.index.get(var)?.get(&(host, rev))
    }

    fn get_or_insert(&mut self, (host, var, rev): Self::KeySet) -> &mut SubscriptionMap {
        self.index
            .get_or_insert_with(var, BTreeMap::new)
            .entry((host, rev))
            .or_default()
    }

    fn remove_entry(
        &mut self,
        (host, var, rev): Self::KeySet,
        client: ClientId,
    ) -> Option<NodeId> {
        let inner = self.index.get_mut(var)?;
        let map = inner.get_mut(&(host, rev))?;
        let handle = map.remove(&client)?;
        if map.is_empty() {
            inner.remove(&(host, rev));
            if inner.is_empty() {
                self.index.remove(var);
            }
        }
        Some(handle)
    }

    fn take_map(&mut self, (host, var, rev): Self::KeySet) -> Option<SubscriptionMap> {
        let inner = self.index.get_mut(var)?;
        let map = inner.remove(&(host, rev));
        if inner.is_empty() {
            self.index.remove(var);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::QuotaLedger;

    fn ledger() -> QuotaLedger {
        QuotaLedger::new(8, 8, 8)
    }

    #[test]
    fn all_index_reports_presence_honestly() {
        let mut bank = AllBank::new(AllIndex::new());
        let mut ledger = ledger();
        assert!(!bank.contains_key(()));
        bank.add((), 3, 100, false, &mut ledger).expect("add");
        assert!(bank.contains_key(()));
        assert_eq!(bank.remove_by_key((), &mut ledger), vec![3]);
        assert!(!bank.contains_key(()));
    }

    #[test]
    fn host_var_evicts_empty_layers() {
        let mut bank = HostVarBank::new(HostVarIndex::with_capacity(16));
        let mut ledger = ledger();
        bank.add((5, 7), 1, 100, false, &mut ledger).expect("add");
        bank.add((6, 7), 2, 100, false, &mut ledger).expect("add");
        assert!(bank.remove((5, 7), 1, &mut ledger));
        // Same variable, different host: the var layer must survive.
        assert!(bank.contains((6, 7), 2));
        assert!(!bank.contains_key((5, 7)));
        assert!(bank.remove((6, 7), 2, &mut ledger));
        assert!(!bank.contains_key((6, 7)));
        assert!(bank.is_empty());
    }

    #[test]
    fn var_rev_distinguishes_revisions() {
        let mut bank = VarRevBank::new(VarRevIndex::with_capacity(16));
        let mut ledger = ledger();
        bank.add((9, 4), 1, 100, false, &mut ledger).expect("add");
        bank.add((9, 5), 1, 100, false, &mut ledger).expect("add");
        assert_eq!(bank.remove_by_key((9, 4), &mut ledger), vec![1]);
        assert!(bank.contains((9, 5), 1));
        assert_eq!(ledger.outstanding(1), (1, 0));
    }

    #[test]
    fn host_var_rev_keys_on_the_full_triple() {
        let mut bank = HostVarRevBank::new(HostVarRevIndex::with_capacity(16));
        let mut ledger = ledger();
        bank.add((2, 9, 4), 1, 100, true, &mut ledger).expect("add");
        bank.add((3, 9, 4), 2, 100, true, &mut ledger).expect("add");
        assert_eq!(bank.remove_by_key((2, 9, 4), &mut ledger), vec![1]);
        assert!(bank.contains((3, 9, 4), 2));
        assert_eq!(ledger.outstanding(1), (0, 0));
        assert_eq!(ledger.outstanding(2), (0, 1));
    }

    #[test]
    fn colliding_vars_stay_separate() {
        // 3 and 16 collide in a 13-bucket table.
        let mut bank = SingleKeyBank::new(SingleKeyIndex::with_capacity(13));
        let mut ledger = ledger();
        bank.add(3, 1, 100, false, &mut ledger).expect("add");
        bank.add(16, 2, 100, false, &mut ledger).expect("add");
        assert_eq!(bank.subscribers(3), vec![1]);
        assert_eq!(bank.subscribers(16), vec![2]);
    }
}

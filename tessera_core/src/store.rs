//! The arbitrator-local object store.
//!
//! Objects are kept in an ordered map keyed by [`ObjectId`]; nothing outside
//! the store holds a reference to an object across ticks. Alongside the map
//! live the ownership set, the update-time index that drives expiry, the
//! in-transit records of outstanding handovers and the claim countdowns for
//! orphaned objects in this region.

use crate::config::ReplicationConfig;
use crate::entity::{Object, ObjectId};
use std::collections::{BTreeMap, BTreeSet};
use tessera_env::{NodeId, Tick};

/// An outstanding ownership handover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRecord {
    pub obj_id: ObjectId,
    pub new_owner: NodeId,
    pub old_owner: NodeId,
    /// Tick at which the sender reclaims if no ack has arrived
    pub deadline: Tick,
}

/// What [`ObjectStore::expire`] did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expiry {
    /// Owned objects forced to resend their position
    pub refreshed: Vec<ObjectId>,
    /// Replicas tombstoned because their owner went quiet
    pub tombstoned: Vec<ObjectId>,
}

#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: BTreeMap<ObjectId, Object>,
    owned: BTreeSet<ObjectId>,
    updated: BTreeMap<ObjectId, Tick>,
    in_transit: BTreeMap<ObjectId, TransferRecord>,
    claims: BTreeMap<ObjectId, u32>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object. Returns `false` (and changes nothing) if the id is
    /// already present.
    pub fn insert(&mut self, obj: Object, owned: bool, now: Tick) -> bool {
        let id = obj.id();
        if self.objects.contains_key(&id) {
            return false;
        }
        self.objects.insert(id, obj);
        self.updated.insert(id, now);
        if owned {
            self.owned.insert(id);
        }
        true
    }

    /// Physically removes an object and every record about it.
    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        self.owned.remove(&id);
        self.updated.remove(&id);
        self.in_transit.remove(&id);
        self.claims.remove(&id);
        self.objects.remove(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.objects.values_mut()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn is_owner(&self, id: ObjectId) -> bool {
        self.owned.contains(&id)
    }

    /// Adds or removes `id` from the ownership set. Unknown ids are ignored.
    pub fn set_owned(&mut self, id: ObjectId, owned: bool) {
        if !self.objects.contains_key(&id) {
            return;
        }
        if owned {
            self.owned.insert(id);
        } else {
            self.owned.remove(&id);
        }
    }

    pub fn owned_ids(&self) -> Vec<ObjectId> {
        self.owned.iter().copied().collect()
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    /// Records that the object was just updated.
    pub fn touch(&mut self, id: ObjectId, now: Tick) {
        if let Some(at) = self.updated.get_mut(&id) {
            *at = now;
        }
    }

    pub fn last_update(&self, id: ObjectId) -> Option<Tick> {
        self.updated.get(&id).copied()
    }

    /// Applies the idle-object rules.
    ///
    /// Owned objects idle for half the expiry threshold get their position
    /// marked dirty so the next diff refreshes every replica. Replicas idle
    /// for the full threshold are tombstoned: their owner is presumed dead.
    pub fn expire(&mut self, now: Tick, config: &ReplicationConfig) -> Expiry {
        let mut expiry = Expiry::default();
        for (id, at) in self.updated.iter_mut() {
            let idle = now.saturating_sub(*at);
            let Some(obj) = self.objects.get_mut(id) else {
                continue;
            };
            if self.owned.contains(id) {
                if idle >= config.refresh_threshold() {
                    obj.pos_dirty = true;
                    *at = now;
                    expiry.refreshed.push(*id);
                }
            } else if idle >= config.expiring_object_threshold && obj.is_alive() {
                obj.mark_deleted();
                expiry.tombstoned.push(*id);
            }
        }
        expiry
    }

    // ------------------------------------------------------------------------
    // Handover bookkeeping
    // ------------------------------------------------------------------------

    pub fn begin_transit(&mut self, record: TransferRecord) {
        self.in_transit.insert(record.obj_id, record);
    }

    pub fn end_transit(&mut self, id: ObjectId) -> Option<TransferRecord> {
        self.in_transit.remove(&id)
    }

    pub fn transit(&self, id: ObjectId) -> Option<&TransferRecord> {
        self.in_transit.get(&id)
    }

    pub fn transit_count(&self) -> usize {
        self.in_transit.len()
    }

    /// Handovers whose deadline has passed.
    pub fn overdue_transits(&self, now: Tick) -> Vec<TransferRecord> {
        self.in_transit
            .values()
            .filter(|record| now >= record.deadline)
            .copied()
            .collect()
    }

    /// Starts a claim countdown unless one is already running.
    pub fn start_claim(&mut self, id: ObjectId, ticks: u32) {
        self.claims.entry(id).or_insert(ticks);
    }

    pub fn cancel_claim(&mut self, id: ObjectId) -> bool {
        self.claims.remove(&id).is_some()
    }

    pub fn claim_pending(&self, id: ObjectId) -> bool {
        self.claims.contains_key(&id)
    }

    /// Decrements every claim countdown and returns the ids reaching zero.
    /// Those claims are removed.
    pub fn tick_claims(&mut self) -> Vec<ObjectId> {
        let mut due = Vec::new();
        self.claims.retain(|id, remaining| {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                due.push(*id);
                false
            } else {
                true
            }
        });
        due
    }

    /// Empties the store, returning every object it held.
    pub fn drain(&mut self) -> Vec<Object> {
        self.owned.clear();
        self.updated.clear();
        self.in_transit.clear();
        self.claims.clear();
        std::mem::take(&mut self.objects).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_env::Position;

    fn obj(n: u16) -> Object {
        Object::new(ObjectId::compose(NodeId(2), n), Position::new(n as f64, 0.0), NodeId::UNASSIGNED)
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut store = ObjectStore::new();
        assert!(store.insert(obj(1), true, 0));
        assert!(!store.insert(obj(1), false, 5));
        assert!(store.is_owner(obj(1).id()));
        assert_eq!(store.last_update(obj(1).id()), Some(0));
    }

    #[test]
    fn test_remove_clears_all_records() {
        let mut store = ObjectStore::new();
        let id = obj(1).id();
        store.insert(obj(1), true, 0);
        store.begin_transit(TransferRecord {
            obj_id: id,
            new_owner: NodeId(3),
            old_owner: NodeId(2),
            deadline: 5,
        });
        store.start_claim(id, 3);

        assert!(store.remove(id).is_some());
        assert!(!store.is_owner(id));
        assert_eq!(store.transit_count(), 0);
        assert!(!store.claim_pending(id));
        assert!(store.last_update(id).is_none());
    }

    #[test]
    fn test_expire_refreshes_owned_and_tombstones_replicas() {
        let config = ReplicationConfig::default();
        let mut store = ObjectStore::new();
        let owned = obj(1);
        let replica = obj(2);
        let (owned_id, replica_id) = (owned.id(), replica.id());
        store.insert(owned, true, 0);
        store.insert(replica, false, 0);
        store.iter_mut().for_each(|o| o.reset_dirty());

        let expiry = store.expire(29, &config);
        assert_eq!(expiry, Expiry::default());

        let expiry = store.expire(30, &config);
        assert_eq!(expiry.refreshed, vec![owned_id]);
        assert!(store.get(owned_id).unwrap().pos_dirty);
        assert!(store.get(replica_id).unwrap().is_alive());

        let expiry = store.expire(60, &config);
        assert_eq!(expiry.tombstoned, vec![replica_id]);
        assert!(!store.get(replica_id).unwrap().is_alive());
        assert_eq!(expiry.refreshed, vec![owned_id]);
    }

    #[test]
    fn test_touch_postpones_expiry() {
        let config = ReplicationConfig::default();
        let mut store = ObjectStore::new();
        let id = obj(1).id();
        store.insert(obj(1), false, 0);
        store.touch(id, 50);
        assert!(store.expire(60, &config).tombstoned.is_empty());
        assert_eq!(store.expire(110, &config).tombstoned, vec![id]);
    }

    #[test]
    fn test_overdue_transits() {
        let mut store = ObjectStore::new();
        let id = obj(1).id();
        store.insert(obj(1), false, 0);
        store.begin_transit(TransferRecord {
            obj_id: id,
            new_owner: NodeId(3),
            old_owner: NodeId(2),
            deadline: 5,
        });
        assert!(store.overdue_transits(4).is_empty());
        assert_eq!(store.overdue_transits(5).len(), 1);
        assert!(store.end_transit(id).is_some());
        assert!(store.end_transit(id).is_none());
    }

    #[test]
    fn test_claim_countdown() {
        let mut store = ObjectStore::new();
        let a = obj(1).id();
        let b = obj(2).id();
        store.start_claim(a, 1);
        store.start_claim(b, 2);
        store.start_claim(b, 9);

        assert_eq!(store.tick_claims(), vec![a]);
        assert_eq!(store.tick_claims(), vec![b]);
        assert!(store.tick_claims().is_empty());

        store.start_claim(a, 3);
        assert!(store.cancel_claim(a));
        assert!(!store.claim_pending(a));
    }

    #[test]
    fn test_set_owned_ignores_unknown() {
        let mut store = ObjectStore::new();
        store.set_owned(ObjectId(77), true);
        assert_eq!(store.owned_count(), 0);
    }
}

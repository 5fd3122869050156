//! The Interest Engine
//!
//! Decides, per connected peer and per neighboring arbitrator, which objects
//! it should hold, and turns store changes into create/update/delete traffic.
//!
//! # Who receives what
//!
//! ```text
//!                 +--------------------------+----------------------------+
//!                 | peer                     | neighbor arbitrator        |
//! +---------------+--------------------------+----------------------------+
//! | visibility    | dist <= aoi * buffer     | every object I own         |
//! | introduction  | full OBJECT + STATE once | full OBJECT + STATE once   |
//! | dirty diff    | if known and visible     | if I own it                |
//! | leaves view   | tombstone, forget        | (never)                    |
//! +---------------+--------------------------+----------------------------+
//! ```
//!
//! "Known" is tracked in [`Knowledge`]: the versions this node last sent to
//! each target. Nothing is ever resent to a target that already holds the
//! current version.
//!
//! A neighbor that loses its replica (expiry, a handover it cannot follow)
//! answers with a request-flagged OBJECT or STATE; the owner then forgets
//! that neighbor's knowledge and introduces the object again.

use crate::arbitrator::ArbitratorState;
use crate::entity::ObjectId;
use crate::logic::LogicNotice;
use crate::protocol::{KnownVersion, MessageTag, WireMessage};
use std::collections::{BTreeMap, BTreeSet};
use tessera_env::{Messaging, NodeId, Overlay, Storage};
use tracing::{debug, trace};

/// Versions of each object last sent to each target node.
#[derive(Debug, Default)]
pub struct Knowledge {
    by_node: BTreeMap<NodeId, BTreeMap<ObjectId, KnownVersion>>,
}

impl Knowledge {
    pub fn get(&self, node: NodeId, obj: ObjectId) -> Option<&KnownVersion> {
        self.by_node.get(&node).and_then(|known| known.get(&obj))
    }

    pub fn knows(&self, node: NodeId, obj: ObjectId) -> bool {
        self.get(node, obj).is_some()
    }

    pub fn record(&mut self, node: NodeId, version: KnownVersion) {
        self.by_node.entry(node).or_default().insert(version.obj_id, version);
    }

    pub fn forget(&mut self, node: NodeId, obj: ObjectId) -> bool {
        self.by_node
            .get_mut(&node)
            .is_some_and(|known| known.remove(&obj).is_some())
    }

    pub fn forget_node(&mut self, node: NodeId) {
        self.by_node.remove(&node);
    }

    /// Removes `obj` from every node's table.
    pub fn forget_object(&mut self, obj: ObjectId) {
        for known in self.by_node.values_mut() {
            known.remove(&obj);
        }
    }

    /// Replaces a node's table, e.g. with what a peer reported on ENTER.
    pub fn seed(&mut self, node: NodeId, versions: impl IntoIterator<Item = KnownVersion>) {
        let table = versions.into_iter().map(|v| (v.obj_id, v)).collect();
        self.by_node.insert(node, table);
    }

    /// Nodes currently holding `obj`.
    pub fn holders(&self, obj: ObjectId) -> Vec<NodeId> {
        self.by_node
            .iter()
            .filter(|(_, known)| known.contains_key(&obj))
            .map(|(node, _)| *node)
            .collect()
    }

    pub fn len_for(&self, node: NodeId) -> usize {
        self.by_node.get(&node).map_or(0, |known| known.len())
    }
}

/// Full encodes made at most once per object per pass, and the targets
/// that got one.
#[derive(Default)]
struct EncodeCache {
    full: BTreeMap<ObjectId, (Vec<u8>, Option<Vec<u8>>)>,
    introduced: BTreeSet<(NodeId, ObjectId)>,
}

impl<M: Messaging, O: Overlay, S: Storage> ArbitratorState<M, O, S> {
    /// Expiry, then visibility, then diffs. Expiry goes first so an object
    /// whose owner went quiet is tombstoned rather than introduced.
    pub(crate) fn replicate(&mut self) {
        let now = self.now();
        let expiry = self.store.expire(now, &self.config);
        for id in &expiry.tombstoned {
            debug!("{} tombstones idle replica {}", self.id(), id);
        }
        let mut cache = EncodeCache::default();
        self.update_interests(&mut cache);
        self.send_updates(&mut cache);
    }

    fn full_encode(&self, cache: &mut EncodeCache, id: ObjectId) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        if let Some(hit) = cache.full.get(&id) {
            return Some(hit.clone());
        }
        let obj = self.store.get(id)?;
        let pos = obj.encode_position(false, false)?.to_bytes();
        let state = match obj.encode_state(false) {
            Ok(state) => state.map(|msg| msg.to_bytes()),
            Err(err) => {
                debug!("{} cannot encode state of {}: {}", self.id(), id, err);
                None
            }
        };
        cache.full.insert(id, (pos.clone(), state.clone()));
        Some((pos, state))
    }

    /// Sends a full copy of `id` to `target` and records the knowledge.
    pub(crate) fn introduce(&mut self, target: NodeId, id: ObjectId) {
        let mut cache = EncodeCache::default();
        self.introduce_cached(&mut cache, target, id);
    }

    fn introduce_cached(&mut self, cache: &mut EncodeCache, target: NodeId, id: ObjectId) {
        let Some((pos, state)) = self.full_encode(cache, id) else {
            return;
        };
        self.send_bytes(target, MessageTag::Object, &pos, false);
        if let Some(state) = state {
            self.send_bytes(target, MessageTag::State, &state, false);
        }
        if let Some(obj) = self.store.get(id) {
            self.knowledge.record(target, obj.known_version());
        }
        cache.introduced.insert((target, id));
    }

    /// Visibility pass: introduce newly visible objects, retire invisible ones.
    fn update_interests(&mut self, cache: &mut EncodeCache) {
        let multiplier = self.config.aoi_buffer_multiplier;

        let peers: Vec<_> = self.peers.values().cloned().collect();
        for peer in &peers {
            let mut introduce = Vec::new();
            let mut retire = Vec::new();
            for obj in self.store.iter().filter(|o| o.is_alive()) {
                let known = self.knowledge.get(peer.id, obj.id());
                if peer.covers(obj.pos(), multiplier) || obj.peer == peer.id {
                    let stale = known.is_some_and(|k| {
                        !obj.is_dirty() && (k.pos_version < obj.pos_version || k.version < obj.version)
                    });
                    if known.is_none() || stale {
                        introduce.push(obj.id());
                    }
                } else if known.is_some() {
                    retire.push(obj.id());
                }
            }

            for id in introduce {
                trace!("{} introduces {} to peer {}", self.id(), id, peer.id);
                self.introduce_cached(cache, peer.id, id);
            }
            for id in retire {
                let tombstone = self
                    .store
                    .get(id)
                    .and_then(|obj| obj.encode_position(false, true))
                    .map(|msg| msg.to_bytes());
                if let Some(bytes) = tombstone {
                    self.send_bytes(peer.id, MessageTag::Object, &bytes, false);
                }
                self.knowledge.forget(peer.id, id);
            }
        }

        let neighbors: Vec<NodeId> = self.neighbors.keys().copied().collect();
        for owned in self.store.owned_ids() {
            let alive = self.store.get(owned).is_some_and(|o| o.is_alive());
            if !alive {
                continue;
            }
            for &neighbor in &neighbors {
                if !self.knowledge.knows(neighbor, owned) {
                    self.introduce_cached(cache, neighbor, owned);
                }
            }
        }
    }

    /// Diff pass: fan out every dirty object, then retire tombstones.
    /// Targets introduced earlier in the pass already hold the full copy.
    fn send_updates(&mut self, cache: &mut EncodeCache) {
        let now = self.now();
        let multiplier = self.config.aoi_buffer_multiplier;
        let mut deleted = Vec::new();

        for id in self.store.ids() {
            let Some(obj) = self.store.get(id) else {
                continue;
            };
            let owned = self.store.is_owner(id);

            if !obj.is_alive() {
                let Some(mut msg) = obj.encode_position(false, true) else {
                    continue;
                };
                let tombstone = msg.to_bytes();
                msg.is_request = true;
                let dropped = msg.to_bytes();
                let avatar_peer = obj.peer;
                for holder in self.knowledge.holders(id) {
                    let is_neighbor = self.neighbors.contains_key(&holder);
                    if holder == avatar_peer && !is_neighbor {
                        continue;
                    }
                    if is_neighbor && !owned {
                        // the owner must not count on my copy any more
                        self.send_bytes(holder, MessageTag::Object, &dropped, false);
                        continue;
                    }
                    self.send_bytes(holder, MessageTag::Object, &tombstone, false);
                }
                deleted.push(id);
                continue;
            }

            if !obj.is_dirty() {
                continue;
            }

            let pos_diff = obj.encode_position(true, false).map(|m| m.to_bytes());
            let state_diff = match obj.encode_state(true) {
                Ok(state) => state.map(|m| m.to_bytes()),
                Err(err) => {
                    debug!("{} cannot encode diff of {}: {}", self.id(), id, err);
                    None
                }
            };
            let current = obj.known_version();
            let obj_pos = *obj.pos();
            let avatar_peer = obj.peer;

            if obj.pos_dirty {
                self.notices.push_back(LogicNotice::PosChanged {
                    id,
                    pos: obj_pos,
                    version: obj.pos_version,
                });
            }
            for (index, value) in obj.attributes().dirty_slots() {
                self.notices.push_back(LogicNotice::StateUpdated {
                    id,
                    index,
                    value: value.clone(),
                    version: obj.version,
                });
            }

            let mut targets: Vec<NodeId> = self
                .peers
                .values()
                .filter(|peer| self.knowledge.knows(peer.id, id))
                .filter(|peer| peer.covers(&obj_pos, multiplier) || avatar_peer == peer.id)
                .map(|peer| peer.id)
                .collect();

            if owned {
                let neighbors: Vec<NodeId> = self.neighbors.keys().copied().collect();
                for neighbor in neighbors {
                    if self.knowledge.knows(neighbor, id) {
                        targets.push(neighbor);
                    } else {
                        self.introduce_cached(cache, neighbor, id);
                    }
                }
            }

            targets.retain(|target| !cache.introduced.contains(&(*target, id)));
            for target in targets {
                if let Some(bytes) = &pos_diff {
                    self.send_bytes(target, MessageTag::Object, bytes, false);
                }
                if let Some(bytes) = &state_diff {
                    self.send_bytes(target, MessageTag::State, bytes, false);
                }
                self.knowledge.record(target, current);
            }
            self.store.touch(id, now);
        }

        for obj in self.store.iter_mut() {
            obj.reset_dirty();
        }

        for id in deleted {
            if self.store.remove(id).is_some() {
                self.knowledge.forget_object(id);
                self.avatar_countdowns.remove(&id);
                self.notices.push_back(LogicNotice::Deleted(id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(obj: u64, pos_version: u32, version: u32) -> KnownVersion {
        KnownVersion {
            obj_id: ObjectId(obj),
            pos_version,
            version,
        }
    }

    #[test]
    fn test_record_and_forget() {
        let mut knowledge = Knowledge::default();
        knowledge.record(NodeId(5), version(1, 1, 1));
        knowledge.record(NodeId(6), version(1, 1, 1));
        knowledge.record(NodeId(5), version(2, 3, 4));

        assert!(knowledge.knows(NodeId(5), ObjectId(2)));
        assert_eq!(knowledge.get(NodeId(5), ObjectId(2)).unwrap().version, 4);
        assert_eq!(knowledge.holders(ObjectId(1)), vec![NodeId(5), NodeId(6)]);

        assert!(knowledge.forget(NodeId(5), ObjectId(1)));
        assert!(!knowledge.forget(NodeId(5), ObjectId(1)));
        assert_eq!(knowledge.holders(ObjectId(1)), vec![NodeId(6)]);

        knowledge.forget_object(ObjectId(1));
        assert!(knowledge.holders(ObjectId(1)).is_empty());
    }

    #[test]
    fn test_seed_replaces_table() {
        let mut knowledge = Knowledge::default();
        knowledge.record(NodeId(5), version(1, 1, 1));
        knowledge.seed(NodeId(5), vec![version(7, 2, 2)]);

        assert!(!knowledge.knows(NodeId(5), ObjectId(1)));
        assert!(knowledge.knows(NodeId(5), ObjectId(7)));
        assert_eq!(knowledge.len_for(NodeId(5)), 1);

        knowledge.forget_node(NodeId(5));
        assert_eq!(knowledge.len_for(NodeId(5)), 0);
    }
}

//! Sample world logic hosted by simulated nodes.
//!
//! Arbitrators run [`WorldLogic`]: joins are resolved through storage, every
//! avatar gets a health and a name slot, MOVE events walk avatars and PING
//! events wear health down. Peers run [`ObserverLogic`], which only counts
//! what it is told.

use serde::Serialize;
use std::collections::BTreeMap;
use tessera_core::{ArbitratorApi, ArbitratorLogic, AttrValue, AttributeList, Event, Object, ObjectId, PeerLogic};
use tessera_env::{NodeDescriptor, NodeId, Position, QueryId, Tick};
use tracing::{debug, trace};

/// Event kind: move the sender's avatar by `(dx, dy)`.
pub const MOVE: u8 = 1;

/// Event kind: no movement; the sender's avatar loses one health point.
pub const PING: u8 = 2;

pub const HEALTH_SLOT: usize = 0;
pub const NAME_SLOT: usize = 1;
pub const FULL_HEALTH: i32 = 100;

/// Storage key under which a peer's profile is kept.
pub fn profile_key(peer: NodeId) -> Vec<u8> {
    format!("peer-{}", peer.as_u64()).into_bytes()
}

/// Builds the attributes of a MOVE event.
pub fn move_attributes(dx: f32, dy: f32) -> AttributeList {
    let mut attrs = AttributeList::new();
    attrs.add(dx);
    attrs.add(dy);
    attrs
}

/// One event as applied by one arbitrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppliedEvent {
    /// Tick at which the arbitrator applied it
    pub tick: Tick,
    pub timestamp: Tick,
    pub sender: NodeId,
    pub id: u64,
    pub kind: u8,
}

/// Arbitrator-side logic of the simulated world.
#[derive(Debug, Default)]
pub struct WorldLogic {
    /// Every event this arbitrator applied, in application order
    pub applied: Vec<AppliedEvent>,

    /// Load reported per attached peer each tick (0 disables load reports)
    pub load_per_peer: u32,

    /// Auth bytes of joiners waiting on storage
    pending: BTreeMap<NodeId, Vec<u8>>,
    pub created: u64,
    pub discovered: u64,
    pub deleted: u64,
}

impl WorldLogic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_per_peer(mut self, load: u32) -> Self {
        self.load_per_peer = load;
        self
    }

    fn owned_avatar(api: &dyn ArbitratorApi, peer: NodeId) -> Option<ObjectId> {
        api.avatar_of(peer).filter(|id| api.is_owner(*id))
    }

    fn apply_move(api: &mut dyn ArbitratorApi, avatar: ObjectId, event: &Event) {
        let attrs = match event.attributes() {
            Ok(attrs) => attrs,
            Err(err) => {
                debug!("{} drops malformed MOVE {:X}: {}", api.self_id(), event.id, err);
                return;
            }
        };
        let (Ok(dx), Ok(dy)) = (attrs.get::<f32>(0), attrs.get::<f32>(1)) else {
            debug!("{} drops MOVE {:X} without a delta", api.self_id(), event.id);
            return;
        };
        let Some(pos) = api.object(avatar).map(|obj| *obj.pos()) else {
            return;
        };
        let target = Position::new(pos.x + dx as f64, pos.y + dy as f64);
        api.change_pos(avatar, target);
    }

    fn apply_ping(api: &mut dyn ArbitratorApi, avatar: ObjectId) {
        let health = api
            .object(avatar)
            .and_then(|obj| obj.attributes().get::<i32>(HEALTH_SLOT).ok())
            .unwrap_or(FULL_HEALTH);
        let next = if health <= 1 { FULL_HEALTH } else { health - 1 };
        api.update_obj(avatar, HEALTH_SLOT, AttrValue::Int(next));
    }
}

impl ArbitratorLogic for WorldLogic {
    fn join_requested(&mut self, api: &mut dyn ArbitratorApi, peer: &NodeDescriptor, auth: &[u8]) {
        debug!("{} looks up the profile of {}", api.self_id(), peer.id);
        self.pending.insert(peer.id, auth.to_vec());
        api.query_storage(&profile_key(peer.id), peer.id);
    }

    fn reply_received(&mut self, api: &mut dyn ArbitratorApi, _query: QueryId, joiner: Option<NodeId>, reply: &[u8]) {
        let Some(joiner) = joiner else {
            return;
        };
        let auth = self.pending.remove(&joiner).unwrap_or_default();
        let init = if reply.is_empty() { auth } else { reply.to_vec() };
        api.insert_peer(joiner, &init);
    }

    fn obj_created(&mut self, api: &mut dyn ArbitratorApi, id: ObjectId, init: &[u8]) {
        self.created += 1;
        let name = match std::str::from_utf8(init) {
            Ok(name) if !name.is_empty() => name.to_owned(),
            _ => format!("npc-{}", id),
        };
        api.add_attr(id, AttrValue::Int(FULL_HEALTH));
        api.add_attr(id, AttrValue::Text(name));
    }

    fn obj_discovered(&mut self, _obj: &Object) {
        self.discovered += 1;
    }

    fn obj_deleted(&mut self, _id: ObjectId) {
        self.deleted += 1;
    }

    fn event_received(&mut self, api: &mut dyn ArbitratorApi, event: &Event) {
        self.applied.push(AppliedEvent {
            tick: api.now(),
            timestamp: event.timestamp,
            sender: event.sender,
            id: event.id,
            kind: event.kind,
        });

        let Some(avatar) = Self::owned_avatar(api, event.sender) else {
            trace!("{} applies {:X} without owning the sender's avatar", api.self_id(), event.id);
            return;
        };
        match event.kind {
            MOVE => Self::apply_move(api, avatar, event),
            PING => Self::apply_ping(api, avatar),
            other => debug!("{} ignores event kind {}", api.self_id(), other),
        }
    }

    fn tick(&mut self, api: &mut dyn ArbitratorApi) {
        if self.load_per_peer > 0 {
            let load = self.load_per_peer.saturating_mul(api.peers().len() as u32).min(100);
            api.report_load(load);
        }
    }
}

/// Peer-side logic: counts callbacks.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ObserverLogic {
    pub discovered: u64,
    pub deleted: u64,
    pub moves: u64,
    pub state_updates: u64,
    /// The peer saw its own avatar
    pub saw_self: bool,
}

impl PeerLogic for ObserverLogic {
    fn obj_discovered(&mut self, _obj: &Object, is_self: bool) {
        self.discovered += 1;
        self.saw_self |= is_self;
    }

    fn obj_deleted(&mut self, _id: ObjectId) {
        self.deleted += 1;
    }

    fn state_updated(&mut self, _id: ObjectId, _index: usize, _value: &AttrValue, _version: u32) {
        self.state_updates += 1;
    }

    fn pos_changed(&mut self, _id: ObjectId, _pos: &Position, _version: u32) {
        self.moves += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_key() {
        assert_eq!(profile_key(NodeId(107)), b"peer-107".to_vec());
    }

    #[test]
    fn test_move_attributes_round_trip_through_event() {
        let attrs = move_attributes(1.5, -2.0);
        let event = Event::new(NodeId(100), 0x640001, 3, MOVE, &attrs).unwrap();
        let back = event.attributes().unwrap();
        assert_eq!(back.get::<f32>(0).unwrap(), 1.5);
        assert_eq!(back.get::<f32>(1).unwrap(), -2.0);
    }

    #[test]
    fn test_observer_counts() {
        let mut logic = ObserverLogic::default();
        let obj = Object::new(ObjectId(0x10001), Position::origin(), NodeId(100));
        logic.obj_discovered(&obj, true);
        logic.pos_changed(obj.id(), obj.pos(), 2);
        logic.obj_deleted(obj.id());

        assert!(logic.saw_self);
        assert_eq!((logic.discovered, logic.moves, logic.deleted), (1, 1, 1));
    }
}

//! Application logic seams.
//!
//! The core never interprets attribute values. Whatever a world means by
//! "hit points" or "open door" lives behind these traits, injected when the
//! node is built. Callbacks run inside the owning node's tick, one at a time.

use crate::attributes::AttrValue;
use crate::entity::{Event, Object, ObjectId};
use tessera_env::{NodeDescriptor, NodeId, Position, QueryId, Tick};

/// What arbitrator logic may ask of its arbitrator.
///
/// Mutations are restricted to owned objects; calls on anything else return
/// `false`/`None` and change nothing.
pub trait ArbitratorApi {
    fn self_id(&self) -> NodeId;

    fn now(&self) -> Tick;

    /// Mints an owned object. `init` is handed back through
    /// [`ArbitratorLogic::obj_created`].
    fn create_obj(&mut self, pos: Position, peer: NodeId, init: &[u8]) -> ObjectId;

    /// Tombstones an owned object.
    fn delete_obj(&mut self, id: ObjectId) -> bool;

    /// Appends an attribute slot to an owned object.
    fn add_attr(&mut self, id: ObjectId, value: AttrValue) -> Option<usize>;

    /// Overwrites an attribute of an owned object and bumps its state version.
    fn update_obj(&mut self, id: ObjectId, index: usize, value: AttrValue) -> bool;

    /// Moves an owned, live object and bumps its position version.
    fn change_pos(&mut self, id: ObjectId, pos: Position) -> bool;

    fn object(&self, id: ObjectId) -> Option<&Object>;

    fn object_ids(&self) -> Vec<ObjectId>;

    fn is_owner(&self, id: ObjectId) -> bool;

    /// The avatar object of a peer, if this arbitrator stores one.
    fn avatar_of(&self, peer: NodeId) -> Option<ObjectId>;

    fn peers(&self) -> Vec<NodeDescriptor>;

    /// Admits a peer whose JOIN was reported through
    /// [`ArbitratorLogic::join_requested`].
    fn insert_peer(&mut self, peer: NodeId, init: &[u8]) -> bool;

    /// Reports a load level (0-100). Crossing the configured thresholds raises
    /// overload or underload signals.
    fn report_load(&mut self, load: u32);

    fn overload(&mut self, level: u32);

    fn underload(&mut self, level: u32);

    /// Forwards a query to the backing store on behalf of a joiner.
    fn query_storage(&mut self, request: &[u8], on_behalf_of: NodeId) -> QueryId;

    fn respond_storage(&mut self, query: QueryId, reply: &[u8]) -> bool;
}

/// Application behaviour running on an arbitrator.
pub trait ArbitratorLogic {
    /// A peer asked to join through this arbitrator (gateway only).
    ///
    /// Accept by calling [`ArbitratorApi::insert_peer`], now or after a
    /// storage round trip.
    fn join_requested(&mut self, api: &mut dyn ArbitratorApi, peer: &NodeDescriptor, auth: &[u8]);

    /// A freshly created object wants its initial attributes.
    fn obj_created(&mut self, _api: &mut dyn ArbitratorApi, _id: ObjectId, _init: &[u8]) {}

    /// A replica arrived from a neighbor.
    fn obj_discovered(&mut self, _obj: &Object) {}

    /// An object left the store.
    fn obj_deleted(&mut self, _id: ObjectId) {}

    fn state_updated(&mut self, _id: ObjectId, _index: usize, _value: &AttrValue, _version: u32) {}

    fn pos_changed(&mut self, _id: ObjectId, _pos: &Position, _version: u32) {}

    /// Events are delivered in `(timestamp, sender)` order.
    fn event_received(&mut self, api: &mut dyn ArbitratorApi, event: &Event);

    /// Once per tick, after events and before replication.
    fn tick(&mut self, _api: &mut dyn ArbitratorApi) {}

    /// A storage reply, with the joiner the query was made for.
    fn reply_received(
        &mut self,
        _api: &mut dyn ArbitratorApi,
        _query: QueryId,
        _joiner: Option<NodeId>,
        _reply: &[u8],
    ) {
    }
}

/// Application behaviour running on a peer. Every callback is passive.
pub trait PeerLogic {
    /// An object entered the peer's view. `is_self` marks the peer's avatar.
    fn obj_discovered(&mut self, _obj: &Object, _is_self: bool) {}

    fn obj_deleted(&mut self, _id: ObjectId) {}

    fn state_updated(&mut self, _id: ObjectId, _index: usize, _value: &AttrValue, _version: u32) {}

    fn pos_changed(&mut self, _id: ObjectId, _pos: &Position, _version: u32) {}
}

/// Callback deferred until the arbitrator is free to hand itself to logic.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LogicNotice {
    JoinRequested { peer: NodeDescriptor, auth: Vec<u8> },
    Created { id: ObjectId, init: Vec<u8> },
    Discovered(ObjectId),
    Deleted(ObjectId),
    StateUpdated { id: ObjectId, index: usize, value: AttrValue, version: u32 },
    PosChanged { id: ObjectId, pos: Position, version: u32 },
    Reply { query: QueryId, joiner: Option<NodeId>, reply: Vec<u8> },
}

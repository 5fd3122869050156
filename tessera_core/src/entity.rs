//! Replicated entities: objects and events.
//!
//! An [`Object`] is identical on its owner and on every replica; ownership is
//! a relation kept by the store, not a property of the object. Two version
//! counters guard the two halves of an object independently:
//!
//! - `pos_version` guards position and owning peer (`0` = tombstone)
//! - `version` guards the attribute list
//!
//! In both cases a higher version wins and anything else is dropped.

use crate::attributes::AttributeList;
use crate::error::CodecError;
use crate::protocol::{KnownVersion, ObjectMsg, StateMsg};
use serde::{Deserialize, Serialize};
use tessera_env::{NodeId, Position, Tick};

/// Globally unique object id: creating arbitrator in the high bits, a
/// per-arbitrator counter in the low 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub fn compose(creator: NodeId, counter: u16) -> Self {
        Self((creator.as_u64() << 16) | counter as u64)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The arbitrator that minted this id.
    pub fn creator(&self) -> NodeId {
        NodeId(self.0 >> 16)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// A replicated piece of world state.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    id: ObjectId,
    pos: Position,
    /// Peer whose avatar this is, or `UNASSIGNED`
    pub peer: NodeId,
    pub pos_version: u32,
    pub version: u32,
    pub pos_dirty: bool,
    alive: bool,
    attributes: AttributeList,
}

impl Object {
    /// A freshly minted object: both versions at 1 and everything dirty.
    pub fn new(id: ObjectId, pos: Position, peer: NodeId) -> Self {
        Self {
            id,
            pos,
            peer,
            pos_version: 1,
            version: 1,
            pos_dirty: true,
            alive: true,
            attributes: AttributeList::new(),
        }
    }

    /// A replica first seen through an OBJECT message.
    ///
    /// The state version starts at 0 so the first STATE always applies.
    pub fn from_position(msg: &ObjectMsg) -> Self {
        Self {
            id: msg.obj_id,
            pos: msg.pos,
            peer: msg.peer,
            pos_version: msg.pos_version,
            version: 0,
            pos_dirty: true,
            alive: true,
            attributes: AttributeList::new(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn pos(&self) -> &Position {
        &self.pos
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn attributes(&self) -> &AttributeList {
        &self.attributes
    }

    /// Mutable access for the owner. Callers bump `version` themselves.
    pub(crate) fn attributes_mut(&mut self) -> &mut AttributeList {
        &mut self.attributes
    }

    /// Moves the object and marks the position dirty. Does not bump
    /// `pos_version`.
    pub fn set_pos(&mut self, pos: Position) {
        self.pos = pos;
        self.pos_dirty = true;
    }

    /// Logically deletes the object. It stays resident until the tombstone
    /// has been sent.
    pub fn mark_deleted(&mut self) {
        self.alive = false;
        self.pos_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.pos_dirty || self.attributes.is_dirty()
    }

    pub fn reset_dirty(&mut self) {
        self.pos_dirty = false;
        self.attributes.reset_dirty();
    }

    pub fn known_version(&self) -> KnownVersion {
        KnownVersion {
            obj_id: self.id,
            pos_version: self.pos_version,
            version: self.version,
        }
    }

    /// Encodes the position half.
    ///
    /// # Arguments
    /// * `dirty_only` - return `None` when the position has not changed
    /// * `as_delete` - send `pos_version = 0` (tombstone)
    pub fn encode_position(&self, dirty_only: bool, as_delete: bool) -> Option<ObjectMsg> {
        if dirty_only && !self.pos_dirty {
            return None;
        }
        Some(ObjectMsg {
            obj_id: self.id,
            pos: self.pos,
            peer: self.peer,
            pos_version: if as_delete { 0 } else { self.pos_version },
            is_request: false,
        })
    }

    /// Applies an incoming position update.
    ///
    /// A tombstone or a newer version replaces position, peer and version and
    /// returns `true`; the caller then decides what a tombstone means. An
    /// equal version only revives a locally deleted copy. Older versions are
    /// ignored.
    pub fn decode_position(&mut self, msg: &ObjectMsg) -> bool {
        if msg.obj_id != self.id {
            return false;
        }
        if !msg.is_delete() && msg.pos_version < self.pos_version {
            return false;
        }

        self.alive = true;
        if !msg.is_delete() && msg.pos_version == self.pos_version {
            return false;
        }

        self.pos = msg.pos;
        self.peer = msg.peer;
        self.pos_version = msg.pos_version;
        self.pos_dirty = true;
        true
    }

    /// Encodes the attribute half. Returns `Ok(None)` when nothing would be
    /// carried.
    pub fn encode_state(&self, dirty_only: bool) -> Result<Option<StateMsg>, CodecError> {
        let mut payload = Vec::new();
        let size = if dirty_only {
            self.attributes.pack_dirty(&mut payload)?
        } else {
            self.attributes.pack_all(&mut payload)?
        };
        if size == 0 {
            return Ok(None);
        }
        Ok(Some(StateMsg {
            obj_id: self.id,
            version: self.version,
            is_request: false,
            payload,
        }))
    }

    /// Applies an incoming attribute update if its version is newer.
    pub fn decode_state(&mut self, msg: &StateMsg) -> Result<bool, CodecError> {
        if msg.obj_id != self.id || msg.version <= self.version {
            return Ok(false);
        }
        self.attributes.unpack(&msg.payload)?;
        self.version = msg.version;
        Ok(true)
    }
}

/// Something that happened, to be applied by every affected arbitrator in
/// the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub sender: NodeId,
    /// `(sender << 16) + n`, increasing per sender
    pub id: u64,
    /// Tick at which the sender created the event
    pub timestamp: Tick,
    /// Application-defined event type
    pub kind: u8,
    /// Packed attribute list
    pub payload: Vec<u8>,
}

impl Event {
    /// Freezes an attribute list into an event.
    pub fn new(
        sender: NodeId,
        id: u64,
        timestamp: Tick,
        kind: u8,
        attributes: &AttributeList,
    ) -> Result<Self, CodecError> {
        let mut payload = Vec::new();
        attributes.pack_all(&mut payload)?;
        Ok(Self {
            sender,
            id,
            timestamp,
            kind,
            payload,
        })
    }

    /// Unpacks the payload into a fresh attribute list.
    pub fn attributes(&self) -> Result<AttributeList, CodecError> {
        let mut list = AttributeList::new();
        list.unpack(&self.payload)?;
        list.reset_dirty();
        Ok(list)
    }
}

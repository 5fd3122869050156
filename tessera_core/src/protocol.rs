//! Wire message catalogue.
//!
//! Each message is a plain struct with explicit encode/decode functions. The
//! payload starts with a one-byte layout version, followed by fixed-width
//! machine-native fields; variable sections carry a `u32` length or count.
//!
//! ```text
//! tag (transport header)   payload
//! +-------+        +--------+------------------------+----------------+
//! |  u16  |        | layout | fixed header fields    | variable part  |
//! +-------+        +--------+------------------------+----------------+
//! ```

use crate::entity::{Event, ObjectId};
use crate::error::ProtocolError;
use crate::wire::{Reader, Writer};
use tessera_env::{NodeDescriptor, NodeId, Position, Tick};

/// Layout version written at the start of every payload.
pub const LAYOUT_VERSION: u8 = 1;

/// Message tags, as carried by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum MessageTag {
    Join = 100,
    Enter,
    Object,
    State,
    Arbitrator,
    ArbitratorLeave,
    Event,
    TickEvent,
    OverloadMove,
    OverloadInsert,
    Underload,
    Promote,
    Transfer,
    TransferAck,
    NewOwner,
}

impl MessageTag {
    const ALL: [MessageTag; 15] = [
        MessageTag::Join,
        MessageTag::Enter,
        MessageTag::Object,
        MessageTag::State,
        MessageTag::Arbitrator,
        MessageTag::ArbitratorLeave,
        MessageTag::Event,
        MessageTag::TickEvent,
        MessageTag::OverloadMove,
        MessageTag::OverloadInsert,
        MessageTag::Underload,
        MessageTag::Promote,
        MessageTag::Transfer,
        MessageTag::TransferAck,
        MessageTag::NewOwner,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageTag::Join => "JOIN",
            MessageTag::Enter => "ENTER",
            MessageTag::Object => "OBJECT",
            MessageTag::State => "STATE",
            MessageTag::Arbitrator => "ARBITRATOR",
            MessageTag::ArbitratorLeave => "ARBITRATOR_LEAVE",
            MessageTag::Event => "EVENT",
            MessageTag::TickEvent => "TICK_EVENT",
            MessageTag::OverloadMove => "OVERLOAD_M",
            MessageTag::OverloadInsert => "OVERLOAD_I",
            MessageTag::Underload => "UNDERLOAD",
            MessageTag::Promote => "PROMOTE",
            MessageTag::Transfer => "TRANSFER",
            MessageTag::TransferAck => "TRANSFER_ACK",
            MessageTag::NewOwner => "NEWOWNER",
        }
    }
}

impl TryFrom<u16> for MessageTag {
    type Error = ProtocolError;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_u16() == raw)
            .ok_or(ProtocolError::UnknownTag(raw))
    }
}

impl std::fmt::Display for MessageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A message with a fixed tag and an explicit byte layout.
pub trait WireMessage: Sized {
    const TAG: MessageTag;

    /// Appends the payload (layout byte included) to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Parses a complete payload. Trailing bytes are an error.
    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

// ============================================================================
// Layout helpers
// ============================================================================

fn begin(out: &mut Vec<u8>) -> Writer<'_> {
    let mut w = Writer::new(out);
    w.put_u8(LAYOUT_VERSION);
    w
}

fn open<'a>(bytes: &'a [u8], tag: MessageTag) -> Result<Reader<'a>, ProtocolError> {
    let mut r = Reader::new(bytes);
    let found = r.get_u8().ok_or(ProtocolError::Truncated(tag.name()))?;
    if found != LAYOUT_VERSION {
        return Err(ProtocolError::LayoutVersion {
            expected: LAYOUT_VERSION,
            found,
        });
    }
    Ok(r)
}

fn finish(r: &Reader<'_>, tag: MessageTag) -> Result<(), ProtocolError> {
    match r.remaining() {
        0 => Ok(()),
        extra => Err(ProtocolError::TrailingBytes {
            message: tag.name(),
            extra,
        }),
    }
}

fn put_node(w: &mut Writer<'_>, node: &NodeDescriptor) {
    w.put_u64(node.id.as_u64());
    w.put_f64(node.pos.x);
    w.put_f64(node.pos.y);
    w.put_f64(node.aoi);
    match node.secondary_aoi {
        Some(radius) => {
            w.put_bool(true);
            w.put_f64(radius);
        }
        None => w.put_bool(false),
    }
}

fn get_node(r: &mut Reader<'_>) -> Option<NodeDescriptor> {
    let id = NodeId(r.get_u64()?);
    let pos = Position::new(r.get_f64()?, r.get_f64()?);
    let aoi = r.get_f64()?;
    let secondary_aoi = if r.get_bool()? { Some(r.get_f64()?) } else { None };
    Some(NodeDescriptor {
        id,
        pos,
        aoi,
        secondary_aoi,
        last_seen: 0,
    })
}

fn put_pos(w: &mut Writer<'_>, pos: &Position) {
    w.put_f64(pos.x);
    w.put_f64(pos.y);
}

fn get_pos(r: &mut Reader<'_>) -> Option<Position> {
    Some(Position::new(r.get_f64()?, r.get_f64()?))
}

fn put_event(w: &mut Writer<'_>, event: &Event) {
    w.put_u64(event.sender.as_u64());
    w.put_u64(event.id);
    w.put_u64(event.timestamp);
    w.put_u8(event.kind);
    w.put_blob(&event.payload);
}

fn get_event(r: &mut Reader<'_>) -> Option<Event> {
    Some(Event {
        sender: NodeId(r.get_u64()?),
        id: r.get_u64()?,
        timestamp: r.get_u64()?,
        kind: r.get_u8()?,
        payload: r.get_blob()?.to_vec(),
    })
}

// ============================================================================
// Messages
// ============================================================================

/// JOIN: a node asks to be admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinMsg {
    pub node: NodeDescriptor,
    pub capacity: u32,
    pub auth: Vec<u8>,
}

impl WireMessage for JoinMsg {
    const TAG: MessageTag = MessageTag::Join;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        put_node(&mut w, &self.node);
        w.put_u32(self.capacity);
        w.put_blob(&self.auth);
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let msg = Self {
            node: get_node(&mut r).ok_or_else(truncated)?,
            capacity: r.get_u32().ok_or_else(truncated)?,
            auth: r.get_blob().ok_or_else(truncated)?.to_vec(),
        };
        finish(&r, Self::TAG)?;
        Ok(msg)
    }
}

/// Version pair a peer already holds for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownVersion {
    pub obj_id: ObjectId,
    pub pos_version: u32,
    pub version: u32,
}

/// ENTER: a peer hands itself over to a new arbitrator.
#[derive(Debug, Clone, PartialEq)]
pub struct EnterMsg {
    pub node: NodeDescriptor,
    pub known: Vec<KnownVersion>,
}

impl WireMessage for EnterMsg {
    const TAG: MessageTag = MessageTag::Enter;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        put_node(&mut w, &self.node);
        w.put_u32(self.known.len() as u32);
        for entry in &self.known {
            w.put_u64(entry.obj_id.as_u64());
            w.put_u32(entry.pos_version);
            w.put_u32(entry.version);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let node = get_node(&mut r).ok_or_else(truncated)?;
        let count = r.get_u32().ok_or_else(truncated)? as usize;
        // 16 bytes per entry; reject counts the payload cannot hold
        if count > r.remaining() / 16 {
            return Err(truncated());
        }
        let mut known = Vec::with_capacity(count);
        for _ in 0..count {
            known.push(KnownVersion {
                obj_id: ObjectId(r.get_u64().ok_or_else(truncated)?),
                pos_version: r.get_u32().ok_or_else(truncated)?,
                version: r.get_u32().ok_or_else(truncated)?,
            });
        }
        finish(&r, Self::TAG)?;
        Ok(Self { node, known })
    }
}

/// OBJECT: position part of an object. `pos_version == 0` is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMsg {
    pub obj_id: ObjectId,
    pub pos: Position,
    pub peer: NodeId,
    pub pos_version: u32,
    pub is_request: bool,
}

impl ObjectMsg {
    pub fn is_delete(&self) -> bool {
        self.pos_version == 0
    }
}

impl WireMessage for ObjectMsg {
    const TAG: MessageTag = MessageTag::Object;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        w.put_u64(self.obj_id.as_u64());
        put_pos(&mut w, &self.pos);
        w.put_u64(self.peer.as_u64());
        w.put_u32(self.pos_version);
        w.put_bool(self.is_request);
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let msg = Self {
            obj_id: ObjectId(r.get_u64().ok_or_else(truncated)?),
            pos: get_pos(&mut r).ok_or_else(truncated)?,
            peer: NodeId(r.get_u64().ok_or_else(truncated)?),
            pos_version: r.get_u32().ok_or_else(truncated)?,
            is_request: r.get_bool().ok_or_else(truncated)?,
        };
        finish(&r, Self::TAG)?;
        Ok(msg)
    }
}

/// STATE: attribute part of an object, as packed codec bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMsg {
    pub obj_id: ObjectId,
    pub version: u32,
    pub is_request: bool,
    pub payload: Vec<u8>,
}

impl WireMessage for StateMsg {
    const TAG: MessageTag = MessageTag::State;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        w.put_u64(self.obj_id.as_u64());
        w.put_u32(self.version);
        w.put_u32(self.payload.len() as u32);
        w.put_bool(self.is_request);
        w.put_bytes(&self.payload);
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let obj_id = ObjectId(r.get_u64().ok_or_else(truncated)?);
        let version = r.get_u32().ok_or_else(truncated)?;
        let size = r.get_u32().ok_or_else(truncated)? as usize;
        let is_request = r.get_bool().ok_or_else(truncated)?;
        let payload = r.take(size).ok_or_else(truncated)?.to_vec();
        finish(&r, Self::TAG)?;
        Ok(Self {
            obj_id,
            version,
            is_request,
            payload,
        })
    }
}

/// One advertised arbitrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitratorEntry {
    pub node: NodeDescriptor,
    pub capacity: u32,
}

/// ARBITRATOR: list of arbitrators a peer may attach to.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitratorMsg {
    pub entries: Vec<ArbitratorEntry>,
}

impl WireMessage for ArbitratorMsg {
    const TAG: MessageTag = MessageTag::Arbitrator;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        w.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            put_node(&mut w, &entry.node);
            w.put_u32(entry.capacity);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let count = r.get_u32().ok_or_else(truncated)? as usize;
        // at least 37 bytes per entry
        if count > r.remaining() / 37 {
            return Err(truncated());
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(ArbitratorEntry {
                node: get_node(&mut r).ok_or_else(truncated)?,
                capacity: r.get_u32().ok_or_else(truncated)?,
            });
        }
        finish(&r, Self::TAG)?;
        Ok(Self { entries })
    }
}

/// ARBITRATOR_LEAVE: an arbitrator steps down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitratorLeaveMsg {
    pub node: NodeId,
    /// Arbitrator whose overload caused this node's promotion
    pub parent: NodeId,
}

impl WireMessage for ArbitratorLeaveMsg {
    const TAG: MessageTag = MessageTag::ArbitratorLeave;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        w.put_u64(self.node.as_u64());
        w.put_u64(self.parent.as_u64());
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let msg = Self {
            node: NodeId(r.get_u64().ok_or_else(truncated)?),
            parent: NodeId(r.get_u64().ok_or_else(truncated)?),
        };
        finish(&r, Self::TAG)?;
        Ok(msg)
    }
}

/// EVENT: an event on its way to the arbitrators it affects.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMsg {
    /// Remaining forwarding budget. Zero means "do not forward".
    pub ttl: u8,
    /// Tick at which the first arbitrator accepted the event (0 from a peer)
    pub admitted: Tick,
    pub event: Event,
}

impl WireMessage for EventMsg {
    const TAG: MessageTag = MessageTag::Event;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        w.put_u8(self.ttl);
        w.put_u64(self.admitted);
        put_event(&mut w, &self.event);
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let ttl = r.get_u8().ok_or_else(truncated)?;
        let admitted = r.get_u64().ok_or_else(truncated)?;
        let event = get_event(&mut r).ok_or_else(truncated)?;
        finish(&r, Self::TAG)?;
        Ok(Self { ttl, admitted, event })
    }
}

/// TICK_EVENT: the sender has forwarded every event up to `timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickEventMsg {
    pub timestamp: Tick,
}

impl WireMessage for TickEventMsg {
    const TAG: MessageTag = MessageTag::TickEvent;

    fn encode(&self, out: &mut Vec<u8>) {
        begin(out).put_u64(self.timestamp);
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let timestamp = r
            .get_u64()
            .ok_or(ProtocolError::Truncated(Self::TAG.name()))?;
        finish(&r, Self::TAG)?;
        Ok(Self { timestamp })
    }
}

/// OVERLOAD_I: ask the gateway to insert a helper arbitrator near `pos`.
#[derive(Debug, Clone, PartialEq)]
pub struct OverloadInsertMsg {
    pub level: u32,
    pub pos: Position,
}

impl WireMessage for OverloadInsertMsg {
    const TAG: MessageTag = MessageTag::OverloadInsert;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        w.put_u32(self.level);
        put_pos(&mut w, &self.pos);
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let msg = Self {
            level: r.get_u32().ok_or_else(truncated)?,
            pos: get_pos(&mut r).ok_or_else(truncated)?,
        };
        finish(&r, Self::TAG)?;
        Ok(msg)
    }
}

/// OVERLOAD_M: ask a neighbor to move closer and share load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverloadMoveMsg {
    pub level: u32,
}

impl WireMessage for OverloadMoveMsg {
    const TAG: MessageTag = MessageTag::OverloadMove;

    fn encode(&self, out: &mut Vec<u8>) {
        begin(out).put_u32(self.level);
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let level = r.get_u32().ok_or(ProtocolError::Truncated(Self::TAG.name()))?;
        finish(&r, Self::TAG)?;
        Ok(Self { level })
    }
}

/// UNDERLOAD: the sender has spare capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnderloadMsg {
    pub level: u32,
}

impl WireMessage for UnderloadMsg {
    const TAG: MessageTag = MessageTag::Underload;

    fn encode(&self, out: &mut Vec<u8>) {
        begin(out).put_u32(self.level);
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let level = r.get_u32().ok_or(ProtocolError::Truncated(Self::TAG.name()))?;
        finish(&r, Self::TAG)?;
        Ok(Self { level })
    }
}

/// PROMOTE: the gateway asks a capable peer to become an arbitrator.
#[derive(Debug, Clone, PartialEq)]
pub struct PromoteMsg {
    /// The overloaded arbitrator that asked for help
    pub requester: NodeDescriptor,
}

impl WireMessage for PromoteMsg {
    const TAG: MessageTag = MessageTag::Promote;

    fn encode(&self, out: &mut Vec<u8>) {
        put_node(&mut begin(out), &self.requester);
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let requester = get_node(&mut r).ok_or(ProtocolError::Truncated(Self::TAG.name()))?;
        finish(&r, Self::TAG)?;
        Ok(Self { requester })
    }
}

/// TRANSFER: ownership of an object moves to `new_owner`.
///
/// `orig_owner == UNASSIGNED` marks a claim or a reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferMsg {
    pub obj_id: ObjectId,
    pub new_owner: NodeId,
    pub orig_owner: NodeId,
}

impl WireMessage for TransferMsg {
    const TAG: MessageTag = MessageTag::Transfer;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        w.put_u64(self.obj_id.as_u64());
        w.put_u64(self.new_owner.as_u64());
        w.put_u64(self.orig_owner.as_u64());
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let msg = Self {
            obj_id: ObjectId(r.get_u64().ok_or_else(truncated)?),
            new_owner: NodeId(r.get_u64().ok_or_else(truncated)?),
            orig_owner: NodeId(r.get_u64().ok_or_else(truncated)?),
        };
        finish(&r, Self::TAG)?;
        Ok(msg)
    }
}

/// TRANSFER_ACK: the new owner confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferAckMsg {
    pub obj_id: ObjectId,
}

impl WireMessage for TransferAckMsg {
    const TAG: MessageTag = MessageTag::TransferAck;

    fn encode(&self, out: &mut Vec<u8>) {
        begin(out).put_u64(self.obj_id.as_u64());
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let raw = r.get_u64().ok_or(ProtocolError::Truncated(Self::TAG.name()))?;
        finish(&r, Self::TAG)?;
        Ok(Self { obj_id: ObjectId(raw) })
    }
}

/// NEWOWNER: informational notice of an ownership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewOwnerMsg {
    pub obj_id: ObjectId,
    pub owner: NodeId,
}

impl WireMessage for NewOwnerMsg {
    const TAG: MessageTag = MessageTag::NewOwner;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = begin(out);
        w.put_u64(self.obj_id.as_u64());
        w.put_u64(self.owner.as_u64());
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = open(bytes, Self::TAG)?;
        let truncated = || ProtocolError::Truncated(Self::TAG.name());
        let msg = Self {
            obj_id: ObjectId(r.get_u64().ok_or_else(truncated)?),
            owner: NodeId(r.get_u64().ok_or_else(truncated)?),
        };
        finish(&r, Self::TAG)?;
        Ok(msg)
    }
}

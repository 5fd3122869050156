//! The Arbitrator
//!
//! An arbitrator owns a region of the world. It is the only node allowed to
//! mutate the objects it owns, it hosts the peers whose avatars live in its
//! region, and it keeps its neighbors' replicas of its objects current.
//!
//! # Tick pipeline
//!
//! ```text
//! receive ─► neighbors ─► validate ─► storage ─► events ─► logic.tick
//!                                                              │
//!   flush ◄── aoi ◄── leave check ◄── ownership ◄── replicate ◄┘
//! ```
//!
//! Each phase runs to completion before the next. Callbacks into
//! [`ArbitratorLogic`] are queued by the phases and delivered between them,
//! so logic always sees a consistent store.

use crate::attributes::AttrValue;
use crate::config::ReplicationConfig;
use crate::entity::{Object, ObjectId};
use crate::error::{CodecError, ProtocolError};
use crate::events::{EventQueue, Unrouted};
use crate::gateway::{covering_aoi, GatewayState, LoadSignals};
use crate::interest::Knowledge;
use crate::logic::{ArbitratorApi, ArbitratorLogic, LogicNotice};
use crate::protocol::{
    ArbitratorEntry, ArbitratorLeaveMsg, ArbitratorMsg, EnterMsg, EventMsg, JoinMsg, MessageTag, ObjectMsg,
    OverloadInsertMsg, OverloadMoveMsg, PromoteMsg, StateMsg, TickEventMsg, TransferAckMsg, TransferMsg,
    UnderloadMsg, NewOwnerMsg, WireMessage,
};
use crate::store::ObjectStore;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tessera_env::{Delivery, Messaging, NodeContext, NodeDescriptor, NodeId, Overlay, Position, QueryId, Storage, Tick};
use tracing::{debug, info, trace, warn};

/// Lifecycle of an arbitrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitratorStatus {
    /// Built but not yet joined to the overlay
    Idle,
    Active,
    /// Handing everything off before stopping
    Suspended,
    Stopped,
}

/// Everything an arbitrator knows, without its logic.
pub struct ArbitratorState<M, O, S> {
    pub(crate) ctx: Arc<dyn NodeContext>,
    pub(crate) config: ReplicationConfig,
    pub(crate) net: M,
    pub(crate) overlay: O,
    pub(crate) storage: S,

    pub(crate) self_desc: NodeDescriptor,
    pub(crate) capacity: u32,
    /// Arbitrator that caused this one to be promoted
    pub(crate) parent: NodeId,

    pub(crate) store: ObjectStore,
    next_counter: u16,

    pub(crate) peers: BTreeMap<NodeId, NodeDescriptor>,
    pub(crate) neighbors: BTreeMap<NodeId, NodeDescriptor>,
    pub(crate) knowledge: Knowledge,

    pub(crate) events: EventQueue,
    pub(crate) unrouted: Vec<Unrouted>,

    pub(crate) avatar_countdowns: BTreeMap<ObjectId, u32>,
    pub(crate) load: LoadSignals,
    pub(crate) gateway: Option<GatewayState>,
    pub(crate) pending_joins: BTreeMap<NodeId, JoinMsg>,
    pub(crate) queries: BTreeMap<QueryId, NodeId>,

    pub(crate) notices: VecDeque<LogicNotice>,
    /// Messages addressed to myself, handled next tick
    pub(crate) loopback: VecDeque<(MessageTag, Vec<u8>)>,
    pub(crate) send_failures: BTreeMap<NodeId, u32>,
    pub(crate) status: ArbitratorStatus,
    last_advertised: Tick,
}

impl<M: Messaging, O: Overlay, S: Storage> ArbitratorState<M, O, S> {
    fn new(ctx: Arc<dyn NodeContext>, node: NodeDescriptor, net: M, overlay: O, storage: S) -> Self {
        let gateway = (node.id == NodeId::GATEWAY).then(GatewayState::default);
        Self {
            ctx,
            config: ReplicationConfig::default(),
            net,
            overlay,
            storage,
            self_desc: node,
            capacity: 0,
            parent: NodeId::UNASSIGNED,
            store: ObjectStore::new(),
            next_counter: 1,
            peers: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            knowledge: Knowledge::default(),
            events: EventQueue::default(),
            unrouted: Vec::new(),
            avatar_countdowns: BTreeMap::new(),
            load: LoadSignals::default(),
            gateway,
            pending_joins: BTreeMap::new(),
            queries: BTreeMap::new(),
            notices: VecDeque::new(),
            loopback: VecDeque::new(),
            send_failures: BTreeMap::new(),
            status: ArbitratorStatus::Idle,
            last_advertised: 0,
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.self_desc.id
    }

    pub(crate) fn now(&self) -> Tick {
        self.ctx.now()
    }

    pub(crate) fn self_entry(&self) -> ArbitratorEntry {
        ArbitratorEntry {
            node: self.self_desc.clone(),
            capacity: self.capacity,
        }
    }

    /// Sends pre-encoded bytes. Messages to myself go through the loopback
    /// queue. Returns false when the transport rejected the send.
    pub(crate) fn send_bytes(&mut self, target: NodeId, tag: MessageTag, bytes: &[u8], reliable: bool) -> bool {
        if target == self.id() {
            self.loopback.push_back((tag, bytes.to_vec()));
            return true;
        }
        if self.net.send(target, tag.as_u16(), bytes, reliable) > 0 {
            self.send_failures.remove(&target);
            return true;
        }
        self.record_send_failure(target, tag);
        false
    }

    pub(crate) fn send<T: WireMessage>(&mut self, target: NodeId, msg: &T, reliable: bool) -> bool {
        self.send_bytes(target, T::TAG, &msg.to_bytes(), reliable)
    }

    /// Repeated failures to a neighbor are taken as a crash: the neighbor is
    /// dropped here and from the overlay, so its region falls to the others.
    fn record_send_failure(&mut self, target: NodeId, tag: MessageTag) {
        let failures = self.send_failures.entry(target).or_insert(0);
        *failures += 1;
        let failures = *failures;
        trace!("{} failed to send {} to {} ({} in a row)", self.id(), tag, target, failures);
        if failures < self.config.max_send_failures {
            return;
        }
        self.send_failures.remove(&target);

        if self.neighbors.remove(&target).is_some() {
            warn!("{} evicts unreachable neighbor {}", self.id(), target);
            self.knowledge.forget_node(target);
            self.events.forget(target);
            self.overlay.leave(target);
        } else if self.peers.remove(&target).is_some() {
            warn!("{} drops unreachable peer {}", self.id(), target);
            self.knowledge.forget_node(target);
            self.net.disconnect(target);
        }
    }

    pub(crate) fn create_obj(&mut self, pos: Position, peer: NodeId, init: &[u8]) -> ObjectId {
        let mut id = ObjectId::compose(self.id(), self.next_counter);
        while self.store.contains(id) {
            self.next_counter = self.next_counter.wrapping_add(1).max(1);
            id = ObjectId::compose(self.id(), self.next_counter);
        }
        self.next_counter = self.next_counter.wrapping_add(1).max(1);

        let now = self.now();
        self.store.insert(Object::new(id, pos, peer), true, now);
        debug!("{} created {} for {}", self.id(), id, peer);
        self.notices.push_back(LogicNotice::Created {
            id,
            init: init.to_vec(),
        });
        id
    }

    fn owned_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        if !self.store.is_owner(id) {
            return None;
        }
        self.store.get_mut(id).filter(|obj| obj.is_alive())
    }

    // Receive phase

    pub(crate) fn process_messages(&mut self) {
        let self_id = self.id();
        for (tag, bytes) in std::mem::take(&mut self.loopback) {
            if let Err(err) = self.dispatch_message(self_id, tag.as_u16(), &bytes) {
                warn!("{} dropped own {}: {}", self_id, tag, err);
            }
        }

        for delivery in self.net.receive() {
            match delivery {
                Delivery::Message { from, tag, payload } => {
                    if let Err(err) = self.dispatch_message(from, tag, &payload) {
                        warn!("{} dropped message {} from {}: {}", self_id, tag, from, err);
                    }
                }
                Delivery::Disconnected(node) => self.handle_disconnect(node),
            }
        }
    }

    fn dispatch_message(&mut self, from: NodeId, tag: u16, payload: &[u8]) -> Result<(), ProtocolError> {
        let tag = MessageTag::try_from(tag)?;
        trace!("{} <- {} from {}", self.id(), tag, from);
        match tag {
            MessageTag::Join => self.handle_join(from, JoinMsg::decode(payload)?),
            MessageTag::Enter => self.handle_enter(from, EnterMsg::decode(payload)?),
            MessageTag::Object => self.handle_object(from, ObjectMsg::decode(payload)?),
            MessageTag::State => self.handle_state(from, StateMsg::decode(payload)?)?,
            MessageTag::Arbitrator => self.handle_arbitrator(from, ArbitratorMsg::decode(payload)?),
            MessageTag::ArbitratorLeave => self.handle_arbitrator_leave(from, ArbitratorLeaveMsg::decode(payload)?),
            MessageTag::Event => self.handle_event(from, EventMsg::decode(payload)?),
            MessageTag::TickEvent => self.handle_tick_event(from, TickEventMsg::decode(payload)?),
            MessageTag::OverloadInsert => self.handle_overload_insert(from, OverloadInsertMsg::decode(payload)?),
            MessageTag::Transfer => self.handle_transfer(from, TransferMsg::decode(payload)?),
            MessageTag::TransferAck => self.handle_transfer_ack(from, TransferAckMsg::decode(payload)?),
            MessageTag::OverloadMove => {
                let msg = OverloadMoveMsg::decode(payload)?;
                debug!("{} ignores {} (level {}) from {}", self.id(), tag, msg.level, from);
            }
            MessageTag::Underload => {
                let msg = UnderloadMsg::decode(payload)?;
                debug!("{} ignores {} (level {}) from {}", self.id(), tag, msg.level, from);
            }
            MessageTag::Promote => {
                PromoteMsg::decode(payload)?;
                debug!("{} ignores {} from {}", self.id(), tag, from);
            }
            MessageTag::NewOwner => {
                let msg = NewOwnerMsg::decode(payload)?;
                debug!("{} ignores {} for {} from {}", self.id(), tag, msg.obj_id, from);
            }
        }
        Ok(())
    }

    fn handle_disconnect(&mut self, node: NodeId) {
        if self.peers.remove(&node).is_some() {
            info!("{} lost peer {}", self.id(), node);
            self.knowledge.forget_node(node);
        }
    }

    fn handle_enter(&mut self, from: NodeId, msg: EnterMsg) {
        let mut node = msg.node;
        if node.id != from {
            warn!("{} ignores ENTER for {} sent by {}", self.id(), node.id, from);
            return;
        }
        node.last_seen = self.now();
        let known: Vec<_> = msg
            .known
            .into_iter()
            .filter(|k| self.store.contains(k.obj_id))
            .collect();
        info!("{} hosts peer {} ({} objects already known)", self.id(), from, known.len());

        self.knowledge.seed(from, known);
        self.peers.insert(from, node);
        if !self.net.is_connected(from) {
            if let Err(err) = self.net.connect(from) {
                warn!("{} cannot reach entering peer {}: {}", self.id(), from, err);
            }
        }
        let advert = self.peer_advert();
        self.send(from, &advert, true);
    }

    fn handle_object(&mut self, from: NodeId, msg: ObjectMsg) {
        let now = self.now();
        let id = msg.obj_id;
        if msg.is_request {
            self.handle_resync_request(from, id);
            return;
        }
        let owned = self.store.is_owner(id);

        let Some(obj) = self.store.get_mut(id) else {
            if msg.is_delete() {
                return;
            }
            trace!("{} discovers {} from {}", self.id(), id, from);
            self.store.insert(Object::from_position(&msg), false, now);
            self.record_sender_knowledge(from, id);
            self.notices.push_back(LogicNotice::Discovered(id));
            return;
        };

        if msg.is_delete() {
            if owned {
                debug!("{} ignores tombstone for owned {} from {}", self.id(), id, from);
            } else if obj.is_alive() {
                obj.mark_deleted();
            }
            return;
        }

        // an equal-version refresh still proves the owner is alive
        let fresh = obj.decode_position(&msg);
        let peer = obj.peer;
        let pos = *obj.pos();
        if obj.is_alive() {
            self.store.touch(id, now);
        }
        if !fresh {
            trace!("{} keeps position of {} from {}", self.id(), id, from);
            return;
        }
        self.record_sender_knowledge(from, id);
        if let Some(host) = self.peers.get_mut(&peer) {
            host.pos = pos;
        }
    }

    /// A neighbor that sent me an object holds it at least at this version.
    fn record_sender_knowledge(&mut self, from: NodeId, id: ObjectId) {
        if !self.neighbors.contains_key(&from) {
            return;
        }
        if let Some(obj) = self.store.get(id) {
            self.knowledge.record(from, obj.known_version());
        }
    }

    fn handle_state(&mut self, from: NodeId, msg: StateMsg) -> Result<(), CodecError> {
        let now = self.now();
        let id = msg.obj_id;
        if msg.is_request {
            self.handle_resync_request(from, id);
            return Ok(());
        }
        let Some(obj) = self.store.get_mut(id) else {
            debug!("{} got STATE for unknown {} from {}", self.id(), id, from);
            self.request_resync(from, id);
            return Ok(());
        };
        let alive = obj.is_alive();
        let applied = match obj.decode_state(&msg) {
            Ok(applied) => applied,
            Err(err) => {
                self.request_resync(from, id);
                return Err(err);
            }
        };
        if alive {
            self.store.touch(id, now);
        }
        if applied {
            self.record_sender_knowledge(from, id);
        } else {
            trace!("{} drops stale state v{} of {} from {}", self.id(), msg.version, id, from);
        }
        Ok(())
    }

    /// Asks a neighbor to send `id` again in full, e.g. after a diff arrived
    /// for a copy I no longer hold.
    fn request_resync(&mut self, to: NodeId, id: ObjectId) {
        if !self.neighbors.contains_key(&to) {
            return;
        }
        let version = self.store.get(id).map_or(0, |obj| obj.version);
        let request = StateMsg {
            obj_id: id,
            version,
            is_request: true,
            payload: Vec::new(),
        };
        debug!("{} asks {} to resend {}", self.id(), to, id);
        self.send(to, &request, false);
    }

    /// `from` no longer holds `id`: forget what it knows so the next
    /// replication pass introduces the object again.
    fn handle_resync_request(&mut self, from: NodeId, id: ObjectId) {
        if self.knowledge.forget(from, id) {
            debug!("{} will resend {} to {}", self.id(), id, from);
        }
    }

    /// A neighbor re-advertising itself.
    fn handle_arbitrator(&mut self, from: NodeId, msg: ArbitratorMsg) {
        let Some(entry) = msg.entries.into_iter().find(|e| e.node.id == from) else {
            return;
        };
        if let Some(known) = self.neighbors.get_mut(&from) {
            known.pos = entry.node.pos;
            known.aoi = entry.node.aoi;
            known.last_seen = self.ctx.now();
        }
    }

    // Neighbor phase

    /// The arbitrator list given to peers: me (unless leaving) and my
    /// neighbors.
    fn peer_advert(&self) -> ArbitratorMsg {
        let mut entries = Vec::with_capacity(self.neighbors.len() + 1);
        if self.status == ArbitratorStatus::Active {
            entries.push(self.self_entry());
        }
        entries.extend(self.neighbors.values().map(|node| ArbitratorEntry {
            node: node.clone(),
            capacity: 0,
        }));
        ArbitratorMsg { entries }
    }

    fn advertise_to_peers(&mut self) {
        let bytes = self.peer_advert().to_bytes();
        let peers: Vec<NodeId> = self.peers.keys().copied().collect();
        for peer in peers {
            self.send_bytes(peer, MessageTag::Arbitrator, &bytes, true);
        }
    }

    pub(crate) fn refresh_neighbors(&mut self) {
        let now = self.now();
        let self_id = self.id();
        let current: BTreeMap<NodeId, NodeDescriptor> = self
            .overlay
            .enclosing_neighbors(self_id)
            .into_iter()
            .filter(|n| n.id != self_id && n.id.is_assigned())
            .map(|n| (n.id, n))
            .collect();

        let departed: Vec<NodeId> = self
            .neighbors
            .keys()
            .filter(|id| !current.contains_key(id))
            .copied()
            .collect();
        let added: BTreeSet<NodeId> = current
            .keys()
            .filter(|id| !self.neighbors.contains_key(id))
            .copied()
            .collect();

        for gone in &departed {
            debug!("{} loses neighbor {}", self_id, gone);
            let tombstones: Vec<Vec<u8>> = self
                .store
                .owned_ids()
                .into_iter()
                .filter(|id| self.knowledge.knows(*gone, *id))
                .filter_map(|id| self.store.get(id))
                .filter_map(|obj| obj.encode_position(false, true))
                .map(|msg| msg.to_bytes())
                .collect();
            for bytes in tombstones {
                self.send_bytes(*gone, MessageTag::Object, &bytes, false);
            }
            self.knowledge.forget_node(*gone);
            self.events.forget(*gone);
        }

        self.neighbors = current;

        let periodic = now.saturating_sub(self.last_advertised) >= self.config.full_update_period;
        let advert = ArbitratorMsg {
            entries: vec![self.self_entry()],
        }
        .to_bytes();
        let targets: Vec<NodeId> = if periodic {
            self.neighbors.keys().copied().collect()
        } else {
            added.iter().copied().collect()
        };
        for target in targets {
            self.send_bytes(target, MessageTag::Arbitrator, &advert, true);
        }

        if periodic || !added.is_empty() || !departed.is_empty() {
            if !added.is_empty() {
                debug!("{} gains neighbors {:?}", self_id, added);
            }
            self.advertise_to_peers();
        }
        if periodic {
            self.last_advertised = now;
        }
    }

    // Validation phase

    /// Counts down owned avatars whose peer is gone and deletes them at zero.
    pub(crate) fn validate_objects(&mut self) {
        let mut expired = Vec::new();
        for id in self.store.owned_ids() {
            let Some(obj) = self.store.get(id) else {
                continue;
            };
            if !obj.is_alive() || !obj.peer.is_assigned() {
                continue;
            }
            if self.peers.contains_key(&obj.peer) {
                self.avatar_countdowns.remove(&id);
                continue;
            }
            match self.avatar_countdowns.get_mut(&id) {
                None => {
                    self.avatar_countdowns.insert(id, self.config.countdown_remove_avatar);
                }
                Some(0) => expired.push(id),
                Some(left) => *left -= 1,
            }
        }

        for id in expired {
            self.avatar_countdowns.remove(&id);
            info!("{} removes abandoned avatar {}", self.id(), id);
            if let Some(obj) = self.store.get_mut(id) {
                obj.mark_deleted();
            }
        }
    }

    pub(crate) fn poll_storage(&mut self) {
        for (query, reply) in self.storage.poll_replies() {
            let Some(joiner) = self.queries.remove(&query) else {
                warn!("{} dropped reply to unknown query {}", self.id(), query);
                continue;
            };
            self.notices.push_back(LogicNotice::Reply {
                query,
                joiner: joiner.is_assigned().then_some(joiner),
                reply,
            });
        }
    }

    // Leave handling

    pub(crate) fn leave(&mut self) {
        if self.status != ArbitratorStatus::Active {
            return;
        }
        info!("{} leaves: handing off {} objects", self.id(), self.store.owned_count());
        self.status = ArbitratorStatus::Suspended;

        let bytes = ArbitratorLeaveMsg {
            node: self.id(),
            parent: NodeId::UNASSIGNED,
        }
        .to_bytes();
        let neighbors: Vec<NodeId> = self.neighbors.keys().copied().collect();
        for neighbor in neighbors {
            self.send_bytes(neighbor, MessageTag::ArbitratorLeave, &bytes, true);
        }
        self.overlay.leave(self.id());
        self.advertise_to_peers();
    }

    pub(crate) fn check_leave(&mut self) {
        if self.status != ArbitratorStatus::Suspended {
            return;
        }
        if self.store.owned_count() > 0 || self.store.transit_count() > 0 || !self.peers.is_empty() {
            return;
        }
        info!("{} stopped", self.id());
        for obj in self.store.drain() {
            self.notices.push_back(LogicNotice::Deleted(obj.id()));
        }
        self.neighbors.clear();
        self.knowledge = Knowledge::default();
        self.avatar_countdowns.clear();
        self.status = ArbitratorStatus::Stopped;
    }

    pub(crate) fn adjust_aoi(&mut self) {
        self.self_desc.aoi = covering_aoi(&self.self_desc.pos, self.peers.values(), &self.config);
        self.overlay.update(&self.self_desc);
    }
}

impl<M: Messaging, O: Overlay, S: Storage> ArbitratorApi for ArbitratorState<M, O, S> {
    fn self_id(&self) -> NodeId {
        self.id()
    }

    fn now(&self) -> Tick {
        self.ctx.now()
    }

    fn create_obj(&mut self, pos: Position, peer: NodeId, init: &[u8]) -> ObjectId {
        ArbitratorState::create_obj(self, pos, peer, init)
    }

    fn delete_obj(&mut self, id: ObjectId) -> bool {
        match self.owned_mut(id) {
            Some(obj) => {
                obj.mark_deleted();
                true
            }
            None => false,
        }
    }

    fn add_attr(&mut self, id: ObjectId, value: AttrValue) -> Option<usize> {
        let obj = self.owned_mut(id)?;
        let index = obj.attributes_mut().add(value);
        obj.version += 1;
        Some(index)
    }

    fn update_obj(&mut self, id: ObjectId, index: usize, value: AttrValue) -> bool {
        let self_id = self.id();
        let Some(obj) = self.owned_mut(id) else {
            return false;
        };
        match obj.attributes_mut().set(index, value) {
            Ok(()) => {
                obj.version += 1;
                true
            }
            Err(err) => {
                debug!("{} rejected update of {}[{}]: {}", self_id, id, index, err);
                false
            }
        }
    }

    fn change_pos(&mut self, id: ObjectId, pos: Position) -> bool {
        let parent = self.parent;
        let Some(obj) = self.owned_mut(id) else {
            return false;
        };
        obj.set_pos(pos);
        obj.pos_version += 1;
        let peer = obj.peer;

        if let Some(host) = self.peers.get_mut(&peer) {
            host.pos = pos;
        }
        if peer.is_assigned() && peer == parent {
            self.self_desc.pos = pos;
        }
        true
    }

    fn object(&self, id: ObjectId) -> Option<&Object> {
        self.store.get(id)
    }

    fn object_ids(&self) -> Vec<ObjectId> {
        self.store.ids()
    }

    fn is_owner(&self, id: ObjectId) -> bool {
        self.store.is_owner(id)
    }

    fn avatar_of(&self, peer: NodeId) -> Option<ObjectId> {
        self.store
            .iter()
            .filter(|obj| obj.is_alive() && obj.peer == peer)
            .map(|obj| obj.id())
            .next()
    }

    fn peers(&self) -> Vec<NodeDescriptor> {
        self.peers.values().cloned().collect()
    }

    fn insert_peer(&mut self, peer: NodeId, init: &[u8]) -> bool {
        ArbitratorState::insert_peer(self, peer, init)
    }

    fn report_load(&mut self, load: u32) {
        ArbitratorState::report_load(self, load)
    }

    fn overload(&mut self, level: u32) {
        ArbitratorState::overload(self, level)
    }

    fn underload(&mut self, level: u32) {
        ArbitratorState::underload(self, level)
    }

    fn query_storage(&mut self, request: &[u8], on_behalf_of: NodeId) -> QueryId {
        let query = self.storage.query(request);
        self.queries.insert(query, on_behalf_of);
        query
    }

    fn respond_storage(&mut self, query: QueryId, reply: &[u8]) -> bool {
        match self.storage.respond(query, reply) {
            Ok(()) => true,
            Err(err) => {
                warn!("{} could not answer storage query {}: {}", self.id(), query, err);
                false
            }
        }
    }
}

/// An arbitrator node: protocol state plus the application logic it hosts.
pub struct Arbitrator<M, O, S, L> {
    state: ArbitratorState<M, O, S>,
    logic: L,
}

impl<M: Messaging, O: Overlay, S: Storage, L: ArbitratorLogic> Arbitrator<M, O, S, L> {
    pub fn new(ctx: Arc<dyn NodeContext>, node: NodeDescriptor, net: M, overlay: O, storage: S, logic: L) -> Self {
        Self {
            state: ArbitratorState::new(ctx, node, net, overlay, storage),
            logic,
        }
    }

    pub fn with_config(mut self, config: ReplicationConfig) -> Self {
        self.state.config = config;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.state.capacity = capacity;
        self
    }

    /// Marks this arbitrator as promoted on behalf of `parent`.
    pub fn with_parent(mut self, parent: NodeId) -> Self {
        self.state.parent = parent;
        self
    }

    /// Enters the overlay and starts serving.
    pub fn join(&mut self) {
        if self.state.status != ArbitratorStatus::Idle {
            return;
        }
        info!(
            "{} joins at ({:.1}, {:.1})",
            self.state.id(),
            self.state.self_desc.pos.x,
            self.state.self_desc.pos.y
        );
        self.state.status = ArbitratorStatus::Active;
        let desc = self.state.self_desc.clone();
        self.state.overlay.update(&desc);
    }

    /// Starts handing everything off; the node stops once it is empty.
    pub fn leave(&mut self) {
        self.state.leave();
        self.dispatch();
    }

    /// Runs one tick of the pipeline.
    pub fn tick(&mut self) {
        if matches!(self.state.status, ArbitratorStatus::Idle | ArbitratorStatus::Stopped) {
            return;
        }
        let active = self.state.status == ArbitratorStatus::Active;

        self.state.process_messages();
        self.dispatch();

        if active {
            self.state.refresh_neighbors();
        }
        self.state.validate_objects();
        self.state.poll_storage();
        self.dispatch();

        for event in self.state.run_event_pipeline() {
            self.logic.event_received(&mut self.state, &event);
            self.dispatch();
        }
        self.logic.tick(&mut self.state);
        self.dispatch();

        self.state.replicate();
        self.dispatch();

        self.state.check_owner_transfer();
        self.state.check_leave();
        self.dispatch();

        if self.state.status == ArbitratorStatus::Active {
            self.state.adjust_aoi();
        }
        self.state.expire_promotions();
        self.state.net.flush();
    }

    /// Delivers queued callbacks. Callbacks may queue more.
    fn dispatch(&mut self) {
        while let Some(notice) = self.state.notices.pop_front() {
            match notice {
                LogicNotice::JoinRequested { peer, auth } => {
                    self.logic.join_requested(&mut self.state, &peer, &auth)
                }
                LogicNotice::Created { id, init } => self.logic.obj_created(&mut self.state, id, &init),
                LogicNotice::Discovered(id) => {
                    if let Some(obj) = self.state.store.get(id) {
                        self.logic.obj_discovered(obj);
                    }
                }
                LogicNotice::Deleted(id) => self.logic.obj_deleted(id),
                LogicNotice::StateUpdated { id, index, value, version } => {
                    self.logic.state_updated(id, index, &value, version)
                }
                LogicNotice::PosChanged { id, pos, version } => self.logic.pos_changed(id, &pos, version),
                LogicNotice::Reply { query, joiner, reply } => {
                    self.logic.reply_received(&mut self.state, query, joiner, &reply)
                }
            }
        }
    }

    /// Runs `f` against the arbitrator as its logic would see it.
    pub fn with_api<R>(&mut self, f: impl FnOnce(&mut dyn ArbitratorApi) -> R) -> R {
        let out = f(&mut self.state);
        self.dispatch();
        out
    }

    pub fn id(&self) -> NodeId {
        self.state.id()
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.state.self_desc
    }

    pub fn status(&self) -> ArbitratorStatus {
        self.state.status
    }

    /// True once underload made this arbitrator step down.
    pub fn is_demoted(&self) -> bool {
        self.state.load.demoted
    }

    pub fn is_gateway(&self) -> bool {
        self.state.gateway.is_some()
    }

    pub fn store(&self) -> &ObjectStore {
        &self.state.store
    }

    pub fn is_owner(&self, id: ObjectId) -> bool {
        self.state.store.is_owner(id)
    }

    pub fn owned_ids(&self) -> Vec<ObjectId> {
        self.state.store.owned_ids()
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.state.peers.keys().copied().collect()
    }

    pub fn neighbor_ids(&self) -> Vec<NodeId> {
        self.state.neighbors.keys().copied().collect()
    }

    pub fn pending_events(&self) -> usize {
        self.state.events.pending_count()
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.state.config
    }

    pub fn logic(&self) -> &L {
        &self.logic
    }

    pub fn logic_mut(&mut self) -> &mut L {
        &mut self.logic
    }

    pub fn network(&self) -> &M {
        &self.state.net
    }

    pub fn network_mut(&mut self) -> &mut M {
        &mut self.state.net
    }

    pub fn overlay(&self) -> &O {
        &self.state.overlay
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.state.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeList;
    use crate::entity::Event;
    use crate::testing::{ManualContext, MemoryStore, RecordingNet, StaticOverlay};

    #[derive(Default)]
    struct Recorder {
        created: Vec<(ObjectId, Vec<u8>)>,
        discovered: Vec<ObjectId>,
        deleted: Vec<ObjectId>,
        events: Vec<(Tick, NodeId)>,
        joins: Vec<NodeId>,
        admit: bool,
    }

    impl ArbitratorLogic for Recorder {
        fn join_requested(&mut self, api: &mut dyn ArbitratorApi, peer: &NodeDescriptor, _auth: &[u8]) {
            self.joins.push(peer.id);
            if self.admit {
                api.insert_peer(peer.id, b"hello");
            }
        }

        fn obj_created(&mut self, _api: &mut dyn ArbitratorApi, id: ObjectId, init: &[u8]) {
            self.created.push((id, init.to_vec()));
        }

        fn obj_discovered(&mut self, obj: &Object) {
            self.discovered.push(obj.id());
        }

        fn obj_deleted(&mut self, id: ObjectId) {
            self.deleted.push(id);
        }

        fn event_received(&mut self, _api: &mut dyn ArbitratorApi, event: &Event) {
            self.events.push((event.timestamp, event.sender));
        }
    }

    type TestArbitrator = Arbitrator<RecordingNet, StaticOverlay, MemoryStore, Recorder>;

    fn arbitrator(ctx: &Arc<ManualContext>, id: u64, sites: &[(u64, f64, f64)]) -> TestArbitrator {
        let overlay = StaticOverlay::with_sites(sites);
        let desc = overlay
            .sites
            .get(&NodeId(id))
            .cloned()
            .unwrap_or_else(|| NodeDescriptor::new(NodeId(id), Position::origin(), 50.0));
        let mut arb = Arbitrator::new(
            ctx.clone(),
            desc,
            RecordingNet::new(NodeId(id)),
            overlay,
            MemoryStore::default(),
            Recorder::default(),
        );
        arb.join();
        arb
    }

    fn step(ctx: &ManualContext, arb: &mut TestArbitrator) {
        ctx.advance();
        arb.tick();
    }

    fn enter(arb: &mut TestArbitrator, peer: u64, x: f64, y: f64, aoi: f64) {
        let node = NodeDescriptor::new(NodeId(peer), Position::new(x, y), aoi);
        arb.network_mut().deliver(NodeId(peer), &EnterMsg { node, known: Vec::new() });
    }

    #[test]
    fn test_create_obj_ids_and_notice() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0)]);
        let a = arb.with_api(|api| api.create_obj(Position::new(1.0, 1.0), NodeId::UNASSIGNED, b"x"));
        let b = arb.with_api(|api| api.create_obj(Position::new(2.0, 1.0), NodeId::UNASSIGNED, b""));

        assert_eq!(a, ObjectId::compose(NodeId(2), 1));
        assert_eq!(b, ObjectId::compose(NodeId(2), 2));
        assert_eq!(a.creator(), NodeId(2));
        assert!(arb.is_owner(a));
        assert_eq!(arb.logic().created[0], (a, b"x".to_vec()));
    }

    #[test]
    fn test_mutations_require_ownership() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0)]);
        let id = arb.with_api(|api| api.create_obj(Position::new(1.0, 1.0), NodeId::UNASSIGNED, b""));

        let index = arb.with_api(|api| api.add_attr(id, AttrValue::Int(3)));
        assert_eq!(index, Some(0));
        assert!(arb.with_api(|api| api.update_obj(id, 0, AttrValue::Int(4))));
        assert!(!arb.with_api(|api| api.update_obj(id, 0, AttrValue::Bool(true))));
        assert_eq!(arb.store().get(id).unwrap().version, 3);

        let foreign = ObjectId::compose(NodeId(9), 1);
        assert!(!arb.with_api(|api| api.change_pos(foreign, Position::origin())));
        assert_eq!(arb.with_api(|api| api.add_attr(foreign, AttrValue::Int(1))), None);
    }

    #[test]
    fn test_gateway_join_flow() {
        let ctx = ManualContext::shared();
        let mut gateway = arbitrator(&ctx, 1, &[(1, 0.0, 0.0)]);
        gateway.logic_mut().admit = true;

        let joiner = NodeDescriptor::new(NodeId(10), Position::new(5.0, 5.0), 20.0);
        gateway.network_mut().deliver(
            NodeId(10),
            &JoinMsg {
                node: joiner,
                capacity: 100,
                auth: b"token".to_vec(),
            },
        );
        step(&ctx, &mut gateway);

        assert_eq!(gateway.logic().joins, vec![NodeId(10)]);
        let (avatar, init) = gateway.logic().created[0].clone();
        assert_eq!(init, b"hello".to_vec());
        assert_eq!(gateway.store().get(avatar).unwrap().peer, NodeId(10));

        let adverts: Vec<ArbitratorMsg> = gateway.network().decoded(NodeId(10));
        assert_eq!(adverts[0].entries[0].node.id, NodeId(1));
        assert!(gateway.network().connected.contains(&NodeId(10)));
    }

    #[test]
    fn test_join_forwarded_to_closest() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0), (3, 100.0, 0.0)]);
        let joiner = NodeDescriptor::new(NodeId(10), Position::new(90.0, 0.0), 20.0);
        arb.network_mut().deliver(
            NodeId(1),
            &JoinMsg {
                node: joiner,
                capacity: 0,
                auth: Vec::new(),
            },
        );
        step(&ctx, &mut arb);

        let forwarded: Vec<JoinMsg> = arb.network().decoded(NodeId(3));
        assert_eq!(forwarded.len(), 1);
        assert!(arb.logic().created.is_empty());
    }

    #[test]
    fn test_entering_peer_sees_visible_objects_once() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0)]);
        let near = arb.with_api(|api| {
            let id = api.create_obj(Position::new(101.0, 0.0), NodeId::UNASSIGNED, b"");
            api.add_attr(id, AttrValue::Int(1));
            id
        });
        let far = arb.with_api(|api| api.create_obj(Position::new(103.0, 0.0), NodeId::UNASSIGNED, b""));
        step(&ctx, &mut arb);

        enter(&mut arb, 10, 0.0, 0.0, 100.0);
        step(&ctx, &mut arb);
        step(&ctx, &mut arb);
        step(&ctx, &mut arb);

        let objects: Vec<ObjectMsg> = arb.network().decoded(NodeId(10));
        let states: Vec<StateMsg> = arb.network().decoded(NodeId(10));
        assert_eq!(objects.iter().filter(|m| m.obj_id == near).count(), 1);
        assert_eq!(states.iter().filter(|m| m.obj_id == near).count(), 1);
        assert!(objects.iter().all(|m| m.obj_id != far));
    }

    #[test]
    fn test_object_leaving_view_is_tombstoned() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0)]);
        let id = arb.with_api(|api| api.create_obj(Position::new(10.0, 0.0), NodeId::UNASSIGNED, b""));
        enter(&mut arb, 10, 0.0, 0.0, 50.0);
        step(&ctx, &mut arb);

        arb.with_api(|api| api.change_pos(id, Position::new(500.0, 0.0)));
        step(&ctx, &mut arb);

        let objects: Vec<ObjectMsg> = arb.network().decoded(NodeId(10));
        let last = objects.iter().filter(|m| m.obj_id == id).last().unwrap();
        assert!(last.is_delete());
    }

    #[test]
    fn test_stale_updates_are_ignored() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0), (3, 1000.0, 0.0)]);
        step(&ctx, &mut arb);
        let id = ObjectId::compose(NodeId(3), 1);
        let update = |version: u32, x: f64| ObjectMsg {
            obj_id: id,
            pos: Position::new(x, 0.0),
            peer: NodeId::UNASSIGNED,
            pos_version: version,
            is_request: false,
        };

        arb.network_mut().deliver(NodeId(3), &update(4, 900.0));
        arb.network_mut().deliver(NodeId(3), &update(3, 800.0));
        arb.network_mut().deliver(
            NodeId(3),
            &StateMsg {
                obj_id: id,
                version: 0,
                is_request: false,
                payload: Vec::new(),
            },
        );
        step(&ctx, &mut arb);

        let obj = arb.store().get(id).unwrap();
        assert_eq!(obj.pos_version, 4);
        assert_eq!(obj.pos().x, 900.0);
        assert_eq!(obj.version, 0);
        assert_eq!(arb.logic().discovered, vec![id]);
    }

    #[test]
    fn test_handover_to_neighbor_is_acknowledged() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0), (3, 100.0, 0.0)]);
        let id = arb.with_api(|api| api.create_obj(Position::new(10.0, 0.0), NodeId::UNASSIGNED, b""));
        step(&ctx, &mut arb);

        arb.with_api(|api| api.change_pos(id, Position::new(90.0, 0.0)));
        step(&ctx, &mut arb);

        assert!(!arb.is_owner(id));
        assert_eq!(arb.store().transit_count(), 1);
        let transfers: Vec<TransferMsg> = arb.network().decoded(NodeId(3));
        assert_eq!(transfers[0].new_owner, NodeId(3));
        assert_eq!(transfers[0].orig_owner, NodeId(2));

        arb.network_mut().deliver(NodeId(3), &TransferAckMsg { obj_id: id });
        step(&ctx, &mut arb);
        assert_eq!(arb.store().transit_count(), 0);
        assert!(!arb.is_owner(id));
    }

    #[test]
    fn test_receiving_transfer_takes_ownership() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 3, &[(2, 0.0, 0.0), (3, 100.0, 0.0)]);
        step(&ctx, &mut arb);
        let id = ObjectId::compose(NodeId(2), 1);
        arb.network_mut().deliver(
            NodeId(2),
            &ObjectMsg {
                obj_id: id,
                pos: Position::new(90.0, 0.0),
                peer: NodeId::UNASSIGNED,
                pos_version: 2,
                is_request: false,
            },
        );
        arb.network_mut().deliver(
            NodeId(2),
            &TransferMsg {
                obj_id: id,
                new_owner: NodeId(3),
                orig_owner: NodeId(2),
            },
        );
        step(&ctx, &mut arb);

        assert!(arb.is_owner(id));
        let acks: Vec<TransferAckMsg> = arb.network().decoded(NodeId(2));
        assert_eq!(acks, vec![TransferAckMsg { obj_id: id }]);
    }

    #[test]
    fn test_transfer_of_unknown_object_is_ignored() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 3, &[(2, 0.0, 0.0), (3, 100.0, 0.0)]);
        let id = ObjectId::compose(NodeId(2), 7);
        arb.network_mut().deliver(
            NodeId(2),
            &TransferMsg {
                obj_id: id,
                new_owner: NodeId(3),
                orig_owner: NodeId(2),
            },
        );
        step(&ctx, &mut arb);
        assert!(!arb.is_owner(id));
        assert!(arb.network().decoded::<TransferAckMsg>(NodeId(2)).is_empty());
    }

    #[test]
    fn test_unreachable_owner_is_evicted_and_orphan_claimed() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 3, &[(2, 0.0, 0.0), (3, 100.0, 0.0)]);
        step(&ctx, &mut arb);
        let id = ObjectId::compose(NodeId(2), 1);
        arb.network_mut().deliver(
            NodeId(2),
            &ObjectMsg {
                obj_id: id,
                pos: Position::new(40.0, 0.0),
                peer: NodeId::UNASSIGNED,
                pos_version: 1,
                is_request: false,
            },
        );
        arb.network_mut().unreachable.insert(NodeId(2));

        for _ in 0..8 {
            step(&ctx, &mut arb);
        }

        assert!(arb.neighbor_ids().is_empty());
        assert!(arb.is_owner(id));
    }

    #[test]
    fn test_events_encoded_once_for_all_targets() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0), (3, 60.0, 0.0), (4, 0.0, 60.0)]);
        enter(&mut arb, 10, 5.0, 5.0, 40.0);
        step(&ctx, &mut arb);

        let event = Event {
            sender: NodeId(10),
            id: (10 << 16) + 1,
            timestamp: 1,
            kind: 0,
            payload: Vec::new(),
        };
        arb.network_mut().deliver(
            NodeId(10),
            &EventMsg {
                ttl: 3,
                admitted: 0,
                event: event.clone(),
            },
        );
        arb.network_mut().deliver(NodeId(3), &TickEventMsg { timestamp: 2 });
        arb.network_mut().deliver(NodeId(4), &TickEventMsg { timestamp: 2 });
        step(&ctx, &mut arb);

        let to_3 = arb.network().sent_to(NodeId(3), MessageTag::Event);
        let to_4 = arb.network().sent_to(NodeId(4), MessageTag::Event);
        assert_eq!(to_3.len(), 1);
        assert_eq!(to_3[0].payload, to_4[0].payload);
        let forwarded = EventMsg::decode(&to_3[0].payload).unwrap();
        assert_eq!(forwarded.ttl, 2);
        assert_eq!(forwarded.admitted, 2);
        assert_eq!(forwarded.event, Event { timestamp: 2, ..event });
        assert_eq!(arb.logic().events, vec![(2, NodeId(10))]);
    }

    #[test]
    fn test_unmarked_neighbor_holds_local_events() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0), (3, 200.0, 0.0)]);
        enter(&mut arb, 10, 5.0, 5.0, 10.0);
        step(&ctx, &mut arb);

        let event = |sender: u64| Event {
            sender: NodeId(sender),
            id: (sender << 16) + 1,
            timestamp: 1,
            kind: 0,
            payload: Vec::new(),
        };
        arb.network_mut().deliver(
            NodeId(10),
            &EventMsg {
                ttl: 3,
                admitted: 0,
                event: event(10),
            },
        );
        step(&ctx, &mut arb);
        // neighbor 3 has never sent a marker
        assert!(arb.logic().events.is_empty());
        assert_eq!(arb.pending_events(), 1);

        arb.network_mut().deliver(
            NodeId(3),
            &EventMsg {
                ttl: 2,
                admitted: 2,
                event: event(5),
            },
        );
        arb.network_mut().deliver(NodeId(3), &TickEventMsg { timestamp: 2 });
        step(&ctx, &mut arb);
        assert_eq!(arb.logic().events, vec![(2, NodeId(5)), (2, NodeId(10))]);
    }

    #[test]
    fn test_replica_refreshed_at_equal_version_survives() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 3, &[(2, 0.0, 0.0), (3, 100.0, 0.0)]);
        step(&ctx, &mut arb);
        let id = ObjectId::compose(NodeId(2), 1);
        let refresh = ObjectMsg {
            obj_id: id,
            pos: Position::new(40.0, 0.0),
            peer: NodeId::UNASSIGNED,
            pos_version: 1,
            is_request: false,
        };
        let mut attrs = AttributeList::new();
        attrs.add(AttrValue::Int(7));
        let mut payload = Vec::new();
        attrs.pack_all(&mut payload).unwrap();
        arb.network_mut().deliver(NodeId(2), &refresh);
        arb.network_mut().deliver(
            NodeId(2),
            &StateMsg {
                obj_id: id,
                version: 1,
                is_request: false,
                payload,
            },
        );

        for tick in 1..=130 {
            if tick % 30 == 0 {
                arb.network_mut().deliver(NodeId(2), &refresh);
            }
            step(&ctx, &mut arb);
        }

        assert!(arb.logic().deleted.is_empty());
        let obj = arb.store().get(id).unwrap();
        assert!(obj.is_alive());
        assert_eq!(obj.version, 1);
        assert_eq!(obj.attributes().value(0), Some(&AttrValue::Int(7)));
    }

    #[test]
    fn test_lost_replica_asks_owner_to_resend() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 3, &[(2, 0.0, 0.0), (3, 100.0, 0.0)]);
        step(&ctx, &mut arb);
        let id = ObjectId::compose(NodeId(2), 1);
        arb.network_mut().deliver(
            NodeId(2),
            &ObjectMsg {
                obj_id: id,
                pos: Position::new(40.0, 0.0),
                peer: NodeId::UNASSIGNED,
                pos_version: 1,
                is_request: false,
            },
        );
        // the owner goes quiet long enough for the replica to expire
        for _ in 0..arb.config().expiring_object_threshold + 2 {
            step(&ctx, &mut arb);
        }
        assert_eq!(arb.logic().deleted, vec![id]);
        let objects: Vec<ObjectMsg> = arb.network().decoded(NodeId(2));
        let notice = objects.iter().find(|m| m.obj_id == id).unwrap();
        assert!(notice.is_delete() && notice.is_request);

        // a diff for the dropped copy is answered with a request too
        let mut attrs = AttributeList::new();
        attrs.add(AttrValue::Int(7));
        let mut payload = Vec::new();
        attrs.pack_all(&mut payload).unwrap();
        arb.network_mut().deliver(
            NodeId(2),
            &StateMsg {
                obj_id: id,
                version: 4,
                is_request: false,
                payload,
            },
        );
        step(&ctx, &mut arb);
        let states: Vec<StateMsg> = arb.network().decoded(NodeId(2));
        assert!(states.iter().any(|m| m.obj_id == id && m.is_request));
    }

    #[test]
    fn test_owner_reintroduces_dropped_replica_in_full() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0), (3, 100.0, 0.0)]);
        let id = arb.with_api(|api| {
            let id = api.create_obj(Position::new(10.0, 0.0), NodeId::UNASSIGNED, b"");
            api.add_attr(id, AttrValue::Int(5));
            id
        });
        step(&ctx, &mut arb);
        step(&ctx, &mut arb);
        let states: Vec<StateMsg> = arb.network().decoded(NodeId(3));
        assert_eq!(states.iter().filter(|m| m.obj_id == id).count(), 1);

        arb.network_mut().deliver(
            NodeId(3),
            &ObjectMsg {
                obj_id: id,
                pos: Position::new(10.0, 0.0),
                peer: NodeId::UNASSIGNED,
                pos_version: 0,
                is_request: true,
            },
        );
        step(&ctx, &mut arb);

        assert!(arb.is_owner(id));
        let objects: Vec<ObjectMsg> = arb.network().decoded(NodeId(3));
        assert_eq!(objects.iter().filter(|m| m.obj_id == id && !m.is_delete()).count(), 2);
        let states: Vec<StateMsg> = arb.network().decoded(NodeId(3));
        let resent = states.iter().filter(|m| m.obj_id == id).last().unwrap();
        let mut copy = AttributeList::new();
        copy.unpack(&resent.payload).unwrap();
        assert_eq!(copy.value(0), Some(&AttrValue::Int(5)));
    }

    #[test]
    fn test_forwarded_events_wait_for_neighbor_marker() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0), (3, 60.0, 0.0)]);
        step(&ctx, &mut arb);
        arb.network_mut().deliver(NodeId(3), &TickEventMsg { timestamp: 1 });
        step(&ctx, &mut arb);

        let event = |sender: u64, timestamp: Tick| Event {
            sender: NodeId(sender),
            id: (sender << 16) + 1,
            timestamp,
            kind: 0,
            payload: Vec::new(),
        };
        arb.network_mut().deliver(
            NodeId(3),
            &EventMsg {
                ttl: 2,
                admitted: 3,
                event: event(12, 3),
            },
        );
        arb.network_mut().deliver(
            NodeId(3),
            &EventMsg {
                ttl: 2,
                admitted: 3,
                event: event(11, 3),
            },
        );
        step(&ctx, &mut arb);
        assert!(arb.logic().events.is_empty());
        assert_eq!(arb.pending_events(), 2);

        arb.network_mut().deliver(NodeId(3), &TickEventMsg { timestamp: 3 });
        step(&ctx, &mut arb);
        assert_eq!(arb.logic().events, vec![(3, NodeId(11)), (3, NodeId(12))]);
    }

    #[test]
    fn test_abandoned_avatar_is_removed() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0)]);
        enter(&mut arb, 10, 0.0, 0.0, 50.0);
        step(&ctx, &mut arb);
        let avatar = arb.with_api(|api| api.create_obj(Position::origin(), NodeId(10), b""));
        step(&ctx, &mut arb);

        arb.network_mut().inbox.push(Delivery::Disconnected(NodeId(10)));
        for _ in 0..arb.config().countdown_remove_avatar + 4 {
            step(&ctx, &mut arb);
        }
        assert!(arb.store().get(avatar).is_none());
        assert_eq!(arb.logic().deleted, vec![avatar]);
    }

    #[test]
    fn test_leave_stops_once_everything_is_handed_off() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0), (3, 100.0, 0.0)]);
        let id = arb.with_api(|api| api.create_obj(Position::new(10.0, 0.0), NodeId::UNASSIGNED, b""));
        step(&ctx, &mut arb);

        arb.leave();
        assert_eq!(arb.status(), ArbitratorStatus::Suspended);
        assert_eq!(arb.network().decoded::<ArbitratorLeaveMsg>(NodeId(3)).len(), 1);
        step(&ctx, &mut arb);
        assert!(!arb.is_owner(id));

        arb.network_mut().deliver(NodeId(3), &TransferAckMsg { obj_id: id });
        step(&ctx, &mut arb);
        assert_eq!(arb.status(), ArbitratorStatus::Stopped);
        assert!(arb.store().is_empty());
        assert!(arb.logic().deleted.contains(&id));
    }

    #[test]
    fn test_overload_reaches_gateway() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0)]);
        arb.with_api(|api| api.report_load(75));

        let requests: Vec<OverloadInsertMsg> = arb.network().decoded(NodeId::GATEWAY);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].level, 5);
        assert!(!arb.network().connected.contains(&NodeId::GATEWAY));
    }

    #[test]
    fn test_third_underload_demotes() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0)]).with_parent(NodeId(5));
        for _ in 0..3 {
            arb.with_api(|api| api.underload(4));
        }
        assert!(arb.is_demoted());
        let leaves: Vec<ArbitratorLeaveMsg> = arb.network().decoded(NodeId::GATEWAY);
        assert_eq!(leaves[0].parent, NodeId(5));
    }

    #[test]
    fn test_unknown_storage_reply_dropped() {
        let ctx = ManualContext::shared();
        let mut arb = arbitrator(&ctx, 2, &[(2, 0.0, 0.0)]);
        let query = arb.with_api(|api| api.query_storage(b"load 10", NodeId(10)));
        arb.storage_mut().replies.push((query, b"ok".to_vec()));
        arb.storage_mut().replies.push((QueryId(99), b"stray".to_vec()));
        step(&ctx, &mut arb);

        assert!(arb.state.queries.is_empty());
    }
}

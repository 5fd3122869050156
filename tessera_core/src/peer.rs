//! The Peer
//!
//! A peer is a passive replica holder. It never mutates objects; it sends
//! events to its current arbitrator and mirrors whatever that arbitrator
//! tells it. Its current arbitrator is always the closest one it has heard
//! of, and switching is a single ENTER carrying the versions it already holds.

use crate::attributes::AttributeList;
use crate::config::ReplicationConfig;
use crate::entity::{Event, Object, ObjectId};
use crate::error::{CodecError, ProtocolError};
use crate::logic::PeerLogic;
use crate::protocol::{
    ArbitratorMsg, EnterMsg, EventMsg, JoinMsg, MessageTag, ObjectMsg, PromoteMsg, StateMsg, WireMessage,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tessera_env::{Delivery, Messaging, NodeContext, NodeDescriptor, NodeId, Position, Tick};
use tracing::{debug, info, trace, warn};

/// A peer node and the logic it hosts.
pub struct Peer<M, L> {
    ctx: Arc<dyn NodeContext>,
    config: ReplicationConfig,
    net: M,
    logic: L,

    self_desc: NodeDescriptor,
    capacity: u32,
    joined: bool,

    /// Current arbitrator, `UNASSIGNED` until the first ENTER
    arbitrator: NodeId,
    arbitrators: BTreeMap<NodeId, NodeDescriptor>,
    send_failures: u32,

    objects: BTreeMap<ObjectId, Object>,
    /// Objects already reported to the logic
    announced: BTreeSet<ObjectId>,

    next_event: u64,
    promotion: Option<NodeDescriptor>,
}

impl<M: Messaging, L: PeerLogic> Peer<M, L> {
    pub fn new(ctx: Arc<dyn NodeContext>, node: NodeDescriptor, net: M, logic: L) -> Self {
        Self {
            ctx,
            config: ReplicationConfig::default(),
            net,
            logic,
            self_desc: node,
            capacity: 0,
            joined: false,
            arbitrator: NodeId::UNASSIGNED,
            arbitrators: BTreeMap::new(),
            send_failures: 0,
            objects: BTreeMap::new(),
            announced: BTreeSet::new(),
            next_event: 1,
            promotion: None,
        }
    }

    pub fn with_config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Capacity advertised on JOIN; above the gateway's threshold the peer
    /// becomes a promotion candidate.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Asks the gateway to admit this peer.
    pub fn join(&mut self, auth: &[u8]) -> bool {
        let gateway = NodeId::GATEWAY;
        if let Err(err) = self.net.connect(gateway) {
            warn!("{} cannot reach the gateway: {}", self.id(), err);
            return false;
        }
        let msg = JoinMsg {
            node: self.self_desc.clone(),
            capacity: self.capacity,
            auth: auth.to_vec(),
        };
        let sent = self.net.send(gateway, MessageTag::Join.as_u16(), &msg.to_bytes(), true) > 0;
        if sent {
            info!("{} asks to join at ({:.1}, {:.1})", self.id(), self.self_desc.pos.x, self.self_desc.pos.y);
            self.joined = true;
        }
        sent
    }

    pub fn tick(&mut self) {
        if !self.joined {
            return;
        }
        self.process_messages();
        self.check_handover();
        self.update_interests();
        self.net.flush();
    }

    fn process_messages(&mut self) {
        for delivery in self.net.receive() {
            match delivery {
                Delivery::Message { from, tag, payload } => {
                    if let Err(err) = self.dispatch_message(from, tag, &payload) {
                        warn!("{} dropped message {} from {}: {}", self.id(), tag, from, err);
                    }
                }
                Delivery::Disconnected(node) => {
                    if node == self.arbitrator {
                        info!("{} lost its arbitrator {}", self.id(), node);
                        self.arbitrator = NodeId::UNASSIGNED;
                    }
                    self.arbitrators.remove(&node);
                }
            }
        }
    }

    fn dispatch_message(&mut self, from: NodeId, tag: u16, payload: &[u8]) -> Result<(), ProtocolError> {
        let tag = MessageTag::try_from(tag)?;
        match tag {
            MessageTag::Object => self.handle_object(ObjectMsg::decode(payload)?),
            MessageTag::State => self.handle_state(StateMsg::decode(payload)?)?,
            MessageTag::Arbitrator => self.handle_arbitrator(from, ArbitratorMsg::decode(payload)?),
            MessageTag::Promote => {
                let msg = PromoteMsg::decode(payload)?;
                info!("{} asked to become an arbitrator near {}", self.id(), msg.requester.id);
                self.promotion = Some(msg.requester);
            }
            other => debug!("{} ignores {} from {}", self.id(), other, from),
        }
        Ok(())
    }

    fn handle_object(&mut self, msg: ObjectMsg) {
        let self_id = self.id();
        let id = msg.obj_id;
        let Some(obj) = self.objects.get_mut(&id) else {
            if !msg.is_delete() {
                trace!("{} receives {}", self_id, id);
                let obj = Object::from_position(&msg);
                if obj.peer == self_id {
                    self.self_desc.pos = *obj.pos();
                }
                self.objects.insert(id, obj);
            }
            return;
        };

        if msg.is_delete() {
            // my own avatar stays until an owner deletes it through a live update
            if obj.peer != self_id {
                obj.mark_deleted();
            }
            return;
        }
        if obj.decode_position(&msg) && obj.peer == self_id {
            self.self_desc.pos = *obj.pos();
        }
    }

    fn handle_state(&mut self, msg: StateMsg) -> Result<(), CodecError> {
        match self.objects.get_mut(&msg.obj_id) {
            Some(obj) => {
                obj.decode_state(&msg)?;
            }
            None => trace!("{} got STATE for unknown {}", self.id(), msg.obj_id),
        }
        Ok(())
    }

    fn handle_arbitrator(&mut self, from: NodeId, msg: ArbitratorMsg) {
        trace!("{} learns {} arbitrators from {}", self.id(), msg.entries.len(), from);
        self.arbitrators = msg
            .entries
            .into_iter()
            .filter(|entry| entry.node.id.is_assigned())
            .map(|entry| (entry.node.id, entry.node))
            .collect();
    }

    fn closest_arbitrator(&self) -> Option<NodeId> {
        let pos = self.self_desc.pos;
        self.arbitrators
            .values()
            .min_by(|a, b| a.distance_to(&pos).total_cmp(&b.distance_to(&pos)))
            .map(|node| node.id)
    }

    /// Switches to the closest known arbitrator.
    fn check_handover(&mut self) {
        let Some(closest) = self.closest_arbitrator() else {
            return;
        };
        if closest == self.arbitrator {
            return;
        }

        if !self.net.is_connected(closest) {
            if let Err(err) = self.net.connect(closest) {
                warn!("{} cannot reach arbitrator {}: {}", self.id(), closest, err);
                self.arbitrators.remove(&closest);
                return;
            }
        }
        let enter = EnterMsg {
            node: self.self_desc.clone(),
            known: self.objects.values().filter(|o| o.is_alive()).map(Object::known_version).collect(),
        };
        if self.net.send(closest, MessageTag::Enter.as_u16(), &enter.to_bytes(), true) == 0 {
            debug!("{} could not enter {}", self.id(), closest);
            return;
        }

        let previous = std::mem::replace(&mut self.arbitrator, closest);
        info!("{} moves from {} to {}", self.id(), previous, closest);
        if previous.is_assigned() && previous != closest {
            self.net.disconnect(previous);
        }
        self.send_failures = 0;
    }

    /// Drops what left the view and reports the rest to the logic.
    fn update_interests(&mut self) {
        let self_id = self.id();
        let pos = self.self_desc.pos;
        let limit = self.self_desc.aoi * self.config.aoi_buffer_multiplier;

        let gone: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|obj| !obj.is_alive() || (obj.peer != self_id && nalgebra::distance(obj.pos(), &pos) > limit))
            .map(|obj| obj.id())
            .collect();
        for id in gone {
            self.objects.remove(&id);
            if self.announced.remove(&id) {
                self.logic.obj_deleted(id);
            }
        }

        for obj in self.objects.values_mut() {
            let id = obj.id();
            if self.announced.insert(id) {
                self.logic.obj_discovered(obj, obj.peer == self_id);
            } else {
                if obj.pos_dirty {
                    self.logic.pos_changed(id, obj.pos(), obj.pos_version);
                }
                for (index, value) in obj.attributes().dirty_slots() {
                    self.logic.state_updated(id, index, value, obj.version);
                }
            }
            obj.reset_dirty();
        }
    }

    /// Builds an event stamped with this peer's next id and the current tick.
    pub fn create_event(&mut self, kind: u8, attributes: &AttributeList) -> Result<Event, CodecError> {
        let id = (self.id().as_u64() << 16) + self.next_event;
        let event = Event::new(self.id(), id, self.now(), kind, attributes)?;
        self.next_event += 1;
        Ok(event)
    }

    /// Sends `event` to the current arbitrator. Repeated failures drop that
    /// arbitrator and enter the closest remaining one right away.
    pub fn send_event(&mut self, event: &Event) -> bool {
        let target = self.arbitrator;
        if !target.is_assigned() {
            debug!("{} has no arbitrator for event {:X}", self.id(), event.id);
            return false;
        }
        let msg = EventMsg {
            ttl: self.config.event_ttl,
            admitted: 0,
            event: event.clone(),
        };
        if self.net.send(target, MessageTag::Event.as_u16(), &msg.to_bytes(), true) > 0 {
            self.send_failures = 0;
            return true;
        }

        self.send_failures += 1;
        if self.send_failures >= self.config.max_send_failures {
            warn!("{} gives up on arbitrator {}", self.id(), target);
            self.arbitrators.remove(&target);
            self.net.disconnect(target);
            self.arbitrator = NodeId::UNASSIGNED;
            self.send_failures = 0;
            self.check_handover();
        }
        false
    }

    /// Returns a pending promotion request once.
    pub fn is_promoted(&mut self) -> Option<NodeDescriptor> {
        self.promotion.take()
    }

    pub fn id(&self) -> NodeId {
        self.self_desc.id
    }

    pub fn now(&self) -> Tick {
        self.ctx.now()
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.self_desc
    }

    pub fn position(&self) -> Position {
        self.self_desc.pos
    }

    pub fn current_arbitrator(&self) -> NodeId {
        self.arbitrator
    }

    pub fn known_arbitrators(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.arbitrators.values()
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// This peer's own avatar, once it has been replicated here.
    pub fn avatar(&self) -> Option<&Object> {
        let self_id = self.id();
        self.objects.values().find(|obj| obj.peer == self_id && obj.is_alive())
    }

    pub fn logic(&self) -> &L {
        &self.logic
    }

    pub fn logic_mut(&mut self) -> &mut L {
        &mut self.logic
    }

    pub fn network(&self) -> &M {
        &self.net
    }

    pub fn network_mut(&mut self) -> &mut M {
        &mut self.net
    }
}

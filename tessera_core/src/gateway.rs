//! Admission and load signals.
//!
//! Every arbitrator can accept a joining peer whose position falls in its
//! region; the gateway additionally authenticates joiners through the logic,
//! keeps the list of peers able to serve as arbitrators, and answers
//! overload requests by promoting one of them.

use crate::arbitrator::ArbitratorState;
use crate::config::ReplicationConfig;
use crate::logic::LogicNotice;
use crate::protocol::{
    ArbitratorLeaveMsg, ArbitratorMsg, JoinMsg, OverloadInsertMsg, PromoteMsg, UnderloadMsg,
    WireMessage,
};
use std::collections::BTreeMap;
use tessera_env::{Messaging, NodeDescriptor, NodeId, Overlay, Position, Storage, Tick};
use tracing::{debug, info, warn};

/// Windowed counter behind overload and underload signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadCounter {
    count: u32,
    last: Option<Tick>,
}

impl LoadCounter {
    /// Adds `amount`, first resetting if the previous signal is older than
    /// `window` ticks. Returns the new count.
    pub fn add(&mut self, amount: u32, now: Tick, window: Tick) -> u32 {
        if self.last.is_some_and(|last| now.saturating_sub(last) >= window) {
            self.count = 0;
        }
        self.count = self.count.saturating_add(amount);
        self.last = Some(now);
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Load-signal bookkeeping shared by every arbitrator.
#[derive(Debug, Default)]
pub struct LoadSignals {
    pub overload: LoadCounter,
    pub underload: LoadCounter,
    pub demoted: bool,
}

/// A peer able to serve as an arbitrator.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: NodeDescriptor,
    pub capacity: u32,
    pub promotions: u32,
}

/// Gateway-only state.
#[derive(Debug, Default)]
pub struct GatewayState {
    candidates: BTreeMap<NodeId, Candidate>,
    /// Where and when promotions happened recently
    promoted: Vec<(Position, Tick)>,
}

impl GatewayState {
    pub fn add_candidate(&mut self, node: NodeDescriptor, capacity: u32) {
        self.candidates.entry(node.id).or_insert(Candidate {
            node,
            capacity,
            promotions: 0,
        });
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    /// True if a promotion near `pos` is still fresh.
    pub fn recently_promoted_near(&self, pos: &Position, radius: f64) -> bool {
        self.promoted
            .iter()
            .any(|(at, _)| nalgebra::distance(at, pos) < radius)
    }

    /// Picks the candidate with the fewest promotions and charges it one.
    pub fn select(&mut self, pos: Position, now: Tick) -> Option<Candidate> {
        let chosen = self
            .candidates
            .values_mut()
            .min_by_key(|c| c.promotions)?;
        chosen.promotions += 1;
        let chosen = chosen.clone();
        self.promoted.push((pos, now));
        Some(chosen)
    }

    pub fn release(&mut self, parent: NodeId) {
        if let Some(candidate) = self.candidates.get_mut(&parent) {
            candidate.promotions = candidate.promotions.saturating_sub(1);
        }
    }

    /// Forgets promotion records older than `ttl`.
    pub fn expire(&mut self, now: Tick, ttl: Tick) {
        self.promoted.retain(|(_, at)| now.saturating_sub(*at) < ttl);
    }
}

/// Arbitrator radius covering every attached peer's AOI.
pub fn covering_aoi<'a>(
    center: &Position,
    peers: impl IntoIterator<Item = &'a NodeDescriptor>,
    config: &ReplicationConfig,
) -> f64 {
    peers.into_iter().fold(config.min_arbitrator_aoi, |aoi, peer| {
        let reach = nalgebra::distance(center, &peer.pos) + peer.aoi;
        if reach >= aoi {
            reach * config.aoi_growth
        } else {
            aoi
        }
    })
}

impl<M: Messaging, O: Overlay, S: Storage> ArbitratorState<M, O, S> {
    pub(crate) fn handle_join(&mut self, from: NodeId, msg: JoinMsg) {
        let joiner = msg.node.id;
        if self.gateway.is_some() && !self.pending_joins.contains_key(&joiner) && from == joiner {
            debug!("{} received JOIN from {}", self.id(), joiner);
            self.notices.push_back(LogicNotice::JoinRequested {
                peer: msg.node.clone(),
                auth: msg.auth.clone(),
            });
            self.pending_joins.insert(joiner, msg);
            return;
        }
        self.check_acceptance(from, &msg);
    }

    /// Admits a peer the logic has approved.
    pub(crate) fn insert_peer(&mut self, peer: NodeId, init: &[u8]) -> bool {
        let Some(mut join) = self.pending_joins.remove(&peer) else {
            warn!("{} cannot insert {}: no pending JOIN", self.id(), peer);
            return false;
        };
        if join.capacity > self.config.arbitrator_capacity_threshold {
            if let Some(gateway) = self.gateway.as_mut() {
                info!(
                    "gateway records {} (capacity {}) as a potential arbitrator",
                    join.node.id, join.capacity
                );
                gateway.add_candidate(join.node.clone(), join.capacity);
            }
        }
        join.auth = init.to_vec();
        self.check_acceptance(peer, &join);
        true
    }

    /// Takes the joiner if it lies in my region, otherwise forwards the JOIN
    /// toward the arbitrator that does.
    fn check_acceptance(&mut self, from: NodeId, msg: &JoinMsg) {
        let self_id = self.id();
        let joiner = &msg.node;
        let closest = self.overlay.closest_to(&joiner.pos);

        if !self.overlay.contains(self_id, &joiner.pos)
            && closest.is_assigned()
            && closest != self_id
            && closest != from
        {
            debug!("{} forwards JOIN of {} to {}", self_id, joiner.id, closest);
            self.send(closest, msg, true);
            return;
        }

        info!("{} accepts {} at ({:.1}, {:.1})", self_id, joiner.id, joiner.pos.x, joiner.pos.y);
        self.create_obj(joiner.pos, joiner.id, &msg.auth);
        if let Err(err) = self.net.connect(joiner.id) {
            warn!("{} cannot reach joiner {}: {}", self_id, joiner.id, err);
            return;
        }
        let advert = ArbitratorMsg {
            entries: vec![self.self_entry()],
        };
        self.send(joiner.id, &advert, true);
    }

    /// Sends `msg` to the gateway, opening a link only for the duration.
    fn send_to_gateway<T: WireMessage>(&mut self, msg: &T) {
        let gateway = NodeId::GATEWAY;
        if self.id() == gateway {
            self.send(gateway, msg, true);
            return;
        }
        let was_connected = self.net.is_connected(gateway);
        if !was_connected {
            if let Err(err) = self.net.connect(gateway) {
                warn!("{} cannot reach the gateway: {}", self.id(), err);
                return;
            }
        }
        self.send(gateway, msg, true);
        if !was_connected {
            self.net.disconnect(gateway);
        }
    }

    pub(crate) fn report_load(&mut self, load: u32) {
        if load > self.config.overload_threshold {
            self.overload(load - self.config.overload_threshold);
        } else if load < self.config.underload_threshold {
            self.underload(self.config.underload_threshold - load);
        }
    }

    /// Accumulates overload; every fifth unit asks the gateway for help.
    pub(crate) fn overload(&mut self, level: u32) {
        let now = self.now();
        let count = self
            .load
            .overload
            .add(level, now, self.config.load_counting_threshold);
        if count % 5 == 0 {
            debug!("{} overloaded (level {}), asking the gateway", self.id(), level);
            let msg = OverloadInsertMsg {
                level,
                pos: self.self_desc.pos,
            };
            self.send_to_gateway(&msg);
        }
    }

    /// Two signals warn the neighbors; the third demotes this arbitrator.
    pub(crate) fn underload(&mut self, level: u32) {
        let now = self.now();
        let count = self
            .load
            .underload
            .add(1, now, self.config.load_counting_threshold);
        if count <= 2 {
            let bytes = UnderloadMsg { level }.to_bytes();
            let neighbors: Vec<NodeId> = self.neighbors.keys().copied().collect();
            for neighbor in neighbors {
                self.send_bytes(neighbor, UnderloadMsg::TAG, &bytes, false);
            }
            return;
        }

        if self.gateway.is_none() {
            info!("{} is underloaded and steps down", self.id());
            self.load.demoted = true;
            let msg = ArbitratorLeaveMsg {
                node: self.id(),
                parent: self.parent,
            };
            self.send_to_gateway(&msg);
        }
        self.load.underload.reset();
    }

    pub(crate) fn handle_overload_insert(&mut self, from: NodeId, msg: OverloadInsertMsg) {
        let now = self.now();
        let radius = self.config.promotion_exclusion_radius;
        let Some(gateway) = self.gateway.as_mut() else {
            debug!("{} ignores OVERLOAD_I from {}: not the gateway", self.id(), from);
            return;
        };
        if gateway.recently_promoted_near(&msg.pos, radius) {
            debug!("promotion near ({:.0}, {:.0}) already under way", msg.pos.x, msg.pos.y);
            return;
        }
        let Some(candidate) = gateway.select(msg.pos, now) else {
            debug!("no candidate to promote for {}", from);
            return;
        };

        let requester = self
            .neighbors
            .get(&from)
            .cloned()
            .map(|mut node| {
                node.pos = msg.pos;
                node
            })
            .unwrap_or_else(|| NodeDescriptor::new(from, msg.pos, self.config.min_arbitrator_aoi));
        info!("gateway promotes {} to help {}", candidate.node.id, from);
        self.send(candidate.node.id, &PromoteMsg { requester }, true);
    }

    pub(crate) fn handle_arbitrator_leave(&mut self, from: NodeId, msg: ArbitratorLeaveMsg) {
        if let Some(gateway) = self.gateway.as_mut() {
            if msg.parent.is_assigned() && msg.parent != NodeId::GATEWAY {
                gateway.release(msg.parent);
            }
        }
        if self.neighbors.remove(&from).is_some() {
            debug!("{} drops departing neighbor {}", self.id(), from);
            self.knowledge.forget_node(from);
            self.events.forget(from);
        }
    }

    pub(crate) fn expire_promotions(&mut self) {
        let now = self.now();
        let ttl = self.config.countdown_promote;
        if let Some(gateway) = self.gateway.as_mut() {
            gateway.expire(now, ttl);
        }
    }
}

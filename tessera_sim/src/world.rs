//! Simulated world: every arbitrator and peer of one run, stepped in lockstep.
//!
//! All nodes share one virtual clock, one router, one overlay and one backing
//! store. A step advances the clock, ticks every live arbitrator and then
//! every live peer, and finally lets the peers act (walk and ping).
//!
//! Convergence checks read the nodes directly; they are meant to be run
//! after a quiet period in which nobody moves.

use crate::context::{SimClock, SimContext};
use crate::error::SimError;
use crate::logic::{move_attributes, profile_key, AppliedEvent, ObserverLogic, WorldLogic, MOVE, PING};
use crate::network::{split_at, NetworkStats, SimLink, SimNetworkController};
use crate::overlay::SharedOverlay;
use crate::storage::MemoryStorage;
use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tessera_core::{Arbitrator, ArbitratorStatus, AttributeList, ObjectId, Peer, ReplicationConfig};
use tessera_env::{NetworkController, NodeDescriptor, NodeId, Overlay, Position, Tick};
use tracing::{debug, info, warn};

pub type SimArbitrator = Arbitrator<SimLink, SharedOverlay, MemoryStorage, WorldLogic>;
pub type SimPeer = Peer<SimLink, ObserverLogic>;

/// Peers are numbered from here.
pub const FIRST_PEER: u64 = 100;

/// Arbitrators spawned by promotion are numbered from here.
pub const FIRST_PROMOTED: u64 = 1000;

/// Configuration for a simulated world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed; every node RNG and the walk are derived from it
    pub seed: u64,

    /// Grid arbitrators, the gateway included (default: 4)
    pub arbitrators: usize,

    /// Peers joining at tick 0 (default: 12)
    pub peers: usize,

    /// Side of the square world (default: 400.0)
    pub world_size: f64,

    /// Peer AOI radius (default: 60.0)
    pub peer_aoi: f64,

    /// Ticks of activity before the quiet period (default: 200)
    pub ticks: u64,

    /// Quiet ticks before convergence is checked (default: 40)
    pub settle_ticks: u64,

    /// Loss rate of unreliable traffic (default: 0.0)
    pub loss: f64,

    /// Link latency in ticks (default: 1)
    pub latency: Tick,

    /// Longest walk per tick (default: 3.0)
    pub step: f64,

    /// Chance per tick that a peer pings instead of walking (default: 0.1)
    pub ping_rate: f64,

    /// Capacity peers advertise when joining (default: 50)
    pub peer_capacity: u32,

    /// Load each attached peer adds to its arbitrator (default: 0, no reports)
    pub load_per_peer: u32,

    pub replication: ReplicationConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            arbitrators: 4,
            peers: 12,
            world_size: 400.0,
            peer_aoi: 60.0,
            ticks: 200,
            settle_ticks: 40,
            loss: 0.0,
            latency: 1,
            step: 3.0,
            ping_rate: 0.1,
            peer_capacity: 50,
            load_per_peer: 0,
            replication: ReplicationConfig::default(),
        }
    }
}

impl SimConfig {
    /// Loads overrides from a JSON file; missing fields keep their defaults.
    pub fn from_file(path: &str) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path).map_err(|source| SimError::ConfigRead {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SimError::ConfigParse {
            path: path.to_string(),
            source,
        })
    }
}

/// An event a peer handed to its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SentEvent {
    pub sender: NodeId,
    pub id: u64,
    pub timestamp: Tick,
}

/// Snapshot of world-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorldStats {
    pub tick: Tick,
    pub live_arbitrators: usize,
    pub attached_peers: usize,
    pub objects: usize,
    pub owned: usize,
    pub events_sent: usize,
    pub events_applied: usize,
    pub handovers: u64,
    pub rejoins: u64,
    pub promotions: usize,
    pub network: NetworkStats,
}

/// Centres of a square grid holding `n` cells over a `size` x `size` world.
pub fn grid_positions(n: usize, size: f64) -> Vec<Position> {
    let side = (n as f64).sqrt().ceil().max(1.0) as usize;
    let cell = size / side as f64;
    (0..n)
        .map(|i| {
            let (row, col) = (i / side, i % side);
            Position::new((col as f64 + 0.5) * cell, (row as f64 + 0.5) * cell)
        })
        .collect()
}

fn random_point(rng: &mut ChaCha8Rng, size: f64) -> Position {
    Position::new(rng.gen_range(0.0..size), rng.gen_range(0.0..size))
}

fn auth_of(peer: NodeId) -> Vec<u8> {
    format!("hero-{}", peer.as_u64()).into_bytes()
}

/// The simulated world.
pub struct SimWorld {
    config: SimConfig,
    clock: SimClock,
    network: SimNetworkController,
    overlay: SharedOverlay,
    storage: MemoryStorage,
    rng: ChaCha8Rng,

    arbitrators: BTreeMap<NodeId, SimArbitrator>,
    peers: BTreeMap<NodeId, SimPeer>,
    crashed: BTreeSet<NodeId>,

    /// Walk target per peer
    goals: BTreeMap<NodeId, Position>,
    /// Tick since which a peer has known no arbitrator at all
    detached_since: BTreeMap<NodeId, Tick>,
    last_arbitrator: BTreeMap<NodeId, NodeId>,

    sent_events: Vec<SentEvent>,
    moving: bool,
    next_promoted: u64,
    /// `(host peer, new arbitrator)` per promotion
    promotions: Vec<(NodeId, NodeId)>,
    handovers: u64,
    rejoins: u64,
}

impl SimWorld {
    /// Builds the gateway, the grid arbitrators and the peers. Peers send
    /// their JOIN immediately.
    pub fn new(config: SimConfig) -> Self {
        let clock = SimClock::new();
        let network = SimNetworkController::new(config.seed.rotate_left(17));
        network.set_default_latency(config.latency);
        network.set_default_loss(config.loss);

        let mut world = Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            clock,
            network,
            overlay: SharedOverlay::new(),
            storage: MemoryStorage::new(NodeId::GATEWAY),
            arbitrators: BTreeMap::new(),
            peers: BTreeMap::new(),
            crashed: BTreeSet::new(),
            goals: BTreeMap::new(),
            detached_since: BTreeMap::new(),
            last_arbitrator: BTreeMap::new(),
            sent_events: Vec::new(),
            moving: true,
            next_promoted: FIRST_PROMOTED,
            promotions: Vec::new(),
            handovers: 0,
            rejoins: 0,
            config,
        };

        let sites = grid_positions(world.config.arbitrators.max(1), world.config.world_size);
        for (i, pos) in sites.into_iter().enumerate() {
            world.spawn_arbitrator(NodeId(NodeId::GATEWAY.as_u64() + i as u64), pos, None);
        }
        for i in 0..world.config.peers {
            let id = NodeId(FIRST_PEER + i as u64);
            let pos = random_point(&mut world.rng, world.config.world_size);
            // every other peer has a stored profile
            if i % 2 == 0 {
                world
                    .storage
                    .put(&profile_key(id), format!("knight-{}", id.as_u64()).as_bytes());
            }
            world.spawn_peer(id, pos);
        }
        info!(
            "world seeded {}: {} arbitrators, {} peers",
            world.config.seed,
            world.arbitrators.len(),
            world.peers.len()
        );
        world
    }

    fn spawn_arbitrator(&mut self, id: NodeId, pos: Position, parent: Option<NodeId>) {
        let ctx = SimContext::for_node(self.config.seed, id, self.clock.clone());
        let link = self.network.link(id, self.clock.clone());
        let node = NodeDescriptor::new(id, pos, self.config.replication.min_arbitrator_aoi);
        let logic = WorldLogic::new().with_load_per_peer(self.config.load_per_peer);

        let mut arbitrator = Arbitrator::new(ctx, node, link, self.overlay.clone(), self.storage.for_node(id), logic)
            .with_config(self.config.replication.clone());
        if let Some(parent) = parent {
            arbitrator = arbitrator.with_parent(parent);
        }
        arbitrator.join();
        self.arbitrators.insert(id, arbitrator);
    }

    fn spawn_peer(&mut self, id: NodeId, pos: Position) {
        let ctx = SimContext::for_node(self.config.seed, id, self.clock.clone());
        let link = self.network.link(id, self.clock.clone());
        let node = NodeDescriptor::new(id, pos, self.config.peer_aoi);

        let mut peer = Peer::new(ctx, node, link, ObserverLogic::default())
            .with_config(self.config.replication.clone())
            .with_capacity(self.config.peer_capacity);
        if !peer.join(&auth_of(id)) {
            warn!("{} could not reach the gateway", id);
        }
        self.peers.insert(id, peer);
    }

    /// Runs one tick of the whole world and returns the new tick.
    pub fn step(&mut self) -> Tick {
        let now = self.clock.advance();

        for (id, arbitrator) in self.arbitrators.iter_mut() {
            if self.crashed.contains(id) {
                continue;
            }
            arbitrator.tick();
            if arbitrator.is_demoted() && arbitrator.status() == ArbitratorStatus::Active {
                info!("{} demoted, leaving", id);
                arbitrator.leave();
            }
        }

        let mut promoted = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            if self.crashed.contains(id) {
                continue;
            }
            peer.tick();
            if let Some(requester) = peer.is_promoted() {
                promoted.push((*id, peer.position(), requester));
            }
        }

        self.track_peers(now);
        if self.moving {
            self.drive_peers();
        }
        for (host, pos, requester) in promoted {
            self.promote(host, pos, requester);
        }
        now
    }

    /// Runs `ticks` steps.
    pub fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Counts handovers and sends peers that lost every arbitrator back
    /// through the gateway.
    fn track_peers(&mut self, now: Tick) {
        let rejoin_after = 3 * self.config.replication.countdown_remove_avatar as Tick;
        for (id, peer) in self.peers.iter_mut() {
            if self.crashed.contains(id) {
                continue;
            }
            let current = peer.current_arbitrator();
            let previous = self.last_arbitrator.insert(*id, current);
            if let Some(previous) = previous {
                if previous.is_assigned() && current.is_assigned() && previous != current {
                    self.handovers += 1;
                }
            }

            let stranded = !current.is_assigned() && peer.known_arbitrators().next().is_none();
            if !stranded {
                self.detached_since.remove(id);
                continue;
            }
            let since = *self.detached_since.entry(*id).or_insert(now);
            if now - since >= rejoin_after {
                debug!("{} is stranded, joining again", id);
                if peer.join(&auth_of(*id)) {
                    self.rejoins += 1;
                }
                self.detached_since.insert(*id, now);
            }
        }
    }

    /// Every attached peer walks toward its goal or pings.
    fn drive_peers(&mut self) {
        let Self {
            config,
            peers,
            goals,
            rng,
            crashed,
            sent_events,
            ..
        } = self;

        for (id, peer) in peers.iter_mut() {
            if crashed.contains(id) || !peer.current_arbitrator().is_assigned() || peer.avatar().is_none() {
                continue;
            }
            let pos = peer.position();
            let goal = *goals.entry(*id).or_insert_with(|| random_point(&mut *rng, config.world_size));
            let to_goal: Vector2<f64> = goal - pos;
            let dist = to_goal.norm();
            if dist < config.step {
                goals.insert(*id, random_point(rng, config.world_size));
            }

            let (kind, attrs) = if rng.gen_bool(config.ping_rate.clamp(0.0, 1.0)) {
                (PING, AttributeList::new())
            } else if dist > f64::EPSILON {
                let delta = to_goal * (config.step.min(dist) / dist);
                (MOVE, move_attributes(delta.x as f32, delta.y as f32))
            } else {
                continue;
            };

            match peer.create_event(kind, &attrs) {
                Ok(event) => {
                    if peer.send_event(&event) {
                        sent_events.push(SentEvent {
                            sender: event.sender,
                            id: event.id,
                            timestamp: event.timestamp,
                        });
                    }
                }
                Err(err) => warn!("{} cannot build event: {}", id, err),
            }
        }
    }

    /// Starts an arbitrator hosted by `host`, halfway toward the requester.
    fn promote(&mut self, host: NodeId, host_pos: Position, requester: NodeDescriptor) {
        let id = NodeId(self.next_promoted);
        self.next_promoted += 1;

        let mut pos = nalgebra::center(&requester.pos, &host_pos);
        if nalgebra::distance(&pos, &requester.pos) < 1.0 {
            pos.x += 1.0;
        }
        info!("{} hosts new arbitrator {} to relieve {}", host, id, requester.id);
        self.spawn_arbitrator(id, pos, Some(host));
        self.promotions.push((host, id));
    }

    // ── Fault injection ────────────────────────────────────────────────

    /// Silently stops a node. A crashed arbitrator also drops out of the overlay.
    pub fn crash(&mut self, node: NodeId) {
        info!("crashing {}", node);
        self.network.crash(node);
        self.crashed.insert(node);
        if self.arbitrators.contains_key(&node) {
            Overlay::leave(&mut self.overlay, node);
        }
    }

    /// Cuts the world in two along `x = world_size / 2`.
    pub fn partition_halves(&mut self) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut xs: BTreeMap<NodeId, f64> = BTreeMap::new();
        for (id, arbitrator) in &self.arbitrators {
            xs.insert(*id, arbitrator.descriptor().pos.x);
        }
        for (id, peer) in &self.peers {
            xs.insert(*id, peer.position().x);
        }
        let (west, east) = split_at(&xs, self.config.world_size / 2.0);
        info!("partition: {} nodes west, {} east", west.len(), east.len());
        self.network.partition(&west, &east);
        (west, east)
    }

    pub fn heal(&mut self) {
        info!("healing all partitions");
        self.network.heal_all();
    }

    pub fn set_loss(&mut self, loss: f64) {
        if loss <= 0.0 {
            self.network.clear_loss();
        } else {
            self.network.set_default_loss(loss);
        }
    }

    pub fn set_moving(&mut self, moving: bool) {
        self.moving = moving;
    }

    /// Sets the load every arbitrator reports per attached peer.
    pub fn set_load_per_peer(&mut self, load: u32) {
        for arbitrator in self.arbitrators.values_mut() {
            arbitrator.logic_mut().load_per_peer = load;
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn network(&self) -> &SimNetworkController {
        &self.network
    }

    pub fn arbitrator(&self, id: NodeId) -> Option<&SimArbitrator> {
        self.arbitrators.get(&id)
    }

    pub fn peer(&self, id: NodeId) -> Option<&SimPeer> {
        self.peers.get(&id)
    }

    pub fn arbitrator_ids(&self) -> Vec<NodeId> {
        self.arbitrators.keys().copied().collect()
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn promotions(&self) -> &[(NodeId, NodeId)] {
        &self.promotions
    }

    pub fn sent_events(&self) -> &[SentEvent] {
        &self.sent_events
    }

    pub fn is_crashed(&self, node: NodeId) -> bool {
        self.crashed.contains(&node)
    }

    fn live_arbitrators(&self) -> impl Iterator<Item = &SimArbitrator> {
        self.arbitrators
            .iter()
            .filter(|(id, a)| !self.crashed.contains(*id) && a.status() != ArbitratorStatus::Stopped)
            .map(|(_, a)| a)
    }

    fn live_peers(&self) -> impl Iterator<Item = &SimPeer> {
        self.peers
            .iter()
            .filter(|(id, _)| !self.crashed.contains(*id))
            .map(|(_, p)| p)
    }

    pub fn stats(&self) -> WorldStats {
        let owners = self.owners();
        WorldStats {
            tick: self.now(),
            live_arbitrators: self.live_arbitrators().count(),
            attached_peers: self
                .live_peers()
                .filter(|p| p.current_arbitrator().is_assigned())
                .count(),
            objects: owners.len(),
            owned: owners.values().map(Vec::len).sum(),
            events_sent: self.sent_events.len(),
            events_applied: self.arbitrators.values().map(|a| a.logic().applied.len()).sum(),
            handovers: self.handovers,
            rejoins: self.rejoins,
            promotions: self.promotions.len(),
            network: self.network.stats(),
        }
    }

    // ── Convergence checks ─────────────────────────────────────────────

    /// Live owners of every live object.
    pub fn owners(&self) -> BTreeMap<ObjectId, Vec<NodeId>> {
        let mut owners: BTreeMap<ObjectId, Vec<NodeId>> = BTreeMap::new();
        for arbitrator in self.live_arbitrators() {
            for id in arbitrator.owned_ids() {
                if arbitrator.store().get(id).is_some_and(|obj| obj.is_alive()) {
                    owners.entry(id).or_default().push(arbitrator.id());
                }
            }
        }
        owners
    }

    /// Objects owned by more than one arbitrator.
    pub fn ownership_violations(&self) -> usize {
        self.owners().values().filter(|owners| owners.len() > 1).count()
    }

    /// Authoritative avatar of every peer: `peer -> (object, position)`.
    fn owned_avatars(&self) -> BTreeMap<NodeId, (ObjectId, Position)> {
        let mut avatars = BTreeMap::new();
        for arbitrator in self.live_arbitrators() {
            for id in arbitrator.owned_ids() {
                if let Some(obj) = arbitrator.store().get(id) {
                    if obj.is_alive() && obj.peer.is_assigned() {
                        avatars.entry(obj.peer).or_insert((id, *obj.pos()));
                    }
                }
            }
        }
        avatars
    }

    /// Live peers whose avatar no live arbitrator owns.
    pub fn orphaned_avatars(&self) -> usize {
        let avatars = self.owned_avatars();
        self.live_peers().filter(|p| !avatars.contains_key(&p.id())).count()
    }

    /// Replicas held by a current neighbor of the owner that disagree with
    /// the owner's versions.
    pub fn replica_divergence(&self) -> usize {
        let owners = self.owners();
        let mut diverged = 0;
        for holder in self.live_arbitrators() {
            for obj in holder.store().iter().filter(|o| o.is_alive()) {
                let id = obj.id();
                if holder.is_owner(id) {
                    continue;
                }
                let Some([owner_id]) = owners.get(&id).map(Vec::as_slice) else {
                    continue;
                };
                let Some(owner) = self.arbitrators.get(owner_id) else {
                    continue;
                };
                if !owner.neighbor_ids().contains(&holder.id()) {
                    continue;
                }
                let Some(master) = owner.store().get(id) else {
                    continue;
                };
                if master.pos_version != obj.pos_version || master.version != obj.version {
                    debug!(
                        "{} holds {} at {}/{}, owner {} has {}/{}",
                        holder.id(),
                        id,
                        obj.pos_version,
                        obj.version,
                        owner_id,
                        master.pos_version,
                        master.version
                    );
                    diverged += 1;
                }
            }
        }
        diverged
    }

    /// Avatars inside an attached peer's AOI that the peer does not hold.
    pub fn visibility_misses(&self) -> usize {
        let avatars = self.owned_avatars();
        let mut misses = 0;
        for peer in self.live_peers() {
            if !peer.current_arbitrator().is_assigned() {
                continue;
            }
            let Some((_, own_pos)) = avatars.get(&peer.id()) else {
                continue;
            };
            let reach = peer.descriptor().aoi * 0.98;
            for (other, (obj_id, pos)) in &avatars {
                if self.crashed.contains(other) || nalgebra::distance(own_pos, pos) > reach {
                    continue;
                }
                if !peer.object(*obj_id).is_some_and(|obj| obj.is_alive()) {
                    debug!("{} misses {} of {}", peer.id(), obj_id, other);
                    misses += 1;
                }
            }
        }
        misses
    }

    fn applied_logs(&self) -> impl Iterator<Item = &[AppliedEvent]> {
        self.arbitrators.values().map(|a| a.logic().applied.as_slice())
    }

    /// Adjacent pairs within one arbitrator's tick batch that break
    /// `(timestamp, sender)` order.
    pub fn event_order_violations(&self) -> usize {
        self.applied_logs()
            .map(|log| {
                log.windows(2)
                    .filter(|pair| {
                        pair[0].tick == pair[1].tick
                            && (pair[1].timestamp, pair[1].sender) < (pair[0].timestamp, pair[0].sender)
                    })
                    .count()
            })
            .sum()
    }

    /// Events applied more than once by the same arbitrator.
    pub fn duplicate_events(&self) -> usize {
        self.applied_logs()
            .map(|log| {
                let mut seen = BTreeSet::new();
                log.iter().filter(|e| !seen.insert(e.id)).count()
            })
            .sum()
    }

    /// Sent events stamped at or before `cutoff` that no arbitrator applied.
    pub fn unapplied_events(&self, cutoff: Tick) -> usize {
        let applied: BTreeSet<u64> = self.applied_logs().flatten().map(|e| e.id).collect();
        self.sent_events
            .iter()
            .filter(|e| e.timestamp <= cutoff && !applied.contains(&e.id))
            .count()
    }

    /// For every pair of arbitrators, how often their shared events appear
    /// in opposite order.
    pub fn order_disagreements(&self) -> usize {
        let logs: Vec<&[AppliedEvent]> = self.applied_logs().collect();
        let mut count = 0;
        for (i, left) in logs.iter().enumerate() {
            let index: HashMap<u64, usize> = left.iter().enumerate().map(|(n, e)| (e.id, n)).collect();
            for right in logs.iter().skip(i + 1) {
                let order: Vec<usize> = right.iter().filter_map(|e| index.get(&e.id).copied()).collect();
                count += order.windows(2).filter(|w| w[1] < w[0]).count();
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimConfig {
        SimConfig {
            seed: 7,
            arbitrators: 4,
            peers: 6,
            ..SimConfig::default()
        }
    }

    #[test]
    fn test_grid_positions() {
        let sites = grid_positions(4, 400.0);
        assert_eq!(sites.len(), 4);
        assert_eq!(sites[0], Position::new(100.0, 100.0));
        assert_eq!(sites[3], Position::new(300.0, 300.0));

        let sites = grid_positions(3, 300.0);
        assert_eq!(sites[2], Position::new(75.0, 225.0));
    }

    #[test]
    fn test_world_builds_gateway_and_grid() {
        let world = SimWorld::new(small());
        assert_eq!(world.arbitrator_ids(), vec![NodeId(1), NodeId(2), NodeId(3), NodeId(4)]);
        assert!(world.arbitrator(NodeId::GATEWAY).is_some_and(|a| a.is_gateway()));
        assert_eq!(world.peer_ids().first(), Some(&NodeId(FIRST_PEER)));
        assert_eq!(world.now(), 0);
    }

    #[test]
    fn test_peers_get_their_avatars() {
        let mut world = SimWorld::new(small());
        world.set_moving(false);
        world.run(15);

        for id in world.peer_ids() {
            let peer = world.peer(id).unwrap();
            assert!(peer.current_arbitrator().is_assigned(), "{} has no arbitrator", id);
            assert!(peer.avatar().is_some(), "{} has no avatar", id);
        }
        assert_eq!(world.orphaned_avatars(), 0);
        assert_eq!(world.ownership_violations(), 0);
    }

    #[test]
    fn test_same_seed_same_world() {
        let run = || {
            let mut world = SimWorld::new(small());
            world.run(60);
            (world.stats(), world.owners())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_crashed_arbitrator_leaves_overlay() {
        let mut world = SimWorld::new(small());
        world.crash(NodeId(3));
        assert!(world.is_crashed(NodeId(3)));
        assert!(world.network().is_crashed(NodeId(3)));
        assert!(world.overlay.lock().site(NodeId(3)).is_none());
        assert_eq!(world.stats().live_arbitrators, 3);
    }

    #[test]
    fn test_config_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!("tessera-sim-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "peers": 3, "loss": 0.25 }"#).unwrap();
        let config = SimConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.peers, 3);
        assert_eq!(config.loss, 0.25);
        assert_eq!(config.arbitrators, SimConfig::default().arbitrators);

        assert!(matches!(
            SimConfig::from_file("/nonexistent/tessera.json"),
            Err(SimError::ConfigRead { .. })
        ));
    }
}

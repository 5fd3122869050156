//! Simulated network transport with fault injection.
//!
//! Every node of a world shares one [`Router`]. A send is stamped with a
//! delivery tick (`now + latency`) and parked in flight; `receive` hands a
//! node everything due at or before the current tick. Per-link FIFO holds
//! even when latency changes mid-run.
//!
//! Faults:
//! - **crash**: the node neither sends nor receives; senders see `0` bytes
//! - **partition**: links across the cut refuse sends and drop in-flight traffic
//! - **loss**: unreliable traffic is silently dropped with the link's probability

use crate::context::SimClock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tessera_env::{Delivery, EnvError, Messaging, NetworkController, NodeId, Tick};
use tracing::trace;

/// Counters kept by the router.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    pub sent: u64,
    pub delivered: u64,
    /// Lost to random loss, partitions or crashes after sending
    pub dropped: u64,
    /// Sends refused outright (crashed, partitioned or unknown target)
    pub refused: u64,
    pub bytes: u64,
}

#[derive(Debug)]
struct Envelope {
    deliver_at: Tick,
    seq: u64,
    from: NodeId,
    to: NodeId,
    delivery: Delivery,
}

/// Shared state of the simulated network.
#[derive(Debug)]
pub struct Router {
    registered: BTreeSet<NodeId>,
    crashed: BTreeSet<NodeId>,
    /// Open links as `(low, high)` pairs
    links: BTreeSet<(NodeId, NodeId)>,
    partitions: Vec<(Vec<NodeId>, Vec<NodeId>)>,

    /// Per-link latency in ticks
    link_latency: HashMap<(NodeId, NodeId), Tick>,

    /// Per-link packet loss rate (0.0 - 1.0)
    link_loss: HashMap<(NodeId, NodeId), f64>,

    default_latency: Tick,
    default_loss: f64,

    /// Latest delivery tick scheduled per directed link
    last_delivery: HashMap<(NodeId, NodeId), Tick>,
    in_flight: Vec<Envelope>,
    next_seq: u64,
    rng: ChaCha8Rng,
    stats: NetworkStats,
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Router {
    pub fn new(seed: u64) -> Self {
        Self {
            registered: BTreeSet::new(),
            crashed: BTreeSet::new(),
            links: BTreeSet::new(),
            partitions: Vec::new(),
            link_latency: HashMap::new(),
            link_loss: HashMap::new(),
            default_latency: 1,
            default_loss: 0.0,
            last_delivery: HashMap::new(),
            in_flight: Vec::new(),
            next_seq: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            stats: NetworkStats::default(),
        }
    }

    /// Makes a node addressable.
    pub fn register(&mut self, node: NodeId) {
        self.registered.insert(node);
        self.crashed.remove(&node);
    }

    /// Checks if two nodes can communicate (not partitioned).
    pub fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        for (group_a, group_b) in &self.partitions {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            // Partitioned if one is in A and other in B (or vice versa)
            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }
        true
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        self.registered.contains(&to)
            && !self.crashed.contains(&to)
            && !self.crashed.contains(&from)
            && self.can_communicate(from, to)
    }

    pub fn latency(&self, from: NodeId, to: NodeId) -> Tick {
        self.link_latency
            .get(&(from, to))
            .copied()
            .unwrap_or(self.default_latency)
    }

    pub fn loss(&self, from: NodeId, to: NodeId) -> f64 {
        self.link_loss.get(&(from, to)).copied().unwrap_or(self.default_loss)
    }

    pub fn set_default_latency(&mut self, latency: Tick) {
        self.default_latency = latency.max(1);
    }

    pub fn set_default_loss(&mut self, loss: f64) {
        self.default_loss = loss.clamp(0.0, 1.0);
    }

    /// Drops every per-link loss override and the default loss.
    pub fn clear_loss(&mut self) {
        self.link_loss.clear();
        self.default_loss = 0.0;
    }

    pub fn is_crashed(&self, node: NodeId) -> bool {
        self.crashed.contains(&node)
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn enqueue(&mut self, from: NodeId, to: NodeId, now: Tick, delivery: Delivery) {
        let earliest = now + self.latency(from, to).max(1);
        let slot = self.last_delivery.entry((from, to)).or_insert(0);
        let deliver_at = earliest.max(*slot);
        *slot = deliver_at;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.push(Envelope {
            deliver_at,
            seq,
            from,
            to,
            delivery,
        });
    }

    fn send(&mut self, from: NodeId, to: NodeId, tag: u16, payload: &[u8], reliable: bool, now: Tick) -> usize {
        if !self.reachable(from, to) {
            self.stats.refused += 1;
            return 0;
        }
        self.stats.sent += 1;
        self.stats.bytes += payload.len() as u64;

        if !reliable {
            let loss = self.loss(from, to);
            if loss > 0.0 && self.rng.gen_bool(loss) {
                trace!("lost {} -> {} tag {}", from, to, tag);
                self.stats.dropped += 1;
                return payload.len();
            }
        }

        let delivery = Delivery::Message {
            from,
            tag,
            payload: payload.to_vec(),
        };
        self.enqueue(from, to, now, delivery);
        payload.len()
    }

    /// Hands `node` everything due by `now`, in send order.
    fn take_due(&mut self, node: NodeId, now: Tick) -> Vec<Delivery> {
        if self.crashed.contains(&node) {
            return Vec::new();
        }
        let (mut due, rest): (Vec<Envelope>, Vec<Envelope>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|env| env.to == node && env.deliver_at <= now);
        self.in_flight = rest;
        due.sort_by_key(|env| (env.deliver_at, env.seq));

        let mut out = Vec::with_capacity(due.len());
        for env in due {
            if self.crashed.contains(&env.from) || !self.can_communicate(env.from, env.to) {
                self.stats.dropped += 1;
                continue;
            }
            self.stats.delivered += 1;
            out.push(env.delivery);
        }
        out
    }
}

type SharedRouter = Arc<Mutex<Router>>;

fn lock(router: &SharedRouter) -> MutexGuard<'_, Router> {
    router.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated network interface for one node.
pub struct SimLink {
    /// This node's ID
    local_id: NodeId,
    router: SharedRouter,
    clock: SimClock,
}

impl SimLink {
    pub fn new(local_id: NodeId, router: SharedRouter, clock: SimClock) -> Self {
        lock(&router).register(local_id);
        Self {
            local_id,
            router,
            clock,
        }
    }
}

impl Messaging for SimLink {
    fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn send(&mut self, target: NodeId, tag: u16, payload: &[u8], reliable: bool) -> usize {
        let now = self.clock.now();
        lock(&self.router).send(self.local_id, target, tag, payload, reliable, now)
    }

    fn connect(&mut self, target: NodeId) -> Result<(), EnvError> {
        let mut router = lock(&self.router);
        if !router.reachable(self.local_id, target) {
            return Err(EnvError::unreachable(target));
        }
        router.links.insert(link_key(self.local_id, target));
        Ok(())
    }

    fn disconnect(&mut self, target: NodeId) {
        let now = self.clock.now();
        let mut router = lock(&self.router);
        if router.links.remove(&link_key(self.local_id, target)) && router.reachable(self.local_id, target) {
            router.enqueue(self.local_id, target, now, Delivery::Disconnected(self.local_id));
        }
    }

    fn is_connected(&self, target: NodeId) -> bool {
        lock(&self.router).links.contains(&link_key(self.local_id, target))
    }

    fn flush(&mut self) {}

    fn receive(&mut self) -> Vec<Delivery> {
        let now = self.clock.now();
        lock(&self.router).take_due(self.local_id, now)
    }
}

/// Network controller for fault injection.
#[derive(Clone)]
pub struct SimNetworkController {
    router: SharedRouter,
}

impl SimNetworkController {
    /// Creates a router and the controller that owns it.
    pub fn new(seed: u64) -> Self {
        Self {
            router: Arc::new(Mutex::new(Router::new(seed))),
        }
    }

    /// Opens a node's interface on this network.
    pub fn link(&self, node: NodeId, clock: SimClock) -> SimLink {
        SimLink::new(node, self.router.clone(), clock)
    }

    pub fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        lock(&self.router).can_communicate(from, to)
    }

    pub fn is_crashed(&self, node: NodeId) -> bool {
        lock(&self.router).is_crashed(node)
    }

    /// Gets the latency for a link.
    pub fn get_latency(&self, from: NodeId, to: NodeId) -> Tick {
        lock(&self.router).latency(from, to)
    }

    /// Gets the loss rate for a link.
    pub fn get_loss(&self, from: NodeId, to: NodeId) -> f64 {
        lock(&self.router).loss(from, to)
    }

    pub fn set_default_latency(&self, latency: Tick) {
        lock(&self.router).set_default_latency(latency);
    }

    pub fn set_default_loss(&self, loss: f64) {
        lock(&self.router).set_default_loss(loss);
    }

    pub fn clear_loss(&self) {
        lock(&self.router).clear_loss();
    }

    pub fn stats(&self) -> NetworkStats {
        lock(&self.router).stats().clone()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.router).in_flight()
    }

    /// Nodes currently registered and not crashed.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        let router = lock(&self.router);
        router
            .registered
            .iter()
            .filter(|node| !router.crashed.contains(node))
            .copied()
            .collect()
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        lock(&self.router)
            .partitions
            .push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        lock(&self.router).partitions.clear();
    }

    fn set_link_latency(&self, from: NodeId, to: NodeId, latency: Tick) {
        lock(&self.router).link_latency.insert((from, to), latency.max(1));
    }

    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64) {
        lock(&self.router)
            .link_loss
            .insert((from, to), loss_rate.clamp(0.0, 1.0));
    }

    fn crash(&self, node: NodeId) {
        let mut router = lock(&self.router);
        router.crashed.insert(node);
        router.links.retain(|(a, b)| *a != node && *b != node);
    }
}

/// Splits nodes by x coordinate into a west and an east group.
pub fn split_at(nodes: &BTreeMap<NodeId, f64>, threshold: f64) -> (Vec<NodeId>, Vec<NodeId>) {
    let (low, high): (Vec<_>, Vec<_>) = nodes.iter().partition(|(_, x)| **x < threshold);
    (
        low.into_iter().map(|(id, _)| *id).collect(),
        high.into_iter().map(|(id, _)| *id).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SimNetworkController, SimClock, SimLink, SimLink) {
        let controller = SimNetworkController::new(7);
        let clock = SimClock::new();
        let a = controller.link(NodeId(1), clock.clone());
        let b = controller.link(NodeId(2), clock.clone());
        (controller, clock, a, b)
    }

    fn payloads(deliveries: Vec<Delivery>) -> Vec<Vec<u8>> {
        deliveries
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Message { payload, .. } => Some(payload),
                Delivery::Disconnected(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_network_controller_partition() {
        let controller = SimNetworkController::new(1);

        let a = NodeId(1);
        let b = NodeId(2);
        let c = NodeId(3);

        // Initially all can communicate
        assert!(controller.can_communicate(a, b));
        assert!(controller.can_communicate(a, c));
        assert!(controller.can_communicate(b, c));

        // Partition: {a} vs {b, c}
        controller.partition(&[a], &[b, c]);

        // Now a cannot talk to b or c
        assert!(!controller.can_communicate(a, b));
        assert!(!controller.can_communicate(a, c));

        // But b and c can still talk
        assert!(controller.can_communicate(b, c));

        // Heal
        controller.heal_all();
        assert!(controller.can_communicate(a, b));
    }

    #[test]
    fn test_network_controller_latency() {
        let controller = SimNetworkController::new(1);

        let a = NodeId(1);
        let b = NodeId(2);

        assert_eq!(controller.get_latency(a, b), 1);

        controller.set_link_latency(a, b, 4);
        assert_eq!(controller.get_latency(a, b), 4);

        // Reverse direction is separate
        assert_eq!(controller.get_latency(b, a), 1);
    }

    #[test]
    fn test_delivery_waits_for_latency() {
        let (controller, clock, mut a, mut b) = pair();
        controller.set_link_latency(NodeId(1), NodeId(2), 3);

        assert_eq!(a.send(NodeId(2), 100, b"hi", true), 2);
        assert!(b.receive().is_empty());
        clock.advance();
        clock.advance();
        assert!(b.receive().is_empty());
        clock.advance();
        assert_eq!(payloads(b.receive()), vec![b"hi".to_vec()]);
    }

    #[test]
    fn test_link_stays_fifo_when_latency_drops() {
        let (controller, clock, mut a, mut b) = pair();
        controller.set_link_latency(NodeId(1), NodeId(2), 5);
        a.send(NodeId(2), 100, b"first", true);
        controller.set_link_latency(NodeId(1), NodeId(2), 1);
        a.send(NodeId(2), 100, b"second", true);

        for _ in 0..5 {
            clock.advance();
        }
        assert_eq!(payloads(b.receive()), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_crashed_target_refuses_sends() {
        let (controller, clock, mut a, mut b) = pair();
        a.send(NodeId(2), 100, b"late", true);
        controller.crash(NodeId(2));

        assert_eq!(a.send(NodeId(2), 100, b"x", true), 0);
        assert!(a.connect(NodeId(2)).is_err());
        clock.advance();
        assert!(b.receive().is_empty());
        assert_eq!(controller.stats().refused, 1);
    }

    #[test]
    fn test_partition_drops_in_flight_traffic() {
        let (controller, clock, mut a, mut b) = pair();
        a.send(NodeId(2), 100, b"x", true);
        controller.partition(&[NodeId(1)], &[NodeId(2)]);
        assert_eq!(a.send(NodeId(2), 100, b"y", true), 0);

        clock.advance();
        assert!(b.receive().is_empty());
        assert_eq!(controller.stats().dropped, 1);

        controller.heal_all();
        a.send(NodeId(2), 100, b"z", true);
        clock.advance();
        assert_eq!(payloads(b.receive()), vec![b"z".to_vec()]);
    }

    #[test]
    fn test_loss_spares_reliable_traffic() {
        let (controller, clock, mut a, mut b) = pair();
        controller.set_link_loss(NodeId(1), NodeId(2), 1.0);

        assert_eq!(a.send(NodeId(2), 100, b"gone", false), 4);
        assert_eq!(a.send(NodeId(2), 100, b"kept", true), 4);
        clock.advance();
        assert_eq!(payloads(b.receive()), vec![b"kept".to_vec()]);
        assert_eq!(controller.stats().dropped, 1);

        controller.clear_loss();
        assert_eq!(controller.get_loss(NodeId(1), NodeId(2)), 0.0);
    }

    #[test]
    fn test_disconnect_notifies_remote() {
        let (_controller, clock, mut a, mut b) = pair();
        a.connect(NodeId(2)).unwrap();
        assert!(b.is_connected(NodeId(1)));

        a.disconnect(NodeId(2));
        assert!(!a.is_connected(NodeId(2)));
        clock.advance();
        assert_eq!(b.receive(), vec![Delivery::Disconnected(NodeId(1))]);

        // Closing a closed link is silent
        a.disconnect(NodeId(2));
        clock.advance();
        assert!(b.receive().is_empty());
    }

    #[test]
    fn test_split_at() {
        let nodes: BTreeMap<NodeId, f64> = [(NodeId(1), 10.0), (NodeId(2), 600.0), (NodeId(3), 90.0)].into();
        let (west, east) = split_at(&nodes, 500.0);
        assert_eq!(west, vec![NodeId(1), NodeId(3)]);
        assert_eq!(east, vec![NodeId(2)]);
    }
}

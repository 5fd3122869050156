//! In-process fakes for unit tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_env::{
    Delivery, EnvError, Messaging, NodeContext, NodeDescriptor, NodeId, Overlay, Position, QueryId, Storage, Tick,
};

use crate::protocol::{MessageTag, WireMessage};

/// Manually advanced clock. `random_below` always returns 0.
#[derive(Default)]
pub struct ManualContext {
    tick: AtomicU64,
}

impl ManualContext {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self) {
        self.tick.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeContext for ManualContext {
    fn now(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    async fn sleep(&self, _duration: Duration) {
        self.advance();
    }

    fn random_below(&self, _bound: u32) -> u32 {
        0
    }

    fn seed(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub target: NodeId,
    pub tag: u16,
    pub payload: Vec<u8>,
    pub reliable: bool,
}

/// Records every send; deliveries are pushed in by the test.
#[derive(Default)]
pub struct RecordingNet {
    pub id: NodeId,
    pub sent: Vec<Sent>,
    pub inbox: Vec<Delivery>,
    pub connected: BTreeSet<NodeId>,
    /// Sends to these nodes report zero bytes
    pub unreachable: BTreeSet<NodeId>,
}

impl RecordingNet {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn deliver<T: WireMessage>(&mut self, from: NodeId, msg: &T) {
        self.inbox.push(Delivery::Message {
            from,
            tag: T::TAG.as_u16(),
            payload: msg.to_bytes(),
        });
    }

    pub fn sent_to(&self, target: NodeId, tag: MessageTag) -> Vec<&Sent> {
        self.sent
            .iter()
            .filter(|s| s.target == target && s.tag == tag.as_u16())
            .collect()
    }

    pub fn decoded<T: WireMessage>(&self, target: NodeId) -> Vec<T> {
        self.sent_to(target, T::TAG)
            .into_iter()
            .filter_map(|s| T::decode(&s.payload).ok())
            .collect()
    }
}

impl Messaging for RecordingNet {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn send(&mut self, target: NodeId, tag: u16, payload: &[u8], reliable: bool) -> usize {
        if self.unreachable.contains(&target) {
            return 0;
        }
        self.sent.push(Sent {
            target,
            tag,
            payload: payload.to_vec(),
            reliable,
        });
        payload.len()
    }

    fn connect(&mut self, target: NodeId) -> Result<(), EnvError> {
        self.connected.insert(target);
        Ok(())
    }

    fn disconnect(&mut self, target: NodeId) {
        self.connected.remove(&target);
    }

    fn is_connected(&self, target: NodeId) -> bool {
        self.connected.contains(&target)
    }

    fn flush(&mut self) {}

    fn receive(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.inbox)
    }
}

/// Nearest-site regions over a fixed set of arbitrators; everyone borders
/// everyone.
#[derive(Default)]
pub struct StaticOverlay {
    pub sites: BTreeMap<NodeId, NodeDescriptor>,
}

impl StaticOverlay {
    pub fn with_sites(sites: &[(u64, f64, f64)]) -> Self {
        let sites = sites
            .iter()
            .map(|(id, x, y)| (NodeId(*id), NodeDescriptor::new(NodeId(*id), Position::new(*x, *y), 50.0)))
            .collect();
        Self { sites }
    }
}

impl Overlay for StaticOverlay {
    fn enclosing_neighbors(&self, self_id: NodeId) -> Vec<NodeDescriptor> {
        self.sites
            .values()
            .filter(|n| n.id != self_id)
            .cloned()
            .collect()
    }

    fn closest_to(&self, pos: &Position) -> NodeId {
        self.sites
            .values()
            .min_by(|a, b| a.distance_to(pos).total_cmp(&b.distance_to(pos)))
            .map_or(NodeId::UNASSIGNED, |n| n.id)
    }

    fn contains(&self, id: NodeId, pos: &Position) -> bool {
        self.closest_to(pos) == id
    }

    fn overlaps(&self, id: NodeId, pos: &Position, radius: f64) -> bool {
        let (Some(site), Some(owner)) = (self.sites.get(&id), self.sites.get(&self.closest_to(pos))) else {
            return false;
        };
        site.distance_to(pos) <= owner.distance_to(pos) + 2.0 * radius
    }

    fn update(&mut self, node: &NodeDescriptor) {
        self.sites.insert(node.id, node.clone());
    }

    fn leave(&mut self, id: NodeId) {
        self.sites.remove(&id);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    next: u64,
    pub queries: Vec<(QueryId, Vec<u8>)>,
    pub replies: Vec<(QueryId, Vec<u8>)>,
}

impl Storage for MemoryStore {
    fn query(&mut self, request: &[u8]) -> QueryId {
        self.next += 1;
        let id = QueryId(self.next);
        self.queries.push((id, request.to_vec()));
        id
    }

    fn respond(&mut self, query: QueryId, reply: &[u8]) -> Result<(), EnvError> {
        self.replies.push((query, reply.to_vec()));
        Ok(())
    }

    fn poll_replies(&mut self) -> Vec<(QueryId, Vec<u8>)> {
        std::mem::take(&mut self.replies)
    }
}

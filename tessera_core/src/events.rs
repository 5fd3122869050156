//! The Event Pipeline
//!
//! Peer events are admitted by the peer's arbitrator, forwarded once to every
//! arbitrator whose region the event can touch, and then replayed by each of
//! them in the same global order.
//!
//! ```text
//!   peer ──EVENT──► admitting arbitrator A (stamps admission tick T)
//!                        │
//!                        ├── queue[A][T] (if A overlaps)
//!                        ├──EVENT(T)──► neighbor B ──► queue[A][T] on B
//!                        └──TICK_EVENT(T)──► every neighbor
//!
//!   watermark = min(now, latest TICK_EVENT of every current neighbor)
//!   ready     = all queued events admitted at or before the watermark,
//!               sorted by (timestamp, sender)
//! ```
//!
//! The admitting arbitrator restamps each event with its admission tick, so
//! the queue key and the sort key are the same timestamp. A neighbor's queue
//! is only known to be complete up to the last marker it sent: silence is not
//! distinguishable from delay, so a neighbor that has not sent one yet holds
//! the watermark where it is. Events arriving for a tick that was already
//! released are dropped; delivering them would break the global order.

use crate::arbitrator::ArbitratorState;
use crate::entity::Event;
use crate::protocol::{EventMsg, MessageTag, TickEventMsg, WireMessage};
use std::collections::BTreeMap;
use tessera_env::{Messaging, NodeDescriptor, NodeId, Overlay, Storage, Tick};
use tracing::{debug, trace};

/// Events buffered per forwarding arbitrator and admission tick.
#[derive(Debug, Default)]
pub struct EventQueue {
    pending: BTreeMap<NodeId, BTreeMap<Tick, Vec<Event>>>,
    marks: BTreeMap<NodeId, Tick>,
    markers_sent: BTreeMap<NodeId, Tick>,
    /// Highest watermark drained so far
    released: Option<Tick>,
}

impl EventQueue {
    /// Queues an event. Returns false, dropping it, when its tick has
    /// already been released.
    pub fn push(&mut self, from: NodeId, admitted: Tick, event: Event) -> bool {
        if self.released.is_some_and(|released| admitted <= released) {
            return false;
        }
        self.pending
            .entry(from)
            .or_default()
            .entry(admitted)
            .or_default()
            .push(event);
        true
    }

    /// Records that `from` has forwarded everything admitted up to `tick`.
    pub fn mark(&mut self, from: NodeId, tick: Tick) {
        let mark = self.marks.entry(from).or_insert(tick);
        *mark = (*mark).max(tick);
    }

    pub fn mark_of(&self, node: NodeId) -> Option<Tick> {
        self.marks.get(&node).copied()
    }

    /// Drops a departed neighbor's watermark. Its queued events still drain.
    pub fn forget(&mut self, node: NodeId) {
        self.marks.remove(&node);
        self.markers_sent.remove(&node);
    }

    /// Lowest tick every current neighbor is known to be complete for.
    ///
    /// A neighbor that has not sent a marker yet pins the watermark at the
    /// last released tick.
    pub fn watermark<'a>(&self, now: Tick, neighbors: impl IntoIterator<Item = &'a NodeId>) -> Tick {
        let floor = self.released.unwrap_or(0);
        neighbors
            .into_iter()
            .map(|node| self.marks.get(node).copied().unwrap_or(floor))
            .fold(now, Tick::min)
    }

    pub fn released(&self) -> Option<Tick> {
        self.released
    }

    /// Removes and orders every event admitted at or before `watermark`.
    pub fn drain_ready(&mut self, watermark: Tick) -> Vec<Event> {
        let mut ready = Vec::new();
        for by_tick in self.pending.values_mut() {
            let later = by_tick.split_off(&(watermark + 1));
            let due = std::mem::replace(by_tick, later);
            for events in due.into_values() {
                ready.extend(events);
            }
        }
        self.pending.retain(|_, by_tick| !by_tick.is_empty());
        self.released = Some(self.released.map_or(watermark, |released| released.max(watermark)));
        ready.sort_by_key(|event| (event.timestamp, event.sender, event.id));
        ready
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().flat_map(|by_tick| by_tick.values()).map(Vec::len).sum()
    }

    fn marker_due(&self, neighbor: NodeId, now: Tick, threshold: Tick) -> bool {
        self.markers_sent
            .get(&neighbor)
            .map_or(true, |sent| now.saturating_sub(*sent) >= threshold)
    }

    fn marker_sent(&mut self, neighbor: NodeId, now: Tick) {
        self.markers_sent.insert(neighbor, now);
    }
}

/// An event received from a peer, waiting to be routed this tick.
#[derive(Debug, Clone)]
pub(crate) struct Unrouted {
    pub origin: NodeDescriptor,
    pub ttl: u8,
    pub event: Event,
}

impl<M: Messaging, O: Overlay, S: Storage> ArbitratorState<M, O, S> {
    /// Accepts an EVENT message.
    ///
    /// Events from attached peers are held for routing. Events forwarded by
    /// another arbitrator go straight into the queue and are never forwarded
    /// again.
    pub(crate) fn handle_event(&mut self, from: NodeId, msg: EventMsg) {
        if let Some(peer) = self.peers.get(&from) {
            self.unrouted.push(Unrouted {
                origin: peer.clone(),
                ttl: msg.ttl,
                event: msg.event,
            });
        } else {
            let admitted = if from == self.id() { self.now() } else { msg.admitted };
            let mut event = msg.event;
            event.timestamp = admitted;
            let id = event.id;
            if self.events.push(from, admitted, event) {
                trace!("{} queues event {:X} from {} at {}", self.id(), id, from, admitted);
            } else {
                debug!("{} drops late event {:X} from {} at {}", self.id(), id, from, admitted);
            }
        }
    }

    /// Routes this tick's peer events, advances neighbors' watermarks and
    /// returns the events ready for the application, in order.
    pub(crate) fn run_event_pipeline(&mut self) -> Vec<Event> {
        let now = self.now();
        let self_id = self.id();

        for mut item in std::mem::take(&mut self.unrouted) {
            item.event.timestamp = now;
            let pos = item.origin.pos;
            let radius = item.origin.aoi;

            let local = self.overlay.overlaps(self_id, &pos, radius);
            let remote: Vec<NodeId> = self
                .neighbors
                .keys()
                .copied()
                .filter(|id| self.overlay.overlaps(*id, &pos, radius))
                .collect();

            if local || remote.is_empty() {
                // now is past every released tick
                self.events.push(self_id, now, item.event.clone());
            }
            if remote.is_empty() {
                continue;
            }
            if item.ttl == 0 {
                debug!("{} drops expired event {:X}", self_id, item.event.id);
                continue;
            }

            // one encode, shared by every target
            let bytes = EventMsg {
                ttl: item.ttl - 1,
                admitted: now,
                event: item.event,
            }
            .to_bytes();
            for target in remote {
                self.send_bytes(target, MessageTag::Event, &bytes, false);
            }
        }

        let marker = TickEventMsg { timestamp: now }.to_bytes();
        let threshold = self.config.event_tick_threshold;
        let neighbors: Vec<NodeId> = self.neighbors.keys().copied().collect();
        for neighbor in neighbors {
            if self.events.marker_due(neighbor, now, threshold) {
                self.send_bytes(neighbor, MessageTag::TickEvent, &marker, false);
                self.events.marker_sent(neighbor, now);
            }
        }

        let watermark = self.events.watermark(now, self.neighbors.keys());
        self.events.drain_ready(watermark)
    }

    pub(crate) fn handle_tick_event(&mut self, from: NodeId, msg: TickEventMsg) {
        if self.neighbors.contains_key(&from) {
            self.events.mark(from, msg.timestamp);
        } else {
            trace!("{} ignores TICK_EVENT from non-neighbor {}", self.id(), from);
        }
    }
}

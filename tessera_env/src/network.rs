//! Messaging abstraction for tessera nodes.

use crate::error::EnvError;
use crate::types::{NodeId, Tick};

/// Something the transport hands back to a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A tagged message from another node (or from ourselves)
    Message {
        from: NodeId,
        tag: u16,
        payload: Vec<u8>,
    },

    /// The link to this node was closed by the remote side
    Disconnected(NodeId),
}

/// Point-to-point messaging between nodes.
///
/// The core treats this as best effort. Reliability is only *requested* for
/// control traffic (JOIN, ENTER, TRANSFER); per-tick diffs go unreliable and
/// the protocol recovers from loss through version checks and periodic resync.
///
/// # Packet Flow
///
/// ```text
/// Node A                     Transport                   Node B
///   |                           |                          |
///   |-- send(B, tag, bytes) --->|                          |
///   |                           |-- [latency / loss] ----->|
///   |                           |                          |-- receive() -> Delivery
/// ```
pub trait Messaging {
    /// Returns this node's id.
    fn local_id(&self) -> NodeId;

    /// Sends a tagged payload to a target node.
    ///
    /// # Returns
    /// The number of bytes accepted by the transport. Anything short of
    /// `payload.len()` is a transport failure; callers count these.
    ///
    /// # Note
    /// A full count does not guarantee delivery.
    fn send(&mut self, target: NodeId, tag: u16, payload: &[u8], reliable: bool) -> usize;

    /// Opens a link to a node. The transport resolves the address from the id.
    fn connect(&mut self, target: NodeId) -> Result<(), EnvError>;

    /// Closes the link to a node; the remote side sees [`Delivery::Disconnected`].
    fn disconnect(&mut self, target: NodeId);

    /// Checks whether a link to the node is open.
    fn is_connected(&self, target: NodeId) -> bool;

    /// Pushes out anything the transport buffered during this tick.
    fn flush(&mut self);

    /// Drains everything delivered to this node so far.
    fn receive(&mut self) -> Vec<Delivery>;
}

/// Fault injection for simulated transports.
pub trait NetworkController {
    /// Creates a network partition between two node sets.
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets latency, in ticks, for a specific link.
    fn set_link_latency(&self, from: NodeId, to: NodeId, latency: Tick);

    /// Sets packet loss probability for a link (0.0 - 1.0).
    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64);

    /// Silently stops a node: nothing it sends or is sent arrives.
    fn crash(&self, node: NodeId);
}

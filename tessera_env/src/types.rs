//! Common types shared by every tessera node.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Logical time, counted in ticks since the node started.
pub type Tick = u64;

/// A location in the 2D world.
pub type Position = Point2<f64>;

/// Unique identifier for a node (peer, arbitrator or gateway).
///
/// Ids are plain integers handed out by the gateway. Object and event ids are
/// derived from them by shifting, so only the low 48 bits are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Placeholder for "no node" (unowned object, no current arbitrator).
    pub const UNASSIGNED: NodeId = NodeId(0);

    /// Well-known id of the gateway arbitrator.
    pub const GATEWAY: NodeId = NodeId(1);

    /// Returns the raw integer id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// True unless this is [`NodeId::UNASSIGNED`].
    pub fn is_assigned(&self) -> bool {
        *self != Self::UNASSIGNED
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

/// Everything a node advertises about itself: where it is and how far it sees.
///
/// Used for both peers and arbitrators. Descriptors are always copied by value;
/// nodes refer to each other only by [`NodeId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node identifier
    pub id: NodeId,

    /// Current position
    pub pos: Position,

    /// Area-of-interest radius
    pub aoi: f64,

    /// Secondary radius advertised by aggregator-class nodes
    pub secondary_aoi: Option<f64>,

    /// Tick at which this descriptor was last refreshed
    pub last_seen: Tick,
}

impl NodeDescriptor {
    /// Creates a descriptor with no secondary AOI.
    pub fn new(id: NodeId, pos: Position, aoi: f64) -> Self {
        Self {
            id,
            pos,
            aoi,
            secondary_aoi: None,
            last_seen: 0,
        }
    }

    /// Euclidean distance from this node to a point.
    pub fn distance_to(&self, pos: &Position) -> f64 {
        nalgebra::distance(&self.pos, pos)
    }

    /// Checks whether `pos` lies within the AOI scaled by `multiplier`.
    ///
    /// A multiplier of 1.0 is the plain AOI test; peers use a slightly larger
    /// value so objects do not flicker at the boundary.
    pub fn covers(&self, pos: &Position, multiplier: f64) -> bool {
        self.distance_to(pos) <= self.aoi * multiplier
    }
}

/// Identifier correlating a storage query with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(pub u64);

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{:X}", self.0)
    }
}

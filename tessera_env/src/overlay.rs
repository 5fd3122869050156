//! Spatial overlay abstraction.

use crate::types::{NodeDescriptor, NodeId, Position};

/// The spatial partitioning service arbitrators sit on.
///
/// The core never computes regions itself; every "whose region is this?"
/// question goes through here. Implementations decide how regions are shaped
/// (Voronoi cells in a real deployment, nearest-site in the simulator).
pub trait Overlay {
    /// Arbitrators whose regions border `self_id`'s region (excluding itself).
    fn enclosing_neighbors(&self, self_id: NodeId) -> Vec<NodeDescriptor>;

    /// The arbitrator whose region contains `pos`.
    ///
    /// Returns [`NodeId::UNASSIGNED`] when the overlay knows no arbitrator.
    fn closest_to(&self, pos: &Position) -> NodeId;

    /// Checks whether `pos` falls inside `id`'s region.
    fn contains(&self, id: NodeId, pos: &Position) -> bool;

    /// Checks whether a disc of `radius` around `pos` touches `id`'s region.
    fn overlaps(&self, id: NodeId, pos: &Position, radius: f64) -> bool;

    /// Publishes a node's current position and AOI.
    fn update(&mut self, node: &NodeDescriptor);

    /// Removes a node from the overlay.
    fn leave(&mut self, id: NodeId);
}

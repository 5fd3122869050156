//! Nearest-site overlay: every arbitrator owns its Voronoi cell.
//!
//! Regions are never materialised. Each query is answered from the site list
//! with half-plane tests, which keeps the overlay exact for any layout.

use nalgebra::Vector2;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tessera_env::{NodeDescriptor, NodeId, Overlay, Position};

const EPS: f64 = 1e-6;

/// Arbitrator sites of one world.
#[derive(Debug, Default, Clone)]
pub struct NearestOverlay {
    sites: BTreeMap<NodeId, NodeDescriptor>,
}

impl NearestOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn site(&self, id: NodeId) -> Option<&NodeDescriptor> {
        self.sites.get(&id)
    }

    pub fn sites(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.sites.values()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Signed distance from `pos` to the half-plane of points at least as
    /// close to `a` as to `b`. Zero or negative means inside.
    fn outside_by(a: &Position, b: &Position, pos: &Position) -> f64 {
        let normal: Vector2<f64> = b - a;
        let norm = normal.norm();
        if norm < EPS {
            return f64::NEG_INFINITY;
        }
        let mid = nalgebra::center(a, b);
        (pos - mid).dot(&normal) / norm
    }

    /// Checks whether the Voronoi cells of `a` and `b` share a boundary by
    /// clipping their bisector against every other site.
    fn adjacent(&self, a: &NodeDescriptor, b: &NodeDescriptor) -> bool {
        let normal: Vector2<f64> = b.pos - a.pos;
        if normal.norm() < EPS {
            return true;
        }
        let mid = nalgebra::center(&a.pos, &b.pos);
        let dir = Vector2::new(-normal.y, normal.x);

        let mut lo = f64::NEG_INFINITY;
        let mut hi = f64::INFINITY;
        for other in self.sites.values() {
            if other.id == a.id || other.id == b.id {
                continue;
            }
            // points mid + t * dir must stay at least as close to `a` as to `other`
            let n: Vector2<f64> = other.pos - a.pos;
            let rhs = n.norm_squared() / 2.0 - (mid - a.pos).dot(&n);
            let slope = dir.dot(&n);
            if slope.abs() < EPS {
                if rhs < -EPS {
                    return false;
                }
                continue;
            }
            let bound = rhs / slope;
            if slope > 0.0 {
                hi = hi.min(bound);
            } else {
                lo = lo.max(bound);
            }
        }
        lo <= hi + EPS
    }
}

impl Overlay for NearestOverlay {
    fn enclosing_neighbors(&self, self_id: NodeId) -> Vec<NodeDescriptor> {
        let Some(me) = self.sites.get(&self_id) else {
            return Vec::new();
        };
        self.sites
            .values()
            // both directions, so rounding never makes the relation one-sided
            .filter(|other| other.id != self_id && (self.adjacent(me, other) || self.adjacent(other, me)))
            .cloned()
            .collect()
    }

    fn closest_to(&self, pos: &Position) -> NodeId {
        self.sites
            .values()
            .min_by(|a, b| a.distance_to(pos).total_cmp(&b.distance_to(pos)).then(a.id.cmp(&b.id)))
            .map_or(NodeId::UNASSIGNED, |site| site.id)
    }

    fn contains(&self, id: NodeId, pos: &Position) -> bool {
        self.sites.contains_key(&id) && self.closest_to(pos) == id
    }

    fn overlaps(&self, id: NodeId, pos: &Position, radius: f64) -> bool {
        let Some(me) = self.sites.get(&id) else {
            return false;
        };
        self.sites
            .values()
            .filter(|other| other.id != id)
            .all(|other| Self::outside_by(&me.pos, &other.pos, pos) <= radius + EPS)
    }

    fn update(&mut self, node: &NodeDescriptor) {
        self.sites.insert(node.id, node.clone());
    }

    fn leave(&mut self, id: NodeId) {
        self.sites.remove(&id);
    }
}

/// One overlay shared by every arbitrator in the world.
#[derive(Debug, Default, Clone)]
pub struct SharedOverlay {
    inner: Arc<Mutex<NearestOverlay>>,
}

impl SharedOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, NearestOverlay> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Overlay for SharedOverlay {
    fn enclosing_neighbors(&self, self_id: NodeId) -> Vec<NodeDescriptor> {
        self.lock().enclosing_neighbors(self_id)
    }

    fn closest_to(&self, pos: &Position) -> NodeId {
        self.lock().closest_to(pos)
    }

    fn contains(&self, id: NodeId, pos: &Position) -> bool {
        self.lock().contains(id, pos)
    }

    fn overlaps(&self, id: NodeId, pos: &Position, radius: f64) -> bool {
        self.lock().overlaps(id, pos, radius)
    }

    fn update(&mut self, node: &NodeDescriptor) {
        self.lock().update(node);
    }

    fn leave(&mut self, id: NodeId) {
        self.lock().leave(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// 3x3 grid with 100 units between sites, ids 1..=9 row by row.
    fn grid() -> NearestOverlay {
        let mut overlay = NearestOverlay::new();
        for row in 0..3u64 {
            for col in 0..3u64 {
                let id = NodeId(1 + row * 3 + col);
                let pos = Position::new(col as f64 * 100.0, row as f64 * 100.0);
                overlay.update(&NodeDescriptor::new(id, pos, 5.0));
            }
        }
        overlay
    }

    fn ids(nodes: Vec<NodeDescriptor>) -> Vec<u64> {
        nodes.into_iter().map(|n| n.id.as_u64()).collect()
    }

    #[test]
    fn test_closest_and_contains() {
        let overlay = grid();
        assert_eq!(overlay.closest_to(&Position::new(10.0, 10.0)), NodeId(1));
        assert_eq!(overlay.closest_to(&Position::new(180.0, 120.0)), NodeId(6));
        assert!(overlay.contains(NodeId(5), &Position::new(120.0, 80.0)));
        assert!(!overlay.contains(NodeId(4), &Position::new(120.0, 80.0)));

        // ties go to the lower id
        assert_eq!(overlay.closest_to(&Position::new(50.0, 0.0)), NodeId(1));
        assert_eq!(NearestOverlay::new().closest_to(&Position::origin()), NodeId::UNASSIGNED);
    }

    #[test]
    fn test_grid_neighbors() {
        let overlay = grid();
        // the centre cell borders all eight others (diagonals touch at corners)
        assert_eq!(ids(overlay.enclosing_neighbors(NodeId(5))), vec![1, 2, 3, 4, 6, 7, 8, 9]);
        // a corner touches only its own 2x2 block
        assert_eq!(ids(overlay.enclosing_neighbors(NodeId(1))), vec![2, 4, 5]);
        assert!(overlay.enclosing_neighbors(NodeId(42)).is_empty());
    }

    #[test]
    fn test_far_sites_are_not_neighbors() {
        let mut overlay = NearestOverlay::new();
        for (id, x) in [(1u64, 0.0), (2, 100.0), (3, 200.0)] {
            overlay.update(&NodeDescriptor::new(NodeId(id), Position::new(x, 0.0), 5.0));
        }
        assert_eq!(ids(overlay.enclosing_neighbors(NodeId(1))), vec![2]);
        assert_eq!(ids(overlay.enclosing_neighbors(NodeId(2))), vec![1, 3]);
    }

    #[test]
    fn test_overlaps_reaches_across_boundaries() {
        let overlay = grid();
        let near_edge = Position::new(40.0, 0.0);
        assert!(overlay.overlaps(NodeId(1), &near_edge, 5.0));
        assert!(!overlay.overlaps(NodeId(2), &near_edge, 5.0));
        assert!(overlay.overlaps(NodeId(2), &near_edge, 15.0));
        assert!(!overlay.overlaps(NodeId(3), &near_edge, 15.0));
    }

    #[test]
    fn test_shared_overlay_sees_updates() {
        let shared = SharedOverlay::new();
        let mut writer = shared.clone();
        writer.update(&NodeDescriptor::new(NodeId(1), Position::new(0.0, 0.0), 5.0));
        writer.update(&NodeDescriptor::new(NodeId(2), Position::new(100.0, 0.0), 5.0));

        assert_eq!(shared.closest_to(&Position::new(90.0, 0.0)), NodeId(2));
        writer.leave(NodeId(2));
        assert_eq!(shared.closest_to(&Position::new(90.0, 0.0)), NodeId(1));
        assert_eq!(shared.lock().len(), 1);
    }

    proptest! {
        #[test]
        fn prop_closest_site_contains_and_overlaps(x in -50.0f64..250.0, y in -50.0f64..250.0) {
            let overlay = grid();
            let pos = Position::new(x, y);
            let owner = overlay.closest_to(&pos);

            prop_assert!(owner.is_assigned());
            prop_assert!(overlay.contains(owner, &pos));
            prop_assert!(overlay.overlaps(owner, &pos, 0.0));
            let holders = overlay.sites().filter(|site| overlay.contains(site.id, &pos)).count();
            prop_assert_eq!(holders, 1);
        }
    }
}

//! Node-edge representation returned by graph store queries

use serde::{Deserialize, Serialize};

use crate::point::Point;

/// Synthetic parent token of a store's root node
pub const ROOT_PARENT: &str = "root";

/// Parent token that matches any edge of a node in queries
pub const ANY_PARENT: &str = "all";

/// A node as seen through one of its parent edges
///
/// `points` belong to the node; `edge_points` belong to the `(parent, id)`
/// relation. `hash` summarizes the subtree rooted at this edge and is only
/// a divergence filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeEdge {
    pub id: String,
    pub typ: String,
    pub parent: String,
    pub points: Vec<Point>,
    pub edge_points: Vec<Point>,
    pub hash: u32,
}

impl NodeEdge {
    /// Create a node edge with no points
    pub fn new(id: impl Into<String>, typ: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            typ: typ.into(),
            parent: parent.into(),
            ..Default::default()
        }
    }

    /// Attach node points
    pub fn with_points(mut self, points: Vec<Point>) -> Self {
        self.points = points;
        self
    }

    /// Attach edge points
    pub fn with_edge_points(mut self, edge_points: Vec<Point>) -> Self {
        self.edge_points = edge_points;
        self
    }

    /// Short description for log output
    pub fn desc(&self) -> String {
        let description = self
            .points
            .iter()
            .find(|p| p.typ == crate::point::POINT_TYPE_DESCRIPTION)
            .map(|p| p.text.as_str())
            .unwrap_or("");

        if description.is_empty() {
            format!("{}:{}", self.typ, self.id)
        } else {
            format!("{}:{} ({})", self.typ, self.id, description)
        }
    }

    /// Whether the edge carries a deleted tombstone
    pub fn is_deleted(&self) -> bool {
        self.edge_points.iter().any(|p| p.is_tombstone_deleted())
    }

    /// Whether the node type has propagated yet
    pub fn has_type(&self) -> bool {
        !self.typ.is_empty()
    }
}

/// Hash of the subtree rooted at one edge
///
/// Point digests are XOR-combined, so point order does not matter. Children
/// are folded in sorted by id together with their own subtree hash, so
/// adding, removing or renaming a child always changes the result, even when
/// two children carry identical points.
pub fn subtree_hash(
    id: &str,
    typ: &str,
    points: &[Point],
    edge_points: &[Point],
    children: &[(String, u32)],
) -> u32 {
    let point_digest = points
        .iter()
        .chain(edge_points)
        .fold(0u32, |acc, p| acc ^ p.content_hash());

    let mut sorted: Vec<&(String, u32)> = children.iter().collect();
    sorted.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(&[0]);
    hasher.update(typ.as_bytes());
    hasher.update(&[0]);
    hasher.update(&point_digest.to_le_bytes());
    for (child, hash) in sorted {
        hasher.update(child.as_bytes());
        hasher.update(&[0]);
        hasher.update(&hash.to_le_bytes());
    }

    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{POINT_TYPE_DESCRIPTION, POINT_TYPE_TOMBSTONE};

    #[test]
    fn test_desc() {
        let node = NodeEdge::new("n1", "device", "root");
        assert_eq!(node.desc(), "device:n1");

        let node = node.with_points(vec![Point::text(POINT_TYPE_DESCRIPTION, "", "pump")]);
        assert_eq!(node.desc(), "device:n1 (pump)");
    }

    #[test]
    fn test_is_deleted() {
        let live = NodeEdge::new("n1", "device", "root").with_edge_points(vec![Point::tombstone_live()]);
        assert!(!live.is_deleted());

        let deleted = NodeEdge::new("n1", "device", "root")
            .with_edge_points(vec![Point::new(POINT_TYPE_TOMBSTONE, "", 1.0)]);
        assert!(deleted.is_deleted());
    }

    #[test]
    fn test_subtree_hash_order_independent() {
        let a = Point::new("a", "", 1.0);
        let b = Point::new("b", "", 2.0);
        let children = vec![("c1".to_string(), 7u32), ("c2".to_string(), 11u32)];
        let reversed: Vec<_> = children.iter().rev().cloned().collect();

        let h1 = subtree_hash("n1", "group", &[a.clone(), b.clone()], &[], &children);
        let h2 = subtree_hash("n1", "group", &[b, a], &[], &reversed);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_subtree_hash_sees_children() {
        let a = Point::new("a", "", 1.0);
        let without = subtree_hash("n1", "group", std::slice::from_ref(&a), &[], &[]);
        let with = subtree_hash("n1", "group", &[a], &[], &[("c1".to_string(), 42)]);
        assert_ne!(without, with);
    }

    #[test]
    fn test_identical_children_do_not_cancel() {
        let leaf = subtree_hash("x", "sensor", &[Point::new("value", "", 1.0)], &[], &[]);
        let empty = subtree_hash("n1", "group", &[], &[], &[]);
        let both = subtree_hash(
            "n1",
            "group",
            &[],
            &[],
            &[("a".to_string(), leaf), ("b".to_string(), leaf)],
        );
        assert_ne!(empty, both);

        let renamed = subtree_hash(
            "n1",
            "group",
            &[],
            &[],
            &[("a".to_string(), leaf), ("c".to_string(), leaf)],
        );
        assert_ne!(both, renamed);
    }

    #[test]
    fn test_subtree_hash_sees_type() {
        let untyped = subtree_hash("n1", "", &[], &[], &[]);
        let typed = subtree_hash("n1", "sensor", &[], &[], &[]);
        assert_ne!(untyped, typed);
    }
}

//! Timestamped point values and the last-write-wins merge rule
//!
//! A [`Point`] is the unit of mergeable state in the graph. Both nodes and
//! node-parent edges carry a set of points that is unique by `(typ, key)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marks a node or edge as live (value 0) or deleted (value 1)
pub const POINT_TYPE_TOMBSTONE: &str = "tombstone";
/// Human readable description of a node
pub const POINT_TYPE_DESCRIPTION: &str = "description";
/// Bus URI of an upstream instance
pub const POINT_TYPE_URI: &str = "uri";
/// Auth token used when connecting upstream
pub const POINT_TYPE_AUTH_TOKEN: &str = "authToken";
/// Disables a node (value 1)
pub const POINT_TYPE_DISABLED: &str = "disabled";

/// A single timestamped value attached to a node or an edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Point type, first half of the merge identity
    pub typ: String,
    /// Point key, second half of the merge identity
    pub key: String,
    /// Numeric payload
    pub value: f64,
    /// Textual payload (uri, token, description, ...)
    pub text: String,
    /// Time the value was written
    pub time: DateTime<Utc>,
}

impl Point {
    /// Create a numeric point stamped with the current time
    pub fn new(typ: impl Into<String>, key: impl Into<String>, value: f64) -> Self {
        Self {
            typ: typ.into(),
            key: key.into(),
            value,
            text: String::new(),
            time: Utc::now(),
        }
    }

    /// Create a textual point stamped with the current time
    pub fn text(typ: impl Into<String>, key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            key: key.into(),
            value: 0.0,
            text: text.into(),
            time: Utc::now(),
        }
    }

    /// A live tombstone, the sentinel published when a node or edge is created
    pub fn tombstone_live() -> Self {
        Self::new(POINT_TYPE_TOMBSTONE, "", 0.0)
    }

    /// Set an explicit timestamp
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Whether this point has the given merge identity
    pub fn is_match(&self, typ: &str, key: &str) -> bool {
        self.typ == typ && self.key == key
    }

    /// Whether this point is a tombstone marking something live
    pub fn is_tombstone_live(&self) -> bool {
        self.typ == POINT_TYPE_TOMBSTONE && self.value == 0.0
    }

    /// Whether this point is a tombstone marking something deleted
    pub fn is_tombstone_deleted(&self) -> bool {
        self.typ == POINT_TYPE_TOMBSTONE && self.value != 0.0
    }

    /// Value interpreted as a boolean flag
    pub fn as_bool(&self) -> bool {
        self.value != 0.0
    }

    /// 32-bit digest of the full point content
    ///
    /// Digests are XOR-combined into node hashes, so the combination does
    /// not depend on point order.
    pub fn content_hash(&self) -> u32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.typ.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.key.as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.value.to_bits().to_le_bytes());
        hasher.update(self.text.as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.time.timestamp().to_le_bytes());
        hasher.update(&self.time.timestamp_subsec_nanos().to_le_bytes());
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// Which side a merge must write to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDirection {
    /// Local copy is strictly newer; overwrite the upstream copy
    Upstream,
    /// Upstream copy is strictly newer; overwrite the local copy
    Downstream,
    /// Same timestamp, already converged
    None,
}

/// Last-write-wins decision for two points with the same identity
///
/// Equal timestamps are treated as converged, which keeps repeated
/// reconciliation passes free of writes.
pub fn merge_decision(local: &Point, remote: &Point) -> MergeDirection {
    if local.time > remote.time {
        MergeDirection::Upstream
    } else if local.time < remote.time {
        MergeDirection::Downstream
    } else {
        MergeDirection::None
    }
}

/// Result of merging a local point set against an upstream one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointSetDiff {
    /// Points the upstream copy is missing or holds stale values for
    pub to_remote: Vec<Point>,
    /// Points the local copy is missing or holds stale values for
    pub to_local: Vec<Point>,
}

impl PointSetDiff {
    /// True when neither side needs a write
    pub fn is_empty(&self) -> bool {
        self.to_remote.is_empty() && self.to_local.is_empty()
    }
}

/// Element-wise merge of two point sets unique by `(typ, key)`
///
/// Local points drive the pass; a remote point never matched by any local
/// point is information the local side never had and is copied down.
pub fn merge_point_sets(local: &[Point], remote: &[Point]) -> PointSetDiff {
    let mut diff = PointSetDiff::default();
    let mut processed = vec![false; remote.len()];

    for p in local {
        let matched = remote
            .iter()
            .enumerate()
            .find(|(_, r)| p.is_match(&r.typ, &r.key));

        match matched {
            Some((i, r)) => {
                processed[i] = true;
                match merge_decision(p, r) {
                    MergeDirection::Upstream => diff.to_remote.push(p.clone()),
                    MergeDirection::Downstream => diff.to_local.push(r.clone()),
                    MergeDirection::None => {}
                }
            }
            None => diff.to_remote.push(p.clone()),
        }
    }

    for (r, seen) in remote.iter().zip(&processed) {
        if !seen {
            diff.to_local.push(r.clone());
        }
    }

    diff
}

/// Insert or replace a point in a set, keeping only the newest value
///
/// Returns true if the set changed.
pub fn upsert_point(points: &mut Vec<Point>, incoming: &Point) -> bool {
    match points
        .iter_mut()
        .find(|p| p.is_match(&incoming.typ, &incoming.key))
    {
        Some(existing) => {
            if incoming.time > existing.time {
                *existing = incoming.clone();
                true
            } else {
                false
            }
        }
        None => {
            points.push(incoming.clone());
            true
        }
    }
}

//! Bus subjects and the messages published on them

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::point::Point;

/// A pub/sub subject on the graph bus
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Points of a single node
    NodePoints(String),
    /// Edge points of a single `(id, parent)` relation
    EdgePoints { id: String, parent: String },
    /// Points of every node
    AllNodePoints,
    /// Edge points of every relation
    AllEdgePoints,
    /// Edge points of any node below `ancestor`
    ///
    /// The store republishes every edge-point write on this subject for each
    /// ancestor of the written node, which is how new descendants are spotted.
    UpEdgePoints { ancestor: String },
}

impl Subject {
    /// Whether a message published on `published` is delivered to this subject
    pub fn matches(&self, published: &Subject) -> bool {
        match (self, published) {
            (Subject::AllNodePoints, Subject::NodePoints(_)) => true,
            (Subject::AllEdgePoints, Subject::EdgePoints { .. }) => true,
            _ => self == published,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::NodePoints(id) => write!(f, "p.{}", id),
            Subject::EdgePoints { id, parent } => write!(f, "p.{}.{}", id, parent),
            Subject::AllNodePoints => write!(f, "p.*"),
            Subject::AllEdgePoints => write!(f, "p.*.*"),
            Subject::UpEdgePoints { ancestor } => write!(f, "up.{}.*.*", ancestor),
        }
    }
}

/// Payload published on the graph bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusMessage {
    /// Node point update
    NodePoints { id: String, points: Vec<Point> },
    /// Edge point update
    EdgePoints {
        id: String,
        parent: String,
        points: Vec<Point>,
    },
    /// Edge point update republished for an ancestor
    UpEdgePoints {
        ancestor: String,
        id: String,
        parent: String,
        points: Vec<Point>,
    },
}

impl BusMessage {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        postcard::to_allocvec(self).map_err(|e| BusError::Encode(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, BusError> {
        postcard::from_bytes(data).map_err(|e| BusError::Decode(e.to_string()))
    }

    /// Points carried by the message
    pub fn points(&self) -> &[Point] {
        match self {
            BusMessage::NodePoints { points, .. }
            | BusMessage::EdgePoints { points, .. }
            | BusMessage::UpEdgePoints { points, .. } => points,
        }
    }

    /// Whether any carried point is a live tombstone
    pub fn has_live_tombstone(&self) -> bool {
        self.points().iter().any(|p| p.is_tombstone_live())
    }
}

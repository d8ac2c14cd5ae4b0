//! Graph bus abstraction
//!
//! The [`GraphBus`] trait is the single surface through which the upstream
//! engine reads and writes a graph store. The same engine logic runs
//! against a real message bus client or against [`MemoryGraph`] in tests.
//!
//! [`MemoryGraph`]: crate::memory_bus::MemoryGraph

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BusResult;
use crate::node::NodeEdge;
use crate::point::Point;
use crate::subject::Subject;

/// Lifecycle transitions reported by a bus client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Initial connection established
    Connected,
    /// Link lost; the client keeps trying in the background
    Disconnected,
    /// Link restored after a disconnect
    Reconnected,
    /// Connection closed for good
    Closed,
}

/// Options for opening a bus connection
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Bus endpoint
    pub uri: String,
    /// Auth token presented on connect
    pub auth_token: String,
    /// Do not deliver this connection's own publications back to it
    pub no_echo: bool,
    /// Where lifecycle events are delivered
    pub events: Option<mpsc::Sender<ConnectionEvent>>,
}

impl ConnectOptions {
    /// Options for an endpoint
    pub fn new(uri: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            auth_token: auth_token.into(),
            ..Default::default()
        }
    }

    /// Suppress echo of own publications
    pub fn no_echo(mut self) -> Self {
        self.no_echo = true;
        self
    }

    /// Deliver lifecycle events to the given channel
    pub fn with_events(mut self, events: mpsc::Sender<ConnectionEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

/// A live subscription on the bus
///
/// Dropping the subscription (or its receiver) unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    /// Subject subscribed to
    pub subject: Subject,
    /// Encoded [`BusMessage`](crate::subject::BusMessage)s in publish order
    pub receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Query and mutation capabilities of a graph store reached over a bus
#[async_trait]
pub trait GraphBus: Send + Sync {
    /// Fetch the node `id` as seen through its edge to `parent`
    ///
    /// `parent` may be [`ANY_PARENT`](crate::node::ANY_PARENT). Returns
    /// `Ok(None)` when the store has no such node.
    async fn get_node(&self, parent: &str, id: &str) -> BusResult<Option<NodeEdge>>;

    /// Fetch the direct children of `id`, deleted edges included
    async fn get_children(&self, id: &str) -> BusResult<Vec<NodeEdge>>;

    /// Fetch the root node of the store
    async fn get_root(&self) -> BusResult<NodeEdge>;

    /// Create or update a node together with its edge to `node.parent`
    async fn send_node(&self, node: &NodeEdge, origin: &str) -> BusResult<()>;

    /// Publish node points
    async fn send_node_points(&self, id: &str, points: &[Point], ack: bool) -> BusResult<()>;

    /// Publish edge points for `(id, parent)`
    async fn send_edge_points(
        &self,
        id: &str,
        parent: &str,
        points: &[Point],
        ack: bool,
    ) -> BusResult<()>;

    /// Subscribe to a subject
    async fn subscribe(&self, subject: Subject) -> BusResult<Subscription>;

    /// Close the connection
    ///
    /// Default implementation does nothing.
    async fn close(&self) {}

    /// Publish a single node point
    async fn send_node_point(&self, id: &str, point: &Point, ack: bool) -> BusResult<()> {
        self.send_node_points(id, std::slice::from_ref(point), ack)
            .await
    }

    /// Publish a single edge point
    async fn send_edge_point(
        &self,
        id: &str,
        parent: &str,
        point: &Point,
        ack: bool,
    ) -> BusResult<()> {
        self.send_edge_points(id, parent, std::slice::from_ref(point), ack)
            .await
    }
}

/// Opens bus connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection
    ///
    /// Lifecycle events, starting with [`ConnectionEvent::Connected`], are
    /// delivered asynchronously to `opts.events`.
    async fn connect(&self, opts: ConnectOptions) -> BusResult<Arc<dyn GraphBus>>;
}

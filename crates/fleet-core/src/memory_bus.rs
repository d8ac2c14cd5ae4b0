//! In-memory graph store and bus for testing
//!
//! Provides a complete graph store reachable through [`GraphBus`]
//! connections, so the upstream engine can be exercised against two
//! independent stores without a real message bus.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleet_core::{ConnectOptions, MemoryConnector, MemoryGraph};
//!
//! let upstream = MemoryGraph::new("mem://cloud", "cloud", "server");
//! let connector = MemoryConnector::new().with_graph(upstream.clone());
//!
//! let bus = connector.connect(ConnectOptions::new("mem://cloud", "")).await?;
//! let root = bus.get_root().await?;
//! ```
//!
//! ## Semantics
//!
//! - A stored point is replaced only by a strictly newer point with the
//!   same `(typ, key)`; every publish is delivered to subscribers anyway.
//! - Edge points for an unknown node create a placeholder node with an
//!   empty type until [`GraphBus::send_node`] fills it in.
//! - Edge point writes are republished on [`Subject::UpEdgePoints`] for
//!   every ancestor of the written node.
//! - Connections opened with `no_echo` never see their own publications.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::bus::{ConnectOptions, ConnectionEvent, Connector, GraphBus, Subscription};
use crate::error::{BusError, BusResult, GraphError};
use crate::node::{subtree_hash, NodeEdge, ANY_PARENT, ROOT_PARENT};
use crate::point::{upsert_point, Point, POINT_TYPE_TOMBSTONE};
use crate::subject::{BusMessage, Subject};

#[derive(Debug, Clone, Default)]
struct StoredNode {
    typ: String,
    points: Vec<Point>,
}

#[derive(Debug, Default)]
struct GraphState {
    root_id: String,
    nodes: BTreeMap<String, StoredNode>,
    /// Edge points keyed by `(id, parent)`
    edges: BTreeMap<(String, String), Vec<Point>>,
}

impl GraphState {
    fn find_parent(&self, id: &str, parent: &str) -> Option<String> {
        if parent != ANY_PARENT {
            let key = (id.to_string(), parent.to_string());
            return self.edges.contains_key(&key).then(|| parent.to_string());
        }

        self.edges
            .range((id.to_string(), String::new())..)
            .take_while(|((edge_id, _), _)| edge_id == id)
            .map(|((_, edge_parent), _)| edge_parent.clone())
            .next()
    }

    fn node_edge(&self, id: &str, parent: &str) -> Option<NodeEdge> {
        let parent = self.find_parent(id, parent)?;
        let edge_points = self.edges.get(&(id.to_string(), parent.clone()))?;
        let node = self.nodes.get(id).cloned().unwrap_or_default();
        let hash = self.edge_hash(id, &parent, &mut HashSet::new());

        Some(NodeEdge {
            id: id.to_string(),
            typ: node.typ,
            parent,
            points: node.points,
            edge_points: edge_points.clone(),
            hash,
        })
    }

    fn edge_hash(&self, id: &str, parent: &str, visiting: &mut HashSet<String>) -> u32 {
        // a cycle contributes nothing past its first visit
        if !visiting.insert(id.to_string()) {
            return 0;
        }

        let empty = Vec::new();
        let node = self.nodes.get(id);
        let typ = node.map(|n| n.typ.as_str()).unwrap_or("");
        let node_points = node.map(|n| &n.points).unwrap_or(&empty);
        let edge_points = self
            .edges
            .get(&(id.to_string(), parent.to_string()))
            .unwrap_or(&empty);

        let children: Vec<(String, u32)> = self
            .child_ids(id)
            .into_iter()
            .map(|child| {
                let hash = self.edge_hash(&child, id, visiting);
                (child, hash)
            })
            .collect();

        visiting.remove(id);
        subtree_hash(id, typ, node_points, edge_points, &children)
    }

    fn child_ids(&self, id: &str) -> Vec<String> {
        self.edges
            .keys()
            .filter(|(_, parent)| parent == id)
            .map(|(child, _)| child.clone())
            .collect()
    }

    /// Every node above `id` when reached through `parent`
    fn ancestors(&self, parent: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([parent.to_string()]);

        while let Some(current) = queue.pop_front() {
            if current == ROOT_PARENT || !seen.insert(current.clone()) {
                continue;
            }
            for ((edge_id, edge_parent), _) in self.edges.iter() {
                if *edge_id == current {
                    queue.push_back(edge_parent.clone());
                }
            }
            out.push(current);
        }

        out
    }

    fn apply_node_points(&mut self, id: &str, points: &[Point]) {
        let node = self.nodes.entry(id.to_string()).or_default();
        for p in points {
            upsert_point(&mut node.points, p);
        }
    }

    /// Returns true if the edge did not exist before
    fn apply_edge_points(&mut self, id: &str, parent: &str, points: &[Point]) -> bool {
        self.nodes.entry(id.to_string()).or_default();
        let key = (id.to_string(), parent.to_string());
        let created = !self.edges.contains_key(&key);
        let edge = self.edges.entry(key).or_default();
        for p in points {
            upsert_point(edge, p);
        }
        created
    }
}

struct ConnectionEntry {
    no_echo: bool,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

struct SubscriberEntry {
    conn_id: u64,
    subject: Subject,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

struct GraphInner {
    uri: String,
    state: RwLock<GraphState>,
    connections: DashMap<u64, ConnectionEntry>,
    subscribers: DashMap<u64, SubscriberEntry>,
    next_id: AtomicU64,
    online: AtomicBool,
    auth_token: RwLock<Option<String>>,
    failing: DashSet<String>,
    send_count: AtomicUsize,
}

impl GraphInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, GraphState>, GraphError> {
        self.state.read().map_err(|_| GraphError::LockPoisoned)
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, GraphState>, GraphError> {
        self.state.write().map_err(|_| GraphError::LockPoisoned)
    }

    fn check(&self, conn_id: u64) -> BusResult<()> {
        if !self.connections.contains_key(&conn_id) {
            return Err(BusError::ConnectionClosed);
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        Ok(())
    }

    fn check_write(&self, conn_id: u64, target: &str) -> BusResult<()> {
        self.check(conn_id)?;
        if self.failing.contains(target) {
            return Err(BusError::SendFailed(format!("publish for {} rejected", target)));
        }
        Ok(())
    }

    fn emit(&self, conn_id: u64, event: ConnectionEvent) {
        if let Some(entry) = self.connections.get(&conn_id)
            && let Some(events) = &entry.events
        {
            let _ = events.send(event);
        }
    }

    fn publish(&self, from_conn: u64, subject: Subject, msg: &BusMessage) -> BusResult<()> {
        let bytes = msg.to_bytes()?;
        let no_echo = self
            .connections
            .get(&from_conn)
            .map(|c| c.no_echo)
            .unwrap_or(false);

        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if !sub.subject.matches(&subject) {
                continue;
            }
            if no_echo && sub.conn_id == from_conn {
                continue;
            }
            if sub.sender.send(bytes.clone()).is_err() {
                dead.push(*entry.key());
            }
        }

        for id in dead {
            self.subscribers.remove(&id);
        }

        trace!(uri = %self.uri, subject = %subject, "Published");
        Ok(())
    }

    fn publish_edge_points(
        &self,
        from_conn: u64,
        id: &str,
        parent: &str,
        points: &[Point],
        ancestors: Vec<String>,
    ) -> BusResult<()> {
        self.publish(
            from_conn,
            Subject::EdgePoints {
                id: id.to_string(),
                parent: parent.to_string(),
            },
            &BusMessage::EdgePoints {
                id: id.to_string(),
                parent: parent.to_string(),
                points: points.to_vec(),
            },
        )?;

        for ancestor in ancestors {
            self.publish(
                from_conn,
                Subject::UpEdgePoints {
                    ancestor: ancestor.clone(),
                },
                &BusMessage::UpEdgePoints {
                    ancestor,
                    id: id.to_string(),
                    parent: parent.to_string(),
                    points: points.to_vec(),
                },
            )?;
        }

        Ok(())
    }
}

/// An in-memory graph store with a pub/sub bus in front of it
#[derive(Clone)]
pub struct MemoryGraph {
    inner: Arc<GraphInner>,
}

impl std::fmt::Debug for MemoryGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGraph")
            .field("uri", &self.inner.uri)
            .field("connections", &self.inner.connections.len())
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}

impl MemoryGraph {
    /// Create a store reachable at `uri` whose root node is `root_id`
    pub fn new(uri: impl Into<String>, root_id: impl Into<String>, root_type: impl Into<String>) -> Self {
        let root_id = root_id.into();
        let mut state = GraphState {
            root_id: root_id.clone(),
            ..Default::default()
        };
        state.nodes.insert(
            root_id.clone(),
            StoredNode {
                typ: root_type.into(),
                points: Vec::new(),
            },
        );
        state
            .edges
            .insert((root_id, ROOT_PARENT.to_string()), vec![Point::tombstone_live()]);

        Self {
            inner: Arc::new(GraphInner {
                uri: uri.into(),
                state: RwLock::new(state),
                connections: DashMap::new(),
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                online: AtomicBool::new(true),
                auth_token: RwLock::new(None),
                failing: DashSet::new(),
                send_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Require this auth token on connect
    pub fn with_auth_token(self, token: impl Into<String>) -> Self {
        if let Ok(mut guard) = self.inner.auth_token.write() {
            *guard = Some(token.into());
        }
        self
    }

    /// Endpoint this store answers on
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Open a connection
    ///
    /// Must be called within a tokio runtime when `opts.events` is set.
    pub fn connect(&self, opts: ConnectOptions) -> BusResult<Arc<MemoryBus>> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionFailed(format!("{} unreachable", self.inner.uri)));
        }
        if opts.uri != self.inner.uri {
            return Err(BusError::ConnectionFailed(format!("unknown endpoint {}", opts.uri)));
        }
        let required = self
            .inner
            .auth_token
            .read()
            .map_err(|_| GraphError::LockPoisoned)?
            .clone();
        if let Some(token) = required
            && token != opts.auth_token
        {
            return Err(BusError::ConnectionFailed("authorization violation".into()));
        }

        let conn_id = self.inner.next_id();

        // events are queued unbounded and forwarded in order so the store
        // never waits on a slow consumer
        let events = opts.events.map(|tx| {
            let (queue_tx, mut queue_rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(event) = queue_rx.recv().await {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
            queue_tx
        });

        self.inner.connections.insert(
            conn_id,
            ConnectionEntry {
                no_echo: opts.no_echo,
                events,
            },
        );
        self.inner.emit(conn_id, ConnectionEvent::Connected);

        debug!(uri = %self.inner.uri, conn_id, no_echo = opts.no_echo, "Connection opened");

        Ok(Arc::new(MemoryBus {
            graph: Arc::clone(&self.inner),
            conn_id,
        }))
    }

    /// Open a plain connection that sees its own publications
    pub fn client(&self) -> BusResult<Arc<MemoryBus>> {
        self.connect(ConnectOptions::new(self.inner.uri.clone(), self.current_token()))
    }

    fn current_token(&self) -> String {
        self.inner
            .auth_token
            .read()
            .ok()
            .and_then(|t| t.clone())
            .unwrap_or_default()
    }

    /// A [`Connector`] that opens connections to this store only
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector::new().with_graph(self.clone())
    }

    /// Take the store offline or bring it back
    ///
    /// Live connections receive `Disconnected` / `Reconnected`, and every
    /// operation fails with [`BusError::NotConnected`] while offline.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }

        let event = if online {
            ConnectionEvent::Reconnected
        } else {
            ConnectionEvent::Disconnected
        };

        let ids: Vec<u64> = self.inner.connections.iter().map(|c| *c.key()).collect();
        for id in ids {
            self.inner.emit(id, event);
        }

        debug!(uri = %self.inner.uri, online, "Store availability changed");
    }

    /// Make every write targeting `id` fail
    pub fn fail_sends_for(&self, id: impl Into<String>) {
        self.inner.failing.insert(id.into());
    }

    /// Stop injecting write failures
    pub fn clear_failures(&self) {
        self.inner.failing.clear();
    }

    /// Total number of successful writes across all connections
    pub fn send_count(&self) -> usize {
        self.inner.send_count.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions on exactly this subject
    pub fn subscriber_count(&self, subject: &Subject) -> usize {
        self.inner
            .subscribers
            .iter()
            .filter(|s| s.subject == *subject && !s.sender.is_closed())
            .count()
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Snapshot of a node through any of its edges
    pub fn node(&self, id: &str) -> Option<NodeEdge> {
        self.inner.read_state().ok()?.node_edge(id, ANY_PARENT)
    }

    /// Subtree hash of `(parent, id)`
    pub fn hash_of(&self, parent: &str, id: &str) -> Option<u32> {
        self.inner.read_state().ok()?.node_edge(id, parent).map(|n| n.hash)
    }

    /// Id of the root node
    pub fn root_id(&self) -> String {
        self.inner
            .read_state()
            .map(|s| s.root_id.clone())
            .unwrap_or_default()
    }
}

/// A connection to a [`MemoryGraph`]
pub struct MemoryBus {
    graph: Arc<GraphInner>,
    conn_id: u64,
}

impl MemoryBus {
    /// Connection identifier within its store
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

#[async_trait]
impl GraphBus for MemoryBus {
    async fn get_node(&self, parent: &str, id: &str) -> BusResult<Option<NodeEdge>> {
        self.graph.check(self.conn_id)?;
        let state = self.graph.read_state()?;
        Ok(state.node_edge(id, parent))
    }

    async fn get_children(&self, id: &str) -> BusResult<Vec<NodeEdge>> {
        self.graph.check(self.conn_id)?;
        let state = self.graph.read_state()?;
        Ok(state
            .child_ids(id)
            .iter()
            .filter_map(|child| state.node_edge(child, id))
            .collect())
    }

    async fn get_root(&self) -> BusResult<NodeEdge> {
        self.graph.check(self.conn_id)?;
        let state = self.graph.read_state()?;
        let root_id = state.root_id.clone();
        state
            .node_edge(&root_id, ROOT_PARENT)
            .ok_or_else(|| GraphError::NodeNotFound(root_id).into())
    }

    async fn send_node(&self, node: &NodeEdge, origin: &str) -> BusResult<()> {
        self.graph.check_write(self.conn_id, &node.id)?;

        let mut edge_points = node.edge_points.clone();
        let ancestors = {
            let mut state = self.graph.write_state()?;
            if node.parent != ROOT_PARENT && !state.nodes.contains_key(&node.parent) {
                return Err(GraphError::ParentNotFound(node.parent.clone()).into());
            }

            let key = (node.id.clone(), node.parent.clone());
            if !state.edges.contains_key(&key)
                && !edge_points.iter().any(|p| p.typ == POINT_TYPE_TOMBSTONE)
            {
                edge_points.push(Point::tombstone_live());
            }

            state.apply_edge_points(&node.id, &node.parent, &edge_points);
            state.apply_node_points(&node.id, &node.points);
            if node.has_type()
                && let Some(stored) = state.nodes.get_mut(&node.id)
            {
                stored.typ = node.typ.clone();
            }

            state.ancestors(&node.parent)
        };

        self.graph.send_count.fetch_add(1, Ordering::SeqCst);
        debug!(uri = %self.graph.uri, node = %node.desc(), parent = %node.parent, origin, "Node stored");

        // edge points go out first, as a real bus client would send them
        self.graph
            .publish_edge_points(self.conn_id, &node.id, &node.parent, &edge_points, ancestors)?;
        self.graph.publish(
            self.conn_id,
            Subject::NodePoints(node.id.clone()),
            &BusMessage::NodePoints {
                id: node.id.clone(),
                points: node.points.clone(),
            },
        )
    }

    async fn send_node_points(&self, id: &str, points: &[Point], _ack: bool) -> BusResult<()> {
        self.graph.check_write(self.conn_id, id)?;
        self.graph.write_state()?.apply_node_points(id, points);
        self.graph.send_count.fetch_add(1, Ordering::SeqCst);

        self.graph.publish(
            self.conn_id,
            Subject::NodePoints(id.to_string()),
            &BusMessage::NodePoints {
                id: id.to_string(),
                points: points.to_vec(),
            },
        )
    }

    async fn send_edge_points(
        &self,
        id: &str,
        parent: &str,
        points: &[Point],
        _ack: bool,
    ) -> BusResult<()> {
        self.graph.check_write(self.conn_id, id)?;
        let ancestors = {
            let mut state = self.graph.write_state()?;
            state.apply_edge_points(id, parent, points);
            state.ancestors(parent)
        };
        self.graph.send_count.fetch_add(1, Ordering::SeqCst);

        self.graph
            .publish_edge_points(self.conn_id, id, parent, points, ancestors)
    }

    async fn subscribe(&self, subject: Subject) -> BusResult<Subscription> {
        self.graph.check(self.conn_id)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let sub_id = self.graph.next_id();
        self.graph.subscribers.insert(
            sub_id,
            SubscriberEntry {
                conn_id: self.conn_id,
                subject: subject.clone(),
                sender,
            },
        );
        trace!(uri = %self.graph.uri, subject = %subject, "Subscribed");
        Ok(Subscription { subject, receiver })
    }

    async fn close(&self) {
        self.graph.subscribers.retain(|_, s| s.conn_id != self.conn_id);
        self.graph.emit(self.conn_id, ConnectionEvent::Closed);
        self.graph.connections.remove(&self.conn_id);
        debug!(uri = %self.graph.uri, conn_id = self.conn_id, "Connection closed");
    }
}

/// [`Connector`] that routes connections to in-memory stores by URI
#[derive(Clone, Default)]
pub struct MemoryConnector {
    graphs: Arc<DashMap<String, MemoryGraph>>,
}

impl MemoryConnector {
    /// Create a connector with no reachable stores
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a store reachable at its URI
    pub fn with_graph(self, graph: MemoryGraph) -> Self {
        self.graphs.insert(graph.uri().to_string(), graph);
        self
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, opts: ConnectOptions) -> BusResult<Arc<dyn GraphBus>> {
        let graph = self
            .graphs
            .get(&opts.uri)
            .map(|g| g.clone())
            .ok_or_else(|| BusError::ConnectionFailed(format!("no route to {}", opts.uri)))?;
        let bus: Arc<dyn GraphBus> = graph.connect(opts)?;
        Ok(bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::POINT_TYPE_DESCRIPTION;

    fn graph() -> MemoryGraph {
        MemoryGraph::new("mem://test", "root-1", "device")
    }

    async fn recv_msg(sub: &mut Subscription) -> BusMessage {
        let bytes = tokio::time::timeout(std::time::Duration::from_secs(1), sub.receiver.recv())
            .await
            .expect("timed out")
            .expect("closed");
        BusMessage::from_bytes(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_root_node() {
        let g = graph();
        let bus = g.client().unwrap();
        let root = bus.get_root().await.unwrap();
        assert_eq!(root.id, "root-1");
        assert_eq!(root.parent, ROOT_PARENT);
        assert_eq!(root.typ, "device");
    }

    #[tokio::test]
    async fn test_send_node_and_query() {
        let g = graph();
        let bus = g.client().unwrap();

        let node = NodeEdge::new("n1", "modbus", "root-1")
            .with_points(vec![Point::text(POINT_TYPE_DESCRIPTION, "", "bus 1")]);
        bus.send_node(&node, "test").await.unwrap();

        let stored = bus.get_node("root-1", "n1").await.unwrap().unwrap();
        assert_eq!(stored.typ, "modbus");
        assert_eq!(stored.points.len(), 1);
        // new edges get a live tombstone
        assert!(stored.edge_points.iter().any(|p| p.is_tombstone_live()));

        let any = bus.get_node(ANY_PARENT, "n1").await.unwrap().unwrap();
        assert_eq!(any.parent, "root-1");

        let children = bus.get_children("root-1").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "n1");

        assert!(bus.get_node("root-1", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_node_unknown_parent() {
        let g = graph();
        let bus = g.client().unwrap();
        let node = NodeEdge::new("n1", "modbus", "nowhere");
        assert!(bus.send_node(&node, "test").await.is_err());
    }

    #[tokio::test]
    async fn test_hash_changes_with_subtree() {
        let g = graph();
        let bus = g.client().unwrap();
        let before = g.hash_of(ROOT_PARENT, "root-1").unwrap();

        bus.send_node(&NodeEdge::new("n1", "modbus", "root-1"), "test")
            .await
            .unwrap();
        let after_child = g.hash_of(ROOT_PARENT, "root-1").unwrap();
        assert_ne!(before, after_child);

        bus.send_node_point("n1", &Point::new("value", "", 3.0), true)
            .await
            .unwrap();
        assert_ne!(after_child, g.hash_of(ROOT_PARENT, "root-1").unwrap());
    }

    #[tokio::test]
    async fn test_older_point_ignored() {
        let g = graph();
        let bus = g.client().unwrap();
        let newer = Point::new("value", "", 2.0);
        let older = Point::new("value", "", 1.0).at(newer.time - chrono::Duration::seconds(5));

        bus.send_node_point("root-1", &newer, true).await.unwrap();
        bus.send_node_point("root-1", &older, true).await.unwrap();

        let root = bus.get_root().await.unwrap();
        assert_eq!(root.points[0].value, 2.0);
    }

    #[tokio::test]
    async fn test_no_echo() {
        let g = graph();
        let quiet = g
            .connect(ConnectOptions::new("mem://test", "").no_echo())
            .unwrap();
        let other = g.client().unwrap();

        let mut sub = quiet.subscribe(Subject::AllNodePoints).await.unwrap();

        quiet
            .send_node_point("root-1", &Point::new("a", "", 1.0), false)
            .await
            .unwrap();
        other
            .send_node_point("root-1", &Point::new("b", "", 1.0), false)
            .await
            .unwrap();

        match recv_msg(&mut sub).await {
            BusMessage::NodePoints { points, .. } => assert_eq!(points[0].typ, "b"),
            other => panic!("unexpected message {:?}", other),
        }
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_up_edge_points_reach_ancestors() {
        let g = graph();
        let bus = g.client().unwrap();
        bus.send_node(&NodeEdge::new("n1", "group", "root-1"), "test")
            .await
            .unwrap();

        let mut up_root = bus
            .subscribe(Subject::UpEdgePoints {
                ancestor: "root-1".into(),
            })
            .await
            .unwrap();

        bus.send_node(&NodeEdge::new("n2", "sensor", "n1"), "test")
            .await
            .unwrap();

        match recv_msg(&mut up_root).await {
            BusMessage::UpEdgePoints {
                ancestor, id, parent, points,
            } => {
                assert_eq!(ancestor, "root-1");
                assert_eq!(id, "n2");
                assert_eq!(parent, "n1");
                assert!(points.iter().any(|p| p.is_tombstone_live()));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_placeholder_node_from_edge_points() {
        let g = graph();
        let bus = g.client().unwrap();
        bus.send_edge_point("n9", "root-1", &Point::tombstone_live(), false)
            .await
            .unwrap();

        let node = bus.get_node("root-1", "n9").await.unwrap().unwrap();
        assert!(!node.has_type());

        bus.send_node(&NodeEdge::new("n9", "sensor", "root-1"), "test")
            .await
            .unwrap();
        assert!(bus.get_node("root-1", "n9").await.unwrap().unwrap().has_type());
    }

    #[tokio::test]
    async fn test_offline_and_events() {
        let g = graph();
        let (tx, mut rx) = mpsc::channel(4);
        let bus = g
            .connect(ConnectOptions::new("mem://test", "").with_events(tx))
            .unwrap();
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Connected));

        g.set_online(false);
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Disconnected));
        assert!(matches!(bus.get_root().await, Err(BusError::NotConnected)));
        assert!(g.connect(ConnectOptions::new("mem://test", "")).is_err());

        g.set_online(true);
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Reconnected));
        assert!(bus.get_root().await.is_ok());

        bus.close().await;
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Closed));
        assert!(matches!(bus.get_root().await, Err(BusError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_auth_token_required() {
        let g = graph().with_auth_token("secret");
        assert!(g.connect(ConnectOptions::new("mem://test", "wrong")).is_err());
        assert!(g.connect(ConnectOptions::new("mem://test", "secret")).is_ok());
    }

    #[tokio::test]
    async fn test_fail_sends_for() {
        let g = graph();
        let bus = g.client().unwrap();
        g.fail_sends_for("root-1");
        assert!(matches!(
            bus.send_node_point("root-1", &Point::new("a", "", 1.0), true).await,
            Err(BusError::SendFailed(_))
        ));
        g.clear_failures();
        assert!(bus
            .send_node_point("root-1", &Point::new("a", "", 1.0), true)
            .await
            .is_ok());
        assert_eq!(g.send_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let g = graph();
        let bus = g.client().unwrap();
        let subject = Subject::NodePoints("root-1".into());
        let sub = bus.subscribe(subject.clone()).await.unwrap();
        assert_eq!(g.subscriber_count(&subject), 1);
        drop(sub);
        assert_eq!(g.subscriber_count(&subject), 0);
    }

    #[tokio::test]
    async fn test_connector_routes_by_uri() {
        let a = MemoryGraph::new("mem://a", "ra", "server");
        let b = MemoryGraph::new("mem://b", "rb", "server");
        let connector = MemoryConnector::new().with_graph(a).with_graph(b);

        let bus = connector.connect(ConnectOptions::new("mem://b", "")).await.unwrap();
        assert_eq!(bus.get_root().await.unwrap().id, "rb");
        assert!(connector.connect(ConnectOptions::new("mem://c", "")).await.is_err());
    }
}

//! Remote subscription tracking
//!
//! Every tracked subscription is a forwarding task that copies upstream
//! point updates into the local store. Node subscriptions are keyed by node
//! id, edge subscriptions by `(id, parent)` with the local parent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use fleet_core::{BusMessage, GraphBus, Subject, Subscription};

use crate::context::SyncContext;
use crate::error::UpstreamResult;

/// A node reported as (re)created upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEdge {
    /// Local parent of the node
    pub parent: String,
    pub id: String,
}

/// Tracks the live upstream subscriptions of one engine
pub struct SubscriptionManager {
    nodes: HashMap<String, JoinHandle<()>>,
    edges: HashMap<(String, String), JoinHandle<()>>,
    new_edges: mpsc::Sender<NewEdge>,
}

impl SubscriptionManager {
    /// Create an empty manager
    ///
    /// Live tombstones seen on edge subscriptions are reported on `new_edges`.
    pub fn new(new_edges: mpsc::Sender<NewEdge>) -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            new_edges,
        }
    }

    /// Subscribe to a node, its edge, and every local descendant
    ///
    /// Already tracked keys are left alone, so repeated calls are cheap.
    pub async fn ensure_node(
        &mut self,
        ctx: &SyncContext,
        parent: &str,
        id: &str,
    ) -> UpstreamResult<()> {
        let mut pending = vec![(parent.to_string(), id.to_string())];
        let mut seen = HashSet::new();

        while let Some((parent, id)) = pending.pop() {
            if !seen.insert((id.clone(), parent.clone())) {
                continue;
            }

            self.ensure_node_points(ctx, &id).await?;
            self.ensure_edge_points(ctx, &parent, &id).await?;

            for child in ctx.local.get_children(&id).await? {
                pending.push((child.parent, child.id));
            }
        }

        Ok(())
    }

    /// Subscribe to upstream points of `id`
    pub async fn ensure_node_points(&mut self, ctx: &SyncContext, id: &str) -> UpstreamResult<()> {
        if self.nodes.get(id).is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let sub = ctx.remote.subscribe(Subject::NodePoints(id.to_string())).await?;
        let task = tokio::spawn(
            forward_node_points(sub, Arc::clone(&ctx.local)).in_current_span(),
        );
        self.nodes.insert(id.to_string(), task);

        debug!(id, "Subscribed to upstream node points");
        Ok(())
    }

    /// Subscribe to upstream edge points of `(parent, id)`
    pub async fn ensure_edge_points(
        &mut self,
        ctx: &SyncContext,
        parent: &str,
        id: &str,
    ) -> UpstreamResult<()> {
        let key = (id.to_string(), parent.to_string());
        if self.edges.get(&key).is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let subject = Subject::EdgePoints {
            id: id.to_string(),
            parent: ctx.remote_parent(parent),
        };
        let sub = ctx.remote.subscribe(subject).await?;
        let task = tokio::spawn(
            forward_edge_points(
                sub,
                Arc::clone(&ctx.local),
                parent.to_string(),
                self.new_edges.clone(),
            )
            .in_current_span(),
        );
        self.edges.insert(key, task);

        debug!(id, parent, "Subscribed to upstream edge points");
        Ok(())
    }

    /// Drop every tracked subscription
    pub fn remove_all(&mut self) {
        let count = self.nodes.len() + self.edges.len();
        for (_, task) in self.nodes.drain() {
            task.abort();
        }
        for (_, task) in self.edges.drain() {
            task.abort();
        }
        if count > 0 {
            debug!(count, "Removed upstream subscriptions");
        }
    }

    /// Number of tracked node subscriptions
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of tracked edge subscriptions
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn has_edge(&self, parent: &str, id: &str) -> bool {
        self.edges.contains_key(&(id.to_string(), parent.to_string()))
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.remove_all();
    }
}

async fn forward_node_points(mut sub: Subscription, local: Arc<dyn GraphBus>) {
    while let Some(bytes) = sub.receiver.recv().await {
        match BusMessage::from_bytes(&bytes) {
            Ok(BusMessage::NodePoints { id, points }) => {
                if let Err(e) = local.send_node_points(&id, &points, false).await {
                    warn!(id = %id, error = %e, "Failed to forward upstream node points");
                }
            }
            Ok(other) => {
                debug!(subject = %sub.subject, message = ?other, "Ignoring unexpected message");
            }
            Err(e) => warn!(subject = %sub.subject, error = %e, "Failed to decode upstream points"),
        }
    }
}

async fn forward_edge_points(
    mut sub: Subscription,
    local: Arc<dyn GraphBus>,
    local_parent: String,
    new_edges: mpsc::Sender<NewEdge>,
) {
    while let Some(bytes) = sub.receiver.recv().await {
        let msg = match BusMessage::from_bytes(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(subject = %sub.subject, error = %e, "Failed to decode upstream edge points");
                continue;
            }
        };

        let BusMessage::EdgePoints { id, points, .. } = &msg else {
            debug!(subject = %sub.subject, message = ?msg, "Ignoring unexpected message");
            continue;
        };

        if let Err(e) = local.send_edge_points(id, &local_parent, points, false).await {
            warn!(id = %id, parent = %local_parent, error = %e, "Failed to forward upstream edge points");
        }

        if msg.has_live_tombstone() {
            let edge = NewEdge {
                parent: local_parent.clone(),
                id: id.clone(),
            };
            if new_edges.send(edge).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleet_core::{MemoryGraph, NodeEdge, Point, ROOT_PARENT};

    struct Fixture {
        local: MemoryGraph,
        remote: MemoryGraph,
        ctx: SyncContext,
    }

    async fn fixture() -> Fixture {
        let local = MemoryGraph::new("mem://local", "dev-1", "device");
        let remote = MemoryGraph::new("mem://cloud", "cloud", "server");

        let local_bus = local.client().unwrap();
        local_bus
            .send_node(&NodeEdge::new("n1", "group", "dev-1"), "test")
            .await
            .unwrap();
        local_bus
            .send_node(&NodeEdge::new("n2", "sensor", "n1"), "test")
            .await
            .unwrap();

        let ctx = SyncContext::new(
            local_bus,
            remote.client().unwrap(),
            "dev-1",
            "cloud",
            "up-1",
        );
        Fixture { local, remote, ctx }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_ensure_node_walks_local_tree() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(1);
        let mut subs = SubscriptionManager::new(tx);

        subs.ensure_node(&f.ctx, ROOT_PARENT, "dev-1").await.unwrap();

        assert_eq!(subs.node_count(), 3);
        assert_eq!(subs.edge_count(), 3);
        assert!(subs.has_edge(ROOT_PARENT, "dev-1"));
        assert!(subs.has_edge("n1", "n2"));

        // the root edge is watched under the upstream root id
        assert_eq!(
            f.remote.subscriber_count(&Subject::EdgePoints {
                id: "dev-1".into(),
                parent: "cloud".into()
            }),
            1
        );
    }

    #[tokio::test]
    async fn test_ensure_node_is_idempotent() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(1);
        let mut subs = SubscriptionManager::new(tx);

        subs.ensure_node(&f.ctx, "dev-1", "n1").await.unwrap();
        subs.ensure_node(&f.ctx, "dev-1", "n1").await.unwrap();

        assert_eq!(subs.node_count(), 2);
        assert_eq!(subs.edge_count(), 2);
        assert_eq!(f.remote.subscriber_count(&Subject::NodePoints("n1".into())), 1);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(1);
        let mut subs = SubscriptionManager::new(tx);

        // empty table is fine
        subs.remove_all();

        subs.ensure_node(&f.ctx, "dev-1", "n1").await.unwrap();
        subs.remove_all();
        assert_eq!(subs.node_count(), 0);
        assert_eq!(subs.edge_count(), 0);

        let subject = Subject::NodePoints("n1".into());
        assert!(eventually(|| f.remote.subscriber_count(&subject) == 0).await);
    }

    #[tokio::test]
    async fn test_forwards_remote_points_locally() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(1);
        let mut subs = SubscriptionManager::new(tx);
        subs.ensure_node(&f.ctx, "dev-1", "n1").await.unwrap();

        let writer = f.remote.client().unwrap();
        writer
            .send_node_point("n1", &Point::new("value", "", 7.0), false)
            .await
            .unwrap();

        let local = f.local.clone();
        assert!(
            eventually(|| {
                local
                    .node("n1")
                    .is_some_and(|n| n.points.iter().any(|p| p.typ == "value" && p.value == 7.0))
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_edge_tombstone_reports_new_edge() {
        let f = fixture().await;
        let (tx, mut rx) = mpsc::channel(1);
        let mut subs = SubscriptionManager::new(tx);
        subs.ensure_node(&f.ctx, "dev-1", "n1").await.unwrap();

        let writer = f.remote.client().unwrap();
        writer
            .send_edge_point("n1", "dev-1", &Point::tombstone_live(), false)
            .await
            .unwrap();

        let edge = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            edge,
            NewEdge {
                parent: "dev-1".into(),
                id: "n1".into()
            }
        );
    }
}

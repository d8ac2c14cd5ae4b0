//! Tree reconciliation between the local store and the upstream
//!
//! [`Reconciler::sync_node`] walks the subtree below a local node and makes
//! both copies converge:
//!
//! 1. A node missing upstream is sent with its whole local subtree.
//! 2. Equal subtree hashes end the walk for that branch.
//! 3. Otherwise node points and edge points are merged last-write-wins,
//!    and children are matched by id. Matched children with differing
//!    hashes are walked next; unmatched ones are copied across.
//!
//! The walk uses an explicit worklist. A failure in a child frame is logged
//! and counted in the [`SyncReport`] while siblings carry on; only a failure
//! in the starting frame is returned.

use std::collections::HashSet;

use tracing::{debug, error, info, warn};

use fleet_core::{merge_point_sets, BusError, GraphBus, NodeEdge, ANY_PARENT, ROOT_PARENT};

use crate::context::SyncContext;
use crate::error::{UpstreamError, UpstreamResult};
use crate::subscriptions::SubscriptionManager;

/// Tally of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Nodes compared against their upstream copy
    pub nodes_visited: usize,
    /// Points written upstream
    pub points_up: usize,
    /// Points written locally
    pub points_down: usize,
    /// Nodes created upstream
    pub nodes_created_up: usize,
    /// Nodes created locally
    pub nodes_created_down: usize,
    /// Sends or branches that failed and were skipped
    pub failures: usize,
}

impl SyncReport {
    /// True when the pass wrote nothing to either store
    pub fn is_noop(&self) -> bool {
        self.points_up == 0
            && self.points_down == 0
            && self.nodes_created_up == 0
            && self.nodes_created_down == 0
    }
}

/// Which store a point batch is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// Runs reconciliation passes for one engine
pub struct Reconciler<'a> {
    ctx: &'a SyncContext,
    subs: &'a mut SubscriptionManager,
}

impl<'a> Reconciler<'a> {
    pub fn new(ctx: &'a SyncContext, subs: &'a mut SubscriptionManager) -> Self {
        Self { ctx, subs }
    }

    /// Reconcile the subtree at `(parent, id)`, a node known locally
    pub async fn sync_node(&mut self, parent: &str, id: &str) -> UpstreamResult<SyncReport> {
        let mut report = SyncReport::default();
        let mut pending = vec![(parent.to_string(), id.to_string())];
        let mut first = true;

        while let Some((parent, id)) = pending.pop() {
            match self.sync_one(&parent, &id, &mut report).await {
                Ok(children) => pending.extend(children),
                Err(e) if first => return Err(e),
                Err(e) => {
                    error!(parent = %parent, id = %id, error = %e, "Error syncing node");
                    report.failures += 1;
                }
            }
            first = false;
        }

        Ok(report)
    }

    /// Reconcile a single node; returns the children that still differ
    async fn sync_one(
        &mut self,
        parent: &str,
        id: &str,
        report: &mut SyncReport,
    ) -> UpstreamResult<Vec<(String, String)>> {
        let query_parent = if parent == ROOT_PARENT { ANY_PARENT } else { parent };

        let local = self
            .ctx
            .local
            .get_node(query_parent, id)
            .await?
            .ok_or_else(|| UpstreamError::LocalNodeMissing {
                parent: parent.to_string(),
                id: id.to_string(),
            })?;
        report.nodes_visited += 1;

        let Some(remote) = self.ctx.remote.get_node(query_parent, id).await? else {
            info!(node = %local.desc(), "Upstream node does not exist, sending");
            self.send_nodes_remote(&local, report).await?;
            self.subs.ensure_node(self.ctx, &local.parent, &local.id).await?;
            return Ok(Vec::new());
        };

        self.fill_type(&local, &remote, report).await;

        if remote.hash == local.hash {
            return Ok(Vec::new());
        }

        debug!(
            node = %local.desc(),
            hash_up = format_args!("{:#x}", remote.hash),
            hash_down = format_args!("{:#x}", local.hash),
            "Syncing node"
        );

        let diff = merge_point_sets(&local.points, &remote.points);
        for p in &diff.to_remote {
            let result = self.ctx.remote.send_node_point(&remote.id, p, true).await;
            tally(result, Side::Remote, &remote.id, report);
        }
        for p in &diff.to_local {
            let result = self.ctx.local.send_node_point(&local.id, p, true).await;
            tally(result, Side::Local, &local.id, report);
        }

        let diff = merge_point_sets(&local.edge_points, &remote.edge_points);
        for p in &diff.to_remote {
            let result = self
                .ctx
                .remote
                .send_edge_point(&remote.id, &remote.parent, p, true)
                .await;
            tally(result, Side::Remote, &remote.id, report);
        }
        for p in &diff.to_local {
            let result = self
                .ctx
                .local
                .send_edge_point(&local.id, &local.parent, p, true)
                .await;
            tally(result, Side::Local, &local.id, report);
        }

        let children = self.ctx.local.get_children(&local.id).await?;
        let up_children = self.ctx.remote.get_children(&remote.id).await?;
        let mut up_processed = vec![false; up_children.len()];
        let mut differing = Vec::new();

        for child in &children {
            let matched = up_children
                .iter()
                .enumerate()
                .find(|(_, up)| up.id == child.id);

            match matched {
                Some((i, up_child)) => {
                    up_processed[i] = true;
                    if up_child.hash != child.hash {
                        differing.push((local.id.clone(), child.id.clone()));
                    }
                }
                None => {
                    if let Err(e) = self.send_nodes_remote(child, report).await {
                        warn!(node = %child.desc(), error = %e, "Error sending node upstream");
                        report.failures += 1;
                        continue;
                    }
                    if let Err(e) = self.subs.ensure_node(self.ctx, &child.parent, &child.id).await {
                        warn!(node = %child.desc(), error = %e, "Error subscribing to upstream");
                    }
                }
            }
        }

        for (up_child, _) in up_children
            .iter()
            .zip(&up_processed)
            .filter(|(_, seen)| !**seen)
        {
            if !up_child.has_type() {
                debug!(id = %up_child.id, "Upstream node type not visible yet, skipping");
                continue;
            }
            if let Err(e) = self.send_nodes_local(up_child, report).await {
                warn!(node = %up_child.desc(), error = %e, "Error getting node from upstream");
                report.failures += 1;
                continue;
            }
            if let Err(e) = self.subs.ensure_node(self.ctx, &local.id, &up_child.id).await {
                warn!(node = %up_child.desc(), error = %e, "Error subscribing to upstream");
            }
        }

        Ok(differing)
    }

    /// Complete a node whose type has not reached one side yet
    async fn fill_type(&self, local: &NodeEdge, remote: &NodeEdge, report: &mut SyncReport) {
        if local.has_type() && !remote.has_type() {
            let node = NodeEdge {
                parent: remote.parent.clone(),
                ..local.clone()
            };
            match self.ctx.remote.send_node(&node, &self.ctx.origin).await {
                Ok(()) => report.nodes_created_up += 1,
                Err(e) => {
                    warn!(id = %local.id, error = %e, "Error completing upstream node");
                    report.failures += 1;
                }
            }
        } else if remote.has_type() && !local.has_type() {
            let node = NodeEdge {
                parent: local.parent.clone(),
                ..remote.clone()
            };
            match self.ctx.local.send_node(&node, &self.ctx.origin).await {
                Ok(()) => report.nodes_created_down += 1,
                Err(e) => {
                    warn!(id = %remote.id, error = %e, "Error completing local node");
                    report.failures += 1;
                }
            }
        }
    }

    /// Send a local node and its local subtree upstream
    pub async fn send_nodes_remote(
        &self,
        node: &NodeEdge,
        report: &mut SyncReport,
    ) -> UpstreamResult<()> {
        let ctx = self.ctx;
        copy_subtree(
            node,
            ctx.local.as_ref(),
            ctx.remote.as_ref(),
            |n| ctx.remote_parent(&n.parent),
            &ctx.origin,
            &mut report.nodes_created_up,
            &mut report.failures,
        )
        .await
    }

    /// Send an upstream node and its upstream subtree to the local store
    pub async fn send_nodes_local(
        &self,
        node: &NodeEdge,
        report: &mut SyncReport,
    ) -> UpstreamResult<()> {
        let ctx = self.ctx;
        copy_subtree(
            node,
            ctx.remote.as_ref(),
            ctx.local.as_ref(),
            |n| ctx.local_parent(&n.id, &n.parent),
            &ctx.origin,
            &mut report.nodes_created_down,
            &mut report.failures,
        )
        .await
    }
}

/// Copy `top` and everything below it in `source` into `target`
///
/// A node that fails to send takes its subtree with it but not its
/// siblings. Only a failure on `top` is returned.
async fn copy_subtree(
    top: &NodeEdge,
    source: &dyn GraphBus,
    target: &dyn GraphBus,
    target_parent: impl Fn(&NodeEdge) -> String,
    origin: &str,
    created: &mut usize,
    failures: &mut usize,
) -> UpstreamResult<()> {
    let mut pending = vec![top.clone()];
    let mut seen = HashSet::new();
    let mut first = true;

    while let Some(mut node) = pending.pop() {
        if !seen.insert(node.id.clone()) {
            continue;
        }
        let is_top = std::mem::replace(&mut first, false);

        node.parent = target_parent(&node);
        let result = match target.send_node(&node, origin).await {
            Ok(()) => source.get_children(&node.id).await.map_err(UpstreamError::from),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(children) => {
                *created += 1;
                pending.extend(children);
            }
            Err(e) if is_top => return Err(e),
            Err(e) => {
                warn!(node = %node.desc(), error = %e, "Error sending child node");
                *failures += 1;
            }
        }
    }

    Ok(())
}

fn tally(
    result: Result<(), BusError>,
    side: Side,
    id: &str,
    report: &mut SyncReport,
) {
    match (result, side) {
        (Ok(()), Side::Remote) => report.points_up += 1,
        (Ok(()), Side::Local) => report.points_down += 1,
        (Err(e), Side::Remote) => {
            warn!(id, error = %e, "Error syncing point upstream");
            report.failures += 1;
        }
        (Err(e), Side::Local) => {
            warn!(id, error = %e, "Error syncing point from upstream");
            report.failures += 1;
        }
    }
}

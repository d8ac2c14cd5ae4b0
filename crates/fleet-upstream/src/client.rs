//! The upstream engine task
//!
//! One task per upstream relationship owns all engine state and handles
//! exactly one input at a time:
//!
//! - local node and edge point updates, forwarded upstream while connected
//! - upstream connection lifecycle events
//! - the periodic reconciliation tick and the reconnect timer
//! - updates to the engine's own configuration node
//! - nodes reported as new by upstream subscriptions, and the resolved
//!   nodes once their type is visible
//! - the stop signal
//!
//! Subscription tasks and new-node resolvers only feed channels into the
//! loop; they never touch engine state. Waiting for a new upstream node's
//! type happens in a resolver task, never in the loop itself.

use std::collections::HashMap;
use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use fleet_core::{
    BusMessage, ConnectOptions, ConnectionEvent, Connector, GraphBus, NodeEdge, Point, Subject,
    Subscription, ROOT_PARENT,
};

use crate::config::{SyncSettings, UpstreamConfig};
use crate::connection;
use crate::context::SyncContext;
use crate::error::{UpstreamError, UpstreamResult};
use crate::reconcile::{Reconciler, SyncReport};
use crate::subscriptions::{NewEdge, SubscriptionManager};

/// Connection state of the upstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// What started a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Upstream connected or reconnected
    Connect,
    /// Periodic tick
    Tick,
}

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// Connection state changed
    StateChanged(ConnectionState),
    /// A full reconciliation pass from the root finished
    SyncCompleted {
        trigger: SyncTrigger,
        report: SyncReport,
    },
    /// A full reconciliation pass could not start or aborted at the root
    SyncFailed { trigger: SyncTrigger, error: String },
    /// A node created upstream was pulled and subscribed to
    NewNodeSubscribed { parent: String, id: String },
    /// A live local update could not be forwarded upstream
    ForwardFailed { id: String, error: String },
}

/// Points published on the local bus
#[derive(Debug)]
struct PointBatch {
    id: String,
    parent: Option<String>,
    points: Vec<Point>,
}

/// Updates to the engine's own configuration node
#[derive(Debug)]
enum ConfigUpdate {
    Points(PointBatch),
    EdgePoints(PointBatch),
}

/// A reported upstream node after waiting for its type
#[derive(Debug)]
struct ResolvedEdge {
    edge: NewEdge,
    /// Upstream link the lookup ran against
    link: u64,
    node: UpstreamResult<NodeEdge>,
}

/// Input channels of the dispatch loop
struct Inputs {
    shutdown: broadcast::Receiver<()>,
    local_nodes: mpsc::Receiver<PointBatch>,
    local_edges: mpsc::Receiver<PointBatch>,
    config: mpsc::Receiver<ConfigUpdate>,
    new_edges: mpsc::Receiver<NewEdge>,
    resolved: mpsc::Receiver<ResolvedEdge>,
}

/// Handle to a running upstream engine
///
/// Dropping the handle without calling [`UpstreamHandle::stop`] also stops
/// the engine, without waiting for it.
pub struct UpstreamHandle {
    config_tx: mpsc::Sender<ConfigUpdate>,
    shutdown_tx: broadcast::Sender<()>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<UpstreamEvent>,
    task: JoinHandle<()>,
}

impl UpstreamHandle {
    /// Deliver point updates for the upstream config node
    pub async fn points(&self, id: impl Into<String>, points: Vec<Point>) -> UpstreamResult<()> {
        self.config_tx
            .send(ConfigUpdate::Points(PointBatch {
                id: id.into(),
                parent: None,
                points,
            }))
            .await?;
        Ok(())
    }

    /// Deliver edge point updates for the upstream config node
    pub async fn edge_points(
        &self,
        id: impl Into<String>,
        parent: impl Into<String>,
        points: Vec<Point>,
    ) -> UpstreamResult<()> {
        self.config_tx
            .send(ConfigUpdate::EdgePoints(PointBatch {
                id: id.into(),
                parent: Some(parent.into()),
                points,
            }))
            .await?;
        Ok(())
    }

    /// Watch the connection state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to engine events
    pub fn events(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events_tx.subscribe()
    }

    /// Whether the engine task is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the engine and wait for its teardown to finish
    pub async fn stop(self) -> UpstreamResult<()> {
        let _ = self.shutdown_tx.send(());
        self.task.await.map_err(UpstreamError::from)
    }
}

/// Keeps the local graph convergent with one upstream instance
pub struct UpstreamClient {
    config: UpstreamConfig,
    settings: SyncSettings,
    connector: Arc<dyn Connector>,
    local: Arc<dyn GraphBus>,
    root_local: NodeEdge,
    root_remote: Option<String>,
    remote: Option<Arc<dyn GraphBus>>,
    conn_events: Option<mpsc::Receiver<ConnectionEvent>>,
    subs: SubscriptionManager,
    up_sub: Option<JoinHandle<()>>,
    new_edge_tx: mpsc::Sender<NewEdge>,
    initial_sub: bool,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<UpstreamEvent>,
    ticker: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    local_tasks: Vec<JoinHandle<()>>,
    resolved_tx: mpsc::Sender<ResolvedEdge>,
    resolvers: HashMap<(String, String), JoinHandle<()>>,
    link: u64,
}

impl UpstreamClient {
    /// Connect to the local bus and start the engine
    ///
    /// The local connection is opened with echo off regardless of
    /// `local_opts`. The first upstream connect attempt happens after
    /// `settings.reconnect_delay`.
    pub async fn spawn(
        local_connector: Arc<dyn Connector>,
        local_opts: ConnectOptions,
        remote_connector: Arc<dyn Connector>,
        config: UpstreamConfig,
        settings: SyncSettings,
    ) -> UpstreamResult<UpstreamHandle> {
        let span = info_span!("upstream", id = %config.id, description = %config.description);

        let local = connection::connect_local(local_connector.as_ref(), local_opts)
            .instrument(span.clone())
            .await?;
        let root_local = local.get_root().await?;

        let (node_tx, local_nodes) = mpsc::channel(1);
        let (edge_tx, local_edges) = mpsc::channel(1);
        let node_sub = local.subscribe(Subject::AllNodePoints).await?;
        let edge_sub = local.subscribe(Subject::AllEdgePoints).await?;
        let local_tasks = vec![
            tokio::spawn(relay_local_points(node_sub, node_tx).instrument(span.clone())),
            tokio::spawn(relay_local_points(edge_sub, edge_tx).instrument(span.clone())),
        ];

        let (config_tx, config_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(settings.event_channel_capacity);
        let (new_edge_tx, new_edges) = mpsc::channel(1);
        let (resolved_tx, resolved) = mpsc::channel(1);

        let client = Self {
            config,
            settings,
            connector: remote_connector,
            local,
            root_local,
            root_remote: None,
            remote: None,
            conn_events: None,
            subs: SubscriptionManager::new(new_edge_tx.clone()),
            up_sub: None,
            new_edge_tx,
            initial_sub: false,
            state: ConnectionState::Disconnected,
            state_tx,
            events_tx: events_tx.clone(),
            ticker: None,
            reconnect: None,
            local_tasks,
            resolved_tx,
            resolvers: HashMap::new(),
            link: 0,
        };

        let inputs = Inputs {
            shutdown: shutdown_rx,
            local_nodes,
            local_edges,
            config: config_rx,
            new_edges,
            resolved,
        };

        let task = tokio::spawn(client.run(inputs).instrument(span));

        Ok(UpstreamHandle {
            config_tx,
            shutdown_tx,
            state_rx,
            events_tx,
            task,
        })
    }

    async fn run(mut self, mut inputs: Inputs) {
        info!(root = %self.root_local.id, uri = %self.config.uri, "Upstream client started");
        self.schedule_connect(self.settings.reconnect_delay);

        loop {
            tokio::select! {
                _ = inputs.shutdown.recv() => {
                    info!("Stopping upstream client");
                    break;
                }
                _ = fire(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.connect().await;
                }
                _ = tick(&mut self.ticker) => {
                    self.sync_pass(SyncTrigger::Tick).await;
                }
                event = next_event(&mut self.conn_events) => match event {
                    Some(event) => self.handle_connection_event(event).await,
                    None => self.conn_events = None,
                },
                Some(batch) = inputs.local_nodes.recv() => {
                    self.forward_node_points(batch).await;
                }
                Some(batch) = inputs.local_edges.recv() => {
                    self.forward_edge_points(batch).await;
                }
                Some(update) = inputs.config.recv() => {
                    self.apply_config(update).await;
                }
                Some(edge) = inputs.new_edges.recv() => {
                    self.resolve_new_edge(edge);
                }
                Some(resolved) = inputs.resolved.recv() => {
                    self.handle_resolved_edge(resolved).await;
                }
            }
        }

        self.shutdown().await;
    }

    fn schedule_connect(&mut self, delay: std::time::Duration) {
        self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Upstream state changed");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(UpstreamEvent::StateChanged(state));
    }

    fn emit(&self, event: UpstreamEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn context(&self) -> Option<SyncContext> {
        Some(SyncContext::new(
            Arc::clone(&self.local),
            Arc::clone(self.remote.as_ref()?),
            self.root_local.id.clone(),
            self.root_remote.clone()?,
            self.config.id.clone(),
        ))
    }

    async fn connect(&mut self) {
        if self.config.disabled {
            info!("Upstream disabled");
            return;
        }

        self.set_state(ConnectionState::Connecting);
        match connection::connect_remote(self.connector.as_ref(), &self.config).await {
            Ok((remote, events)) => {
                info!(uri = %self.config.uri, "Upstream connection opened");
                self.remote = Some(remote);
                self.conn_events = Some(events);
                self.link += 1;
            }
            Err(e) => {
                warn!(
                    uri = %self.config.uri,
                    error = %e,
                    retry_secs = self.settings.connect_retry.as_secs(),
                    "Error connecting upstream"
                );
                self.set_state(ConnectionState::Disconnected);
                self.schedule_connect(self.settings.connect_retry);
            }
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected | ConnectionEvent::Reconnected => {
                info!(event = ?event, "Upstream connected");
                self.on_connected().await;
            }
            ConnectionEvent::Disconnected => {
                // subscriptions stay in place until the link is replaced or
                // the engine stops
                info!("Upstream disconnected");
                self.ticker = None;
                self.set_state(ConnectionState::Disconnected);
            }
            ConnectionEvent::Closed => {
                warn!("Upstream connection closed by the bus");
                self.disconnect().await;
                self.schedule_connect(self.settings.connect_retry);
            }
        }
    }

    async fn on_connected(&mut self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };

        if self.root_remote.is_none() {
            match remote.get_root().await {
                Ok(root) => {
                    debug!(root = %root.id, "Upstream root");
                    self.root_remote = Some(root.id);
                }
                Err(e) => {
                    error!(error = %e, "Error getting upstream root");
                    self.disconnect().await;
                    self.schedule_connect(self.settings.connect_retry);
                    return;
                }
            }
        }

        self.set_state(ConnectionState::Connected);

        if self.up_sub.is_none() {
            let subject = Subject::UpEdgePoints {
                ancestor: self.root_local.id.clone(),
            };
            match remote.subscribe(subject).await {
                Ok(sub) => {
                    let task = relay_new_edges(sub, self.root_local.id.clone(), self.new_edge_tx.clone());
                    self.up_sub = Some(tokio::spawn(task.in_current_span()));
                }
                Err(e) => warn!(error = %e, "Error subscribing to new upstream nodes"),
            }
        }

        let period = self.settings.sync_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);

        self.sync_pass(SyncTrigger::Connect).await;

        if !self.initial_sub {
            let Some(ctx) = self.context() else {
                return;
            };
            match self.subs.ensure_node(&ctx, ROOT_PARENT, &ctx.root_local).await {
                Ok(()) => self.initial_sub = true,
                Err(e) => warn!(error = %e, "Initial upstream subscriptions failed"),
            }
        }
    }

    /// Tear down the upstream link and its subscriptions
    async fn disconnect(&mut self) {
        self.subs.remove_all();
        for (_, task) in self.resolvers.drain() {
            task.abort();
        }
        if let Some(task) = self.up_sub.take() {
            task.abort();
        }
        self.ticker = None;
        self.conn_events = None;
        if let Some(remote) = self.remote.take() {
            remote.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    #[instrument(skip(self))]
    async fn sync_pass(&mut self, trigger: SyncTrigger) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(ctx) = self.context() else {
            return;
        };

        let result = Reconciler::new(&ctx, &mut self.subs)
            .sync_node(ROOT_PARENT, &ctx.root_local)
            .await;

        match result {
            Ok(report) => {
                if report.is_noop() {
                    debug!(visited = report.nodes_visited, "Sync pass found nothing to do");
                } else {
                    info!(
                        visited = report.nodes_visited,
                        points_up = report.points_up,
                        points_down = report.points_down,
                        created_up = report.nodes_created_up,
                        created_down = report.nodes_created_down,
                        failures = report.failures,
                        "Sync pass complete"
                    );
                }
                self.emit(UpstreamEvent::SyncCompleted { trigger, report });
            }
            Err(e) => {
                warn!(error = %e, "Error syncing");
                self.emit(UpstreamEvent::SyncFailed {
                    trigger,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn forward_node_points(&mut self, batch: PointBatch) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(remote) = self.remote.clone() else {
            return;
        };

        if let Err(e) = remote.send_node_points(&batch.id, &batch.points, false).await {
            warn!(id = %batch.id, error = %e, "Error sending node points upstream");
            self.emit(UpstreamEvent::ForwardFailed {
                id: batch.id,
                error: e.to_string(),
            });
        }
    }

    async fn forward_edge_points(&mut self, batch: PointBatch) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(ctx) = self.context() else {
            return;
        };
        let parent = batch.parent.unwrap_or_default();

        let result = ctx
            .remote
            .send_edge_points(&batch.id, &ctx.remote_parent(&parent), &batch.points, false)
            .await;
        if let Err(e) = result {
            warn!(id = %batch.id, parent = %parent, error = %e, "Error sending edge points upstream");
            self.emit(UpstreamEvent::ForwardFailed {
                id: batch.id.clone(),
                error: e.to_string(),
            });
        }

        if batch.points.iter().any(|p| p.is_tombstone_live()) {
            // a node was likely created locally, make sure it is complete
            // upstream and watched
            let mut reconciler = Reconciler::new(&ctx, &mut self.subs);
            if let Err(e) = reconciler.sync_node(&parent, &batch.id).await {
                warn!(id = %batch.id, error = %e, "Error syncing new local node");
            }
            if let Err(e) = self.subs.ensure_node(&ctx, &parent, &batch.id).await {
                warn!(id = %batch.id, error = %e, "Error subscribing to upstream node");
            }
        }
    }

    async fn apply_config(&mut self, update: ConfigUpdate) {
        match update {
            ConfigUpdate::Points(batch) => {
                if batch.id != self.config.id {
                    warn!(id = %batch.id, "Ignoring points for another node");
                    return;
                }

                let change = self.config.merge_points(&batch.points);
                if change.requires_reconnect() {
                    info!(
                        uri = %self.config.uri,
                        disabled = self.config.disabled,
                        "Upstream configuration changed, reconnecting"
                    );
                    self.disconnect().await;
                    self.initial_sub = false;
                    self.root_remote = None;
                    self.schedule_connect(self.settings.reconnect_delay);
                }
            }
            ConfigUpdate::EdgePoints(batch) => {
                debug!(
                    id = %batch.id,
                    parent = ?batch.parent,
                    count = batch.points.len(),
                    "Upstream config edge points"
                );
            }
        }
    }

    /// Start waiting for a node reported as new upstream
    fn resolve_new_edge(&mut self, edge: NewEdge) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(ctx) = self.context() else {
            return;
        };

        let key = (edge.parent.clone(), edge.id.clone());
        if self.resolvers.get(&key).is_some_and(|t| !t.is_finished()) {
            return;
        }

        let task = resolve_edge(
            Arc::clone(&ctx.remote),
            ctx.remote_parent(&edge.parent),
            edge,
            self.link,
            self.settings.clone(),
            self.resolved_tx.clone(),
        );
        self.resolvers.insert(key, tokio::spawn(task.in_current_span()));
    }

    /// Pull and subscribe to a new upstream node once it is typed
    async fn handle_resolved_edge(&mut self, resolved: ResolvedEdge) {
        let ResolvedEdge { edge, link, node } = resolved;
        self.resolvers.remove(&(edge.parent.clone(), edge.id.clone()));

        if link != self.link || self.state != ConnectionState::Connected {
            debug!(id = %edge.id, "Dropping new node from a previous upstream link");
            return;
        }
        let Some(ctx) = self.context() else {
            return;
        };

        let node = match node {
            Ok(node) => node,
            Err(e) => {
                warn!(id = %edge.id, error = %e, "Error getting new upstream node");
                return;
            }
        };

        let mut report = SyncReport::default();
        let reconciler = Reconciler::new(&ctx, &mut self.subs);
        if let Err(e) = reconciler.send_nodes_local(&node, &mut report).await {
            // the next sync pass retries the pull
            warn!(node = %node.desc(), error = %e, "Error pulling new upstream node");
            return;
        }

        match self.subs.ensure_node(&ctx, &edge.parent, &edge.id).await {
            Ok(()) => {
                debug!(node = %node.desc(), parent = %edge.parent, "Subscribed to new upstream node");
                self.emit(UpstreamEvent::NewNodeSubscribed {
                    parent: edge.parent,
                    id: edge.id,
                });
            }
            Err(e) => warn!(id = %edge.id, error = %e, "Error subscribing to new edge"),
        }
    }

    async fn shutdown(&mut self) {
        for task in self.local_tasks.drain(..) {
            task.abort();
        }
        self.disconnect().await;
        self.local.close().await;
        info!("Upstream client stopped");
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ConnectionEvent>>) -> Option<ConnectionEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

/// Wait for a node reported as new upstream to show its type
///
/// Edge points are published before node points, so the node can show up
/// with an empty type for a short while.
async fn fetch_typed(
    remote: &dyn GraphBus,
    parent: &str,
    id: &str,
    settings: &SyncSettings,
) -> UpstreamResult<NodeEdge> {
    let attempts = settings.new_node_max_attempts;

    for _ in 0..attempts {
        tokio::time::sleep(settings.new_node_retry_delay).await;
        if let Some(node) = remote.get_node(parent, id).await?
            && node.has_type()
        {
            return Ok(node);
        }
    }

    Err(UpstreamError::NodeNotVisible {
        id: id.to_string(),
        attempts,
    })
}

async fn resolve_edge(
    remote: Arc<dyn GraphBus>,
    remote_parent: String,
    edge: NewEdge,
    link: u64,
    settings: SyncSettings,
    tx: mpsc::Sender<ResolvedEdge>,
) {
    let node = fetch_typed(remote.as_ref(), &remote_parent, &edge.id, &settings).await;
    // a closed channel means the engine is gone
    let _ = tx.send(ResolvedEdge { edge, link, node }).await;
}

/// Hand local point updates to the dispatch loop
async fn relay_local_points(mut sub: Subscription, tx: mpsc::Sender<PointBatch>) {
    while let Some(bytes) = sub.receiver.recv().await {
        let batch = match BusMessage::from_bytes(&bytes) {
            Ok(BusMessage::NodePoints { id, points }) => PointBatch {
                id,
                parent: None,
                points,
            },
            Ok(BusMessage::EdgePoints { id, parent, points }) => PointBatch {
                id,
                parent: Some(parent),
                points,
            },
            Ok(other) => {
                debug!(subject = %sub.subject, message = ?other, "Ignoring unexpected message");
                continue;
            }
            Err(e) => {
                warn!(subject = %sub.subject, error = %e, "Error decoding local points");
                continue;
            }
        };

        if tx.send(batch).await.is_err() {
            break;
        }
    }
}

/// Report nodes created anywhere below the local root upstream
async fn relay_new_edges(mut sub: Subscription, root_local: String, tx: mpsc::Sender<NewEdge>) {
    while let Some(bytes) = sub.receiver.recv().await {
        let msg = match BusMessage::from_bytes(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(subject = %sub.subject, error = %e, "Error decoding remote up points");
                continue;
            }
        };
        if !msg.has_live_tombstone() {
            continue;
        }

        if let BusMessage::UpEdgePoints { id, parent, .. } = msg {
            let parent = if id == root_local {
                ROOT_PARENT.to_string()
            } else {
                parent
            };
            if tx.send(NewEdge { parent, id }).await.is_err() {
                break;
            }
        }
    }
}

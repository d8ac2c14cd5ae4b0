//! Upstream node configuration and engine timing settings

use std::time::Duration;

use fleet_core::{
    NodeEdge, Point, POINT_TYPE_AUTH_TOKEN, POINT_TYPE_DESCRIPTION, POINT_TYPE_DISABLED,
    POINT_TYPE_URI,
};

/// Configuration of one upstream relationship
///
/// The configuration is itself a node in the local graph; edits arrive as
/// ordinary points through [`UpstreamConfig::merge_points`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamConfig {
    /// Id of the upstream config node
    pub id: String,
    /// Parent of the upstream config node
    pub parent: String,
    pub description: String,
    /// Bus endpoint of the upstream instance
    pub uri: String,
    pub auth_token: String,
    pub disabled: bool,
}

/// Outcome of applying points to an [`UpstreamConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// Nothing changed
    None,
    /// Only fields that do not affect the connection changed
    Cosmetic,
    /// Uri, auth token, or disabled changed
    Reconnect,
}

impl ConfigChange {
    /// Whether the upstream connection must be re-established
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, ConfigChange::Reconnect)
    }
}

impl UpstreamConfig {
    /// Create a configuration for the upstream at `uri`
    pub fn new(id: impl Into<String>, parent: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: parent.into(),
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the auth token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    /// Set the disabled flag
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Build a configuration from the upstream node as stored in the graph
    pub fn from_node(node: &NodeEdge) -> Self {
        let mut config = Self {
            id: node.id.clone(),
            parent: node.parent.clone(),
            ..Default::default()
        };
        config.merge_points(&node.points);
        config
    }

    /// Apply point updates
    ///
    /// A batch that touches several connection fields still reports a
    /// single [`ConfigChange::Reconnect`].
    pub fn merge_points(&mut self, points: &[Point]) -> ConfigChange {
        let mut change = ConfigChange::None;

        for p in points {
            match p.typ.as_str() {
                POINT_TYPE_DESCRIPTION if self.description != p.text => {
                    self.description = p.text.clone();
                    if change == ConfigChange::None {
                        change = ConfigChange::Cosmetic;
                    }
                }
                POINT_TYPE_URI if self.uri != p.text => {
                    self.uri = p.text.clone();
                    change = ConfigChange::Reconnect;
                }
                POINT_TYPE_AUTH_TOKEN if self.auth_token != p.text => {
                    self.auth_token = p.text.clone();
                    change = ConfigChange::Reconnect;
                }
                POINT_TYPE_DISABLED if self.disabled != p.as_bool() => {
                    self.disabled = p.as_bool();
                    change = ConfigChange::Reconnect;
                }
                _ => {}
            }
        }

        change
    }
}

/// Timing and capacity settings for the engine
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Period of the full reconciliation pass while connected
    pub sync_interval: Duration,
    /// Delay before retrying a failed connect
    pub connect_retry: Duration,
    /// Delay before connecting at startup and after a config change
    pub reconnect_delay: Duration,
    /// Delay between fetches of a newly reported upstream node
    pub new_node_retry_delay: Duration,
    /// Fetch attempts before a new upstream node is given up on
    pub new_node_max_attempts: u32,
    /// Engine event broadcast channel capacity
    pub event_channel_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(20),
            connect_retry: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(10),
            new_node_retry_delay: Duration::from_millis(10),
            new_node_max_attempts: 100,
            event_channel_capacity: 256,
        }
    }
}

impl SyncSettings {
    /// Set the reconciliation interval
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the connect retry delay
    pub fn with_connect_retry(mut self, retry: Duration) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Set the reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the new node retry policy
    pub fn with_new_node_retry(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.new_node_retry_delay = delay;
        self.new_node_max_attempts = max_attempts;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }
}

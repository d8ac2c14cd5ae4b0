//! # Fleet Upstream
//!
//! Keeps a local fleet graph convergent with an upstream instance that is
//! reachable only over a pub/sub bus.
//!
//! Live edits are forwarded in both directions as they happen. A periodic
//! reconciliation pass, plus one on every (re)connect, walks the tree from
//! the local root and repairs anything the live path missed, using subtree
//! hashes to skip branches that already agree and last-write-wins to merge
//! the ones that do not.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fleet_core::{ConnectOptions, MemoryGraph};
//! use fleet_upstream::{SyncSettings, UpstreamClient, UpstreamConfig};
//!
//! let local = MemoryGraph::new("mem://local", "dev-1", "device");
//! let cloud = MemoryGraph::new("mem://cloud", "cloud", "server");
//!
//! let handle = UpstreamClient::spawn(
//!     Arc::new(local.connector()),
//!     ConnectOptions::new("mem://local", ""),
//!     Arc::new(cloud.connector()),
//!     UpstreamConfig::new("up-1", "dev-1", "mem://cloud"),
//!     SyncSettings::default(),
//! )
//! .await?;
//!
//! // ...
//! handle.stop().await?;
//! ```

pub mod client;
pub mod config;
mod connection;
pub mod context;
pub mod error;
pub mod reconcile;
pub mod subscriptions;

pub use client::{ConnectionState, SyncTrigger, UpstreamClient, UpstreamEvent, UpstreamHandle};
pub use config::{ConfigChange, SyncSettings, UpstreamConfig};
pub use context::SyncContext;
pub use error::{UpstreamError, UpstreamResult};
pub use reconcile::{Reconciler, SyncReport};
pub use subscriptions::{NewEdge, SubscriptionManager};

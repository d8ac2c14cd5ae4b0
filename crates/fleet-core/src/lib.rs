//! # Fleet Core
//!
//! Graph model, bus abstractions, and errors shared by the fleet upstream
//! synchronization engine.
//!
//! The same engine logic runs against a real message bus or against the
//! in-memory store in [`memory_bus`], which is what the tests use.
//!
//! ## Key Types
//!
//! - [`Point`]: Timestamped value, unique within a set by `(typ, key)`
//! - [`NodeEdge`]: A node seen through one of its parent edges, with a subtree hash
//! - [`Subject`] / [`BusMessage`]: Pub/sub subjects and their payloads
//!
//! ## Key Traits
//!
//! - [`GraphBus`]: Query, mutate, and subscribe to a graph store over a bus
//! - [`Connector`]: Opens [`GraphBus`] connections

pub mod bus;
pub mod error;
pub mod memory_bus;
pub mod node;
pub mod point;
pub mod subject;

// Re-export main types
pub use bus::*;
pub use error::*;
pub use memory_bus::*;
pub use node::*;
pub use point::*;
pub use subject::*;

//! The pair of stores a reconciliation runs between

use std::sync::Arc;

use fleet_core::{GraphBus, ROOT_PARENT};

/// Local and upstream bus handles plus the identities that tie them together
///
/// The local root hangs off the synthetic `root` parent locally but off the
/// upstream root node upstream; `remote_parent` and `local_parent` translate
/// between the two.
#[derive(Clone)]
pub struct SyncContext {
    pub local: Arc<dyn GraphBus>,
    pub remote: Arc<dyn GraphBus>,
    /// Id of the local root node
    pub root_local: String,
    /// Id of the upstream root node
    pub root_remote: String,
    /// Origin recorded on nodes this engine creates
    pub origin: String,
}

impl SyncContext {
    pub fn new(
        local: Arc<dyn GraphBus>,
        remote: Arc<dyn GraphBus>,
        root_local: impl Into<String>,
        root_remote: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            local,
            remote,
            root_local: root_local.into(),
            root_remote: root_remote.into(),
            origin: origin.into(),
        }
    }

    /// Upstream parent of an edge known locally as `(parent, _)`
    pub fn remote_parent(&self, parent: &str) -> String {
        if parent == ROOT_PARENT {
            self.root_remote.clone()
        } else {
            parent.to_string()
        }
    }

    /// Local parent of an edge known upstream as `(parent, id)`
    pub fn local_parent(&self, id: &str, parent: &str) -> String {
        if id == self.root_local {
            ROOT_PARENT.to_string()
        } else {
            parent.to_string()
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("root_local", &self.root_local)
            .field("root_remote", &self.root_remote)
            .field("origin", &self.origin)
            .finish()
    }
}

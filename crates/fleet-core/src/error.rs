//! Error types for the fleet graph model and bus

use thiserror::Error;

/// Errors raised by a bus connection
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Errors raised by the graph store behind the bus
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Parent not found: {0}")]
    ParentNotFound(String),

    #[error("Internal lock poisoned")]
    LockPoisoned,
}

impl From<GraphError> for BusError {
    fn from(e: GraphError) -> Self {
        BusError::RequestFailed(e.to_string())
    }
}

/// Result type alias for bus operations
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_error_display() {
        let err = BusError::ConnectionFailed("refused".to_string());
        assert!(format!("{}", err).contains("Connection failed"));
        assert!(format!("{}", err).contains("refused"));

        assert!(format!("{}", BusError::ConnectionClosed).contains("closed"));
        assert!(format!("{}", BusError::NotConnected).contains("Not connected"));

        let err = BusError::SendFailed("p.n1".to_string());
        assert!(format!("{}", err).contains("p.n1"));
    }

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::NodeNotFound("n1".to_string());
        assert!(format!("{}", err).contains("Node not found"));
        assert!(format!("{}", err).contains("n1"));
    }

    #[test]
    fn test_error_conversions() {
        let bus_err: BusError = GraphError::ParentNotFound("p".to_string()).into();
        assert!(matches!(bus_err, BusError::RequestFailed(_)));
    }
}

//! Error types for the TPNet environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Network send failed (buffer full, connection closed, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),
    
    /// Target peer is unreachable (simulated partition or disconnected)
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }
    
    /// Creates an unreachable error.
    pub fn unreachable(peer: impl std::fmt::Display) -> Self {
        Self::PeerUnreachable(peer.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(EnvError::network("closed").to_string(), "Network error: closed");
        assert_eq!(EnvError::unreachable("peer-7").to_string(), "Peer unreachable: peer-7");
    }
}

//! Distribution error types

use std::net::SocketAddr;

use thiserror::Error;

/// Distribution-specific errors
#[derive(Debug, Error)]
pub enum DistributionError {
    /// Listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// WebSocket upgrade failed for one peer
    #[error("websocket handshake with {peer} failed: {message}")]
    Handshake { peer: SocketAddr, message: String },

    /// Viewer-side error (from contract)
    #[error("viewer error: {0}")]
    Contract(#[from] contracts::ContractError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DistributionError {
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }
}

/// Distribution Result alias
pub type Result<T> = std::result::Result<T, DistributionError>;

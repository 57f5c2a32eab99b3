//! Reconciler error types

use thiserror::Error;

/// Viewer client errors
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Could not open the WebSocket
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    /// Connection lost without a close handshake; reconnect for a fresh replay
    #[error("transport lost: {message}")]
    TransportLost { message: String },
}

impl ReconcilerError {
    pub fn connect(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn transport_lost(message: impl Into<String>) -> Self {
        Self::TransportLost {
            message: message.into(),
        }
    }
}

/// Reconciler Result alias
pub type Result<T> = std::result::Result<T, ReconcilerError>;

//! Layered error definitions
//!
//! Categorized by source: config / device link / viewer transport / recorder

use thiserror::Error;

use crate::DeviceAddress;

/// Unified error type
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Device Errors =====
    /// Device transport error outside of a link (adapter missing, scan failed)
    #[error("device transport error for '{address}': {message}")]
    DeviceTransport {
        address: DeviceAddress,
        message: String,
    },

    // ===== Viewer Errors =====
    /// Viewer transport lost; the viewer must resubscribe
    #[error("viewer '{viewer}' transport lost: {message}")]
    TransportLost { viewer: String, message: String },

    /// Malformed wire frame
    #[error("frame error: {message}")]
    Frame { message: String },

    // ===== Recorder Errors =====
    #[error("recorder error: {message}")]
    Recorder { message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn device_transport(address: impl Into<DeviceAddress>, message: impl Into<String>) -> Self {
        Self::DeviceTransport {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create viewer transport-lost error
    pub fn transport_lost(viewer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportLost {
            viewer: viewer.into(),
            message: message.into(),
        }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn recorder(message: impl Into<String>) -> Self {
        Self::Recorder {
            message: message.into(),
        }
    }
}

/// Errors raised by a device link or transport while driving one handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Device is not (yet) visible to the transport
    #[error("device not found")]
    NotFound,

    /// Connection attempt rejected or timed out at the protocol layer
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Established link lost unexpectedly
    #[error("connection dropped: {0}")]
    Dropped(String),

    /// Link closed on request
    #[error("link closed")]
    Closed,

    /// Device lacks the characteristic needed for the configured capability
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl LinkError {
    pub fn connect_failed(message: impl Into<String>) -> Self {
        Self::ConnectFailed(message.into())
    }

    pub fn dropped(message: impl Into<String>) -> Self {
        Self::Dropped(message.into())
    }
}

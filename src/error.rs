//! Error types for the relay
//!
//! Only construction and lifecycle calls surface these. Connection and
//! delivery failures are reported through callbacks and return values.

use std::net::SocketAddr;

use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The actor behind a handle has stopped
    #[error("Channel send error")]
    ChannelSend,

    /// The listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A global tracing subscriber was already installed
    #[error("Logger initialization failed: {0}")]
    Logging(String),
}

impl AppError {
    /// Bind failure for the given address
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }
}

/// Reply carrying the bound address of a started listener
pub type StartResult = Result<SocketAddr, AppError>;

//! Error types for the Roomcast real-time core

use thiserror::Error;

/// Result type alias for real-time core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the real-time core
#[derive(Debug, Error)]
pub enum Error {
    /// Signalling channel error (socket, handshake, send while disconnected)
    #[error("Signalling error: {0}")]
    Signaling(String),

    /// Transport engine error (peer connection, description, candidate)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Data channel error (closed channel, send failure)
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Negotiation fault (unknown peer, inconsistent description state)
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// File transfer protocol error
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Media device acquisition failure
    #[error("Media error: {0}")]
    Media(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity persistence error
    #[error("Identity store error: {0}")]
    Store(String),

    /// Session command could not be delivered (orchestrator gone)
    #[error("Session closed")]
    SessionClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

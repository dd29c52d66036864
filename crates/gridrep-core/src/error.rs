//! Error types for gridrep core

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the gridrep Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from offset files and markers
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Packet sequence violations (out-of-order index, wrong type mid-message)
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Missing or unparseable transport metadata
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Remote and local type definitions share an id but differ in structure
    #[error("Schema divergence for type {type_id}: local {local} <> remote {remote}")]
    SchemaDivergence {
        /// Type id both sides claim
        type_id: u64,
        /// Local definition, rendered
        local: String,
        /// Remote definition, rendered
        remote: String,
    },

    /// Write attempted on a node that is not the distributor
    #[error("This node is currently not a distributor")]
    NotADistributor,

    /// Promotion requested on a node that already distributes
    #[error("Distribution is already enabled")]
    DistributionAlreadyEnabled,

    /// Promotion gave up waiting for the log client to catch up
    #[error("Log client did not become ready within {0:?}")]
    PromotionTimeout(Duration),

    /// The log client loop is no longer running
    #[error("Log client stopped: {0}")]
    LogClientStopped(String),

    /// Broker / producer / consumer failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation on a component that was already disposed
    #[error("Disposed: {0}")]
    Disposed(String),

    /// Operation not valid in the component's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Failures reported by the local storage engine
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a decoding error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a disposed error
    pub fn disposed(msg: impl Into<String>) -> Self {
        Self::Disposed(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Errors after which the affected consumer or merge session must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Decode(_) | Self::SchemaDivergence { .. }
        )
    }

    /// Errors the caller may retry, possibly against another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotADistributor | Self::PromotionTimeout(_) | Self::Transport(_)
        )
    }
}

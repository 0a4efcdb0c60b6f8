//! Error types for bean cache operations.

/// Error type for bean cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No record exists for the requested identifier.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backing store failed to read or write a record.
    #[error("Store error: {0}")]
    Store(String),

    /// Group contents could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// An activation or passivation hook failed.
    #[error("Lifecycle hook failed: {0}")]
    Hook(String),

    /// A mutation was attempted through a read-only view or factory.
    #[error("Read-only access: {0}")]
    ReadOnly(String),

    /// The bean or group handle was already closed.
    #[error("Already closed: {0}")]
    Closed(String),

    /// Invalid cache configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] stasis_config::ConfigError),
}

/// Result type for bean cache operations.
pub type Result<T> = std::result::Result<T, Error>;

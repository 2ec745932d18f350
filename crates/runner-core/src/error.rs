//! Error types for the runner client.

use thiserror::Error;

/// Main error type for runner client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An RPC was attempted while the transport was disconnected or closed
    #[error("Client not active: transport is not ready")]
    TransportNotActive,

    /// Server launch retries exhausted
    #[error("Server launch failed after {attempts} attempt(s): {reason}")]
    ServerLaunchFailed {
        /// Number of launch attempts made
        attempts: u32,
        /// Cause of the last failed attempt
        reason: String,
    },

    /// Server process started but never answered health checks
    #[error("Server did not accept connections after {elapsed_ms}ms")]
    ServerNotAccepting {
        /// Time spent polling, in milliseconds
        elapsed_ms: u64,
    },

    /// Candidate port is already bound
    #[error("Port {0} is not available")]
    PortUnavailable(u16),

    /// Operation on an environment that was never created or already disposed
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    /// Resize/activate addressed to a window that was never registered
    #[error("Terminal window not registered: {0}")]
    UnregisteredTerminalWindow(String),

    /// Server ended an execute stream without an exit code
    #[error("Execute stream closed before an exit code was received")]
    StreamClosedPrematurely,

    /// Program session already closed
    #[error("Program session already closed")]
    SessionClosed,

    /// TLS material could not be loaded or used
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// Connection-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server reported an error for a call
    #[error("RPC error: {0}")]
    Rpc(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input or parameters (generic)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error with custom message
    #[error("{0}")]
    Other(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

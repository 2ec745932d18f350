//! # runner-core
//!
//! Core types for the runner client.
//!
//! This crate contains all fundamental types with **no internal dependencies**
//! on other runner crates. It provides:
//!
//! - Geometry types (Dimensions)
//! - Program options handed to the runtime by document collaborators
//! - Wire protocol frames and envelopes for the runner RPC surface
//! - Configuration loading (YAML)
//! - Platform detection
//! - Error types
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - all other crates depend on this one,
//! but this crate has no dependencies on other runner crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod geometry;
pub mod platform;
pub mod program;
pub mod protocol;

// Re-export commonly used types
pub use config::{
    AcceptancePoll, LoggingSettings, OutputSettings, RetryPolicy, RetrySettings, RunnerConfig,
    ServerConfig, ServerSettings,
};
pub use error::{Error, Result};
pub use geometry::Dimensions;
pub use platform::Platform;
pub use program::{env_name, ProgramId, ProgramOptions};
pub use protocol::{
    ClientMessage, CreateSessionRequest, CreateSessionResponse, DeleteSessionRequest,
    ExecuteRequest, ExecuteResponse, ExecuteStop, RemoteSession, ServerMessage, Winsize,
};

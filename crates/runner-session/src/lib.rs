//! # runner-session
//!
//! Session lifecycle management for the runner client.
//!
//! This crate provides:
//! - The session manager facade guarding every RPC behind a ready transport
//! - Environment handles for remote sessions
//! - Program sessions streaming input and output of one remote program
//! - The terminal window registry with its readiness barrier
//! - Output coalescing and display line-ending conversion
//! - Typed event emitters
//!
//! ## Architecture
//!
//! This is Layer 2 in the architecture - it depends on runner-core and
//! runner-server to manage remote program lifecycles.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod environment;
pub mod events;
pub mod manager;
pub mod output;
pub mod program;
pub mod registry;

// Re-export commonly used types
pub use environment::EnvironmentHandle;
pub use events::{Emitter, ListenerId};
pub use manager::{SessionManager, SessionManagerConfig};
pub use output::{convert_eol, normalize_line_endings, OutputBuffer, OutputPolicy};
pub use program::{ProgramInfo, ProgramSession, ProgramStatus};
pub use registry::{TerminalWindow, TerminalWindowRegistry};

//! # runner-cli
//!
//! Command line front-end of the runner client.
//!
//! `runner-exec` launches (or locates) a runner server, opens a remote
//! environment, runs one program in it with stdin forwarded, prints its
//! output and exits with its exit code.
//!
//! ## Architecture
//!
//! This is Layer 3 - the binary that ties together:
//! - runner-core: Configuration and program options
//! - runner-server: Server supervision and transport
//! - runner-session: Environments and program sessions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod run;

pub use cli::Args;
pub use run::{run, run_with_input, EXIT_INDETERMINATE};

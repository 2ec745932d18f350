//! # runner-server
//!
//! Runner server supervision and transport for the runner client.
//!
//! This crate provides:
//! - Transport credential resolution (TLS material or insecure channel)
//! - Disposable resource tracking
//! - The `RunnerTransport` abstraction and observable transport state
//! - A multiplexed TCP/TLS connection speaking the runner wire protocol
//! - Server process launching with port-increment retry and acceptance polling
//! - An in-memory mock runner for tests
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on runner-core and is
//! consumed by runner-session.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod credentials;
pub mod disposable;
pub mod launcher;
pub mod supervisor;
pub mod testing;
pub mod transport;

// Re-export commonly used types
pub use connection::Connection;
pub use credentials::{TlsMaterial, TransportCredentials};
pub use disposable::{Disposable, DisposableSet, DisposeFn};
pub use launcher::{BinaryLauncher, ServerLauncher, SpawnedServer};
pub use supervisor::ServerSupervisor;
pub use transport::{
    ready_channel, transport_channel, ExecuteCall, RequestSink, ResponseStream, RunnerTransport,
    SinkCommand, TransportState,
};

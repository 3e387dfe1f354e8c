#![deny(unsafe_code)]

//! Shared test utilities for the uprelay workspace.
//!
//! Provides a config builder, tracing setup, an in-process push server and a
//! connector that records every callback, so integration tests stay short.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! uprelay-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod connector;
pub mod server;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use connector::{ConnectorEvent, ConnectorEvents, RecordingConnector};
pub use server::TestServer;

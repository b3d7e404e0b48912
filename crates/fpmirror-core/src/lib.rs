//! fpmirror Core Library
//!
//! Shared functionality for the mirroring receiver crates:
//! - Configuration resolution (settings file + environment overrides)
//! - Capability-style logging sink used by the protocol core
//! - `tracing` subscriber initialisation for the embedding layer
//! - Common error types

pub mod config;
pub mod error;
pub mod log_sink;
pub mod tracing_init;

pub use config::{Config, HandshakeConfig, LoggingConfig};
pub use error::{Error, Result};
pub use log_sink::{LogSink, MemorySink, NullSink, TracingSink, default_sink};
pub use tracing_init::{init_from_config, init_tracing};

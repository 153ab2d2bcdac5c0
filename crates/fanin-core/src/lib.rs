//! fanin-core — shared types and configuration for the Fanin aggregator.
//!
//! Fanin scrapes exposition-format text from a cluster's state service,
//! every node exporter, and every node's cadvisor, tags each stream with
//! identifying labels, and serves the concatenation as one document.

pub mod config;
pub mod types;

pub use config::{ConfigError, FailurePolicy, FaninConfig, load_namespace};
pub use types::*;

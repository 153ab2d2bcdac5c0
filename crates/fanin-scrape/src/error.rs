//! Error types for discovery, fetching, and aggregation.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Node discovery against the cluster directory failed.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("endpoints lookup {namespace}/{service} failed: {reason}")]
    Request {
        namespace: String,
        service: String,
        reason: String,
    },

    #[error("endpoints lookup {namespace}/{service} returned status {status}")]
    Status {
        namespace: String,
        service: String,
        status: u16,
    },

    #[error("malformed endpoints response: {0}")]
    Decode(String),

    #[error("endpoint address {ip} has no node name")]
    MissingNodeName { ip: String },
}

/// Why a single fetch failed.
#[derive(Debug, Error)]
pub enum FetchCause {
    #[error("connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("reading body: {0}")]
    Body(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unsupported target: {0}")]
    Unsupported(String),
}

/// One producer could not be scraped.
#[derive(Debug, Error)]
#[error("fetching {producer}: {cause}")]
pub struct FetchError {
    /// Display form of the producer, e.g. `node worker-1 (10.0.0.1)`.
    pub producer: String,
    #[source]
    pub cause: FetchCause,
}

/// Pipeline stage an aggregation failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    State,
    Discovery,
    Node,
    CAdvisor,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::State => "state metrics",
            Stage::Discovery => "node discovery",
            Stage::Node => "node metrics",
            Stage::CAdvisor => "cadvisor metrics",
        })
    }
}

/// The first failure of an aggregation, tagged with its stage.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("state metrics: {0}")]
    State(#[source] FetchError),

    #[error("node discovery: {0}")]
    Discovery(#[source] LookupError),

    #[error("node metrics: {0}")]
    Node(#[source] FetchError),

    #[error("cadvisor metrics: {0}")]
    CAdvisor(#[source] FetchError),
}

impl AggregationError {
    pub fn stage(&self) -> Stage {
        match self {
            AggregationError::State(_) => Stage::State,
            AggregationError::Discovery(_) => Stage::Discovery,
            AggregationError::Node(_) => Stage::Node,
            AggregationError::CAdvisor(_) => Stage::CAdvisor,
        }
    }
}

/// The in-cluster API client could not be built.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not running in a cluster: {0} is not set")]
    MissingEnv(&'static str),

    #[error("invalid api server address {0:?}")]
    InvalidAddress(String),

    #[error("failed to read {path}: {reason}")]
    Credentials { path: String, reason: String },

    #[error("tls setup: {0}")]
    Tls(String),
}

//! fanin-scrape — the fetch/annotate/merge pipeline.
//!
//! Turns N raw exposition-format streams into one labelled document.
//!
//! # Architecture
//!
//! ```text
//! AggregationEngine::aggregate(namespace)
//!   ├── SourceFetcher::fetch(State)            → state block
//!   ├── ProducerRegistry::resolve(namespace)   → [NodeIdentity]
//!   │   └── ClusterApi::endpoint_addresses()
//!   ├── SourceFetcher::fetch(Node) × nodes     → node blocks
//!   │   └── HttpSource::get()  ─┐
//!   ├── SourceFetcher::fetch(CAdvisor) × nodes → cadvisor blocks
//!   │   └── ClusterApi::node_proxy() ─┤
//!   │                                 └── StreamAnnotator (per fetch)
//!   └── AggregatedDocument::render()
//! ```
//!
//! The network seams (`HttpSource`, `ClusterApi`) are traits so the
//! engine runs unchanged against the in-cluster clients or the
//! in-memory implementations in [`memory`].

pub mod annotate;
pub mod cluster;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod memory;
pub mod registry;

pub use annotate::{StreamAnnotator, annotate, annotate_line};
pub use cluster::{ClusterApi, KubeClient};
pub use engine::{AggregatedDocument, AggregationEngine, EngineOptions, SourceStatus};
pub use error::{AggregationError, ClusterError, FetchCause, FetchError, LookupError, Stage};
pub use fetcher::{FetchSettings, SourceFetcher};
pub use http::{BoxError, HttpClient, HttpSource, MetricsBody};
pub use registry::ProducerRegistry;

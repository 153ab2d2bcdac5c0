//! fanin-api — HTTP surface of the Fanin aggregator.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/metrics` | Aggregated exposition document |
//! | GET | `/endpoints` | JSON array of the nodes currently scraped |
//! | GET | `/healthz` | Process liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use fanin_scrape::AggregationEngine;

/// Read-only state shared by every request.
///
/// Built once at startup; nothing in it changes afterwards.
#[derive(Clone)]
pub struct AppContext {
    pub engine: Arc<AggregationEngine>,
    pub namespace: Arc<str>,
}

impl AppContext {
    pub fn new(engine: AggregationEngine, namespace: impl Into<String>) -> Self {
        Self {
            engine: Arc::new(engine),
            namespace: Arc::from(namespace.into()),
        }
    }
}

/// Build the complete router.
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/endpoints", get(handlers::endpoints))
        .route("/healthz", get(handlers::healthz))
        .with_state(ctx)
}

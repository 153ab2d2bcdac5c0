//! Request handlers.
//!
//! Every request triggers a fresh lookup or fan-out; failures are
//! returned as `500` with the error text as a plain-text body.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use crate::AppContext;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// GET /metrics
pub async fn metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.engine.aggregate(&ctx.namespace).await {
        Ok(doc) => {
            let body = doc.render();
            debug!(bytes = body.len(), "serving aggregated metrics");
            (StatusCode::OK, [(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body).into_response()
        }
        Err(e) => {
            error!(stage = %e.stage(), error = %e, "aggregation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /endpoints
pub async fn endpoints(State(ctx): State<AppContext>) -> Response {
    match ctx.engine.registry().resolve(&ctx.namespace).await {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => {
            error!(error = %e, "node discovery failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fanin_core::EndpointAddress;
    use fanin_scrape::memory::{MemoryCluster, MemoryHttp, MemoryResponse};
    use fanin_scrape::{AggregationEngine, EngineOptions, FetchSettings, ProducerRegistry, SourceFetcher};

    const STATE_URL: &str = "http://kube-state-metrics:8080/metrics";

    fn test_context(http: Arc<MemoryHttp>, cluster: Arc<MemoryCluster>) -> AppContext {
        let registry = ProducerRegistry::new(cluster.clone(), "node-exporter");
        let fetcher = SourceFetcher::new(http, cluster, FetchSettings::default());
        let engine = AggregationEngine::new(registry, fetcher, EngineOptions::default());
        AppContext::new(engine, "monitoring")
    }

    fn one_node_cluster() -> (Arc<MemoryHttp>, Arc<MemoryCluster>) {
        let http = Arc::new(MemoryHttp::new());
        http.set(STATE_URL, MemoryResponse::ok("kube_up 1\n"));
        http.set("http://10.0.0.1:9100/metrics", MemoryResponse::ok("up 1\n"));

        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_endpoints(
            "monitoring",
            "node-exporter",
            vec![EndpointAddress {
                ip: "10.0.0.1".to_string(),
                node_name: Some("w1".to_string()),
                hostname: None,
            }],
        );
        cluster.set_proxy("w1", "/metrics/cadvisor", MemoryResponse::ok("cpu{id=\"/\"} 2\n"));
        (http, cluster)
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn metrics_returns_exposition_text() {
        let (http, cluster) = one_node_cluster();
        let resp = metrics(State(test_context(http, cluster))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get(CONTENT_TYPE).unwrap().to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));

        assert_eq!(
            body_text(resp).await,
            "kube_up{component=\"state\"} 1\n\n\
             up{component=\"node\",node=\"w1\"} 1\n\n\
             cpu{component=\"cadvisor\",node=\"w1\",id=\"/\"} 2\n"
        );
    }

    #[tokio::test]
    async fn metrics_failure_is_plain_text_500() {
        let (http, cluster) = one_node_cluster();
        http.remove("http://10.0.0.1:9100/metrics");
        let resp = metrics(State(test_context(http, cluster))).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_text(resp).await;
        assert!(body.starts_with("node metrics: "), "{body}");
        assert!(!body.contains("kube_up"));
    }

    #[tokio::test]
    async fn endpoints_returns_json_nodes() {
        let (http, cluster) = one_node_cluster();
        let resp = endpoints(State(test_context(http, cluster))).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json, serde_json::json!([{"ip": "10.0.0.1", "nodeName": "w1"}]));
    }

    #[tokio::test]
    async fn endpoints_failure_is_500() {
        let (http, cluster) = one_node_cluster();
        cluster.fail_lookups(Some("forbidden"));
        let resp = endpoints(State(test_context(http, cluster))).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(resp).await.contains("forbidden"));
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        assert_eq!(healthz().await, "ok");
    }
}

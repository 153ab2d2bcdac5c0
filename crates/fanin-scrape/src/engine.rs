//! Aggregation engine — fans one request out to every producer.
//!
//! Stages run in a fixed order: state metrics, node discovery, node
//! exporters, cadvisors. Within a stage producers are fetched one after
//! another, or up to `fan_out` at a time; either way blocks are kept in
//! registry order.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use fanin_core::{ConfigError, FailurePolicy, FaninConfig, LabelSet, Producer};

use crate::cluster::ClusterApi;
use crate::error::{AggregationError, FetchCause, FetchError};
use crate::fetcher::{FetchSettings, SourceFetcher};
use crate::http::HttpSource;
use crate::registry::ProducerRegistry;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub state_url: String,
    /// Producers fetched concurrently within a stage; `1` is sequential.
    pub fan_out: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            state_url: "http://kube-state-metrics:8080/metrics".to_string(),
            fan_out: 1,
            failure_policy: FailurePolicy::Abort,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &FaninConfig) -> Self {
        Self {
            state_url: config.sources.state_url.clone(),
            fan_out: config.scrape.fan_out.max(1),
            failure_policy: config.scrape.failure_policy,
        }
    }
}

/// Outcome of one producer under the partial failure policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub labels: LabelSet,
    pub up: bool,
}

/// The merged output of one aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedDocument {
    pub state: String,
    /// One block per node, in registry order.
    pub nodes: Vec<String>,
    /// One block per node, in registry order.
    pub cadvisor: Vec<String>,
    /// Per-producer outcomes; empty unless failures are tolerated.
    pub sources: Vec<SourceStatus>,
}

impl AggregatedDocument {
    /// `state + "\n" + nodes… + "\n" + cadvisor…`, followed by the
    /// `fanin_source_up` gauge when producer outcomes were recorded.
    pub fn render(&self) -> String {
        let len = self.state.len()
            + self.nodes.iter().map(String::len).sum::<usize>()
            + self.cadvisor.iter().map(String::len).sum::<usize>()
            + 2;
        let mut out = String::with_capacity(len);

        out.push_str(&self.state);
        out.push('\n');
        for block in &self.nodes {
            out.push_str(block);
        }
        out.push('\n');
        for block in &self.cadvisor {
            out.push_str(block);
        }

        if !self.sources.is_empty() {
            out.push('\n');
            out.push_str(
                "# HELP fanin_source_up Whether the producer was scraped successfully.\n",
            );
            out.push_str("# TYPE fanin_source_up gauge\n");
            for source in &self.sources {
                out.push_str(&format!(
                    "fanin_source_up{{{}}} {}\n",
                    source.labels.render(),
                    u8::from(source.up)
                ));
            }
        }

        out
    }
}

pub struct AggregationEngine {
    registry: ProducerRegistry,
    fetcher: Arc<SourceFetcher>,
    options: EngineOptions,
}

impl AggregationEngine {
    pub fn new(registry: ProducerRegistry, fetcher: SourceFetcher, options: EngineOptions) -> Self {
        Self {
            registry,
            fetcher: Arc::new(fetcher),
            options,
        }
    }

    /// Wire an engine from configuration and the two network seams.
    pub fn from_config(
        config: &FaninConfig,
        http: Arc<dyn HttpSource>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Result<Self, ConfigError> {
        let registry =
            ProducerRegistry::new(Arc::clone(&cluster), config.sources.node_exporter_service.clone());
        let fetcher = SourceFetcher::new(http, cluster, FetchSettings::from_config(config)?);
        Ok(Self::new(registry, fetcher, EngineOptions::from_config(config)))
    }

    pub fn registry(&self) -> &ProducerRegistry {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Scrape every producer for `namespace` and merge the results.
    pub async fn aggregate(&self, namespace: &str) -> Result<AggregatedDocument, AggregationError> {
        let started = Instant::now();
        let mut doc = AggregatedDocument::default();

        let state = [Producer::State {
            url: self.options.state_url.clone(),
        }];
        doc.state = self
            .fetch_stage(&state, AggregationError::State, &mut doc.sources)
            .await?
            .concat();

        let nodes = self
            .registry
            .resolve(namespace)
            .await
            .map_err(|e| {
                warn!(%namespace, error = %e, "node discovery failed");
                AggregationError::Discovery(e)
            })?;

        let node_producers: Vec<Producer> = nodes.iter().map(Producer::node).collect();
        doc.nodes = self
            .fetch_stage(&node_producers, AggregationError::Node, &mut doc.sources)
            .await?;

        let cadvisor_producers: Vec<Producer> = nodes.iter().map(Producer::cadvisor).collect();
        doc.cadvisor = self
            .fetch_stage(&cadvisor_producers, AggregationError::CAdvisor, &mut doc.sources)
            .await?;

        info!(
            %namespace,
            nodes = nodes.len(),
            failed = doc.sources.iter().filter(|s| !s.up).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregation complete"
        );
        Ok(doc)
    }

    /// Fetch one stage. Under `Abort` the first failure in registry
    /// order is returned; under `Partial` failures become empty blocks.
    async fn fetch_stage(
        &self,
        producers: &[Producer],
        wrap: fn(FetchError) -> AggregationError,
        sources: &mut Vec<SourceStatus>,
    ) -> Result<Vec<String>, AggregationError> {
        let results = self.fetch_all(producers).await;
        let mut blocks = Vec::with_capacity(producers.len());

        for (producer, result) in producers.iter().zip(results) {
            match (result, self.options.failure_policy) {
                (Ok(text), policy) => {
                    if policy == FailurePolicy::Partial {
                        sources.push(SourceStatus {
                            labels: producer.labels(),
                            up: true,
                        });
                    }
                    blocks.push(text);
                }
                (Err(err), FailurePolicy::Abort) => {
                    warn!(error = %err, "aborting aggregation");
                    return Err(wrap(err));
                }
                (Err(err), FailurePolicy::Partial) => {
                    warn!(error = %err, "producer failed, serving without it");
                    sources.push(SourceStatus {
                        labels: producer.labels(),
                        up: false,
                    });
                    blocks.push(String::new());
                }
            }
        }

        Ok(blocks)
    }

    /// Results in producer order. Sequential fetching under `Abort` stops
    /// at the first failure, so the result may be shorter than the input.
    async fn fetch_all(&self, producers: &[Producer]) -> Vec<Result<String, FetchError>> {
        if self.options.fan_out <= 1 || producers.len() <= 1 {
            let mut results = Vec::with_capacity(producers.len());
            for producer in producers {
                let result = self.fetcher.fetch(producer).await;
                let failed = result.is_err();
                results.push(result);
                if failed && self.options.failure_policy == FailurePolicy::Abort {
                    break;
                }
            }
            return results;
        }

        let permits = Arc::new(Semaphore::new(self.options.fan_out));
        let mut tasks = JoinSet::new();
        for (index, producer) in producers.iter().cloned().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, fetcher.fetch(&producer).await)
            });
        }

        let mut slots: Vec<Option<Result<String, FetchError>>> =
            producers.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!(error = %e, "fetch task did not complete"),
            }
        }

        slots
            .into_iter()
            .zip(producers)
            .map(|(slot, producer)| {
                slot.unwrap_or_else(|| {
                    Err(FetchError {
                        producer: producer.to_string(),
                        cause: FetchCause::Request("fetch task did not complete".to_string()),
                    })
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fanin_core::EndpointAddress;

    use crate::error::Stage;
    use crate::memory::{MemoryCluster, MemoryHttp, MemoryResponse};

    const NS: &str = "monitoring";
    const STATE_URL: &str = "http://kube-state-metrics:8080/metrics";

    struct Harness {
        http: Arc<MemoryHttp>,
        cluster: Arc<MemoryCluster>,
    }

    impl Harness {
        /// State source plus `nodes` nodes named w1.. with healthy
        /// exporters and cadvisors.
        fn new(nodes: usize) -> Self {
            let http = Arc::new(MemoryHttp::new());
            let cluster = Arc::new(MemoryCluster::new());
            http.set(STATE_URL, MemoryResponse::ok("kube_node_info{node=\"w1\"} 1\n"));

            let mut addresses = Vec::new();
            for i in 1..=nodes {
                let ip = format!("10.0.0.{i}");
                let name = format!("w{i}");
                http.set(
                    format!("http://{ip}:9100/metrics"),
                    MemoryResponse::ok(format!("node_load1 0.{i}\n")),
                );
                cluster.set_proxy(
                    &name,
                    "/metrics/cadvisor",
                    MemoryResponse::ok(format!("container_threads{{id=\"/\"}} {i}\n")),
                );
                addresses.push(EndpointAddress {
                    ip,
                    node_name: Some(name),
                    hostname: None,
                });
            }
            cluster.set_endpoints(NS, "node-exporter", addresses);

            Self { http, cluster }
        }

        fn engine(&self, options: EngineOptions) -> AggregationEngine {
            let registry = ProducerRegistry::new(self.cluster.clone(), "node-exporter");
            let fetcher = SourceFetcher::new(
                self.http.clone(),
                self.cluster.clone(),
                FetchSettings {
                    timeout: Duration::from_secs(5),
                    ..FetchSettings::default()
                },
            );
            AggregationEngine::new(registry, fetcher, options)
        }
    }

    fn options(fan_out: usize, failure_policy: FailurePolicy) -> EngineOptions {
        EngineOptions {
            state_url: STATE_URL.to_string(),
            fan_out,
            failure_policy,
        }
    }

    const STATE_BLOCK: &str = "kube_node_info{component=\"state\",node=\"w1\"} 1\n";

    fn node_block(i: usize) -> String {
        format!("node_load1{{component=\"node\",node=\"w{i}\"}} 0.{i}\n")
    }

    fn cadvisor_block(i: usize) -> String {
        format!("container_threads{{component=\"cadvisor\",node=\"w{i}\",id=\"/\"}} {i}\n")
    }

    #[tokio::test]
    async fn document_concatenates_blocks_in_registry_order() {
        let harness = Harness::new(2);
        let engine = harness.engine(options(1, FailurePolicy::Abort));

        let doc = engine.aggregate(NS).await.unwrap();
        let expected = format!(
            "{STATE_BLOCK}\n{}{}\n{}{}",
            node_block(1),
            node_block(2),
            cadvisor_block(1),
            cadvisor_block(2)
        );
        assert_eq!(doc.render(), expected);
        assert!(doc.sources.is_empty());
    }

    #[tokio::test]
    async fn zero_nodes_yields_state_block_alone() {
        let harness = Harness::new(0);
        let engine = harness.engine(options(1, FailurePolicy::Abort));

        let doc = engine.aggregate(NS).await.unwrap();
        assert!(doc.nodes.is_empty());
        assert!(doc.cadvisor.is_empty());
        assert_eq!(doc.render(), format!("{STATE_BLOCK}\n\n"));
    }

    #[tokio::test]
    async fn state_failure_aborts_before_discovery() {
        let harness = Harness::new(1);
        harness.http.set(STATE_URL, MemoryResponse::status(500, "boom"));
        let engine = harness.engine(options(1, FailurePolicy::Abort));

        let err = engine.aggregate(NS).await.unwrap_err();
        assert_eq!(err.stage(), Stage::State);
        assert_eq!(harness.cluster.lookups(), 0);
    }

    #[tokio::test]
    async fn discovery_failure_aborts() {
        let harness = Harness::new(1);
        harness.cluster.fail_lookups(Some("api server unavailable"));
        let engine = harness.engine(options(1, FailurePolicy::Partial));

        let err = engine.aggregate(NS).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Discovery);
        assert!(err.to_string().contains("api server unavailable"));
    }

    #[tokio::test]
    async fn node_failure_aborts_whole_aggregation_then_recovers() {
        let harness = Harness::new(3);
        let url = "http://10.0.0.2:9100/metrics";
        harness.http.remove(url);
        let engine = harness.engine(options(1, FailurePolicy::Abort));

        let err = engine.aggregate(NS).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Node);
        assert!(err.to_string().contains("w2"));
        // Sequential abort: later nodes and the cadvisor stage are skipped.
        assert_eq!(harness.http.hits("http://10.0.0.3:9100/metrics"), 0);
        assert_eq!(harness.cluster.proxy_hits("w1", "/metrics/cadvisor"), 0);

        harness.http.set(url, MemoryResponse::ok("node_load1 0.2\n"));
        let doc = engine.aggregate(NS).await.unwrap();
        assert_eq!(doc.nodes, vec![node_block(1), node_block(2), node_block(3)]);
    }

    #[tokio::test]
    async fn cadvisor_failure_aborts() {
        let harness = Harness::new(2);
        harness
            .cluster
            .set_proxy("w2", "/metrics/cadvisor", MemoryResponse::status(403, "forbidden"));
        let engine = harness.engine(options(1, FailurePolicy::Abort));

        let err = engine.aggregate(NS).await.unwrap_err();
        assert_eq!(err.stage(), Stage::CAdvisor);
        assert!(err.to_string().contains("unexpected status 403"));
    }

    #[tokio::test]
    async fn missing_node_name_fails_request() {
        let harness = Harness::new(0);
        harness.cluster.set_endpoints(
            NS,
            "node-exporter",
            vec![EndpointAddress {
                ip: "10.0.0.7".to_string(),
                node_name: None,
                hostname: None,
            }],
        );
        let engine = harness.engine(options(1, FailurePolicy::Abort));

        let err = engine.aggregate(NS).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Discovery);
        assert!(err.to_string().contains("10.0.0.7"));
    }

    #[tokio::test]
    async fn parallel_fan_out_keeps_registry_order() {
        let harness = Harness::new(4);
        // Earlier nodes answer last.
        for i in 1..=4u64 {
            harness.http.set(
                format!("http://10.0.0.{i}:9100/metrics"),
                MemoryResponse::ok(format!("node_load1 0.{i}\n"))
                    .delayed(Duration::from_millis(80 - i * 20)),
            );
        }
        let engine = harness.engine(options(4, FailurePolicy::Abort));

        let doc = engine.aggregate(NS).await.unwrap();
        assert_eq!(
            doc.nodes,
            (1..=4).map(node_block).collect::<Vec<_>>()
        );
        assert_eq!(
            doc.cadvisor,
            (1..=4).map(cadvisor_block).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn parallel_abort_reports_earliest_failure() {
        let harness = Harness::new(3);
        harness.http.set(
            "http://10.0.0.2:9100/metrics",
            MemoryResponse::status(502, "bad gateway").delayed(Duration::from_millis(50)),
        );
        harness
            .http
            .set("http://10.0.0.3:9100/metrics", MemoryResponse::status(500, "oops"));
        let engine = harness.engine(options(3, FailurePolicy::Abort));

        let err = engine.aggregate(NS).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Node);
        assert!(err.to_string().contains("w2"), "{err}");
        assert!(err.to_string().contains("502"), "{err}");
    }

    #[tokio::test]
    async fn partial_policy_serves_survivors_with_up_gauge() {
        let harness = Harness::new(2);
        harness.http.remove("http://10.0.0.1:9100/metrics");
        let engine = harness.engine(options(1, FailurePolicy::Partial));

        let doc = engine.aggregate(NS).await.unwrap();
        assert_eq!(doc.nodes, vec![String::new(), node_block(2)]);

        let text = doc.render();
        assert!(text.starts_with(STATE_BLOCK));
        assert!(text.contains("# TYPE fanin_source_up gauge\n"));
        assert!(text.contains("fanin_source_up{component=\"state\"} 1\n"));
        assert!(text.contains("fanin_source_up{component=\"node\",node=\"w1\"} 0\n"));
        assert!(text.contains("fanin_source_up{component=\"node\",node=\"w2\"} 1\n"));
        assert!(text.contains("fanin_source_up{component=\"cadvisor\",node=\"w2\"} 1\n"));
        assert_eq!(doc.sources.len(), 5);
    }

    #[tokio::test]
    async fn partial_policy_tolerates_state_failure() {
        let harness = Harness::new(1);
        harness.http.remove(STATE_URL);
        let engine = harness.engine(options(2, FailurePolicy::Partial));

        let doc = engine.aggregate(NS).await.unwrap();
        assert_eq!(doc.state, "");
        assert_eq!(doc.nodes, vec![node_block(1)]);
        assert!(!doc.sources[0].up);
    }

    #[test]
    fn options_from_config() {
        let mut config = FaninConfig::default();
        config.scrape.fan_out = 8;
        config.scrape.failure_policy = FailurePolicy::Partial;
        let options = EngineOptions::from_config(&config);
        assert_eq!(options.fan_out, 8);
        assert_eq!(options.failure_policy, FailurePolicy::Partial);
        assert_eq!(options.state_url, config.sources.state_url);
    }
}

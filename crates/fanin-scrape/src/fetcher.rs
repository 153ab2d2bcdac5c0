//! Source fetcher — one scrape of one producer.
//!
//! Opens the producer's response, streams the body through a
//! `StreamAnnotator` with the producer's labels, and returns the
//! annotated text. A failure anywhere discards the partial output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::BodyExt;
use tracing::debug;

use fanin_core::{ConfigError, FaninConfig, Producer};

use crate::annotate::StreamAnnotator;
use crate::cluster::ClusterApi;
use crate::error::{FetchCause, FetchError};
use crate::http::HttpSource;

/// Where and how producers are scraped.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub node_port: u16,
    pub node_path: String,
    pub cadvisor_path: String,
    /// Bound on one fetch, from connect to the end of the body.
    pub timeout: Duration,
    /// Fail fetches whose status is not 2xx.
    pub require_success: bool,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            node_port: 9100,
            node_path: "/metrics".to_string(),
            cadvisor_path: "/metrics/cadvisor".to_string(),
            timeout: Duration::from_secs(10),
            require_success: true,
        }
    }
}

impl FetchSettings {
    pub fn from_config(config: &FaninConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            node_port: config.sources.node_exporter_port,
            node_path: config.sources.node_exporter_path.clone(),
            cadvisor_path: config.sources.cadvisor_path.clone(),
            timeout: config.scrape.timeout()?,
            require_success: config.scrape.require_success,
        })
    }
}

#[derive(Clone)]
pub struct SourceFetcher {
    http: Arc<dyn HttpSource>,
    cluster: Arc<dyn ClusterApi>,
    settings: FetchSettings,
}

impl SourceFetcher {
    pub fn new(
        http: Arc<dyn HttpSource>,
        cluster: Arc<dyn ClusterApi>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            http,
            cluster,
            settings,
        }
    }

    /// Node exporter URL for a node address.
    pub fn node_url(&self, address: &str) -> String {
        let host = if address.contains(':') {
            format!("[{address}]")
        } else {
            address.to_string()
        };
        format!("http://{host}:{}{}", self.settings.node_port, self.settings.node_path)
    }

    /// Scrape `producer` and return its annotated exposition text.
    pub async fn fetch(&self, producer: &Producer) -> Result<String, FetchError> {
        let started = Instant::now();
        let timeout = self.settings.timeout;

        let result = tokio::time::timeout(timeout, self.scrape(producer))
            .await
            .unwrap_or(Err(FetchCause::Timeout(timeout)));

        match result {
            Ok(text) => {
                debug!(
                    %producer,
                    bytes = text.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "scraped producer"
                );
                Ok(text)
            }
            Err(cause) => Err(FetchError {
                producer: producer.to_string(),
                cause,
            }),
        }
    }

    async fn scrape(&self, producer: &Producer) -> Result<String, FetchCause> {
        let resp = match producer {
            Producer::State { url } => self.http.get(url).await?,
            Producer::Node { address, .. } => self.http.get(&self.node_url(address)).await?,
            Producer::CAdvisor { node } => {
                self.cluster
                    .node_proxy(node, &self.settings.cadvisor_path)
                    .await?
            }
        };

        let status = resp.status();
        if self.settings.require_success && !status.is_success() {
            return Err(FetchCause::Status(status.as_u16()));
        }

        let mut body = resp.into_body();
        let mut annotator = StreamAnnotator::new(&producer.labels());
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| FetchCause::Body(e.to_string()))?;
            if let Ok(chunk) = frame.into_data() {
                annotator.feed(&chunk);
            }
        }
        Ok(annotator.finish())
    }
}

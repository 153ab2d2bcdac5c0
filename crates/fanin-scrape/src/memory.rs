//! In-memory producers and cluster directory.
//!
//! Serve canned responses keyed by URL, node, or service. Used by tests
//! across the workspace and for running the API without a cluster.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};

use fanin_core::EndpointAddress;

use crate::cluster::ClusterApi;
use crate::error::{FetchCause, LookupError};
use crate::http::{BoxError, HttpSource, MetricsBody};

/// A canned response.
#[derive(Debug, Clone)]
pub struct MemoryResponse {
    status: u16,
    chunks: Vec<Result<Bytes, String>>,
    delay: Option<Duration>,
    refuse: Option<String>,
}

impl MemoryResponse {
    /// `200` with the whole body in one chunk.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            chunks: vec![Ok(Bytes::from(body.into()))],
            delay: None,
            refuse: None,
        }
    }

    /// `200` delivered as separate body frames.
    pub fn chunked<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            status: 200,
            chunks: chunks.into_iter().map(|c| Ok(Bytes::from(c.into()))).collect(),
            delay: None,
            refuse: None,
        }
    }

    /// The connection is refused before any response.
    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            status: 0,
            chunks: Vec::new(),
            delay: None,
            refuse: Some(reason.into()),
        }
    }

    /// Fail the body stream after the frames sent so far.
    pub fn then_break(mut self, reason: impl Into<String>) -> Self {
        self.chunks.push(Err(reason.into()));
        self
    }

    /// Wait before answering.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn open(&self, target: &str) -> Result<Response<MetricsBody>, FetchCause> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.refuse {
            return Err(FetchCause::Connect {
                addr: target.to_string(),
                reason: reason.clone(),
            });
        }
        let body = Frames {
            chunks: self.chunks.iter().cloned().collect(),
        };
        Response::builder()
            .status(self.status)
            .body(body.boxed_unsync())
            .map_err(|e| FetchCause::Request(e.to_string()))
    }
}

struct Frames {
    chunks: VecDeque<Result<Bytes, String>>,
}

impl Body for Frames {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        Poll::Ready(
            self.chunks
                .pop_front()
                .map(|chunk| chunk.map(Frame::data).map_err(BoxError::from)),
        )
    }
}

/// [`HttpSource`] answering from a URL → response table.
///
/// Unknown URLs are refused, like a closed port.
#[derive(Debug, Default)]
pub struct MemoryHttp {
    responses: RwLock<HashMap<String, MemoryResponse>>,
    hits: RwLock<HashMap<String, usize>>,
}

impl MemoryHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, url: impl Into<String>, response: MemoryResponse) {
        let mut responses = self.responses.write().expect("memory http lock");
        responses.insert(url.into(), response);
    }

    pub fn remove(&self, url: &str) {
        let mut responses = self.responses.write().expect("memory http lock");
        responses.remove(url);
    }

    /// Number of requests made for `url`.
    pub fn hits(&self, url: &str) -> usize {
        let hits = self.hits.read().expect("memory http lock");
        hits.get(url).copied().unwrap_or(0)
    }

    async fn respond(&self, key: &str) -> Result<Response<MetricsBody>, FetchCause> {
        {
            let mut hits = self.hits.write().expect("memory http lock");
            *hits.entry(key.to_string()).or_default() += 1;
        }
        let response = {
            let responses = self.responses.read().expect("memory http lock");
            responses.get(key).cloned()
        };
        match response {
            Some(response) => response.open(key).await,
            None => Err(FetchCause::Connect {
                addr: key.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

#[async_trait]
impl HttpSource for MemoryHttp {
    async fn get(&self, url: &str) -> Result<Response<MetricsBody>, FetchCause> {
        self.respond(url).await
    }
}

/// [`ClusterApi`] backed by an endpoints table and per-node proxy
/// responses.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    endpoints: RwLock<HashMap<(String, String), Vec<EndpointAddress>>>,
    lookup_failure: RwLock<Option<String>>,
    proxy: MemoryHttp,
    lookups: AtomicUsize,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_endpoints(&self, namespace: &str, service: &str, addresses: Vec<EndpointAddress>) {
        let mut endpoints = self.endpoints.write().expect("memory cluster lock");
        endpoints.insert((namespace.to_string(), service.to_string()), addresses);
    }

    /// Make every lookup fail with `reason` until cleared with `None`.
    pub fn fail_lookups(&self, reason: Option<&str>) {
        let mut failure = self.lookup_failure.write().expect("memory cluster lock");
        *failure = reason.map(str::to_string);
    }

    pub fn set_proxy(&self, node: &str, path: &str, response: MemoryResponse) {
        self.proxy.set(proxy_key(node, path), response);
    }

    pub fn proxy_hits(&self, node: &str, path: &str) -> usize {
        self.proxy.hits(&proxy_key(node, path))
    }

    /// Number of endpoint lookups served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

fn proxy_key(node: &str, path: &str) -> String {
    format!("/api/v1/nodes/{node}/proxy{path}")
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn endpoint_addresses(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointAddress>, LookupError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(reason) = self.lookup_failure.read().expect("memory cluster lock").clone() {
            return Err(LookupError::Request {
                namespace: namespace.to_string(),
                service: service.to_string(),
                reason,
            });
        }

        let endpoints = self.endpoints.read().expect("memory cluster lock");
        endpoints
            .get(&(namespace.to_string(), service.to_string()))
            .cloned()
            .ok_or_else(|| LookupError::Status {
                namespace: namespace.to_string(),
                service: service.to_string(),
                status: 404,
            })
    }

    async fn node_proxy(&self, node: &str, path: &str) -> Result<Response<MetricsBody>, FetchCause> {
        self.proxy.respond(&proxy_key(node, path)).await
    }
}

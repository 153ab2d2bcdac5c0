//! Cluster API access: endpoint discovery and the node proxy.
//!
//! `KubeClient` talks to the API server with the pod's service-account
//! credentials over TLS, trusting only the cluster CA.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::Response;
use http::uri::Authority;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use fanin_core::EndpointAddress;
use fanin_core::config::ClusterConfig;

use crate::error::{ClusterError, FetchCause, LookupError};
use crate::http::{MetricsBody, get_over, into_metrics_body};

/// Operations the aggregator needs from the cluster control plane.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Addresses currently registered for `service` in `namespace`,
    /// in directory order.
    async fn endpoint_addresses(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointAddress>, LookupError>;

    /// Open `path` on `node` through the API server's node proxy.
    async fn node_proxy(&self, node: &str, path: &str) -> Result<Response<MetricsBody>, FetchCause>;
}

/// In-cluster API server client.
pub struct KubeClient {
    addr: String,
    authority: String,
    server_name: ServerName<'static>,
    token: String,
    tls: TlsConnector,
}

impl fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClient").field("addr", &self.addr).finish_non_exhaustive()
    }
}

impl KubeClient {
    /// Build a client from the pod's service account and environment.
    pub fn in_cluster(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let addr = match &config.api_server {
            Some(addr) => addr.clone(),
            None => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST")
                    .map_err(|_| ClusterError::MissingEnv("KUBERNETES_SERVICE_HOST"))?;
                let port = std::env::var("KUBERNETES_SERVICE_PORT")
                    .map_err(|_| ClusterError::MissingEnv("KUBERNETES_SERVICE_PORT"))?;
                join_host_port(&host, &port)
            }
        };

        let read = |path: &std::path::Path| {
            std::fs::read(path).map_err(|e| ClusterError::Credentials {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        };
        let token = String::from_utf8_lossy(&read(&config.token_file)?).trim().to_string();
        let ca_pem = read(&config.ca_file)?;

        Self::new(&addr, token, &ca_pem)
    }

    /// Build a client for `addr` (`host:port`) trusting the PEM bundle.
    pub fn new(addr: &str, token: String, ca_pem: &[u8]) -> Result<Self, ClusterError> {
        let authority: Authority = addr
            .parse()
            .map_err(|_| ClusterError::InvalidAddress(addr.to_string()))?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        let port = authority.port_u16().unwrap_or(443);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ClusterError::InvalidAddress(addr.to_string()))?;

        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
            let cert = cert.map_err(|e| ClusterError::Tls(format!("parse CA bundle: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| ClusterError::Tls(format!("add CA certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(ClusterError::Tls("CA bundle holds no certificates".to_string()));
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ClusterError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            addr: join_host_port(host, &port.to_string()),
            authority: authority.as_str().to_string(),
            server_name,
            token,
            tls: TlsConnector::from(Arc::new(tls)),
        })
    }

    async fn get(&self, path: &str) -> Result<Response<Incoming>, FetchCause> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| FetchCause::Connect {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        let stream = self
            .tls
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| FetchCause::Connect {
                addr: self.addr.clone(),
                reason: format!("tls: {e}"),
            })?;
        debug!(addr = %self.addr, %path, "api server request");
        get_over(stream, &self.authority, path, Some(&self.token)).await
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn endpoint_addresses(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointAddress>, LookupError> {
        let path = format!("/api/v1/namespaces/{namespace}/endpoints/{service}");
        let request_error = |reason: String| LookupError::Request {
            namespace: namespace.to_string(),
            service: service.to_string(),
            reason,
        };

        let resp = self.get(&path).await.map_err(|e| request_error(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(LookupError::Status {
                namespace: namespace.to_string(),
                service: service.to_string(),
                status: resp.status().as_u16(),
            });
        }
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| request_error(format!("reading body: {e}")))?
            .to_bytes();

        parse_endpoints(&body)
    }

    async fn node_proxy(&self, node: &str, path: &str) -> Result<Response<MetricsBody>, FetchCause> {
        let resp = self.get(&format!("/api/v1/nodes/{node}/proxy{path}")).await?;
        Ok(into_metrics_body(resp))
    }
}

#[derive(Deserialize)]
struct Endpoints {
    #[serde(default)]
    subsets: Option<Vec<EndpointSubset>>,
}

#[derive(Deserialize)]
struct EndpointSubset {
    #[serde(default)]
    addresses: Option<Vec<EndpointAddress>>,
}

/// Flatten an Endpoints object into its ready addresses.
///
/// Subsets are concatenated in order; an object without subsets has no
/// addresses.
pub fn parse_endpoints(body: &[u8]) -> Result<Vec<EndpointAddress>, LookupError> {
    let endpoints: Endpoints =
        serde_json::from_slice(body).map_err(|e| LookupError::Decode(e.to_string()))?;
    Ok(endpoints
        .subsets
        .unwrap_or_default()
        .into_iter()
        .flat_map(|s| s.addresses.unwrap_or_default())
        .collect())
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

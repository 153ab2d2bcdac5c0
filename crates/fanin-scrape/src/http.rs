//! Plain HTTP/1.1 scraping.
//!
//! One connection per request: the aggregator scrapes each target once
//! per inbound request, so there is nothing to gain from pooling.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, HOST, USER_AGENT};
use http::{Method, Request, Response, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::FetchCause;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body handed to the fetcher, drained frame by frame.
pub type MetricsBody = UnsyncBoxBody<Bytes, BoxError>;

pub(crate) const AGENT: &str = concat!("fanin/", env!("CARGO_PKG_VERSION"));

/// Issues plain GET requests against directly reachable producers.
#[async_trait]
pub trait HttpSource: Send + Sync {
    async fn get(&self, url: &str) -> Result<Response<MetricsBody>, FetchCause>;
}

/// [`HttpSource`] over hyper's HTTP/1.1 client connection.
#[derive(Debug, Clone, Default)]
pub struct HttpClient;

impl HttpClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HttpSource for HttpClient {
    async fn get(&self, url: &str) -> Result<Response<MetricsBody>, FetchCause> {
        let uri: Uri = url
            .parse()
            .map_err(|e| FetchCause::Unsupported(format!("{url}: {e}")))?;
        if uri.scheme_str() != Some("http") {
            return Err(FetchCause::Unsupported(format!(
                "{url}: only http:// targets are scraped directly"
            )));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| FetchCause::Unsupported(format!("{url}: missing host")))?;
        let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| FetchCause::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let resp = get_over(stream, authority.as_str(), path, None).await?;
        Ok(into_metrics_body(resp))
    }
}

/// Send a single GET over an established stream.
pub(crate) async fn get_over<S>(
    stream: S,
    host: &str,
    path: &str,
    bearer: Option<&str>,
) -> Result<Response<Incoming>, FetchCause>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| FetchCause::Request(format!("handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "scrape connection closed with error");
        }
    });

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, host)
        .header(USER_AGENT, AGENT)
        .header(ACCEPT, "text/plain");
    if let Some(token) = bearer {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let req = builder
        .body(Empty::<Bytes>::new())
        .map_err(|e| FetchCause::Request(e.to_string()))?;

    sender
        .send_request(req)
        .await
        .map_err(|e| FetchCause::Request(e.to_string()))
}

pub(crate) fn into_metrics_body(resp: Response<Incoming>) -> Response<MetricsBody> {
    resp.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed_unsync())
}

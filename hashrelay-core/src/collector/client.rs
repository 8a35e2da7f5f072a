//! HTTP transport for the collector
//!
//! The delivery engine talks to the network only through [`Transport`], so
//! the probe/report state machine can be driven by a scripted transport in
//! tests. [`CollectorClient`] is the real implementation on top of reqwest.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::config::SenderConfig;
use crate::error::{Error, Result};

use super::envelope::Envelope;

/// Status and body of a collector response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Any 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking request seam between the delivery engine and the network.
///
/// Implementations must bound every call with a timeout and report
/// transport failures as [`Error::Network`].
pub trait Transport: Send + Sync {
    /// `GET url`
    fn get(&self, url: &str) -> Result<HttpReply>;

    /// `POST url` with the envelope as a JSON body
    fn post_envelope(&self, url: &str, envelope: &Envelope) -> Result<HttpReply>;
}

/// reqwest-backed [`Transport`]
///
/// Requests are driven on a private single-threaded runtime, so callers
/// stay synchronous.
pub struct CollectorClient {
    http_client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    timeout: Duration,
}

impl CollectorClient {
    /// Create a new client from the sender configuration
    pub fn new(config: &SenderConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("hashrelay/", env!("CARGO_PKG_VERSION"))),
        );

        let timeout = config.network_timeout();
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            http_client,
            runtime,
            timeout,
        })
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(request: reqwest::RequestBuilder) -> Result<HttpReply> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("failed to read response body: {}", e)))?;

        Ok(HttpReply { status, body })
    }
}

impl Transport for CollectorClient {
    fn get(&self, url: &str) -> Result<HttpReply> {
        let request = self.http_client.get(url);
        self.runtime.block_on(Self::execute(request))
    }

    fn post_envelope(&self, url: &str, envelope: &Envelope) -> Result<HttpReply> {
        // `.json()` also sets `Content-Type: application/json`
        let request = self.http_client.post(url).json(envelope);
        self.runtime.block_on(Self::execute(request))
    }
}

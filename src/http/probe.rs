//! Liveness probe against the server's own address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::time;

/// Probe bodies are the echoed message; anything bigger is a bug.
const MAX_PROBE_BODY: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to build probe request: {0}")]
    Build(#[from] axum::http::Error),

    #[error("probe request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read probe body: {0}")]
    Body(#[from] axum::Error),
}

/// What the server answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub status: StatusCode,
    pub body: String,
}

/// Issues `GET /` against a local server.
pub struct LivenessProbe {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl LivenessProbe {
    pub fn new(timeout: Duration) -> Self {
        // No pooling: a pooled connection may belong to a server that has
        // since been replaced.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(HttpConnector::new());

        Self { client, timeout }
    }

    /// A listener on the unspecified address is reached over loopback.
    pub fn target(addr: SocketAddr) -> SocketAddr {
        match addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
            }
            IpAddr::V6(ip) if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
            }
            _ => addr,
        }
    }

    pub async fn probe(&self, addr: SocketAddr) -> Result<ProbeReport, ProbeError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("http://{}/", Self::target(addr)))
            .header(header::USER_AGENT, "configmap-reloader-probe")
            .body(Body::empty())?;

        let response = time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;

        let status = response.status();
        let body = time::timeout(
            self.timeout,
            axum::body::to_bytes(Body::new(response.into_body()), MAX_PROBE_BODY),
        )
        .await
        .map_err(|_| ProbeError::Timeout(self.timeout))??;

        Ok(ProbeReport {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

//! External address probes
//!
//! A probe asks a "what is my IP" service for the address the outside world sees,
//! with the request sourced from one instance's modem address.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{CACHE_CONTROL, CONNECTION, HOST, USER_AGENT};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tracing::{debug, instrument};
use url::Url;

use crate::config::HealthConfig;
use crate::error::{Result, RotaError};
use crate::proxy::upstream;

/// Reports the public address seen when connecting from `local`
#[async_trait]
pub trait ExternalIpProbe: Send + Sync {
    async fn probe(&self, local: Ipv4Addr) -> Result<Ipv4Addr>;
}

/// Plain-HTTP probe against a checkip-style endpoint
pub struct HttpProbe {
    url: Url,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self { url, timeout }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.probe_url.clone(), config.probe_timeout)
    }

    async fn fetch(&self, local: Ipv4Addr) -> Result<Bytes> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| RotaError::InvalidConfig(format!("probe URL has no host: {}", self.url)))?;
        let port = self.url.port_or_known_default().unwrap_or(80);

        let stream = upstream::connect_bound(host, port, Some(local), self.timeout).await?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Probe connection ended: {}", e);
            }
        });

        let mut path = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            path.push('?');
            path.push_str(query);
        }
        let host_header = match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let request = Request::get(path)
            .header(HOST, host_header)
            .header(CACHE_CONTROL, "no-cache")
            .header(CONNECTION, "close")
            .header(USER_AGENT, concat!("rota-modem/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(|e| RotaError::Http(e.to_string()))?;

        let response = sender.send_request(request).await?;
        if !response.status().is_success() {
            return Err(RotaError::Http(format!("probe returned {}", response.status())));
        }

        Ok(response.into_body().collect().await?.to_bytes())
    }
}

#[async_trait]
impl ExternalIpProbe for HttpProbe {
    #[instrument(skip(self), level = "debug")]
    async fn probe(&self, local: Ipv4Addr) -> Result<Ipv4Addr> {
        let body = tokio::time::timeout(self.timeout, self.fetch(local))
            .await
            .map_err(|_| RotaError::Timeout)??;

        extract_ipv4(&String::from_utf8_lossy(&body))
            .ok_or_else(|| RotaError::Http("no address in probe response".to_string()))
    }
}

/// First dotted-quad IPv4 address in `text`
pub fn extract_ipv4(text: &str) -> Option<Ipv4Addr> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|token| token.trim_matches('.'))
        .find_map(|token| token.parse::<Ipv4Addr>().ok())
}

//! reqwest-backed transport shared by the CardDAV and admin clients.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::{DavRequest, DavResponse, Transport};
use crate::error::{Error, Result};

/// TLS and timeout settings for outgoing HTTPS connections.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Skip server certificate verification.
    pub insecure: bool,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Client certificate and key (PEM) for mutual TLS.
    pub identity: Option<(PathBuf, PathBuf)>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            insecure: false,
            timeout: Duration::from_secs(30),
            identity: None,
        }
    }
}

impl HttpSettings {
    /// Build a reqwest client honoring these settings.
    pub fn client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.insecure);

        if let Some((cert, key)) = &self.identity {
            let mut pem = std::fs::read(cert).map_err(|err| {
                Error::Configuration(format!("cannot read client certificate {}: {}", cert.display(), err))
            })?;
            let key_pem = std::fs::read(key).map_err(|err| {
                Error::Configuration(format!("cannot read client key {}: {}", key.display(), err))
            })?;
            pem.push(b'\n');
            pem.extend_from_slice(&key_pem);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|err| {
                Error::Configuration(format!("invalid client certificate {}: {}", cert.display(), err))
            })?;
            builder = builder.identity(identity);
        }

        Ok(builder.build()?)
    }
}

/// Sends `DavRequest`s to one origin (`scheme://host[:port]`).
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    origin: String,
}

impl HttpTransport {
    /// Transport for the origin of `base`; the path of `base` is ignored.
    pub fn new(base: &Url, settings: &HttpSettings) -> Result<Self> {
        Ok(Self::with_client(base, settings.client()?))
    }

    /// Reuse an existing client (connection pool) for another transport.
    pub fn with_client(base: &Url, client: reqwest::Client) -> Self {
        Self {
            client,
            origin: base.origin().ascii_serialization(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: DavRequest) -> Result<DavResponse> {
        let target = format!("{}{}", self.origin, request.path);
        let url = Url::parse(&target)
            .map_err(|err| Error::InvalidArgument(format!("bad request URL {}: {}", target, err)))?;

        let response = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        debug!(method = %request.method, path = %request.path, %status, "dav response");

        Ok(DavResponse {
            status,
            headers,
            body,
        })
    }
}

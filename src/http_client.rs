//! HTTP abstraction (§4.3).
//!
//! Two operations: [`HttpClientFactory::create_client`] hands back a fresh
//! client whose lifetime the caller manages, used by the scheduler so each
//! range request owns a client that can be torn down independently of every
//! other in-flight request; [`HttpClientFactory::head`] is a self-contained
//! HEAD using an ephemeral client, used by the server probe. The default
//! implementation wraps `reqwest`; tests substitute a deterministic mock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;

use crate::error::{Error, Result};

/// The parts of a HEAD response the server probe needs.
#[derive(Debug, Clone)]
pub(crate) struct HeadResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

/// Factory for HTTP clients and HEAD requests, abstracted so tests can
/// substitute a deterministic implementation.
#[async_trait]
pub trait HttpClientFactory: Send + Sync {
    /// Build a fresh client. Each range request gets its own, so closing
    /// one client never affects another in-flight request.
    fn create_client(&self, connection_timeout: Duration) -> Result<reqwest::Client>;

    /// Issue a self-contained HEAD request with an ephemeral client.
    async fn head(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        connection_timeout: Duration,
    ) -> Result<HeadResponse>;
}

/// `reqwest`-backed [`HttpClientFactory`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHttpClientFactory;

impl DefaultHttpClientFactory {
    /// Construct the default factory.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn build_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|e| Error::InvalidResponse(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::try_from(value.as_str())
            .map_err(|e| Error::InvalidResponse(format!("invalid header value {value:?}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[async_trait]
impl HttpClientFactory for DefaultHttpClientFactory {
    fn create_client(&self, connection_timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(connection_timeout)
            .build()
            .map_err(Error::from)
    }

    async fn head(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        connection_timeout: Duration,
    ) -> Result<HeadResponse> {
        let client = self.create_client(connection_timeout)?;
        let response = client
            .head(url)
            .headers(build_header_map(headers)?)
            .timeout(connection_timeout)
            .send()
            .await?;
        Ok(HeadResponse {
            status: response.status(),
            headers: response.headers().clone(),
        })
    }
}

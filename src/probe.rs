//! Server capability probe (§4.4): a HEAD request parsed into
//! [`ServerInfo`].

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::http_client::HttpClientFactory;

/// What the range client needs to know about the server before it decides
/// whether to fan out range requests or fall back to a serial fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Whether the server is willing to serve byte ranges.
    pub accept_ranges: bool,
    /// Size of the resource in bytes.
    pub content_length: u64,
    /// Filename suggested by `Content-Disposition`, if present.
    pub file_name: Option<String>,
}

/// Issue a HEAD request and parse the response into a [`ServerInfo`].
///
/// Non-200 responses raise [`Error::ServerError`] carrying the status code;
/// a missing or unparseable `Content-Length` raises
/// [`Error::InvalidResponse`].
pub(crate) async fn check_server_info(
    factory: &dyn HttpClientFactory,
    url: &str,
    headers: &HashMap<String, String>,
    connection_timeout: Duration,
) -> Result<ServerInfo> {
    let response = factory.head(url, headers, connection_timeout).await?;

    if response.status != reqwest::StatusCode::OK {
        return Err(Error::ServerError(format!(
            "HEAD {} returned status {}",
            url,
            response.status.as_u16()
        )));
    }

    let content_length = response
        .headers
        .get(reqwest::header::CONTENT_LENGTH)
        .ok_or_else(|| Error::InvalidResponse("Content-Length header missing".to_string()))?
        .to_str()
        .map_err(|_| Error::InvalidResponse("Content-Length header is not valid UTF-8".to_string()))?
        .parse::<u64>()
        .map_err(|_| Error::InvalidResponse("Content-Length header is not a valid integer".to_string()))?;

    // Case-sensitive comparison to the literal `none`, matching the source.
    // HTTP header values are case-insensitive by spec; this preserves a
    // known quirk of the original rather than silently "fixing" it (§9).
    let accept_ranges = response
        .headers
        .get(reqwest::header::ACCEPT_RANGES)
        .is_some_and(|v| v.to_str().unwrap_or_default() != "none");

    let file_name = response
        .headers
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_filename);

    debug!(%url, content_length, accept_ranges, ?file_name, "server probe complete");

    Ok(ServerInfo {
        accept_ranges,
        content_length,
        file_name,
    })
}

/// Parse `filename=` out of a `Content-Disposition` header value, per
/// §4.4: either a double-quoted string (unquoted) or a semicolon-delimited
/// unquoted token (trimmed). First match wins.
fn extract_filename(content_disposition: &str) -> Option<String> {
    let idx = content_disposition.find("filename=")?;
    let rest = &content_disposition[idx + "filename=".len()..];
    let rest = rest.trim_start();

    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(stripped[..end].to_string());
    }

    let token = rest.split(';').next().unwrap_or(rest).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

//! Shared, read-only download configuration.

use std::collections::HashMap;
use std::time::Duration;

/// Immutable, copy-on-modify configuration shared by a [`RangeRequestClient`]
/// and the [`FileDownloader`] built on top of it.
///
/// [`RangeRequestClient`]: crate::RangeRequestClient
/// [`FileDownloader`]: crate::FileDownloader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequestConfig {
    /// Size, in bytes, of each range request (except possibly the last).
    pub chunk_size: u64,
    /// Maximum number of range requests in flight at once.
    pub max_concurrent_requests: usize,
    /// Extra headers merged into every HTTP request this client issues.
    pub headers: HashMap<String, String>,
    /// Maximum number of retries per range, in addition to the first
    /// attempt.
    pub max_retries: u32,
    /// Base delay for the retry policy's exponential backoff.
    pub retry_delay: Duration,
    /// Suffix appended to the final filename while a download is in
    /// progress.
    pub temp_file_extension: String,
    /// Timeout applied to each individual HTTP call (HEAD, ranged `GET`,
    /// whole-body `GET`).
    pub connection_timeout: Duration,
    /// How often the progress callback is invoked while bytes are flowing.
    pub progress_interval: Duration,
}

impl Default for RangeRequestConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10 * 1024 * 1024,
            max_concurrent_requests: 8,
            headers: HashMap::new(),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            temp_file_extension: ".tmp".to_string(),
            connection_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl RangeRequestConfig {
    /// Create a config with all defaults (§3).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of `self` with the given fields overridden. A call
    /// with every argument `None` returns a field-wise-equal copy — the
    /// Rust shape of the spec's `copyWith()`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn copy_with(
        &self,
        chunk_size: Option<u64>,
        max_concurrent_requests: Option<usize>,
        headers: Option<HashMap<String, String>>,
        max_retries: Option<u32>,
        retry_delay: Option<Duration>,
        temp_file_extension: Option<String>,
        connection_timeout: Option<Duration>,
        progress_interval: Option<Duration>,
    ) -> Self {
        Self {
            chunk_size: chunk_size.unwrap_or(self.chunk_size),
            max_concurrent_requests: max_concurrent_requests
                .unwrap_or(self.max_concurrent_requests),
            headers: headers.unwrap_or_else(|| self.headers.clone()),
            max_retries: max_retries.unwrap_or(self.max_retries),
            retry_delay: retry_delay.unwrap_or(self.retry_delay),
            temp_file_extension: temp_file_extension
                .unwrap_or_else(|| self.temp_file_extension.clone()),
            connection_timeout: connection_timeout.unwrap_or(self.connection_timeout),
            progress_interval: progress_interval.unwrap_or(self.progress_interval),
        }
    }
}

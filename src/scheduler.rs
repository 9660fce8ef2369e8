//! Chunk scheduler (§4.5): plans byte ranges, dispatches up to
//! `max_concurrent_requests` overlapping range fetches via a
//! `tokio::task::JoinSet`, buffers out-of-order completions, and yields them
//! back in strictly increasing range order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::config::RangeRequestConfig;
use crate::error::{Error, Result};
use crate::http_client::{build_header_map, HttpClientFactory};
use crate::retry::{RetryOutcome, RetryPolicy};

/// An inclusive byte range to request with `Range: bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First byte of the range, inclusive.
    pub start: u64,
    /// Last byte of the range, inclusive.
    pub end: u64,
}

impl ChunkRange {
    /// Number of bytes this range covers.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// This range is never empty: `start <= end` is an invariant.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Plan the sequence of ranges covering `[offset, total)` in chunks of
/// `chunk_size` bytes (§3). Empty when `offset >= total`.
pub(crate) fn plan_ranges(total: u64, chunk_size: u64, offset: u64) -> Vec<ChunkRange> {
    if offset >= total {
        return Vec::new();
    }
    let mut ranges = Vec::new();
    let mut start = offset;
    while start < total {
        let end = (start + chunk_size - 1).min(total - 1);
        ranges.push(ChunkRange { start, end });
        start = end + 1;
    }
    ranges
}

/// Per-fetch scheduler state (§3 "Scheduler state"). Created once per fetch
/// and consumed exactly once.
pub(crate) struct ChunkScheduler {
    url: String,
    ranges: Vec<ChunkRange>,
    next_chunk_index: usize,
    next_write_index: usize,
    active: JoinSet<(usize, Result<Bytes>)>,
    active_indices: HashSet<usize>,
    pending: HashMap<usize, Bytes>,
    config: RangeRequestConfig,
    factory: Arc<dyn HttpClientFactory>,
    cancel_token: CancelToken,
    on_progress_bytes: Box<dyn FnMut(u64) + Send>,
}

impl ChunkScheduler {
    pub(crate) fn new(
        url: String,
        total: u64,
        offset: u64,
        config: RangeRequestConfig,
        factory: Arc<dyn HttpClientFactory>,
        cancel_token: CancelToken,
        on_progress_bytes: Box<dyn FnMut(u64) + Send>,
    ) -> Self {
        let ranges = plan_ranges(total, config.chunk_size, offset);
        debug!(url = %url, chunks = ranges.len(), "chunk plan computed");
        Self {
            url,
            ranges,
            next_chunk_index: 0,
            next_write_index: 0,
            active: JoinSet::new(),
            active_indices: HashSet::new(),
            pending: HashMap::new(),
            config,
            factory,
            cancel_token,
            on_progress_bytes,
        }
    }

    /// True while there is dispatched-or-buffered work left to drain.
    pub(crate) fn has_more(&self) -> bool {
        !self.active_indices.is_empty() || !self.pending.is_empty()
    }

    /// Fill the dispatch window up to `max_concurrent_requests`, or until
    /// the plan is exhausted. Checks cancellation before each dispatch and
    /// raises synchronously, leaving no partial dispatch state (§4.5).
    pub(crate) fn start_initial_fetches(&mut self) -> Result<()> {
        while self.active_indices.len() < self.config.max_concurrent_requests
            && self.next_chunk_index < self.ranges.len()
        {
            self.cancel_token.throw_if_cancelled()?;
            self.dispatch_next();
        }
        Ok(())
    }

    fn dispatch_next(&mut self) {
        let index = self.next_chunk_index;
        let range = self.ranges[index];
        self.next_chunk_index += 1;
        self.active_indices.insert(index);

        let url = self.url.clone();
        let config = self.config.clone();
        let factory = Arc::clone(&self.factory);
        let cancel_token = self.cancel_token.clone();

        trace!(index, start = range.start, end = range.end, "dispatching range");
        self.active
            .spawn(async move { (index, fetch_range(&factory, &url, range, &config, &cancel_token).await) });
    }

    /// Await the next completing task, buffer its bytes, report progress,
    /// and (if not cancelled and ranges remain) dispatch a replacement.
    pub(crate) async fn process_next_completion(&mut self) -> Result<()> {
        let Some(joined) = self.active.join_next().await else {
            return Ok(());
        };
        let (index, result) = joined.map_err(|e| Error::NetworkError(format!("range task panicked: {e}")))?;
        self.active_indices.remove(&index);
        let bytes = result?;
        (self.on_progress_bytes)(bytes.len() as u64);
        self.pending.insert(index, bytes);

        if self.cancel_token.throw_if_cancelled().is_ok() && self.next_chunk_index < self.ranges.len() {
            self.dispatch_next();
        }
        Ok(())
    }

    /// Emit every buffered chunk that is next in order, without blocking.
    pub(crate) fn yield_ready_chunks(&mut self) -> Vec<Bytes> {
        let mut ready = Vec::new();
        while let Some(bytes) = self.pending.remove(&self.next_write_index) {
            ready.push(bytes);
            self.next_write_index += 1;
        }
        ready
    }
}

async fn fetch_range(
    factory: &Arc<dyn HttpClientFactory>,
    url: &str,
    range: ChunkRange,
    config: &RangeRequestConfig,
    cancel_token: &CancelToken,
) -> Result<Bytes> {
    let mut retry = RetryPolicy::new(config.max_retries, config.retry_delay);
    loop {
        cancel_token.throw_if_cancelled()?;
        match fetch_range_once(factory, url, range, config, cancel_token).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) => {
                cancel_token.throw_if_cancelled()?;
                match retry.handle_error().await {
                    RetryOutcome::Continue => {
                        warn!(url, start = range.start, end = range.end, error = %err, "retrying range");
                    }
                    RetryOutcome::GiveUp => return Err(err),
                }
            }
        }
    }
}

async fn fetch_range_once(
    factory: &Arc<dyn HttpClientFactory>,
    url: &str,
    range: ChunkRange,
    config: &RangeRequestConfig,
    cancel_token: &CancelToken,
) -> Result<Bytes> {
    let client = factory.create_client(config.connection_timeout)?;
    let mut headers: HeaderMap = build_header_map(&config.headers)?;
    headers.insert(
        RANGE,
        HeaderValue::from_str(&format!("bytes={}-{}", range.start, range.end))
            .map_err(|e| Error::InvalidResponse(format!("invalid range header: {e}")))?,
    );

    let request = client.get(url).headers(headers).timeout(config.connection_timeout);
    let handle = tokio::spawn(async move { request.send().await });
    let registration = cancel_token.register_client(handle.abort_handle());
    let send_result = handle.await;
    cancel_token.unregister_client(registration);

    let response = match send_result {
        Ok(inner) => inner?,
        Err(join_err) if join_err.is_cancelled() => return Err(Error::cancelled()),
        Err(join_err) => return Err(Error::NetworkError(format!("range request task failed: {join_err}"))),
    };

    if response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(Error::InvalidResponse(format!(
            "Expected 206 Partial Content, got {} for bytes={}-{}",
            response.status().as_u16(),
            range.start,
            range.end
        )));
    }

    let bytes = response.bytes().await?;
    let expected = range.len();
    if bytes.len() as u64 != expected {
        return Err(Error::InvalidResponse(format!(
            "range response length {} did not match expected {expected}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_splits_into_exact_multiples() {
        let ranges = plan_ranges(20, 10, 0);
        assert_eq!(
            ranges,
            vec![
                ChunkRange { start: 0, end: 9 },
                ChunkRange { start: 10, end: 19 },
            ]
        );
    }

    #[test]
    fn plan_handles_remainder_in_final_chunk() {
        let ranges = plan_ranges(25, 10, 0);
        assert_eq!(
            ranges,
            vec![
                ChunkRange { start: 0, end: 9 },
                ChunkRange { start: 10, end: 19 },
                ChunkRange { start: 20, end: 24 },
            ]
        );
    }

    #[test]
    fn plan_respects_a_nonzero_offset() {
        let ranges = plan_ranges(25, 10, 15);
        assert_eq!(ranges, vec![ChunkRange { start: 15, end: 24 }]);
    }

    #[test]
    fn plan_is_empty_when_offset_equals_total() {
        assert!(plan_ranges(10, 5, 10).is_empty());
    }

    #[test]
    fn plan_is_empty_for_zero_total() {
        assert!(plan_ranges(0, 5, 0).is_empty());
    }

    #[test]
    fn plan_is_empty_when_offset_exceeds_total() {
        assert!(plan_ranges(10, 5, 20).is_empty());
    }
}

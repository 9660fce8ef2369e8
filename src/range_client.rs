//! Range client (§4.6): the public entry point that ties the probe, the
//! chunk scheduler, and the serial fallback together into one ordered byte
//! stream, with progress reporting and cooperative cancellation.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use tokio::task::AbortHandle;
use tracing::warn;

use crate::cancel::{CancelToken, CancelTokenGroup};
use crate::config::RangeRequestConfig;
use crate::error::{Error, Result};
use crate::http_client::{build_header_map, DefaultHttpClientFactory, HttpClientFactory};
use crate::probe::{self, ServerInfo};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::scheduler::ChunkScheduler;

/// Ordered byte stream produced by [`RangeRequestClient::fetch`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Progress callback for [`RangeRequestClient::fetch`]'s raw byte stream:
/// `(received_bytes, total_bytes)`. `total_bytes` is `None` when the
/// content length could not be determined.
///
/// Distinct from [`crate::FileProgressCallback`], which is the
/// three-arity `(received, total, status)` callback [`FileDownloader`]
/// exposes to its own callers; `FileDownloader` adapts its callback into
/// one of these internally when it calls `fetch` (see
/// `file_sink::FileDownloader::stream_into_temp_file`).
///
/// [`FileDownloader`]: crate::FileDownloader
pub type OnProgress = Box<dyn FnMut(u64, Option<u64>) + Send>;

/// Discovers server range support and streams a URL's bytes in order,
/// either by fanning out concurrent range requests or, for servers that
/// don't support ranges, a retried serial fetch.
pub struct RangeRequestClient {
    config: RangeRequestConfig,
    factory: Arc<dyn HttpClientFactory>,
    tokens: CancelTokenGroup,
}

impl RangeRequestClient {
    /// Build a client backed by the default `reqwest`-based HTTP factory.
    #[must_use]
    pub fn new(config: RangeRequestConfig) -> Self {
        Self::with_http_client_factory(config, Arc::new(DefaultHttpClientFactory::new()))
    }

    /// Build a client backed by a caller-supplied [`HttpClientFactory`],
    /// for tests that need a deterministic transport.
    #[must_use]
    pub fn with_http_client_factory(config: RangeRequestConfig, factory: Arc<dyn HttpClientFactory>) -> Self {
        Self {
            config,
            factory,
            tokens: CancelTokenGroup::new(),
        }
    }

    /// The configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &RangeRequestConfig {
        &self.config
    }

    /// Probe the server for `Content-Length`, `Accept-Ranges`, and a
    /// suggested filename (§4.4).
    pub async fn check_server_info(&self, url: &str) -> Result<ServerInfo> {
        probe::check_server_info(
            self.factory.as_ref(),
            url,
            &self.config.headers,
            self.config.connection_timeout,
        )
        .await
    }

    /// Cancel every fetch in flight on this client.
    pub fn cancel_all(&self) {
        self.tokens.cancel_all();
    }

    /// Drop every tracked cancellation token without cancelling it.
    pub fn clear_tokens(&self) {
        self.tokens.clear();
    }

    /// Fetch `url` as a strictly ordered byte stream (§4.6).
    ///
    /// `content_length`/`accept_ranges` skip the HEAD probe when both are
    /// already known. `start_bytes` resumes a parallel fetch at an offset;
    /// it is ignored by the serial fallback, which always restarts from
    /// byte 0 on failure. `cancel_token` is adopted if supplied, otherwise
    /// a fresh one is created and tracked by this client's group.
    pub async fn fetch(
        &self,
        url: &str,
        content_length: Option<u64>,
        accept_ranges: Option<bool>,
        start_bytes: u64,
        cancel_token: Option<CancelToken>,
        on_progress: Option<OnProgress>,
    ) -> Result<ByteStream> {
        let cancel_token = cancel_token.unwrap_or_default();
        self.tokens.add_token(cancel_token.clone());
        cancel_token.throw_if_cancelled()?;

        let (content_length, accept_ranges) = match (content_length, accept_ranges) {
            (Some(len), Some(ranges)) => (len, ranges),
            (len, ranges) => {
                let info = self.check_server_info(url).await?;
                (len.unwrap_or(info.content_length), ranges.unwrap_or(info.accept_ranges))
            }
        };

        let received = Arc::new(AtomicU64::new(0));
        let progress = on_progress.map(|cb| ProgressCtx::spawn(cb, Arc::clone(&received), Some(content_length), self.config.progress_interval));

        if accept_ranges {
            self.fetch_parallel(url, content_length, start_bytes, cancel_token, received, progress)
        } else {
            self.fetch_serial(url, cancel_token, received, progress).await
        }
    }

    fn fetch_parallel(
        &self,
        url: &str,
        content_length: u64,
        start_bytes: u64,
        cancel_token: CancelToken,
        received: Arc<AtomicU64>,
        progress: Option<ProgressCtx>,
    ) -> Result<ByteStream> {
        let progress_counter = Arc::clone(&received);
        let mut scheduler = ChunkScheduler::new(
            url.to_string(),
            content_length,
            start_bytes,
            self.config.clone(),
            Arc::clone(&self.factory),
            cancel_token,
            Box::new(move |n| {
                progress_counter.fetch_add(n, Ordering::SeqCst);
            }),
        );
        scheduler.start_initial_fetches()?;

        let state = ParallelState {
            scheduler,
            ready: VecDeque::new(),
            progress,
            finished: false,
        };

        Ok(Box::pin(stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            loop {
                if let Some(bytes) = state.ready.pop_front() {
                    return Some((Ok(bytes), state));
                }
                if !state.scheduler.has_more() {
                    state.finished = true;
                    ProgressCtx::finalize(&mut state.progress);
                    return None;
                }
                if let Err(err) = state.scheduler.process_next_completion().await {
                    state.finished = true;
                    ProgressCtx::finalize(&mut state.progress);
                    return Some((Err(err), state));
                }
                state.ready.extend(state.scheduler.yield_ready_chunks());
            }
        })))
    }

    async fn fetch_serial(
        &self,
        url: &str,
        cancel_token: CancelToken,
        received: Arc<AtomicU64>,
        mut progress: Option<ProgressCtx>,
    ) -> Result<ByteStream> {
        let body = self.serial_fetch_with_retry(url, &cancel_token, &received).await;
        ProgressCtx::finalize(&mut progress);

        let body = match body {
            Ok(bytes) => bytes,
            Err(err) => return Ok(Box::pin(stream::once(async move { Err(err) }))),
        };

        let chunk_size = self.config.chunk_size as usize;
        let chunks: VecDeque<Bytes> = body
            .chunks(chunk_size.max(1))
            .map(|c| Bytes::copy_from_slice(c))
            .collect();
        Ok(Box::pin(stream::unfold(chunks, |mut chunks| async move {
            chunks.pop_front().map(|b| (Ok(b), chunks))
        })))
    }

    async fn serial_fetch_with_retry(&self, url: &str, cancel_token: &CancelToken, received: &Arc<AtomicU64>) -> Result<Bytes> {
        let mut retry = RetryPolicy::new(self.config.max_retries, self.config.retry_delay);
        loop {
            cancel_token.throw_if_cancelled()?;
            match self.serial_fetch_once(url, cancel_token, received).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    cancel_token.throw_if_cancelled()?;
                    match retry.handle_error().await {
                        RetryOutcome::Continue => {
                            warn!(url, error = %err, "retrying serial fetch from byte 0");
                            received.store(0, Ordering::SeqCst);
                        }
                        RetryOutcome::GiveUp => return Err(err),
                    }
                }
            }
        }
    }

    async fn serial_fetch_once(&self, url: &str, cancel_token: &CancelToken, received: &Arc<AtomicU64>) -> Result<Bytes> {
        let client = self.factory.create_client(self.config.connection_timeout)?;
        let headers = build_header_map(&self.config.headers)?;
        let request = client.get(url).headers(headers).timeout(self.config.connection_timeout);

        let handle = tokio::spawn(async move { request.send().await });
        let registration = cancel_token.register_client(handle.abort_handle());
        let send_result = handle.await;
        cancel_token.unregister_client(registration);

        let response = match send_result {
            Ok(inner) => inner?,
            Err(join_err) if join_err.is_cancelled() => return Err(Error::cancelled()),
            Err(join_err) => return Err(Error::NetworkError(format!("serial request task failed: {join_err}"))),
        };

        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::ServerError(format!(
                "GET {} returned status {} (expected 200)",
                url,
                response.status().as_u16()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::new();
        while let Some(next) = stream.next().await {
            cancel_token.throw_if_cancelled()?;
            let chunk = next?;
            received.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

struct ParallelState {
    scheduler: ChunkScheduler,
    ready: VecDeque<Bytes>,
    progress: Option<ProgressCtx>,
    finished: bool,
}

/// Owns the periodic progress timer task and the shared byte counter it
/// reads. Dropping this (or calling [`ProgressCtx::finalize`]) stops the
/// timer; `finalize` additionally performs the one guaranteed last call.
struct ProgressCtx {
    received: Arc<AtomicU64>,
    total: Option<u64>,
    callback: Arc<Mutex<OnProgress>>,
    timer: AbortHandle,
}

impl ProgressCtx {
    fn spawn(callback: OnProgress, received: Arc<AtomicU64>, total: Option<u64>, interval: Duration) -> Self {
        let callback = Arc::new(Mutex::new(callback));
        let timer_received = Arc::clone(&received);
        let timer_callback = Arc::clone(&callback);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let value = timer_received.load(Ordering::SeqCst);
                if value > 0 {
                    (timer_callback.lock().expect("progress callback lock poisoned"))(value, total);
                }
            }
        });
        Self {
            received,
            total,
            callback,
            timer: handle.abort_handle(),
        }
    }

    /// Stop the timer and deliver the one guaranteed final progress event
    /// (§4.6 step 6). A no-op if called more than once or never started.
    fn finalize(this: &mut Option<Self>) {
        if let Some(ctx) = this.take() {
            ctx.timer.abort();
            let value = ctx.received.load(Ordering::SeqCst);
            (ctx.callback.lock().expect("progress callback lock poisoned"))(value, ctx.total);
        }
    }
}

impl Drop for ProgressCtx {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HeadResponse;
    use async_trait::async_trait;
    use httpmock::prelude::*;
    use httpmock::Method::HEAD;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    struct RealFactory;

    #[async_trait]
    impl HttpClientFactory for RealFactory {
        fn create_client(&self, timeout: Duration) -> Result<reqwest::Client> {
            reqwest::Client::builder()
                .connect_timeout(timeout)
                .build()
                .map_err(Error::from)
        }

        async fn head(&self, url: &str, headers: &std::collections::HashMap<String, String>, timeout: Duration) -> Result<HeadResponse> {
            let client = self.create_client(timeout)?;
            let resp = client
                .head(url)
                .headers(build_header_map(headers)?)
                .timeout(timeout)
                .send()
                .await?;
            Ok(HeadResponse {
                status: resp.status(),
                headers: resp.headers().clone(),
            })
        }
    }

    fn client_for(server: &MockServer, config: RangeRequestConfig) -> RangeRequestClient {
        let _ = server;
        RangeRequestClient::with_http_client_factory(config, Arc::new(RealFactory))
    }

    #[tokio::test]
    async fn parallel_fetch_reassembles_chunks_in_order() {
        let server = MockServer::start();
        let body = b"0123456789ABCDEFGHIJ".to_vec();

        server.mock(|when, then| {
            when.method(HEAD).path("/file");
            then.status(200).header("Content-Length", "20").header("Accept-Ranges", "bytes");
        });
        server.mock(|when, then| {
            when.method(GET).path("/file").header("Range", "bytes=0-9");
            then.status(206).body(&body[0..10]);
        });
        server.mock(|when, then| {
            when.method(GET).path("/file").header("Range", "bytes=10-19");
            then.status(206).body(&body[10..20]);
        });

        let config = RangeRequestConfig::new().copy_with(Some(10), Some(4), None, None, None, None, None, None);
        let client = client_for(&server, config);
        let url = server.url("/file");

        let stream = client.fetch(&url, None, None, 0, None, None).await.unwrap();
        let collected: Vec<u8> = stream
            .map(|r| r.unwrap().to_vec())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(collected, body);
    }

    #[tokio::test]
    async fn parallel_fetch_retries_a_failed_range() {
        let server = MockServer::start();
        let body = b"0123456789".to_vec();

        server.mock(|when, then| {
            when.method(HEAD).path("/flaky");
            then.status(200).header("Content-Length", "10").header("Accept-Ranges", "bytes");
        });

        // Fails the first two matching requests, then stops matching so the
        // unconditional success mock below takes over.
        let remaining_failures = Arc::new(AtomicUsize::new(2));
        let failure_gate = Arc::clone(&remaining_failures);
        let failing_mock = server.mock(move |when, then| {
            when.method(GET)
                .path("/flaky")
                .header("Range", "bytes=0-9")
                .matches(move |_req| {
                    failure_gate
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                });
            then.status(500);
        });
        let success_mock = server.mock(|when, then| {
            when.method(GET).path("/flaky").header("Range", "bytes=0-9");
            then.status(206).body(&body);
        });

        let config = RangeRequestConfig::new().copy_with(
            None,
            None,
            None,
            Some(5),
            Some(Duration::from_millis(1)),
            None,
            None,
            None,
        );
        let client = client_for(&server, config);
        let url = server.url("/flaky");

        let stream = client.fetch(&url, None, None, 0, None, None).await.unwrap();
        let collected: Vec<u8> = stream
            .map(|r| r.unwrap().to_vec())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(collected, body);
        failing_mock.assert_hits(2);
        success_mock.assert_hits(1);
    }

    #[tokio::test]
    async fn non_ranged_server_falls_back_to_serial_fetch() {
        let server = MockServer::start();
        let body = b"whole-body-no-ranges".to_vec();

        server.mock(|when, then| {
            when.method(HEAD).path("/plain");
            then.status(200).header("Content-Length", body.len().to_string());
        });
        server.mock(|when, then| {
            when.method(GET).path("/plain");
            then.status(200).body(&body);
        });

        let config = RangeRequestConfig::new();
        let client = client_for(&server, config);
        let url = server.url("/plain");

        let stream = client.fetch(&url, None, None, 0, None, None).await.unwrap();
        let collected: Vec<u8> = stream
            .map(|r| r.unwrap().to_vec())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(collected, body);
    }

    #[tokio::test]
    async fn cancel_before_fetch_surfaces_cancelled_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(HEAD).path("/any");
            then.status(200).header("Content-Length", "10").header("Accept-Ranges", "bytes");
        });

        let client = client_for(&server, RangeRequestConfig::new());
        let token = CancelToken::new();
        token.cancel();

        let err = match client.fetch(&server.url("/any"), None, None, 0, Some(token), None).await {
            Err(e) => e,
            Ok(_) => panic!("expected fetch to fail"),
        };
        assert_eq!(err.code(), crate::ErrorCode::Cancelled);
    }
}

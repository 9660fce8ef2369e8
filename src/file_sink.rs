//! File sink (§4.7): a resumable, checksum-computing file writer layered
//! on top of [`RangeRequestClient`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::RangeRequestConfig;
use crate::digest;
use crate::error::{Error, Result};
use crate::http_client::{DefaultHttpClientFactory, HttpClientFactory};
use crate::paths;
use crate::range_client::RangeRequestClient;
use crate::{ChecksumType, DownloadStatus};

/// How to resolve a conflict between an existing file and the download's
/// final destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileConflictStrategy {
    /// Delete the existing file and replace it.
    Overwrite,
    /// Write alongside it as `<stem>(n)<ext>` for the smallest free `n`.
    Rename,
    /// Fail with [`Error::FileError`].
    Error,
}

/// Progress callback for [`FileDownloader::download_to_file`]:
/// `(received_bytes, total_bytes, status)`.
///
/// The sink-level counterpart to [`crate::range_client::OnProgress`]:
/// `stream_into_temp_file` wraps this callback in an `OnProgress` closure
/// (adding the `start_bytes` offset and the constant `Downloading` status)
/// before handing it to [`RangeRequestClient::fetch`]. The two types are
/// intentionally distinct, not duplicates — one is the client's raw
/// stream-progress shape, the other is the file sink's public shape.
pub type FileProgressCallback = Box<dyn FnMut(u64, u64, DownloadStatus) + Send>;

/// Inputs to one [`FileDownloader::download_to_file`] call.
pub struct DownloadOptions {
    /// URL to download.
    pub url: String,
    /// Directory the final file and its temp sibling are written under.
    pub destination_dir: PathBuf,
    /// Overrides the server-suggested / URL-derived filename.
    pub file_name: Option<String>,
    /// Resume from an existing temp file's length when the server supports
    /// ranges.
    pub resume: bool,
    /// How to resolve a collision with an existing file at the final path.
    pub conflict_strategy: FileConflictStrategy,
    /// Digest to compute over the completed file.
    pub checksum_type: ChecksumType,
    /// Adopted if supplied, otherwise a fresh token is created internally.
    pub cancel_token: Option<CancelToken>,
    /// Invoked with `(received, total, status)` as the download progresses.
    pub on_progress: Option<FileProgressCallback>,
}

impl DownloadOptions {
    /// Minimal options: a URL and a destination directory, everything else
    /// at its default.
    #[must_use]
    pub fn new(url: impl Into<String>, destination_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination_dir: destination_dir.into(),
            file_name: None,
            resume: false,
            conflict_strategy: FileConflictStrategy::Error,
            checksum_type: ChecksumType::None,
            cancel_token: None,
            on_progress: None,
        }
    }
}

/// Result of a completed [`FileDownloader::download_to_file`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    /// Where the file ultimately landed (post conflict-resolution).
    pub file_path: PathBuf,
    /// Size of the written file, in bytes.
    pub file_size: u64,
    /// Lowercase hex digest, if `checksum_type != ChecksumType::None`.
    pub checksum: Option<String>,
    /// Digest algorithm used, if any.
    pub checksum_type: ChecksumType,
}

/// Composes a [`RangeRequestClient`] with filesystem resume, conflict
/// resolution, and checksum computation.
pub struct FileDownloader {
    client: RangeRequestClient,
}

impl FileDownloader {
    /// Build a downloader backed by the default `reqwest`-based transport.
    #[must_use]
    pub fn new(config: RangeRequestConfig) -> Self {
        Self::with_http_client_factory(config, Arc::new(DefaultHttpClientFactory::new()))
    }

    /// Build a downloader backed by a caller-supplied transport.
    #[must_use]
    pub fn with_http_client_factory(config: RangeRequestConfig, factory: Arc<dyn HttpClientFactory>) -> Self {
        Self {
            client: RangeRequestClient::with_http_client_factory(config, factory),
        }
    }

    /// The range client this sink is built on, for callers that also want
    /// direct stream access.
    #[must_use]
    pub fn client(&self) -> &RangeRequestClient {
        &self.client
    }

    /// Download `options.url` to a file under `options.destination_dir`
    /// (§4.7).
    pub async fn download_to_file(&self, mut options: DownloadOptions) -> Result<DownloadResult> {
        let config = self.client.config().clone();
        let cancel_token = options.cancel_token.take().unwrap_or_default();

        let server_info = self.client.check_server_info(&options.url).await?;
        let file_name = paths::resolve_filename(
            options.file_name.as_deref(),
            server_info.file_name.as_deref(),
            &options.url,
        );

        tokio::fs::create_dir_all(&options.destination_dir).await?;
        let final_path = options.destination_dir.join(&file_name);
        let temp_path = temp_path_for(&final_path, &config.temp_file_extension);

        let resume = options.resume && server_info.accept_ranges;
        let start_bytes = prepare_temp_file(&temp_path, resume).await?;
        if start_bytes > server_info.content_length {
            return Err(Error::FileError(format!(
                "existing temp file ({start_bytes} bytes) exceeds remote file size ({} bytes)",
                server_info.content_length
            )));
        }

        let total = server_info.content_length;
        let progress = Arc::new(std::sync::Mutex::new(options.on_progress.take()));
        let mut received_total = start_bytes;

        if start_bytes == total {
            debug!(url = %options.url, %total, "temp file already complete, skipping network");
            emit_progress(&progress, total, total, DownloadStatus::Downloading);
        } else {
            received_total = self
                .stream_into_temp_file(
                    &options,
                    &temp_path,
                    total,
                    start_bytes,
                    server_info.accept_ranges,
                    cancel_token.clone(),
                    Arc::clone(&progress),
                    resume,
                )
                .await?;
        }

        if options.checksum_type != ChecksumType::None {
            emit_progress(&progress, received_total, total, DownloadStatus::CalculatingChecksum);
        }
        let checksum = digest::compute(temp_path.clone(), options.checksum_type).await?;

        let destination = resolve_conflict(&final_path, options.conflict_strategy).await?;
        tokio::fs::rename(&temp_path, &destination).await?;
        let file_size = tokio::fs::metadata(&destination).await?.len();

        info!(path = %destination.display(), file_size, "download finalized");
        Ok(DownloadResult {
            file_path: destination,
            file_size,
            checksum,
            checksum_type: options.checksum_type,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_into_temp_file(
        &self,
        options: &DownloadOptions,
        temp_path: &Path,
        total: u64,
        start_bytes: u64,
        accept_ranges: bool,
        cancel_token: CancelToken,
        progress: Arc<std::sync::Mutex<Option<FileProgressCallback>>>,
        resume: bool,
    ) -> Result<u64> {
        let chunk_size = self.client.config().chunk_size as usize;
        let progress_for_fetch = Arc::clone(&progress);
        let on_progress: crate::range_client::OnProgress = Box::new(move |received, total_opt| {
            let total = total_opt.unwrap_or(total);
            emit_progress(&progress_for_fetch, start_bytes + received, total, DownloadStatus::Downloading);
        });

        let fetch_result = self
            .client
            .fetch(
                &options.url,
                Some(total),
                Some(accept_ranges),
                start_bytes,
                Some(cancel_token),
                Some(on_progress),
            )
            .await;

        let mut stream = match fetch_result {
            Ok(stream) => stream,
            Err(err) => {
                cleanup_on_failure(temp_path, resume).await;
                return Err(err);
            }
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!resume)
            .open(temp_path)
            .await?;
        if resume {
            use tokio::io::AsyncSeekExt;
            file.seek(std::io::SeekFrom::End(0)).await?;
        }

        let mut buffer = Vec::<u8>::new();
        let received = Arc::new(AtomicU64::new(start_bytes));

        let write_result: Result<()> = async {
            while let Some(next) = stream.next().await {
                let chunk = next?;
                if buffer.is_empty() && chunk.len() >= chunk_size {
                    file.write_all(&chunk).await?;
                } else {
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() >= chunk_size {
                        file.write_all(&buffer).await?;
                        buffer.clear();
                    }
                }
                received.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            }
            if !buffer.is_empty() {
                file.write_all(&buffer).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        drop(file);

        match write_result {
            Ok(()) => Ok(received.load(Ordering::SeqCst)),
            Err(err) => {
                cleanup_on_failure(temp_path, resume).await;
                Err(err)
            }
        }
    }
}

fn temp_path_for(final_path: &Path, extension: &str) -> PathBuf {
    let mut os_string = final_path.as_os_str().to_os_string();
    os_string.push(extension);
    PathBuf::from(os_string)
}

async fn prepare_temp_file(temp_path: &Path, resume: bool) -> Result<u64> {
    if resume {
        match tokio::fs::metadata(temp_path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::from(e)),
        }
    } else {
        // `stream_into_temp_file` opens with `truncate(true)`, so a stale
        // temp file from a prior non-resuming attempt is discarded there.
        Ok(0)
    }
}

async fn cleanup_on_failure(temp_path: &Path, resume: bool) {
    if resume {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %temp_path.display(), error = %e, "failed to clean up temp file after error");
        }
    }
}

async fn resolve_conflict(final_path: &Path, strategy: FileConflictStrategy) -> Result<PathBuf> {
    let exists = tokio::fs::metadata(final_path).await.is_ok();
    match strategy {
        FileConflictStrategy::Overwrite => {
            if exists {
                tokio::fs::remove_file(final_path).await?;
            }
            Ok(final_path.to_path_buf())
        }
        FileConflictStrategy::Rename => {
            if exists {
                let dir = final_path.parent().unwrap_or_else(|| Path::new("."));
                let name = final_path.file_name().and_then(|n| n.to_str()).unwrap_or("download");
                Ok(paths::next_available_rename(dir, name))
            } else {
                Ok(final_path.to_path_buf())
            }
        }
        FileConflictStrategy::Error => {
            if exists {
                Err(Error::FileError("File already exists".to_string()))
            } else {
                Ok(final_path.to_path_buf())
            }
        }
    }
}

fn emit_progress(progress: &Arc<std::sync::Mutex<Option<FileProgressCallback>>>, received: u64, total: u64, status: DownloadStatus) {
    if let Some(cb) = progress.lock().expect("progress callback lock poisoned").as_mut() {
        cb(received, total, status);
    }
}

/// Options for [`cleanup_temp_files`].
pub struct CleanupOptions {
    /// Directory to walk recursively.
    pub directory: PathBuf,
    /// Extension to match; defaults to the config's `temp_file_extension`
    /// when `None`.
    pub extension: Option<String>,
    /// Only delete files last modified longer ago than this, if set.
    pub older_than: Option<Duration>,
}

/// Walk `options.directory` recursively and delete every regular file
/// whose name ends with the matching extension and (if set) is older than
/// `options.older_than`. Returns the number of files deleted; per-file
/// errors are tolerated silently; a non-existent directory returns `Ok(0)`
/// (§4.7 "Temp cleanup utility").
pub async fn cleanup_temp_files(options: CleanupOptions, config: &RangeRequestConfig) -> Result<usize> {
    if tokio::fs::metadata(&options.directory).await.is_err() {
        return Ok(0);
    }
    let extension = options.extension.unwrap_or_else(|| config.temp_file_extension.clone());
    let directory = options.directory;
    let older_than = options.older_than;

    tokio::task::spawn_blocking(move || {
        let now = SystemTime::now();
        let mut deleted = 0usize;
        for entry in walkdir::WalkDir::new(&directory)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !path.to_string_lossy().ends_with(&extension) {
                continue;
            }
            if let Some(threshold) = older_than {
                let Ok(metadata) = entry.metadata() else { continue };
                let Ok(modified) = metadata.modified() else { continue };
                let Ok(age) = now.duration_since(modified) else { continue };
                if age < threshold {
                    continue;
                }
            }
            if std::fs::remove_file(path).is_ok() {
                deleted += 1;
            }
        }
        deleted
    })
    .await
    .map_err(|e| Error::FileError(format!("cleanup task panicked: {e}")))
}

//! Parallel HTTP range-request downloader.
//!
//! [`RangeRequestClient`] discovers whether a server supports byte-range
//! requests, fans out up to `max_concurrent_requests` overlapping `GET`
//! requests across the file, and reassembles the responses into a single,
//! strictly-ordered [`futures::Stream`] of bytes. [`FileDownloader`] layers a
//! resumable, checksum-computing file sink on top of that stream.
//!
//! The crate only *computes* checksums; verifying them against an
//! expected value, mirroring content, and TLS configuration are left to the
//! caller.

mod cancel;
mod config;
mod digest;
mod error;
mod file_sink;
mod http_client;
mod paths;
mod probe;
mod range_client;
mod retry;
mod scheduler;

pub use cancel::{CancelToken, CancelTokenGroup};
pub use config::RangeRequestConfig;
pub use error::{Error, ErrorCode, Result};
pub use file_sink::{
    cleanup_temp_files, CleanupOptions, DownloadOptions, DownloadResult, FileConflictStrategy,
    FileDownloader, FileProgressCallback,
};
pub use http_client::{DefaultHttpClientFactory, HttpClientFactory};
pub use probe::ServerInfo;
pub use range_client::{ByteStream, OnProgress, RangeRequestClient};
pub use scheduler::ChunkRange;

/// Supported digest algorithms for [`FileDownloader::download_to_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumType {
    /// SHA-256, lowercase hex.
    Sha256,
    /// MD5, lowercase hex.
    Md5,
    /// Skip checksum computation entirely.
    #[default]
    None,
}

/// Phase of an in-progress download, reported alongside byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Bytes are still being received from the network.
    Downloading,
    /// The network transfer is complete; a digest is being computed.
    CalculatingChecksum,
}

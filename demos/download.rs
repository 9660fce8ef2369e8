//! Downloads a single URL to a directory, printing progress as it goes.
//!
//! ```sh
//! cargo run --example download -- <url> <destination-dir>
//! ```

use std::env;
use std::error::Error;
use std::process::exit;

use rangedl::{ChecksumType, DownloadOptions, DownloadStatus, FileDownloader, RangeRequestConfig};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let mut args = env::args().skip(1);
    let (Some(url), Some(destination_dir)) = (args.next(), args.next()) else {
        eprintln!("usage: download <url> <destination-dir>");
        exit(2);
    };

    let downloader = FileDownloader::new(RangeRequestConfig::new());

    let mut options = DownloadOptions::new(url, destination_dir);
    options.checksum_type = ChecksumType::Sha256;
    options.on_progress = Some(Box::new(|received, total, status| match status {
        DownloadStatus::Downloading => info!(received, total, "downloading"),
        DownloadStatus::CalculatingChecksum => info!("computing checksum"),
    }));

    let result = downloader.download_to_file(options).await?;
    info!(
        path = %result.file_path.display(),
        size = result.file_size,
        checksum = ?result.checksum,
        "download complete"
    );
    Ok(())
}

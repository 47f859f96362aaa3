//! Direct HTTP link downloads into a session directory.
//!
//! Streams the body chunk by chunk, enforces the size limit both from
//! `Content-Length` and while streaming, and retries transient failures
//! with [`retry_until_cancelled`]. A partial file never survives a failed
//! or cancelled download. Byte progress goes to the caller's
//! [`ProgressSink`].

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::retry::{retry_until_cancelled, RetryPolicy, Retryable};
use crate::core::utils::{format_file_size, human_size, is_video_name};
use crate::progress::{ProgressMeter, ProgressSink, Stage};
use crate::staging::StagingArea;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("🔗 That is not a downloadable http(s) link: {0}")]
    InvalidUrl(String),

    #[error("🌐 The server answered HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("📦 The file is too large ({}), the limit is {}.", human_size(.size), human_size(.limit))]
    TooLarge { size: u64, limit: u64 },

    #[error("📥 Download failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure reported by a non-HTTP source (e.g. the Bot API).
    #[error("📥 Download failed: {message}")]
    Transport { message: String, transient: bool },

    #[error("💾 Could not store the file: {0}")]
    Io(#[from] std::io::Error),

    #[error("🛑 Download cancelled")]
    Cancelled,
}

impl Retryable for DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            DownloadError::Http(e) => e.is_retryable(),
            DownloadError::Transport { transient, .. } => *transient,
            DownloadError::Io(e) => e.is_retryable(),
            DownloadError::InvalidUrl(_) | DownloadError::TooLarge { .. } | DownloadError::Cancelled => false,
        }
    }
}

/// Accepts a message text as a link input: a single http(s) URL with a host.
pub fn parse_link(text: &str) -> Option<Url> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return None;
    }
    let url = Url::parse(trimmed).ok()?;
    let http = url.scheme() == "http" || url.scheme() == "https";
    (http && url.host_str().is_some()).then_some(url)
}

/// File name for a link download: the last path segment, given a video
/// extension when it has none.
pub fn name_from_url(url: &Url, seq: usize) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    match segment {
        Some(name) if is_video_name(&name) => name,
        Some(name) => format!("{}.mp4", name),
        None => format!("video_{}.mp4", seq + 1),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
}

pub struct LinkDownloader {
    client: Client,
    retry: RetryPolicy,
    max_bytes: u64,
}

impl LinkDownloader {
    pub fn new(client: Client, retry: RetryPolicy, max_bytes: u64) -> Self {
        Self {
            client,
            retry,
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Downloads `url` as input number `seq` of the session in `dir`.
    pub async fn fetch(
        &self,
        url: &Url,
        dir: &Path,
        seq: usize,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<DownloadedFile, DownloadError> {
        let name = name_from_url(url, seq);
        let path = StagingArea::input_path(dir, seq, &name);
        log::info!("📥 Link download: {} -> {}", url, path.display());

        match retry_until_cancelled(&self.retry, cancel, || self.fetch_once(url, &path, progress)).await {
            Ok(size_bytes) => {
                log::info!("✅ Link download complete: {} ({})", name, format_file_size(size_bytes));
                Ok(DownloadedFile { path, name, size_bytes })
            }
            Err(e) => {
                let _ = fs_err::tokio::remove_file(&path).await;
                let err = e.into_error(|| DownloadError::Cancelled);
                if !matches!(err, DownloadError::Cancelled) {
                    log::warn!("❌ Link download failed for {}: {}", url, err);
                }
                Err(err)
            }
        }
    }

    async fn fetch_once(&self, url: &Url, path: &Path, progress: &ProgressSink) -> Result<u64, DownloadError> {
        let response = self.client.get(url.as_str()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_bytes {
                return Err(DownloadError::TooLarge {
                    size: declared,
                    limit: self.max_bytes,
                });
            }
        }

        let mut meter = ProgressMeter::new(Stage::Downloading, response.content_length());
        let mut file = fs_err::tokio::File::create(path).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            if downloaded > self.max_bytes {
                return Err(DownloadError::TooLarge {
                    size: downloaded,
                    limit: self.max_bytes,
                });
            }
            file.write_all(&chunk).await?;
            if let Some(update) = meter.advance(chunk.len() as u64) {
                progress.report(update);
            }
        }
        file.flush().await?;

        Ok(downloaded)
    }
}

//! Delivery of merged outputs: back through the chat transport or to an
//! external file host.

pub mod gofile;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::retry::{retry_until_cancelled, RetryPolicy, Retryable};
use crate::core::utils::{format_file_size, human_size};
use crate::merge::MergedOutput;
use crate::progress::ProgressSink;

pub use gofile::GofileUploader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    TelegramUpload,
    ExternalHost,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::TelegramUpload => "telegram",
            DeliveryMode::ExternalHost => "host",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "telegram" => Some(DeliveryMode::TelegramUpload),
            "host" => Some(DeliveryMode::ExternalHost),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("📦 The file is {}, over the {} upload limit. Choose the external host instead.", human_size(.size), human_size(.limit))]
    TooLarge { size: u64, limit: u64 },

    #[error("📡 Delivery failed: {message}")]
    Transport {
        message: String,
        transient: bool,
        retry_after: Option<Duration>,
    },

    /// Permanent refusal by the recipient side (blocked bot, deleted chat...)
    #[error("🚫 Delivery rejected: {reason}")]
    Rejected { reason: String },

    #[error("☁️ File host error: {0}")]
    Host(String),

    #[error("☁️ File host answered HTTP {0}")]
    HostStatus(u16),

    #[error("☁️ File host request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("💾 Could not read the merged file: {0}")]
    Io(#[from] std::io::Error),

    #[error("☁️ No external file host is configured")]
    HostUnavailable,

    #[error("🛑 Delivery cancelled")]
    Cancelled,
}

impl DeliveryError {
    /// Short machine-readable reason, used as the failure-summary key of a
    /// broadcast log.
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::TooLarge { .. } => "too_large",
            DeliveryError::Transport { .. } => "transport",
            DeliveryError::Rejected { .. } => "rejected",
            DeliveryError::Host(_) | DeliveryError::HostStatus(_) | DeliveryError::Http(_) => "host",
            DeliveryError::Io(_) => "io",
            DeliveryError::HostUnavailable => "host_unavailable",
            DeliveryError::Cancelled => "cancelled",
        }
    }
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Transport { transient, .. } => *transient,
            DeliveryError::HostStatus(status) => *status >= 500 || *status == 429,
            DeliveryError::Http(e) => e.is_retryable(),
            DeliveryError::Io(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::Transport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Sends a local file into a chat (the Telegram Bot API in production).
#[async_trait]
pub trait ChatUpload: Send + Sync {
    async fn send_file(
        &self,
        chat_id: i64,
        path: &Path,
        caption: &str,
        progress: &ProgressSink,
    ) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedFile {
    pub link: String,
    pub file_id: Option<String>,
}

/// Uploads a local file somewhere and returns a shareable link.
#[async_trait]
pub trait ExternalHost: Send + Sync {
    async fn upload(&self, path: &Path, progress: &ProgressSink) -> Result<HostedFile, DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReceipt {
    Uploaded,
    Hosted { link: String },
}

pub struct UploadDispatcher {
    chat: Arc<dyn ChatUpload>,
    host: Option<Arc<dyn ExternalHost>>,
    max_upload_bytes: u64,
    retry: RetryPolicy,
}

impl UploadDispatcher {
    pub fn new(
        chat: Arc<dyn ChatUpload>,
        host: Option<Arc<dyn ExternalHost>>,
        max_upload_bytes: u64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            chat,
            host,
            max_upload_bytes,
            retry,
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Whether a Telegram upload of `size` bytes is possible at all.
    pub fn fits_chat_upload(&self, size: u64) -> bool {
        size <= self.max_upload_bytes
    }

    pub async fn deliver(
        &self,
        chat_id: i64,
        output: &MergedOutput,
        mode: DeliveryMode,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        log::info!(
            "📤 Delivering {} ({}) to chat {} via {}",
            output.name,
            format_file_size(output.size_bytes),
            chat_id,
            mode.as_str()
        );

        match mode {
            DeliveryMode::TelegramUpload => {
                if !self.fits_chat_upload(output.size_bytes) {
                    return Err(DeliveryError::TooLarge {
                        size: output.size_bytes,
                        limit: self.max_upload_bytes,
                    });
                }
                let caption = format!("🎬 {} ({})", output.name, format_file_size(output.size_bytes));
                retry_until_cancelled(&self.retry, cancel, || {
                    self.chat.send_file(chat_id, &output.path, &caption, progress)
                })
                .await
                .map(|()| DeliveryReceipt::Uploaded)
                .map_err(|e| e.into_error(|| DeliveryError::Cancelled))
            }
            DeliveryMode::ExternalHost => {
                let host = self.host.as_ref().ok_or(DeliveryError::HostUnavailable)?;
                let hosted = retry_until_cancelled(&self.retry, cancel, || host.upload(&output.path, progress))
                    .await
                    .map_err(|e| e.into_error(|| DeliveryError::Cancelled))?;
                log::info!("☁️ Uploaded {} to {}", output.name, hosted.link);
                Ok(DeliveryReceipt::Hosted { link: hosted.link })
            }
        }
    }
}

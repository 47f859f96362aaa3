//! Telegram implementations of the transport traits mergecore is written
//! against: file downloads, chat uploads, channel membership and broadcast
//! delivery.

use std::path::Path;

use async_trait::async_trait;
use mergecore::access::MembershipCheck;
use mergecore::broadcast::BroadcastSink;
use mergecore::collect::FileSource;
use mergecore::core::config::ChannelRef;
use mergecore::download::DownloadError;
use mergecore::progress::{ProgressMeter, ProgressReader, ProgressSink, Stage};
use mergecore::upload::{ChatUpload, DeliveryError};
use teloxide::prelude::*;
use teloxide::types::{FileId, InputFile, MessageId, Recipient, UserId};
use teloxide::RequestError;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Container prefix of a self-hosted Bot API server's file paths.
const LOCAL_API_PREFIX: &str = "/var/lib/telegram-bot-api/";

/// Maps a Bot API failure onto the delivery taxonomy. Flood control and
/// network trouble are transient; anything the API itself refused is not.
pub fn delivery_error(err: RequestError) -> DeliveryError {
    match err {
        RequestError::RetryAfter(wait) => DeliveryError::Transport {
            message: format!("flood control, retry after {}s", wait.seconds()),
            transient: true,
            retry_after: Some(wait.duration()),
        },
        RequestError::Network(e) => DeliveryError::Transport {
            message: e.to_string(),
            transient: true,
            retry_after: None,
        },
        RequestError::Io(e) => DeliveryError::Transport {
            message: e.to_string(),
            transient: true,
            retry_after: None,
        },
        RequestError::Api(api) => DeliveryError::Rejected {
            reason: api.to_string(),
        },
        other => DeliveryError::Transport {
            message: other.to_string(),
            transient: false,
            retry_after: None,
        },
    }
}

fn download_error(err: RequestError) -> DownloadError {
    let transient = matches!(
        err,
        RequestError::RetryAfter(_) | RequestError::Network(_) | RequestError::Io(_)
    );
    DownloadError::Transport {
        message: err.to_string(),
        transient,
    }
}

/// `{api}/file/bot{token}/{path}`, with the local server's container prefix
/// stripped.
fn file_url(api_url: &Url, token: &str, file_path: &str) -> Result<Url, DownloadError> {
    let relative = file_path.strip_prefix(LOCAL_API_PREFIX).unwrap_or(file_path);
    let mut url = api_url.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| DownloadError::InvalidUrl(api_url.to_string()))?;
        segments.pop_if_empty();
        segments.push("file");
        segments.push(&format!("bot{}", token));
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            segments.push(segment);
        }
    }
    Ok(url)
}

/// The bot seen through mergecore's transport traits.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
    http: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(bot: Bot, http: reqwest::Client) -> Self {
        Self { bot, http }
    }
}

#[async_trait]
impl FileSource for TelegramTransport {
    async fn fetch_to(&self, file_id: &str, dest: &Path, progress: &ProgressSink) -> Result<u64, DownloadError> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(download_error)?;
        log::debug!("File {} resolved to {} ({} bytes)", file_id, file.path, file.size);
        let mut meter = ProgressMeter::new(Stage::Downloading, Some(u64::from(file.size)));

        // A local Bot API server that shares our filesystem hands out real paths
        if Path::new(&file.path).is_absolute() && fs_err::tokio::metadata(&file.path).await.is_ok() {
            let copied = fs_err::tokio::copy(&file.path, dest).await?;
            if let Some(update) = meter.set(copied) {
                progress.report(update);
            }
            return Ok(copied);
        }

        let url = file_url(&self.bot.api_url(), self.bot.token(), &file.path)?;
        let mut response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: file.path.clone(),
            });
        }

        let mut out = fs_err::tokio::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(update) = meter.advance(chunk.len() as u64) {
                progress.report(update);
            }
        }
        out.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl ChatUpload for TelegramTransport {
    async fn send_file(
        &self,
        chat_id: i64,
        path: &Path,
        caption: &str,
        progress: &ProgressSink,
    ) -> Result<(), DeliveryError> {
        let file = fs_err::tokio::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("merged.mp4")
            .to_string();
        let reader = ProgressReader::new(file, ProgressMeter::new(Stage::Uploading, Some(size)), progress.clone());

        self.bot
            .send_video(ChatId(chat_id), InputFile::read(reader).file_name(name))
            .caption(caption)
            .supports_streaming(true)
            .await
            .map(|_| ())
            .map_err(delivery_error)
    }
}

#[async_trait]
impl MembershipCheck for TelegramTransport {
    async fn is_member(&self, channel: &ChannelRef, user_id: i64) -> Result<bool, String> {
        let recipient = match channel {
            ChannelRef::Id(id) => Recipient::Id(ChatId(*id)),
            ChannelRef::Username(name) => Recipient::ChannelUsername(format!("@{}", name)),
        };
        let user = u64::try_from(user_id).map_err(|_| format!("invalid user id {}", user_id))?;

        let member = self
            .bot
            .get_chat_member(recipient, UserId(user))
            .await
            .map_err(|e| e.to_string())?;
        Ok(member.kind.is_present())
    }
}

/// Broadcast delivery that reports progress by editing a status message in
/// the sender's chat.
pub struct TelegramBroadcast {
    bot: Bot,
    status: Option<(ChatId, MessageId)>,
}

impl TelegramBroadcast {
    pub fn new(bot: Bot, status: Option<(ChatId, MessageId)>) -> Self {
        Self { bot, status }
    }
}

#[async_trait]
impl BroadcastSink for TelegramBroadcast {
    async fn deliver(&self, user_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.bot
            .send_message(ChatId(user_id), text)
            .await
            .map(|_| ())
            .map_err(delivery_error)
    }

    async fn progress(&self, done: usize, total: usize) {
        let Some((chat_id, message_id)) = self.status else {
            return;
        };
        let text = format!("📢 Broadcasting... {}/{}", done, total);
        if let Err(e) = self.bot.edit_message_text(chat_id, message_id, text).await {
            log::debug!("Failed to update broadcast progress: {}", e);
        }
    }
}

//! Input collection: turns an incoming video or link into a staged input of
//! the user's current session.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::core::error::{AppError, AppResult};
use crate::core::retry::{retry_until_cancelled, RetryPolicy};
use crate::core::utils::{extension_of, format_file_size};
use crate::download::{DownloadError, LinkDownloader};
use crate::progress::ProgressSink;
use crate::session::{InputSource, InputTicket, SessionError, SessionRegistry, StagedInput};
use crate::staging::StagingArea;

/// Fetches chat-hosted files (Telegram `file_id`s) to local disk.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Writes the file to `dest` and returns the number of bytes written.
    async fn fetch_to(&self, file_id: &str, dest: &Path, progress: &ProgressSink) -> Result<u64, DownloadError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingMedia {
    TelegramFile {
        file_id: String,
        file_name: Option<String>,
        size_bytes: Option<u64>,
    },
    Link(Url),
}

/// Result of a successful collection, for the acknowledgement message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected {
    /// Number of inputs staged in the session so far
    pub staged: usize,
    pub name: String,
    pub size_bytes: u64,
}

pub struct Collector {
    sessions: Arc<SessionRegistry>,
    files: Arc<dyn FileSource>,
    links: LinkDownloader,
    retry: RetryPolicy,
}

impl Collector {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        files: Arc<dyn FileSource>,
        links: LinkDownloader,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sessions,
            files,
            links,
            retry,
        }
    }

    /// Downloads `media` into the user's session, opening one if needed.
    pub async fn collect(
        &self,
        user_id: i64,
        chat_id: i64,
        media: IncomingMedia,
        progress: &ProgressSink,
    ) -> AppResult<Collected> {
        let ticket = self.sessions.begin_input(user_id, chat_id)?;

        if let Err(e) = self.sessions.staging().prepare(&ticket.dir).await {
            self.sessions.abandon_input(&ticket);
            return Err(e.into());
        }

        let staged = match self.download(&ticket, media, progress).await {
            Ok(staged) => staged,
            Err(e) => {
                self.sessions.abandon_input(&ticket);
                if matches!(e, DownloadError::Cancelled) {
                    self.sessions.staging().release(&ticket.dir).await;
                }
                return Err(e.into());
            }
        };

        let name = staged.name.clone();
        let size_bytes = staged.size_bytes;
        let path = staged.path.clone();

        match self.sessions.push_input(&ticket, staged) {
            Ok(staged) => {
                log::info!(
                    "📎 User {} staged input #{}: {} ({})",
                    user_id,
                    staged,
                    name,
                    format_file_size(size_bytes)
                );
                Ok(Collected {
                    staged,
                    name,
                    size_bytes,
                })
            }
            Err(SessionError::Stale) => {
                log::info!("🗑️ Discarding late download {} for user {}", name, user_id);
                let _ = fs_err::tokio::remove_file(&path).await;
                self.release_if_orphaned(&ticket).await;
                Err(SessionError::Stale.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn download(
        &self,
        ticket: &InputTicket,
        media: IncomingMedia,
        progress: &ProgressSink,
    ) -> Result<StagedInput, DownloadError> {
        match media {
            IncomingMedia::TelegramFile {
                file_id,
                file_name,
                size_bytes,
            } => {
                let limit = self.links.max_bytes();
                if let Some(size) = size_bytes.filter(|s| *s > limit) {
                    return Err(DownloadError::TooLarge { size, limit });
                }

                let name = telegram_input_name(file_name.as_deref(), ticket.seq);
                let path = StagingArea::input_path(&ticket.dir, ticket.seq, &name);
                let result = retry_until_cancelled(&self.retry, &ticket.cancel, || {
                    self.files.fetch_to(&file_id, &path, progress)
                })
                .await;

                match result {
                    Ok(written) => Ok(StagedInput {
                        seq: ticket.seq,
                        path,
                        name,
                        source: InputSource::TelegramFile { file_id },
                        size_bytes: written,
                    }),
                    Err(e) => {
                        let _ = fs_err::tokio::remove_file(&path).await;
                        Err(e.into_error(|| DownloadError::Cancelled))
                    }
                }
            }
            IncomingMedia::Link(url) => {
                let file = self
                    .links
                    .fetch(&url, &ticket.dir, ticket.seq, &ticket.cancel, progress)
                    .await?;
                Ok(StagedInput {
                    seq: ticket.seq,
                    path: file.path,
                    name: file.name,
                    source: InputSource::Link { url: url.to_string() },
                    size_bytes: file.size_bytes,
                })
            }
        }
    }

    /// The session directory may have been recreated by `prepare` after a
    /// cancel removed it.
    async fn release_if_orphaned(&self, ticket: &InputTicket) {
        let still_current = self
            .sessions
            .snapshot(ticket.user_id)
            .is_some_and(|s| s.session_id == ticket.session_id);
        if !still_current {
            self.sessions.staging().release(&ticket.dir).await;
        }
    }
}

/// Display name for a Telegram input. Videos sent as media often have no
/// file name at all.
fn telegram_input_name(file_name: Option<&str>, seq: usize) -> String {
    match file_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) if extension_of(name).is_some() => name.to_string(),
        Some(name) => format!("{}.mp4", name),
        None => format!("video_{}.mp4", seq + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telegram_input_name() {
        assert_eq!(telegram_input_name(Some("clip.MOV"), 0), "clip.MOV");
        assert_eq!(telegram_input_name(Some("clip"), 0), "clip.mp4");
        assert_eq!(telegram_input_name(Some("  "), 4), "video_5.mp4");
        assert_eq!(telegram_input_name(None, 0), "video_1.mp4");
    }
}

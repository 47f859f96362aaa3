//! Mocks for the Telegram-side traits and the external host.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mergecore::access::MembershipCheck;
use mergecore::broadcast::BroadcastSink;
use mergecore::collect::FileSource;
use mergecore::core::config::ChannelRef;
use mergecore::download::DownloadError;
use mergecore::progress::{ProgressMeter, ProgressSink, Stage};
use mergecore::upload::{ChatUpload, DeliveryError, ExternalHost, HostedFile};

/// Serves `video:<file_id>` as the content of every Telegram file.
#[derive(Default)]
pub struct MockFiles {
    pub delay: Mutex<Duration>,
    pub fetched: AtomicUsize,
}

impl MockFiles {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl FileSource for MockFiles {
    async fn fetch_to(&self, file_id: &str, dest: &Path, progress: &ProgressSink) -> Result<u64, DownloadError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let body = format!("video:{};", file_id);
        tokio::fs::write(dest, body.as_bytes()).await?;
        let size = body.len() as u64;
        if let Some(update) = ProgressMeter::new(Stage::Downloading, Some(size)).set(size) {
            progress.report(update);
        }
        self.fetched.fetch_add(1, Ordering::SeqCst);
        Ok(body.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    pub chat_id: i64,
    pub caption: String,
    pub content: Vec<u8>,
}

#[derive(Default)]
pub struct MockChat {
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<SentFile>>,
}

impl MockChat {
    pub fn sent(&self) -> Vec<SentFile> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatUpload for MockChat {
    async fn send_file(
        &self,
        chat_id: i64,
        path: &Path,
        caption: &str,
        _progress: &ProgressSink,
    ) -> Result<(), DeliveryError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected {
                reason: "Bad Request: file is too big".into(),
            });
        }
        let content = tokio::fs::read(path).await?;
        self.sent.lock().unwrap().push(SentFile {
            chat_id,
            caption: caption.to_string(),
            content,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MockHost {
    pub fail: AtomicBool,
    pub uploads: AtomicUsize,
}

#[async_trait]
impl ExternalHost for MockHost {
    async fn upload(&self, path: &Path, _progress: &ProgressSink) -> Result<HostedFile, DeliveryError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Host("error-notPremium".into()));
        }
        tokio::fs::metadata(path).await?;
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(HostedFile {
            link: format!("https://gofile.test/d/{}", n),
            file_id: Some(format!("file-{}", n)),
        })
    }
}

pub struct MockMembership {
    pub joined: AtomicBool,
}

impl MockMembership {
    pub fn new(joined: bool) -> Self {
        Self {
            joined: AtomicBool::new(joined),
        }
    }
}

#[async_trait]
impl MembershipCheck for MockMembership {
    async fn is_member(&self, _channel: &ChannelRef, _user_id: i64) -> Result<bool, String> {
        Ok(self.joined.load(Ordering::SeqCst))
    }
}

/// Broadcast sink rejecting a fixed set of recipients.
#[derive(Default)]
pub struct MockSink {
    pub rejecting: HashSet<i64>,
    pub delivered: Mutex<Vec<i64>>,
    pub progress: Mutex<Vec<(usize, usize)>>,
}

impl MockSink {
    pub fn rejecting(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            rejecting: ids.into_iter().collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl BroadcastSink for MockSink {
    async fn deliver(&self, user_id: i64, _text: &str) -> Result<(), DeliveryError> {
        if self.rejecting.contains(&user_id) {
            return Err(DeliveryError::Rejected {
                reason: "Forbidden: bot was blocked by the user".into(),
            });
        }
        self.delivered.lock().unwrap().push(user_id);
        Ok(())
    }

    async fn progress(&self, done: usize, total: usize) {
        self.progress.lock().unwrap().push((done, total));
    }
}

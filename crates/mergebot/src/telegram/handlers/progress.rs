//! Live progress in a status message.
//!
//! Reports arrive over a [`ProgressSink`] from the download, merge and
//! upload stages. Telegram throttles edits of a single message, so they are
//! spaced out, except that a new stage is always shown at once.

use std::time::{Duration, Instant};

use mergecore::core::utils::format_file_size;
use mergecore::progress::{Progress, ProgressSink, Stage};
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tokio::task::JoinHandle;

use super::types::edit_status;

const MIN_EDIT_INTERVAL: Duration = Duration::from_secs(3);

pub fn progress_bar(percent: u8) -> String {
    let filled = usize::from(percent.min(100) / 10);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(10 - filled))
}

fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 60 {
        format!("~{}m {}s", secs / 60, secs % 60)
    } else {
        format!("~{}s", secs)
    }
}

/// `m:ss`, or `h:mm:ss` past an hour.
fn format_clock(micros: u64) -> String {
    let secs = micros / 1_000_000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

pub fn progress_text(progress: &Progress) -> String {
    let title = match progress.stage {
        Stage::Downloading => "📥 Downloading",
        Stage::Merging => "⚙️ Merging",
        Stage::Uploading => "📤 Uploading",
    };
    let mut text = match progress.percent {
        Some(percent) => format!("{}: {}%\n{}", title, percent, progress_bar(percent)),
        None => format!("{}...", title),
    };

    let mut details = Vec::new();
    if progress.stage == Stage::Merging {
        // positions in microseconds of output
        details.push(match progress.total {
            Some(total) => format!("🎞 {} / {}", format_clock(progress.done), format_clock(total)),
            None => format!("🎞 {} written", format_clock(progress.done)),
        });
    } else {
        if let Some(rate) = progress.rate {
            details.push(format!("⚡ {}/s", format_file_size(rate as u64)));
        }
        details.push(match progress.total {
            Some(total) => format!("📦 {} / {}", format_file_size(progress.done), format_file_size(total)),
            None => format!("📦 {}", format_file_size(progress.done)),
        });
    }
    if let Some(eta) = progress.eta {
        details.push(format!("⏱️ {} left", format_eta(eta)));
    }

    text.push_str("\n\n");
    text.push_str(&details.join("\n"));
    text
}

fn edit_due(last: Option<(Instant, Stage)>, stage: Stage, now: Instant) -> bool {
    match last {
        None => true,
        Some((at, last_stage)) => last_stage != stage || now.duration_since(at) >= MIN_EDIT_INTERVAL,
    }
}

/// Edits one status message as progress comes in.
pub struct StatusProgress {
    sink: ProgressSink,
    task: JoinHandle<()>,
}

impl StatusProgress {
    pub fn start(bot: Bot, chat_id: ChatId, message_id: MessageId) -> Self {
        let (sink, mut rx) = ProgressSink::channel();
        let task = tokio::spawn(async move {
            let mut last: Option<(Instant, Stage)> = None;
            while let Some(progress) = rx.recv().await {
                if edit_due(last, progress.stage, Instant::now()) {
                    edit_status(&bot, chat_id, message_id, progress_text(&progress), None).await;
                    last = Some((Instant::now(), progress.stage));
                }
            }
        });
        Self { sink, task }
    }

    pub fn sink(&self) -> &ProgressSink {
        &self.sink
    }

    /// Stops editing. Must run before the final edit of the message, which
    /// a late progress edit would otherwise overwrite.
    pub async fn stop(self) {
        let Self { sink, task } = self;
        drop(sink);
        task.abort();
        let _ = task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn progress(stage: Stage, percent: Option<u8>, done: u64, total: Option<u64>) -> Progress {
        Progress {
            stage,
            percent,
            done,
            total,
            rate: None,
            eta: None,
        }
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0), "[░░░░░░░░░░]");
        assert_eq!(progress_bar(55), "[█████░░░░░]");
        assert_eq!(progress_bar(100), "[██████████]");
        assert_eq!(progress_bar(250), "[██████████]");
    }

    #[test]
    fn test_download_text_shows_sizes_speed_and_eta() {
        let p = Progress {
            rate: Some(2.0 * 1024.0 * 1024.0),
            eta: Some(Duration::from_secs(75)),
            ..progress(Stage::Downloading, Some(40), 4 * 1024 * 1024, Some(10 * 1024 * 1024))
        };
        let text = progress_text(&p);

        assert!(text.starts_with("📥 Downloading: 40%\n[████░░░░░░]"));
        assert!(text.contains("⚡ 2.0 MB/s"));
        assert!(text.contains("📦 4.0 MB / 10.0 MB"));
        assert!(text.contains("⏱️ ~1m 15s left"));
    }

    #[test]
    fn test_merge_text_shows_output_position() {
        let text = progress_text(&progress(Stage::Merging, Some(50), 65_000_000, Some(130_000_000)));
        assert!(text.contains("⚙️ Merging: 50%"));
        assert!(text.contains("🎞 1:05 / 2:10"));

        let unknown = progress_text(&progress(Stage::Merging, None, 3_725_000_000, None));
        assert!(unknown.starts_with("⚙️ Merging..."));
        assert!(unknown.contains("🎞 1:02:05 written"));
    }

    #[test]
    fn test_upload_without_total() {
        let text = progress_text(&progress(Stage::Uploading, None, 8 * 1024 * 1024, None));
        assert_eq!(text, "📤 Uploading...\n\n📦 8.0 MB");
    }

    #[test]
    fn test_edits_are_spaced_out_within_a_stage() {
        let start = Instant::now();
        let last = Some((start, Stage::Downloading));

        assert!(edit_due(None, Stage::Downloading, start));
        assert!(!edit_due(last, Stage::Downloading, start + Duration::from_secs(1)));
        assert!(edit_due(last, Stage::Downloading, start + MIN_EDIT_INTERVAL));
        assert!(edit_due(last, Stage::Merging, start + Duration::from_millis(10)));
    }
}

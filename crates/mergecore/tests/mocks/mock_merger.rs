//! Merger that concatenates input bytes instead of running ffmpeg.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use mergecore::merge::{MergeError, MergeStrategy, MergedOutput, Merger};
use mergecore::progress::{ProgressMeter, ProgressSink, Stage};
use mergecore::session::StagedInput;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MockMerger {
    /// Fail every merge with a fixed diagnostic
    pub fail: AtomicBool,
    /// Block until cancelled
    pub hang: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockMerger {
    pub fn failing() -> Self {
        let merger = Self::default();
        merger.fail.store(true, Ordering::SeqCst);
        merger
    }

    pub fn hanging() -> Self {
        let merger = Self::default();
        merger.hang.store(true, Ordering::SeqCst);
        merger
    }
}

#[async_trait]
impl Merger for MockMerger {
    async fn merge(
        &self,
        inputs: &[StagedInput],
        output_dir: &Path,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<MergedOutput, MergeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.hang.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(MergeError::Cancelled);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(MergeError::Failed("Invalid data found when processing input".into()));
        }

        // one step of progress per input
        let mut meter = ProgressMeter::new(Stage::Merging, Some(inputs.len() as u64));
        let mut merged = Vec::new();
        for input in inputs {
            let bytes = tokio::fs::read(&input.path)
                .await
                .map_err(|e| MergeError::Failed(e.to_string()))?;
            merged.extend_from_slice(&bytes);
            if let Some(update) = meter.advance(1) {
                progress.report(update);
            }
        }
        let path = output_dir.join("merged.mp4");
        tokio::fs::write(&path, &merged)
            .await
            .map_err(|e| MergeError::Failed(e.to_string()))?;

        Ok(MergedOutput {
            path,
            name: "merged.mp4".into(),
            size_bytes: merged.len() as u64,
            strategy: MergeStrategy::StreamCopy,
        })
    }
}

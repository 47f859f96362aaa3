//! Merge pipeline: runs a [`MergeJob`] through merge and delivery and takes
//! care of the bookkeeping around it.
//!
//! | result            | merge log                      | staged files         | session |
//! |-------------------|--------------------------------|----------------------|---------|
//! | delivered         | success / delivered            | released             | Idle    |
//! | delivery failed   | success / delivery_failed      | output retained      | Idle    |
//! | merge failed      | failure / not_attempted        | released             | Idle    |
//! | cancelled         | none                           | released here        | Idle    |

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::core::error::AppResult;
use crate::merge::{MergeError, MergedOutput, Merger};
use crate::progress::ProgressSink;
use crate::session::{MergeJob, RetainedOutput, SessionRegistry};
use crate::storage::logs::{insert_merge_log, DeliveryOutcome, MergeStatus, NewMergeLog, OutputDescriptor};
use crate::storage::{db, get_connection, DbPool};
use crate::upload::{DeliveryError, DeliveryReceipt, UploadDispatcher};

#[derive(Debug)]
pub enum PipelineOutcome {
    Delivered {
        receipt: DeliveryReceipt,
        output: OutputDescriptor,
        log_id: String,
    },
    MergeFailed {
        reason: String,
        log_id: String,
    },
    DeliveryFailed {
        error: DeliveryError,
        output: OutputDescriptor,
        log_id: String,
    },
    Cancelled,
}

pub struct MergePipeline {
    pool: Arc<DbPool>,
    sessions: Arc<SessionRegistry>,
    merger: Arc<dyn Merger>,
    dispatcher: Arc<UploadDispatcher>,
}

impl MergePipeline {
    pub fn new(
        pool: Arc<DbPool>,
        sessions: Arc<SessionRegistry>,
        merger: Arc<dyn Merger>,
        dispatcher: Arc<UploadDispatcher>,
    ) -> Self {
        Self {
            pool,
            sessions,
            merger,
            dispatcher,
        }
    }

    /// Session state and staged files are settled on every path before a
    /// failure to write the merge log is returned.
    pub async fn run(&self, job: MergeJob, progress: &ProgressSink) -> AppResult<PipelineOutcome> {
        let started = Instant::now();
        let staging = self.sessions.staging();

        if job.cancel.is_cancelled() {
            staging.release(&job.dir).await;
            return Ok(PipelineOutcome::Cancelled);
        }

        let merged = match self.merger.merge(&job.inputs, &job.dir, &job.cancel, progress).await {
            Ok(merged) => merged,
            Err(_) if job.cancel.is_cancelled() => {
                staging.release(&job.dir).await;
                return Ok(PipelineOutcome::Cancelled);
            }
            Err(MergeError::Cancelled) => {
                staging.release(&job.dir).await;
                return Ok(PipelineOutcome::Cancelled);
            }
            Err(MergeError::Failed(reason)) => {
                log::warn!("❌ Merge failed for user {}: {}", job.user_id, reason);
                let logged = self.record(
                    &job,
                    None,
                    MergeStatus::Failure,
                    DeliveryOutcome::NotAttempted,
                    Some(reason.clone()),
                );
                self.sessions.finish(job.user_id, job.session_id);
                staging.release(&job.dir).await;
                let log_id = logged?;
                return Ok(PipelineOutcome::MergeFailed { reason, log_id });
            }
        };

        if !self.sessions.mark_uploading(job.user_id, job.session_id) {
            staging.release(&job.dir).await;
            return Ok(PipelineOutcome::Cancelled);
        }

        let output = merged.descriptor();
        match self
            .dispatcher
            .deliver(job.chat_id, &merged, job.mode, &job.cancel, progress)
            .await
        {
            Ok(receipt) => {
                let logged = self.record(
                    &job,
                    Some(output.clone()),
                    MergeStatus::Success,
                    DeliveryOutcome::Delivered,
                    None,
                );
                self.sessions.finish(job.user_id, job.session_id);
                staging.release(&job.dir).await;
                let log_id = logged?;
                log::info!(
                    "✅ Merge for user {} delivered via {} in {:.1}s",
                    job.user_id,
                    job.mode.as_str(),
                    started.elapsed().as_secs_f64()
                );
                Ok(PipelineOutcome::Delivered {
                    receipt,
                    output,
                    log_id,
                })
            }
            Err(DeliveryError::Cancelled) => {
                staging.release(&job.dir).await;
                Ok(PipelineOutcome::Cancelled)
            }
            Err(_) if job.cancel.is_cancelled() => {
                staging.release(&job.dir).await;
                Ok(PipelineOutcome::Cancelled)
            }
            Err(error) => {
                log::warn!("📭 Delivery to chat {} failed: {}", job.chat_id, error);
                let logged = self.record(
                    &job,
                    Some(output.clone()),
                    MergeStatus::Success,
                    DeliveryOutcome::DeliveryFailed,
                    Some(error.to_string()),
                );
                if self.sessions.finish(job.user_id, job.session_id) {
                    self.retain(&job, &merged).await;
                } else {
                    // cancelled after the upload gave up
                    staging.release(&job.dir).await;
                }
                let log_id = logged?;
                Ok(PipelineOutcome::DeliveryFailed { error, output, log_id })
            }
        }
    }

    /// Keeps the merged output for a later re-delivery and drops the inputs.
    async fn retain(&self, job: &MergeJob, merged: &MergedOutput) {
        let staging = self.sessions.staging();
        if let Err(e) = staging.release_all_except(&job.dir, &merged.path).await {
            log::warn!("Failed to drop inputs of {}: {}", job.dir.display(), e);
        }
        let displaced = self.sessions.retain_output(RetainedOutput {
            user_id: job.user_id,
            chat_id: job.chat_id,
            output: merged.clone(),
            dir: job.dir.clone(),
            retained_at: Instant::now(),
        });
        if let Some(old) = displaced {
            staging.release(&old.dir).await;
        }
    }

    fn record(
        &self,
        job: &MergeJob,
        output: Option<OutputDescriptor>,
        status: MergeStatus,
        delivery_outcome: DeliveryOutcome,
        error: Option<String>,
    ) -> AppResult<String> {
        let entry = NewMergeLog {
            user_id: job.user_id,
            chat_id: job.chat_id,
            inputs: job.inputs.iter().map(|i| i.descriptor()).collect(),
            output,
            status,
            delivery_mode: Some(job.mode.as_str().to_string()),
            delivery_outcome,
            error,
        };

        let mut conn = get_connection(&self.pool)?;
        let tx = conn.transaction()?;
        let id = insert_merge_log(&tx, &entry, Utc::now())?;
        if status == MergeStatus::Success {
            db::increment_merge_count(&tx, job.user_id)?;
        }
        tx.commit()?;
        Ok(id)
    }
}

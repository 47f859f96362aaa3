//! Inline keyboard callbacks: merge, delivery choice, re-delivery and the
//! admin panel.

use mergecore::access::Capability;
use mergecore::core::utils::format_file_size;
use mergecore::pipeline::PipelineOutcome;
use mergecore::session::MergeJob;
use mergecore::upload::{DeliveryMode, DeliveryReceipt};
use mergecore::AppError;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, MessageId};

use super::commands::{cancel_text, queue_summary_text};
use super::progress::StatusProgress;
use super::types::{announce_new_user, callback_context, edit_status, log_unexpected, HandlerDeps, HandlerError};
use crate::telegram::admin::format_stats;
use crate::telegram::keyboards::{admin_keyboard, delivery_keyboard, redeliver_keyboard, CallbackAction};
use crate::telegram::notifications::notify_merge;

/// Status text for a finished pipeline run, and whether the re-delivery
/// button should be offered.
pub fn outcome_text(outcome: &PipelineOutcome) -> (String, bool) {
    match outcome {
        PipelineOutcome::Delivered { receipt, output, .. } => {
            let size = format_file_size(output.size_bytes);
            let text = match receipt {
                DeliveryReceipt::Uploaded => format!("✅ Done! {} ({}) is above.", output.name, size),
                DeliveryReceipt::Hosted { link } => {
                    format!("✅ Done! {} ({})\n\n☁️ Download: {}", output.name, size, link)
                }
            };
            (text, false)
        }
        PipelineOutcome::MergeFailed { reason, .. } => (
            format!("❌ The videos could not be merged.\n\n{}", reason),
            false,
        ),
        PipelineOutcome::DeliveryFailed { error, output, .. } => (
            format!(
                "⚠️ {} ({}) was merged but could not be delivered:\n{}\n\nYou can get it as a download link instead.",
                output.name,
                format_file_size(output.size_bytes),
                error
            ),
            true,
        ),
        PipelineOutcome::Cancelled => ("🛑 Merge cancelled.".to_string(), false),
    }
}

async fn answer(bot: &Bot, q: &CallbackQuery, text: Option<String>, alert: bool) -> Result<(), HandlerError> {
    let request = bot.answer_callback_query(q.id.clone());
    match text {
        Some(text) => request.text(text).show_alert(alert).await?,
        None => request.await?,
    };
    Ok(())
}

async fn answer_error(bot: &Bot, q: &CallbackQuery, err: &AppError) -> Result<(), HandlerError> {
    if let Some(message) = &q.message {
        log_unexpected(message.chat().id, err);
    }
    answer(bot, q, Some(err.user_message()), true).await
}

pub(super) async fn handle_callback(bot: &Bot, q: &CallbackQuery, deps: &HandlerDeps) -> Result<(), HandlerError> {
    let action = q.data.as_deref().and_then(CallbackAction::parse);
    let (Some(action), Some(ctx), Some(message)) = (action, callback_context(q), q.message.as_ref()) else {
        return answer(bot, q, None, false).await;
    };
    let chat_id = message.chat().id;
    let message_id = message.id();
    log::info!("Callback {:?} from user {} in chat {}", action, ctx.user_id, chat_id);

    match action {
        CallbackAction::MergeNow => match deps.service.preview_merge(&ctx).await {
            Ok(snapshot) => {
                answer(bot, q, None, false).await?;
                edit_status(bot, chat_id, message_id, queue_summary_text(&snapshot), Some(delivery_keyboard())).await;
            }
            Err(e) => answer_error(bot, q, &e).await?,
        },
        CallbackAction::ClearQueue => {
            let outcome = deps.service.cancel(ctx.user_id).await;
            answer(bot, q, None, false).await?;
            edit_status(bot, chat_id, message_id, cancel_text(&outcome), None).await;
        }
        CallbackAction::Upload(mode) => match deps.service.request_merge(&ctx, mode).await {
            Ok(job) => {
                answer(bot, q, Some("⏳ Merging...".to_string()), false).await?;
                let text = format!(
                    "⏳ Merging {} videos, then {}. Send /cancel to stop.",
                    job.inputs.len(),
                    match mode {
                        DeliveryMode::TelegramUpload => "uploading here",
                        DeliveryMode::ExternalHost => "uploading to GoFile",
                    }
                );
                edit_status(bot, chat_id, message_id, text, None).await;

                let bot = bot.clone();
                let deps = deps.clone();
                tokio::spawn(async move {
                    run_merge(&bot, &deps, job, chat_id, message_id).await;
                });
            }
            Err(e) => answer_error(bot, q, &e).await?,
        },
        CallbackAction::Redeliver => {
            answer(bot, q, Some("☁️ Uploading...".to_string()), false).await?;
            edit_status(bot, chat_id, message_id, "☁️ Uploading to GoFile...", None).await;

            let bot = bot.clone();
            let deps = deps.clone();
            tokio::spawn(async move {
                let progress = StatusProgress::start(bot.clone(), chat_id, message_id);
                let delivered = deps.service.redeliver(&ctx, progress.sink()).await;
                progress.stop().await;
                let (text, keyboard) = match delivered {
                    Ok(DeliveryReceipt::Hosted { link }) => (format!("✅ Here is your file:\n{}", link), None),
                    Ok(DeliveryReceipt::Uploaded) => ("✅ Done!".to_string(), None),
                    Err(e) => {
                        log_unexpected(chat_id, &e);
                        let retry = deps
                            .service
                            .sessions()
                            .has_retained(ctx.user_id)
                            .then(redeliver_keyboard);
                        (e.user_message(), retry)
                    }
                };
                edit_status(&bot, chat_id, message_id, text, keyboard).await;
            });
        }
        CallbackAction::CheckSubscription => match deps.service.admit(&ctx, Capability::UseBot).await {
            Ok(admission) => {
                if admission.new_user {
                    announce_new_user(bot, deps, &ctx);
                }
                answer(bot, q, Some("✅ Thanks for joining!".to_string()), false).await?;
                edit_status(
                    bot,
                    chat_id,
                    message_id,
                    "✅ You're all set. Send me the videos to merge.",
                    None,
                )
                .await;
            }
            Err(e) => answer_error(bot, q, &e).await?,
        },
        CallbackAction::AdminStats => match deps.service.stats(ctx.user_id) {
            Ok(stats) => {
                answer(bot, q, None, false).await?;
                edit_status(bot, chat_id, message_id, format_stats(&stats), Some(admin_keyboard())).await;
            }
            Err(e) => answer_error(bot, q, &e).await?,
        },
    }
    Ok(())
}

async fn run_merge(bot: &Bot, deps: &HandlerDeps, job: MergeJob, chat_id: ChatId, message_id: MessageId) {
    let user_id = job.user_id;
    let progress = StatusProgress::start(bot.clone(), chat_id, message_id);
    let result = deps.service.run(job, progress.sink()).await;
    progress.stop().await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("Merge pipeline for user {} failed: {}", user_id, e);
            edit_status(bot, chat_id, message_id, e.user_message(), None).await;
            return;
        }
    };

    let (text, offer_redelivery) = outcome_text(&outcome);
    let keyboard = offer_redelivery.then(redeliver_keyboard);
    edit_status(bot, chat_id, message_id, text, keyboard).await;
    notify_merge(bot, deps.service.settings(), user_id, &outcome).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mergecore::storage::logs::OutputDescriptor;
    use mergecore::upload::DeliveryError;

    fn output() -> OutputDescriptor {
        OutputDescriptor {
            name: "merged.mp4".into(),
            size_bytes: 3 * 1024 * 1024,
            strategy: "stream_copy".into(),
        }
    }

    #[test]
    fn test_hosted_outcome_shows_link() {
        let outcome = PipelineOutcome::Delivered {
            receipt: DeliveryReceipt::Hosted {
                link: "https://gofile.io/d/xyz".into(),
            },
            output: output(),
            log_id: "1".into(),
        };
        let (text, redeliver) = outcome_text(&outcome);
        assert!(text.contains("https://gofile.io/d/xyz"));
        assert!(!redeliver);
    }

    #[test]
    fn test_failed_delivery_offers_redelivery() {
        let outcome = PipelineOutcome::DeliveryFailed {
            error: DeliveryError::Rejected {
                reason: "Request Entity Too Large".into(),
            },
            output: output(),
            log_id: "2".into(),
        };
        let (text, redeliver) = outcome_text(&outcome);
        assert!(text.contains("merged.mp4"));
        assert!(redeliver);
    }

    #[test]
    fn test_merge_failure_shows_reason() {
        let outcome = PipelineOutcome::MergeFailed {
            reason: "Invalid data found when processing input".into(),
            log_id: "3".into(),
        };
        let (text, redeliver) = outcome_text(&outcome);
        assert!(text.contains("Invalid data"));
        assert!(!redeliver);
    }
}

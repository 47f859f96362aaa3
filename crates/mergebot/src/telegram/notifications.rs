//! Log-channel notifications: new users go to LOG_CHANNEL, finished merges
//! to MERGE_LOG_CHANNEL. Both are optional and best effort.

use mergecore::core::utils::format_file_size;
use mergecore::pipeline::PipelineOutcome;
use mergecore::upload::DeliveryReceipt;
use mergecore::{RequestContext, Settings};
use teloxide::prelude::*;

pub fn new_user_text(ctx: &RequestContext) -> String {
    let username = ctx
        .username
        .as_deref()
        .map(|u| format!("@{}", u))
        .unwrap_or_else(|| "no username".to_string());
    format!(
        "👤 New user\nID: {}\nName: {}\nUsername: {}",
        ctx.user_id,
        ctx.first_name.as_deref().unwrap_or("-"),
        username
    )
}

/// `None` for outcomes that are not worth a log entry (cancelled merges).
pub fn merge_text(user_id: i64, outcome: &PipelineOutcome) -> Option<String> {
    let text = match outcome {
        PipelineOutcome::Delivered { receipt, output, log_id } => {
            let via = match receipt {
                DeliveryReceipt::Uploaded => "Telegram".to_string(),
                DeliveryReceipt::Hosted { link } => format!("GoFile {}", link),
            };
            format!(
                "✅ Merge {}\nUser: {}\nOutput: {} ({}, {})\nDelivered via {}",
                log_id,
                user_id,
                output.name,
                format_file_size(output.size_bytes),
                output.strategy,
                via
            )
        }
        PipelineOutcome::DeliveryFailed { error, output, log_id } => format!(
            "⚠️ Merge {}\nUser: {}\nOutput: {} ({})\nDelivery failed: {}",
            log_id,
            user_id,
            output.name,
            format_file_size(output.size_bytes),
            error
        ),
        PipelineOutcome::MergeFailed { reason, log_id } => {
            format!("❌ Merge {}\nUser: {}\nffmpeg: {}", log_id, user_id, reason)
        }
        PipelineOutcome::Cancelled => return None,
    };
    Some(text)
}

async fn send_to_channel(bot: &Bot, channel: Option<i64>, text: String) {
    let Some(channel) = channel else {
        return;
    };
    if let Err(e) = bot.send_message(ChatId(channel), text).await {
        log::warn!("Failed to post to log channel {}: {}", channel, e);
    }
}

pub async fn notify_new_user(bot: &Bot, settings: &Settings, ctx: &RequestContext) {
    send_to_channel(bot, settings.log_channel, new_user_text(ctx)).await;
}

pub async fn notify_merge(bot: &Bot, settings: &Settings, user_id: i64, outcome: &PipelineOutcome) {
    if let Some(text) = merge_text(user_id, outcome) {
        send_to_channel(bot, settings.merge_log_channel, text).await;
    }
}

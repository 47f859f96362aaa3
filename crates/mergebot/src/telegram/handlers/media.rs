//! Video and link intake.
//!
//! Access is checked before anything is posted, so a rejected sender only
//! sees the reason. The dispatcher handles one update per chat at a time,
//! so the download itself runs in a spawned task; otherwise /cancel could
//! not get through while a large file is being fetched.

use mergecore::access::Capability;
use mergecore::collect::{Collected, IncomingMedia};
use mergecore::core::utils::{format_file_size, is_video_name};
use mergecore::download::{parse_link, DownloadError};
use mergecore::session::{SessionError, MIN_INPUTS};
use mergecore::{AppError, RequestContext};
use teloxide::prelude::*;
use teloxide::types::{Message, MessageId};

use super::progress::StatusProgress;
use super::types::{
    announce_new_user, edit_status, error_markup, log_unexpected, message_context, reply_error, HandlerDeps, HandlerError,
};
use crate::telegram::keyboards::queue_keyboard;

/// Extracts a video sent as a video or as a document with a video type.
pub fn incoming_media(msg: &Message) -> Option<IncomingMedia> {
    if let Some(video) = msg.video() {
        return Some(IncomingMedia::TelegramFile {
            file_id: video.file.id.0.clone(),
            file_name: video.file_name.clone(),
            size_bytes: Some(u64::from(video.file.size)),
        });
    }

    let document = msg.document()?;
    let by_mime = document
        .mime_type
        .as_ref()
        .is_some_and(|mime| mime.essence_str().starts_with("video/"));
    let by_name = document.file_name.as_deref().is_some_and(is_video_name);
    if !by_mime && !by_name {
        return None;
    }
    Some(IncomingMedia::TelegramFile {
        file_id: document.file.id.0.clone(),
        file_name: document.file_name.clone(),
        size_bytes: Some(u64::from(document.file.size)),
    })
}

/// First http(s) link in a message text.
pub fn link_in_text(text: &str) -> Option<IncomingMedia> {
    text.split_whitespace().find_map(parse_link).map(IncomingMedia::Link)
}

pub fn collected_text(collected: &Collected) -> String {
    let next = if collected.staged < MIN_INPUTS {
        "Send at least one more video to merge."
    } else {
        "Send more videos, or press \"Merge now\"."
    };
    format!(
        "✅ Added video #{}: {} ({})\n\n{}",
        collected.staged,
        collected.name,
        format_file_size(collected.size_bytes),
        next
    )
}

pub(super) async fn handle_media(bot: Bot, msg: Message, deps: HandlerDeps, media: IncomingMedia) -> Result<(), HandlerError> {
    let Some(ctx) = message_context(&msg) else {
        return Ok(());
    };
    let admission = match deps.service.admit(&ctx, Capability::UseBot).await {
        Ok(admission) => admission,
        Err(e) => return reply_error(&bot, &deps, msg.chat.id, &e).await,
    };
    if admission.new_user {
        announce_new_user(&bot, &deps, &ctx);
    }
    let status = bot.send_message(msg.chat.id, "📥 Downloading...").await?;

    tokio::spawn(async move {
        collect(&bot, &deps, &ctx, media, status.id).await;
    });
    Ok(())
}

/// Text addressed to the bot: a link is collected, anything else gets a
/// hint in private chats.
pub(super) async fn handle_text(bot: Bot, msg: Message, deps: HandlerDeps) -> Result<(), HandlerError> {
    let Some(text) = msg.text() else {
        return Ok(());
    };

    match link_in_text(text) {
        Some(media) => handle_media(bot, msg, deps, media).await,
        None => {
            if msg.chat.is_private() {
                bot.send_message(
                    msg.chat.id,
                    "🎞 Send me videos, or direct links to video files, and I will merge them. See /help.",
                )
                .await?;
            }
            Ok(())
        }
    }
}

async fn collect(bot: &Bot, deps: &HandlerDeps, ctx: &RequestContext, media: IncomingMedia, status_id: MessageId) {
    let chat_id = ChatId(ctx.chat_id);
    let progress = StatusProgress::start(bot.clone(), chat_id, status_id);
    let result = deps.service.collect_admitted(ctx, media, progress.sink()).await;
    progress.stop().await;

    match result {
        Ok(collected) => {
            let keyboard = (collected.staged >= MIN_INPUTS).then(queue_keyboard);
            edit_status(bot, chat_id, status_id, collected_text(&collected), keyboard).await;
        }
        Err(AppError::Session(SessionError::Stale)) | Err(AppError::Download(DownloadError::Cancelled)) => {
            edit_status(bot, chat_id, status_id, SessionError::Stale.to_string(), None).await;
        }
        Err(e) => {
            log_unexpected(chat_id, &e);
            edit_status(bot, chat_id, status_id, e.user_message(), error_markup(deps, &e)).await;
        }
    }
}

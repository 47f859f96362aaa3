//! Handler types, dependencies and request helpers

use std::sync::Arc;

use mergecore::access::{AccessDenied, ChatKind};
use mergecore::{AppError, MergeService, RequestContext};
use teloxide::prelude::*;
use teloxide::types::{Chat, InlineKeyboardMarkup, Message, MessageId, User, UserId};

use crate::telegram::keyboards::subscribe_keyboard;
use crate::telegram::notifications::notify_new_user;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Dependencies required by handlers
#[derive(Clone)]
pub struct HandlerDeps {
    pub service: Arc<MergeService>,
    pub bot_username: Option<String>,
    pub bot_id: UserId,
}

impl HandlerDeps {
    pub fn new(service: Arc<MergeService>, bot_username: Option<String>, bot_id: UserId) -> Self {
        Self {
            service,
            bot_username,
            bot_id,
        }
    }
}

fn chat_kind(chat: &Chat) -> ChatKind {
    if chat.is_private() {
        ChatKind::Private
    } else if chat.is_channel() {
        ChatKind::Channel
    } else {
        ChatKind::Group
    }
}

fn context_for(user: &User, chat: &Chat) -> Option<RequestContext> {
    Some(RequestContext {
        user_id: i64::try_from(user.id.0).ok()?,
        chat_id: chat.id.0,
        chat_kind: chat_kind(chat),
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
    })
}

/// Who sent `msg`, and where. `None` for anonymous senders.
pub fn message_context(msg: &Message) -> Option<RequestContext> {
    context_for(msg.from.as_ref()?, &msg.chat)
}

/// Context of a button press on one of the bot's messages.
pub fn callback_context(q: &CallbackQuery) -> Option<RequestContext> {
    let message = q.message.as_ref()?;
    context_for(&q.from, message.chat())
}

/// Keyboard to attach to an error reply, if the error has a remedy the
/// user can click.
pub fn error_markup(deps: &HandlerDeps, err: &AppError) -> Option<InlineKeyboardMarkup> {
    match (err, &deps.service.settings().force_sub_channel) {
        (AppError::Access(AccessDenied::NotSubscribed { .. }), Some(channel)) => Some(subscribe_keyboard(channel)),
        _ => None,
    }
}

pub fn log_unexpected(chat_id: ChatId, err: &AppError) {
    if !matches!(err, AppError::Access(_) | AppError::Session(_) | AppError::Validation(_)) {
        log::error!("Request in chat {} failed: {}", chat_id, err);
    }
}

/// Tells the user why their request failed. Infrastructure errors are
/// logged and reported generically.
pub async fn reply_error(bot: &Bot, deps: &HandlerDeps, chat_id: ChatId, err: &AppError) -> Result<(), HandlerError> {
    log_unexpected(chat_id, err);
    let request = bot.send_message(chat_id, err.user_message());
    match error_markup(deps, err) {
        Some(keyboard) => request.reply_markup(keyboard).await?,
        None => request.await?,
    };
    Ok(())
}

/// Replaces the text of a status message. Failures are only logged: the
/// message may have been deleted, or already show the same text.
pub async fn edit_status(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: impl Into<String>,
    keyboard: Option<InlineKeyboardMarkup>,
) {
    let request = bot.edit_message_text(chat_id, message_id, text);
    let result = match keyboard {
        Some(keyboard) => request.reply_markup(keyboard).await,
        None => request.await,
    };
    if let Err(e) = result {
        log::debug!("Failed to edit message {} in chat {}: {}", message_id.0, chat_id, e);
    }
}

/// Posts the new-user notice in the background.
pub fn announce_new_user(bot: &Bot, deps: &HandlerDeps, ctx: &RequestContext) {
    let bot = bot.clone();
    let service = deps.service.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        notify_new_user(&bot, service.settings(), &ctx).await;
    });
}

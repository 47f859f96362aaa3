//! Bot initialization and message routing utilities
//!
//! This module contains:
//! - Command enum definition
//! - Bot instance creation
//! - Message addressing logic (private chats, mentions, replies)

use mergecore::Settings;
use reqwest::ClientBuilder;
use secrecy::ExposeSecret;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatKind, Message, MessageEntityKind, UserId};
use teloxide::utils::command::BotCommands;

/// Bot commands enum with descriptions
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "start the bot")]
    Start,
    #[command(description = "how to merge videos")]
    Help,
    #[command(description = "about this bot")]
    About,
    #[command(description = "merge the queued videos")]
    Merge,
    #[command(description = "discard the queued videos")]
    Cancel,
    #[command(description = "usage statistics (admins)")]
    Stats,
    #[command(description = "admin panel (admins)")]
    Admin,
    #[command(description = "send a message to every user (owner)")]
    Broadcast(String),
    #[command(description = "ban a user: /ban <user_id> (admins)")]
    Ban(String),
    #[command(description = "lift a ban: /unban <user_id> (admins)")]
    Unban(String),
    #[command(description = "allow a group: /authorize [chat_id] (admins)")]
    Authorize(String),
    #[command(description = "revoke a group: /unauthorize [chat_id] (admins)")]
    Unauthorize(String),
}

/// Creates a Bot instance with custom or default API URL
///
/// # Returns
/// * `Ok(Bot)` - Successfully created bot instance
/// * `Err(anyhow::Error)` - Failed to build the HTTP client
pub fn create_bot(settings: &Settings) -> anyhow::Result<Bot> {
    let client = ClientBuilder::new().timeout(settings.request_timeout).build()?;
    let bot = Bot::with_client(settings.bot_token.expose_secret(), client);

    let bot = match &settings.bot_api_url {
        Some(url) => {
            log::info!("Using custom Bot API URL: {}", url);
            bot.set_api_url(url.clone())
        }
        None => bot,
    };

    Ok(bot)
}

/// Commands shown in the Telegram menu. Staff commands stay out of it.
pub fn public_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("start", "start the bot"),
        BotCommand::new("help", "how to merge videos"),
        BotCommand::new("merge", "merge the queued videos"),
        BotCommand::new("cancel", "discard the queued videos"),
        BotCommand::new("about", "about this bot"),
    ]
}

/// Sets up bot commands in Telegram UI
pub async fn setup_bot_commands(bot: &Bot) -> Result<(), teloxide::RequestError> {
    bot.set_my_commands(public_commands()).await?;
    Ok(())
}

/// Checks if a message is addressed to the bot
///
/// # Arguments
/// * `msg` - Message to check
/// * `bot_username` - Bot's username (without @)
/// * `bot_id` - Bot's user ID
///
/// # Returns
/// * `true` if message is addressed to bot (private chat, bot mention, reply to bot message)
/// * `false` otherwise
pub fn is_message_addressed_to_bot(msg: &Message, bot_username: Option<&str>, bot_id: UserId) -> bool {
    if matches!(msg.chat.kind, ChatKind::Private(_)) {
        return true;
    }

    if let Some(from) = msg.reply_to_message().and_then(|reply| reply.from.as_ref()) {
        if from.id == bot_id {
            return true;
        }
    }

    let (Some(text), Some(username)) = (msg.text(), bot_username) else {
        return false;
    };

    if let Some(entities) = msg.parse_entities() {
        for entity in entities {
            if matches!(entity.kind(), MessageEntityKind::Mention) {
                let mention = entity.text();
                let mention_username = mention.strip_prefix('@').unwrap_or(mention);
                if mention_username.eq_ignore_ascii_case(username) {
                    return true;
                }
            }
        }
    }

    text.contains(&format!("@{}", username))
}

//! Command handler implementations

use mergecore::access::Capability;
use mergecore::core::utils::format_file_size;
use mergecore::session::{CancelOutcome, SessionSnapshot, SessionState};
use mergecore::{AppError, RequestContext, Settings};
use teloxide::prelude::*;
use teloxide::types::Message;
use teloxide::utils::command::BotCommands;

use super::types::{announce_new_user, message_context, reply_error, HandlerDeps, HandlerError};
use crate::telegram::admin::{admin_panel_text, format_broadcast_report, format_stats, parse_chat_id, parse_user_id};
use crate::telegram::bot::Command;
use crate::telegram::keyboards::{admin_keyboard, delivery_keyboard, links_keyboard};
use crate::telegram::transport::TelegramBroadcast;

pub fn welcome_text(settings: &Settings, first_name: Option<&str>) -> String {
    format!(
        "👋 Hi {}!\n\n\
         I am {}. Send me two or more videos, or direct links to video files, \
         and I will merge them into one in the order you sent them.\n\n\
         When everything is queued, press \"Merge now\" or send /merge. /help has the details.",
        first_name.unwrap_or("there"),
        settings.bot_name
    )
}

pub fn help_text(settings: &Settings) -> String {
    format!(
        "🎬 How to merge videos\n\n\
         1. Send the videos (as video or file) or direct download links, one by one.\n\
         2. Send /merge or press \"Merge now\".\n\
         3. Choose how to receive the result: uploaded here, or as a GoFile link for big files.\n\n\
         Videos with the same format are joined without re-encoding. Mixed formats are \
         re-encoded to 720p, which takes longer.\n\n\
         Limits: {} per input, {} per upload to Telegram.\n\
         /cancel discards everything you queued.\n\n{}",
        format_file_size(settings.max_download_bytes),
        format_file_size(settings.max_upload_bytes),
        Command::descriptions()
    )
}

pub fn about_text(settings: &Settings) -> String {
    let mut text = format!("🤖 {}", settings.bot_name);
    if let Some(username) = &settings.bot_username {
        text.push_str(&format!(" (@{})", username.trim_start_matches('@')));
    }
    text.push_str("\n\nMerges your videos with ffmpeg.");
    if let Some(developer) = &settings.developer {
        text.push_str(&format!("\n👨‍💻 Developer: {}", developer));
    }
    if let Some(channel) = &settings.update_channel {
        text.push_str(&format!("\n📢 Updates: {}", channel));
    }
    if let Some(group) = &settings.support_group {
        text.push_str(&format!("\n💬 Support: {}", group));
    }
    text
}

/// Queue listing shown before the delivery choice.
pub fn queue_summary_text(snapshot: &SessionSnapshot) -> String {
    let mut text = format!("🎬 {} videos queued:\n", snapshot.input_names.len());
    for (i, name) in snapshot.input_names.iter().enumerate() {
        text.push_str(&format!("{}. {}\n", i + 1, name));
    }
    text.push_str("\nHow should I deliver the result?");
    text
}

pub fn cancel_text(outcome: &CancelOutcome) -> String {
    if outcome.is_noop() {
        return "🤷 Nothing to cancel.".to_string();
    }
    match outcome.previous {
        SessionState::Merging | SessionState::Uploading => "🛑 Merge cancelled, files removed.".to_string(),
        SessionState::Collecting => format!(
            "🗑 Queue cleared, {} video(s) discarded.",
            outcome.discarded_inputs
        ),
        _ => "🗑 The merged file kept for re-delivery was discarded.".to_string(),
    }
}

pub(super) async fn handle_command(bot: &Bot, msg: &Message, cmd: Command, deps: &HandlerDeps) -> Result<(), HandlerError> {
    let Some(ctx) = message_context(msg) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;
    let settings = deps.service.settings();

    let result: Result<(), AppError> = match cmd {
        Command::Start => match deps.service.admit(&ctx, Capability::UseBot).await {
            Ok(admission) => {
                if admission.new_user {
                    announce_new_user(bot, deps, &ctx);
                }
                let request = bot.send_message(chat_id, welcome_text(settings, ctx.first_name.as_deref()));
                match links_keyboard(settings) {
                    Some(keyboard) => request.reply_markup(keyboard).await?,
                    None => request.await?,
                };
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Help => match deps.service.admit(&ctx, Capability::UseBot).await {
            Ok(_) => {
                bot.send_message(chat_id, help_text(settings)).await?;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::About => {
            let request = bot.send_message(chat_id, about_text(settings));
            match links_keyboard(settings) {
                Some(keyboard) => request.reply_markup(keyboard).await?,
                None => request.await?,
            };
            Ok(())
        }
        Command::Cancel => {
            let outcome = deps.service.cancel(ctx.user_id).await;
            bot.send_message(chat_id, cancel_text(&outcome)).await?;
            Ok(())
        }
        Command::Merge => match deps.service.preview_merge(&ctx).await {
            Ok(snapshot) => {
                bot.send_message(chat_id, queue_summary_text(&snapshot))
                    .reply_markup(delivery_keyboard())
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Stats => match deps.service.stats(ctx.user_id) {
            Ok(stats) => {
                bot.send_message(chat_id, format_stats(&stats)).await?;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Admin => match deps.service.access().require(ctx.user_id, Capability::AdminPanel) {
            Ok(role) => {
                bot.send_message(chat_id, admin_panel_text(role))
                    .reply_markup(admin_keyboard())
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Command::Broadcast(text) => start_broadcast(bot, msg, deps, &ctx, text).await,
        Command::Ban(arg) => match parse_user_id(&arg) {
            Ok(target) => match deps.service.ban(ctx.user_id, target).await {
                Ok(user) => {
                    bot.send_message(chat_id, format!("🚫 {} is banned.", user.display_name()))
                        .await?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(usage) => Err(AppError::Validation(usage)),
        },
        Command::Unban(arg) => match parse_user_id(&arg) {
            Ok(target) => match deps.service.unban(ctx.user_id, target) {
                Ok(user) => {
                    bot.send_message(chat_id, format!("✅ {} is no longer banned.", user.display_name()))
                        .await?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(usage) => Err(AppError::Validation(usage.replace("/ban", "/unban"))),
        },
        Command::Authorize(arg) => match parse_chat_id(&arg, chat_id.0) {
            Ok(target) => match deps.service.authorize(ctx.user_id, target) {
                Ok(added) => {
                    let text = if added {
                        format!("🔓 Chat {} is now authorized.", target)
                    } else {
                        format!("ℹ️ Chat {} was already authorized.", target)
                    };
                    bot.send_message(chat_id, text).await?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(usage) => Err(AppError::Validation(usage)),
        },
        Command::Unauthorize(arg) => match parse_chat_id(&arg, chat_id.0) {
            Ok(target) => match deps.service.unauthorize(ctx.user_id, target) {
                Ok(removed) => {
                    let text = if removed {
                        format!("🔒 Chat {} is no longer authorized.", target)
                    } else {
                        format!("ℹ️ Chat {} was not authorized.", target)
                    };
                    bot.send_message(chat_id, text).await?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(usage) => Err(AppError::Validation(usage)),
        },
    };

    if let Err(e) = result {
        reply_error(bot, deps, chat_id, &e).await?;
    }
    Ok(())
}

/// Runs the broadcast in the background and reports into a status message.
/// The text is the command argument, or the replied-to message.
async fn start_broadcast(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    ctx: &RequestContext,
    text: String,
) -> Result<(), AppError> {
    deps.service.access().require(ctx.user_id, Capability::Broadcast)?;

    let text = if text.trim().is_empty() {
        msg.reply_to_message()
            .and_then(|m| m.text())
            .map(str::to_string)
            .unwrap_or_default()
    } else {
        text
    };
    if text.trim().is_empty() {
        return Err(AppError::Validation(
            "Usage: /broadcast <text>, or reply to a message with /broadcast".to_string(),
        ));
    }

    let status = bot
        .send_message(msg.chat.id, "📢 Broadcast started...")
        .await
        .map_err(|e| AppError::Anyhow(e.into()))?;

    let bot = bot.clone();
    let service = deps.service.clone();
    let actor = ctx.user_id;
    tokio::spawn(async move {
        let sink = TelegramBroadcast::new(bot.clone(), Some((status.chat.id, status.id)));
        let report = match service.broadcast(actor, &text, &sink).await {
            Ok(report) => format_broadcast_report(&report),
            Err(e) => {
                log::error!("Broadcast by {} failed: {}", actor, e);
                e.user_message()
            }
        };
        if let Err(e) = bot.edit_message_text(status.chat.id, status.id, report).await {
            log::warn!("Failed to post broadcast report: {}", e);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_text() {
        let noop = CancelOutcome {
            previous: SessionState::Idle,
            discarded_inputs: 0,
            dirs: vec![],
            retained_discarded: false,
        };
        assert_eq!(cancel_text(&noop), "🤷 Nothing to cancel.");

        let collecting = CancelOutcome {
            previous: SessionState::Collecting,
            discarded_inputs: 3,
            dirs: vec![],
            retained_discarded: false,
        };
        assert!(cancel_text(&collecting).contains("3 video(s)"));

        let retained = CancelOutcome {
            retained_discarded: true,
            ..noop
        };
        assert!(cancel_text(&retained).contains("re-delivery"));
    }
}

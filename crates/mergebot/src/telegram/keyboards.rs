//! Inline keyboards and their callback data.

use mergecore::core::config::ChannelRef;
use mergecore::upload::DeliveryMode;
use mergecore::Settings;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use url::Url;

/// Everything an inline button can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    MergeNow,
    ClearQueue,
    Upload(DeliveryMode),
    Redeliver,
    CheckSubscription,
    AdminStats,
}

impl CallbackAction {
    pub fn data(self) -> &'static str {
        match self {
            CallbackAction::MergeNow => "merge_now",
            CallbackAction::ClearQueue => "clear_queue",
            CallbackAction::Upload(DeliveryMode::TelegramUpload) => "upload:telegram",
            CallbackAction::Upload(DeliveryMode::ExternalHost) => "upload:host",
            CallbackAction::Redeliver => "redeliver:host",
            CallbackAction::CheckSubscription => "check_sub",
            CallbackAction::AdminStats => "admin:stats",
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        let action = match data {
            "merge_now" => CallbackAction::MergeNow,
            "clear_queue" => CallbackAction::ClearQueue,
            "redeliver:host" => CallbackAction::Redeliver,
            "check_sub" => CallbackAction::CheckSubscription,
            "admin:stats" => CallbackAction::AdminStats,
            other => {
                let mode = other.strip_prefix("upload:")?;
                CallbackAction::Upload(DeliveryMode::parse(mode)?)
            }
        };
        Some(action)
    }
}

fn button(text: &str, action: CallbackAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text, action.data())
}

/// Shown under the acknowledgement once enough videos are queued.
pub fn queue_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        button("🎬 Merge now", CallbackAction::MergeNow),
        button("🗑 Clear queue", CallbackAction::ClearQueue),
    ]])
}

pub fn delivery_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button(
            "📤 Upload to Telegram",
            CallbackAction::Upload(DeliveryMode::TelegramUpload),
        )],
        vec![button(
            "☁️ Upload to GoFile",
            CallbackAction::Upload(DeliveryMode::ExternalHost),
        )],
        vec![button("✖️ Cancel", CallbackAction::ClearQueue)],
    ])
}

pub fn redeliver_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button(
        "☁️ Send via GoFile instead",
        CallbackAction::Redeliver,
    )]])
}

pub fn subscribe_keyboard(channel: &ChannelRef) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if let Some(url) = channel.public_link().and_then(|link| Url::parse(&link).ok()) {
        rows.push(vec![InlineKeyboardButton::url("📢 Join channel", url)]);
    }
    rows.push(vec![button("🔄 I joined", CallbackAction::CheckSubscription)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn admin_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button("📊 Stats", CallbackAction::AdminStats)]])
}

/// Links to the update channel and support group, if configured.
pub fn links_keyboard(settings: &Settings) -> Option<InlineKeyboardMarkup> {
    let mut row = Vec::new();
    if let Some(url) = settings.update_channel.as_deref().and_then(link_url) {
        row.push(InlineKeyboardButton::url("📢 Updates", url));
    }
    if let Some(url) = settings.support_group.as_deref().and_then(link_url) {
        row.push(InlineKeyboardButton::url("💬 Support", url));
    }
    (!row.is_empty()).then(|| InlineKeyboardMarkup::new(vec![row]))
}

/// Accepts a full URL, `t.me/...` or `@username`.
fn link_url(raw: &str) -> Option<Url> {
    if let Ok(url) = Url::parse(raw) {
        if matches!(url.scheme(), "http" | "https") {
            return Some(url);
        }
    }
    ChannelRef::parse(raw)?
        .public_link()
        .and_then(|link| Url::parse(&link).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_callback_data_round_trips() {
        for action in [
            CallbackAction::MergeNow,
            CallbackAction::ClearQueue,
            CallbackAction::Upload(DeliveryMode::TelegramUpload),
            CallbackAction::Upload(DeliveryMode::ExternalHost),
            CallbackAction::Redeliver,
            CallbackAction::CheckSubscription,
            CallbackAction::AdminStats,
        ] {
            assert_eq!(CallbackAction::parse(action.data()), Some(action));
        }
    }

    #[test]
    fn test_unknown_callback_data() {
        assert_eq!(CallbackAction::parse("upload:ftp"), None);
        assert_eq!(CallbackAction::parse("language:ru"), None);
    }

    #[test]
    fn test_link_url_forms() {
        assert_eq!(link_url("@vidmerge").unwrap().as_str(), "https://t.me/vidmerge");
        assert_eq!(link_url("https://t.me/joinchat/abc").unwrap().as_str(), "https://t.me/joinchat/abc");
        assert!(link_url("-100200300").is_none());
    }

    #[test]
    fn test_subscribe_keyboard_for_private_channel_has_only_check_button() {
        let keyboard = subscribe_keyboard(&ChannelRef::Id(-100200300));
        assert_eq!(keyboard.inline_keyboard.len(), 1);
    }
}

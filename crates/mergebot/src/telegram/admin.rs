//! Admin panel text, stats formatting and argument parsing for the
//! moderation commands.

use mergecore::access::Role;
use mergecore::broadcast::BroadcastReport;
use mergecore::service::ServiceStats;

pub fn format_stats(stats: &ServiceStats) -> String {
    let g = &stats.global;
    let mut text = format!(
        "📊 Bot statistics\n\n\
         👥 Users: {} ({} active in 24h, {} banned)\n\
         🎬 Merges: {} total, {} today, {} failed\n\
         ⚙️ Sessions in progress: {}\n\
         🔓 Authorized chats: {}\n\
         📢 Broadcasts sent: {}",
        g.total_users,
        g.active_users_24h,
        g.banned_users,
        g.total_merges,
        g.merges_today,
        g.failed_merges,
        stats.active_sessions,
        g.authorized_chats,
        g.broadcasts,
    );

    if !stats.top_users.is_empty() {
        text.push_str("\n\n🏆 Top users:");
        for (i, user) in stats.top_users.iter().enumerate() {
            let name = user
                .username
                .as_deref()
                .map(|u| format!("@{}", u))
                .unwrap_or_else(|| user.user_id.to_string());
            text.push_str(&format!("\n{}. {}: {} merges", i + 1, name, user.merge_count));
        }
    }
    text
}

pub fn admin_panel_text(role: Role) -> String {
    let mut text = String::from(
        "🛠 Admin panel\n\n\
         /stats: usage statistics\n\
         /ban <user_id>: ban a user\n\
         /unban <user_id>: lift a ban\n\
         /authorize [chat_id]: allow a group (defaults to this chat)\n\
         /unauthorize [chat_id]: revoke a group",
    );
    if role == Role::Owner {
        text.push_str("\n/broadcast <text>: message every user (or reply to a message)");
    }
    text
}

pub fn format_broadcast_report(report: &BroadcastReport) -> String {
    let mut text = format!(
        "📢 Broadcast finished in {:.1}s\n\n✅ Delivered: {}\n❌ Failed: {}\n👥 Recipients: {}",
        report.duration.as_secs_f64(),
        report.successes,
        report.failures,
        report.recipients
    );
    for (reason, count) in &report.failure_summary {
        text.push_str(&format!("\n   {}: {}", reason, count));
    }
    text
}

/// Parses the `<user_id>` argument of /ban and /unban.
pub fn parse_user_id(arg: &str) -> Result<i64, String> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Err("Usage: /ban <user_id>".to_string());
    }
    arg.parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| format!("❓ `{}` is not a user id.", arg))
}

/// Parses the optional `[chat_id]` argument of /authorize and
/// /unauthorize, falling back to the current chat.
pub fn parse_chat_id(arg: &str, current_chat: i64) -> Result<i64, String> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Ok(current_chat);
    }
    arg.parse::<i64>().map_err(|_| format!("❓ `{}` is not a chat id.", arg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mergecore::storage::logs::{GlobalStats, TopUser};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_format_stats_lists_top_users() {
        let stats = ServiceStats {
            global: GlobalStats {
                total_users: 10,
                total_merges: 7,
                merges_today: 2,
                ..GlobalStats::default()
            },
            active_sessions: 1,
            top_users: vec![TopUser {
                user_id: 5,
                username: Some("bob".into()),
                merge_count: 4,
            }],
        };
        let text = format_stats(&stats);
        assert!(text.contains("Users: 10"));
        assert!(text.contains("7 total, 2 today"));
        assert!(text.contains("1. @bob: 4 merges"));
    }

    #[test]
    fn test_broadcast_is_only_listed_for_owner() {
        assert!(!admin_panel_text(Role::Admin).contains("/broadcast"));
        assert!(admin_panel_text(Role::Owner).contains("/broadcast"));
    }

    #[test]
    fn test_broadcast_report_lists_reasons() {
        let report = BroadcastReport {
            log_id: 1,
            recipients: 100,
            successes: 95,
            failures: 5,
            failure_summary: BTreeMap::from([("rejected".to_string(), 5)]),
            duration: Duration::from_secs(3),
        };
        let text = format_broadcast_report(&report);
        assert!(text.contains("Delivered: 95"));
        assert!(text.contains("rejected: 5"));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_user_id(" 42 "), Ok(42));
        assert!(parse_user_id("").is_err());
        assert!(parse_user_id("alice").is_err());
        assert_eq!(parse_chat_id("", -100), Ok(-100));
        assert_eq!(parse_chat_id("-100200", 1), Ok(-100200));
        assert!(parse_chat_id("group", 1).is_err());
    }
}

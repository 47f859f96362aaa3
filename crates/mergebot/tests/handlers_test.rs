//! The real handler tree driven with synthetic updates against a mocked
//! Bot API.
//!
//! Run with: cargo test -p vidmerge --test handlers_test

mod common;

use common::{callback_update, message_update, video_update, BotHarness, OWNER_ID, USER_ID};
use pretty_assertions::assert_eq;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_start_greets_and_records_user() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    let result = test.dispatch(message_update("/start", USER_ID, USER_ID)).await;
    assert!(matches!(result, Some(Ok(()))));

    let sent = test.requests_to("sendMessage").await;
    assert_eq!(sent.len(), 1);
    let text = sent[0]["text"].as_str().unwrap();
    assert!(text.contains("Hi Alice"), "unexpected greeting: {}", text);

    let user = test.service.user(USER_ID).unwrap().expect("user recorded on first contact");
    assert_eq!(user.username.as_deref(), Some("alice"));
}

#[tokio::test]
#[serial]
async fn test_cancel_with_nothing_queued() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    test.dispatch(message_update("/cancel", USER_ID, USER_ID)).await;

    let sent = test.requests_to("sendMessage").await;
    assert_eq!(sent[0]["text"], "🤷 Nothing to cancel.");
}

#[tokio::test]
#[serial]
async fn test_merge_needs_two_videos() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    test.dispatch(message_update("/merge", USER_ID, USER_ID)).await;

    let sent = test.requests_to("sendMessage").await;
    let text = sent[0]["text"].as_str().unwrap();
    assert!(text.contains("at least 2 videos"), "unexpected reply: {}", text);
    assert!(sent[0].get("reply_markup").is_none());
}

#[tokio::test]
#[serial]
async fn test_stats_is_refused_for_regular_users() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    test.dispatch(message_update("/stats", USER_ID, USER_ID)).await;

    let sent = test.requests_to("sendMessage").await;
    assert!(!sent[0]["text"].as_str().unwrap().contains("Bot statistics"));
}

#[tokio::test]
#[serial]
async fn test_owner_gets_admin_panel_with_broadcast() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    test.dispatch(message_update("/admin", OWNER_ID, OWNER_ID)).await;

    let sent = test.requests_to("sendMessage").await;
    assert!(sent[0]["text"].as_str().unwrap().contains("/broadcast"));
    let keyboard = &sent[0]["reply_markup"]["inline_keyboard"];
    assert_eq!(keyboard[0][0]["callback_data"], "admin:stats");
}

#[tokio::test]
#[serial]
async fn test_ban_command_validates_argument() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    test.dispatch(message_update("/start", USER_ID, USER_ID)).await;
    test.dispatch(message_update("/ban alice", OWNER_ID, OWNER_ID)).await;
    test.dispatch(message_update("/ban 1000", OWNER_ID, OWNER_ID)).await;

    let sent = test.requests_to("sendMessage").await;
    assert!(sent[1]["text"].as_str().unwrap().contains("is not a user id"));
    assert_eq!(sent[2]["text"], "🚫 @alice is banned.");
    assert!(test.service.access().is_banned(USER_ID).unwrap());
}

#[tokio::test]
#[serial]
async fn test_upload_button_without_queue_answers_with_alert() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    test.dispatch(callback_update("upload:telegram", USER_ID, USER_ID)).await;

    let answers = test.requests_to("answerCallbackQuery").await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0]["show_alert"], true);
    assert!(answers[0]["text"].as_str().unwrap().contains("at least 2 videos"));
    assert!(test.requests_to("editMessageText").await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_unknown_callback_is_acknowledged() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    test.dispatch(callback_update("something_else", USER_ID, USER_ID)).await;

    let answers = test.requests_to("answerCallbackQuery").await;
    assert_eq!(answers.len(), 1);
    assert!(answers[0].get("text").is_none());
}

#[tokio::test]
#[serial]
async fn test_group_chatter_is_ignored() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    let result = test.dispatch(message_update("see you tonight", -100200, USER_ID)).await;

    assert!(result.is_none());
    assert!(test.requests_to("sendMessage").await.is_empty());
}

#[tokio::test]
#[serial]
async fn test_private_text_without_link_gets_hint() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    test.dispatch(message_update("hello there", USER_ID, USER_ID)).await;

    let sent = test.requests_to("sendMessage").await;
    assert!(sent[0]["text"].as_str().unwrap().contains("/help"));
}

#[tokio::test]
#[serial]
async fn test_video_in_unauthorized_group_gets_only_the_refusal() {
    let test = BotHarness::new().await;
    test.mock_all_telegram_api().await;

    let result = test.dispatch(video_update(-100200, USER_ID)).await;
    assert!(matches!(result, Some(Ok(()))));

    let sent = test.requests_to("sendMessage").await;
    assert_eq!(sent.len(), 1);
    let text = sent[0]["text"].as_str().unwrap();
    assert!(text.contains("not authorized"), "unexpected reply: {}", text);
    assert!(!sent.iter().any(|m| m["text"].as_str().unwrap_or("").contains("Downloading")));

    assert!(test.requests_to("getFile").await.is_empty());
    assert!(test.service.user(USER_ID).unwrap().is_none());
}

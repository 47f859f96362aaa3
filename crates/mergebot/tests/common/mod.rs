//! Bot API test harness: a wiremock server standing in for
//! api.telegram.org and a fully wired service behind the real handler tree.

#![allow(dead_code)]

use std::ops::ControlFlow;
use std::sync::Arc;

use figment::providers::{Format, Toml};
use figment::Figment;
use mergebot::telegram::{schema, HandlerDeps, HandlerError, TelegramTransport};
use mergecore::merge::FfmpegMerger;
use mergecore::service::ServiceParts;
use mergecore::storage::create_pool;
use mergecore::{MergeService, Settings};
use serde_json::{json, Value};
use teloxide::prelude::*;
use teloxide::types::{Me, Update, UserId};
use tempfile::TempDir;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const OWNER_ID: i64 = 1;
pub const USER_ID: i64 = 1000;
pub const BOT_ID: u64 = 987654321;
pub const TOKEN: &str = "test_token_12345:ABCDEF";

pub struct BotHarness {
    pub mock_server: MockServer,
    pub bot: Bot,
    pub service: Arc<MergeService>,
    pub deps: HandlerDeps,
    _dir: TempDir,
}

impl BotHarness {
    pub async fn new() -> Self {
        let mock_server = MockServer::start().await;
        let bot = Bot::new(TOKEN).set_api_url(mock_server.uri().parse().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            bot_token = "{token}"
            owner_id = {owner}
            database_url = "{db}"
            staging_dir = "{staging}"
            download_max_retries = 0
            delivery_max_retries = 0
            broadcast_delay_ms = 0
            "#,
            token = TOKEN,
            owner = OWNER_ID,
            db = dir.path().join("vidmerge.sqlite").display(),
            staging = dir.path().join("staging").display(),
        );
        let settings = Arc::new(Settings::from_figment(Figment::new().merge(Toml::string(&toml))).unwrap());
        let pool = Arc::new(create_pool(&settings.database_url).unwrap());

        let transport = Arc::new(TelegramTransport::new(bot.clone(), reqwest::Client::new()));
        let parts = ServiceParts {
            membership: transport.clone(),
            files: transport.clone(),
            chat: transport,
            host: None,
            merger: Arc::new(FfmpegMerger::from_settings(&settings)),
            http: reqwest::Client::new(),
        };
        let service = Arc::new(MergeService::new(settings, pool, parts));
        let deps = HandlerDeps::new(Arc::clone(&service), Some("test_bot".to_string()), UserId(BOT_ID));

        Self {
            mock_server,
            bot,
            service,
            deps,
            _dir: dir,
        }
    }

    /// Mocks every Bot API method the handlers call with a generic success.
    pub async fn mock_all_telegram_api(&self) {
        let sent = json!({
            "ok": true,
            "result": {
                "message_id": 42,
                "from": { "id": BOT_ID, "is_bot": true, "first_name": "TestBot" },
                "chat": { "id": USER_ID, "type": "private", "first_name": "Alice" },
                "date": 1735992000,
                "text": "Response"
            }
        });
        for api_method in ["sendmessage", "editmessagetext"] {
            Mock::given(method("POST"))
                .and(path_regex(format!("(?i)/bot[^/]+/{}$", api_method)))
                .respond_with(ResponseTemplate::new(200).set_body_json(sent.clone()))
                .mount(&self.mock_server)
                .await;
        }
        for api_method in ["answercallbackquery", "setmycommands", "deletemessage"] {
            Mock::given(method("POST"))
                .and(path_regex(format!("(?i)/bot[^/]+/{}$", api_method)))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })))
                .mount(&self.mock_server)
                .await;
        }
        Mock::given(method("POST"))
            .and(path_regex("(?i)/bot[^/]+/getme$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {
                    "id": BOT_ID,
                    "is_bot": true,
                    "first_name": "TestBot",
                    "username": "test_bot",
                    "can_join_groups": true,
                    "can_read_all_group_messages": false,
                    "supports_inline_queries": false,
                    "can_connect_to_business": false,
                    "has_main_web_app": false
                }
            })))
            .mount(&self.mock_server)
            .await;
    }

    /// Runs one update through the production handler tree. `None` when no
    /// branch took the update.
    pub async fn dispatch(&self, update: Update) -> Option<Result<(), HandlerError>> {
        let me: Me = self.bot.get_me().await.unwrap();
        let handler = schema(self.deps.clone());
        match handler.dispatch(dptree::deps![self.bot.clone(), me, update]).await {
            ControlFlow::Break(result) => Some(result),
            ControlFlow::Continue(_) => None,
        }
    }

    /// JSON bodies of the requests made to one Bot API method.
    pub async fn requests_to(&self, api_method: &str) -> Vec<Value> {
        let suffix = format!("/{}", api_method.to_lowercase());
        self.mock_server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path().to_lowercase().ends_with(&suffix))
            .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
            .collect()
    }
}

fn chat(chat_id: i64) -> Value {
    if chat_id > 0 {
        json!({ "id": chat_id, "type": "private", "first_name": "Alice" })
    } else {
        json!({ "id": chat_id, "type": "supergroup", "title": "Movie night" })
    }
}

pub fn message_update(text: &str, chat_id: i64, user_id: i64) -> Update {
    let mut message = json!({
        "message_id": 7,
        "date": 1735992000,
        "chat": chat(chat_id),
        "from": { "id": user_id, "is_bot": false, "first_name": "Alice", "username": "alice" },
        "text": text
    });
    if text.starts_with('/') {
        let length = text.split_whitespace().next().map(|c| c.encode_utf16().count()).unwrap_or(0);
        message["entities"] = json!([{ "type": "bot_command", "offset": 0, "length": length }]);
    }
    parse_update(json!({ "update_id": 1, "message": message })).unwrap()
}

/// A video sent as media, as `vid-1`.
pub fn video_update(chat_id: i64, user_id: i64) -> Update {
    parse_update(json!({
        "update_id": 3,
        "message": {
            "message_id": 8,
            "date": 1735992000,
            "chat": chat(chat_id),
            "from": { "id": user_id, "is_bot": false, "first_name": "Alice", "username": "alice" },
            "video": {
                "file_id": "vid-1", "file_unique_id": "u1", "file_size": 2048,
                "width": 640, "height": 360, "duration": 5, "file_name": "clip.mp4"
            }
        }
    }))
    .unwrap()
}

pub fn callback_update(data: &str, chat_id: i64, user_id: i64) -> Update {
    parse_update(json!({
        "update_id": 2,
        "callback_query": {
            "id": "cbq-1",
            "from": { "id": user_id, "is_bot": false, "first_name": "Alice" },
            "chat_instance": "instance",
            "data": data,
            "message": {
                "message_id": 42,
                "date": 1735992000,
                "chat": chat(chat_id),
                "from": { "id": BOT_ID, "is_bot": true, "first_name": "TestBot" },
                "text": "🎬 2 videos queued"
            }
        }
    }))
    .unwrap()
}

/// Parses an update from its JSON text. teloxide-core 0.13's `UpdateKind`
/// deserializer only reads borrowed keys, so `serde_json::from_value`
/// silently yields `UpdateKind::Error`.
fn parse_update(value: Value) -> serde_json::Result<Update> {
    serde_json::from_str(&value.to_string())
}

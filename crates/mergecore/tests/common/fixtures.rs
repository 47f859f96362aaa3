//! A fully wired [`MergeService`] over a temporary database and staging
//! root, with every collaborator mocked.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use figment::providers::{Format, Toml};
use figment::Figment;
use mergecore::access::ChatKind;
use mergecore::collect::IncomingMedia;
use mergecore::progress::ProgressSink;
use mergecore::service::ServiceParts;
use mergecore::storage::logs::{merge_logs_for_user, MergeLog};
use mergecore::storage::{create_pool, db, get_connection, DbPool};
use mergecore::{MergeService, RequestContext, Settings};
use tempfile::TempDir;

use crate::mocks::{MockChat, MockFiles, MockHost, MockMembership, MockMerger};

pub const OWNER_ID: i64 = 1;
pub const ADMIN_ID: i64 = 2;

pub struct TestOptions {
    pub merger: MockMerger,
    pub force_sub: bool,
    pub joined: bool,
    pub max_upload_bytes: u64,
    pub idle_timeout_secs: u64,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            merger: MockMerger::default(),
            force_sub: false,
            joined: true,
            max_upload_bytes: 50 * 1024 * 1024,
            idle_timeout_secs: 1800,
        }
    }
}

pub struct TestEnv {
    pub dir: TempDir,
    pub pool: Arc<DbPool>,
    pub service: Arc<MergeService>,
    pub files: Arc<MockFiles>,
    pub chat: Arc<MockChat>,
    pub host: Arc<MockHost>,
    pub merger: Arc<MockMerger>,
    pub membership: Arc<MockMembership>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with(TestOptions::default())
    }

    pub fn with(options: TestOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let db_path = dir.path().join("vidmerge.sqlite");

        let mut toml = format!(
            r#"
            bot_token = "123456:TEST-TOKEN"
            owner_id = {owner}
            admins = "{admin}"
            database_url = "{db}"
            staging_dir = "{staging}"
            max_upload_bytes = {max_upload}
            session_idle_timeout_secs = {idle}
            broadcast_delay_ms = 0
            download_max_retries = 0
            delivery_max_retries = 0
            "#,
            owner = OWNER_ID,
            admin = ADMIN_ID,
            db = db_path.display(),
            staging = staging.display(),
            max_upload = options.max_upload_bytes,
            idle = options.idle_timeout_secs,
        );
        if options.force_sub {
            toml.push_str("force_sub_channel = \"@vidmerge_news\"\n");
        }

        let settings = Arc::new(Settings::from_figment(Figment::from(Toml::string(&toml))).unwrap());
        let pool = Arc::new(create_pool(&settings.database_url).unwrap());

        let files = Arc::new(MockFiles::default());
        let chat = Arc::new(MockChat::default());
        let host = Arc::new(MockHost::default());
        let merger = Arc::new(options.merger);
        let membership = Arc::new(MockMembership::new(options.joined));

        let parts = ServiceParts {
            membership: membership.clone(),
            files: files.clone(),
            chat: chat.clone(),
            host: Some(host.clone()),
            merger: merger.clone(),
            http: reqwest::Client::new(),
        };
        let service = Arc::new(MergeService::new(settings, pool.clone(), parts));

        Self {
            dir,
            pool,
            service,
            files,
            chat,
            host,
            merger,
            membership,
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    /// Number of entries left under `staging/<user_id>`.
    pub fn staged_entries(&self, user_id: i64) -> usize {
        std::fs::read_dir(self.staging_root().join(user_id.to_string()))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    pub fn merge_logs(&self, user_id: i64) -> Vec<MergeLog> {
        let conn = get_connection(&self.pool).unwrap();
        merge_logs_for_user(&conn, user_id).unwrap()
    }

    pub fn add_user(&self, user_id: i64) {
        let conn = get_connection(&self.pool).unwrap();
        db::touch_user(&conn, user_id, None, None, Utc::now()).unwrap();
    }

    pub fn ban(&self, user_id: i64) {
        let conn = get_connection(&self.pool).unwrap();
        db::touch_user(&conn, user_id, None, None, Utc::now()).unwrap();
        db::set_banned(&conn, user_id, true).unwrap();
    }

    pub async fn send_video(&self, user_id: i64, file_id: &str) -> mergecore::AppResult<usize> {
        self.service
            .submit(&ctx(user_id), video(file_id), &ProgressSink::default())
            .await
            .map(|submission| submission.collected.staged)
    }
}

pub fn ctx(user_id: i64) -> RequestContext {
    RequestContext::private(user_id)
}

pub fn group_ctx(user_id: i64, chat_id: i64) -> RequestContext {
    RequestContext {
        user_id,
        chat_id,
        chat_kind: ChatKind::Group,
        username: None,
        first_name: None,
    }
}

pub fn video(file_id: &str) -> IncomingMedia {
    IncomingMedia::TelegramFile {
        file_id: file_id.to_string(),
        file_name: Some(format!("{}.mp4", file_id)),
        size_bytes: Some(16),
    }
}

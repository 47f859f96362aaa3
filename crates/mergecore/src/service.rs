//! The bot's use cases, independent of the Telegram transport.
//!
//! A handler builds a [`RequestContext`] from the update and calls one
//! method here. Methods that consume resources run the access checks
//! themselves, so a rejected request never touches the session map, the
//! staging area or the database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::access::{AccessControl, Capability, ChatKind, MembershipCheck, Role};
use crate::broadcast::{broadcast, BroadcastReport, BroadcastSink};
use crate::collect::{Collected, Collector, FileSource, IncomingMedia};
use crate::core::config::Settings;
use crate::core::error::{AppError, AppResult};
use crate::core::retry::RetryPolicy;
use crate::download::LinkDownloader;
use crate::merge::{FfmpegMerger, Merger};
use crate::pipeline::{MergePipeline, PipelineOutcome};
use crate::progress::ProgressSink;
use crate::session::{CancelOutcome, MergeJob, SessionError, SessionRegistry, SessionSnapshot};
use crate::staging::StagingArea;
use crate::storage::db::{self, User};
use crate::storage::logs::{global_stats, top_users, GlobalStats, TopUser};
use crate::storage::{get_connection, DbPool};
use crate::upload::{ChatUpload, DeliveryMode, DeliveryReceipt, ExternalHost, GofileUploader, UploadDispatcher};

/// Who is asking, and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: i64,
    pub chat_id: i64,
    pub chat_kind: ChatKind,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

impl RequestContext {
    pub fn private(user_id: i64) -> Self {
        Self {
            user_id,
            chat_id: user_id,
            chat_kind: ChatKind::Private,
            username: None,
            first_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub role: Role,
    /// The user was recorded for the first time by this request.
    pub new_user: bool,
}

/// What [`MergeService::submit`] did with an incoming video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub admission: Admission,
    pub collected: Collected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub global: GlobalStats,
    pub active_sessions: usize,
    pub top_users: Vec<TopUser>,
}

/// The pluggable collaborators of a [`MergeService`].
pub struct ServiceParts {
    pub membership: Arc<dyn MembershipCheck>,
    pub files: Arc<dyn FileSource>,
    pub chat: Arc<dyn ChatUpload>,
    pub host: Option<Arc<dyn ExternalHost>>,
    pub merger: Arc<dyn Merger>,
    pub http: Client,
}

impl ServiceParts {
    /// Production wiring: ffmpeg for merging and GoFile as the external host.
    pub fn production(
        settings: &Settings,
        membership: Arc<dyn MembershipCheck>,
        files: Arc<dyn FileSource>,
        chat: Arc<dyn ChatUpload>,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("vidmerge/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        let host = GofileUploader::new(http.clone(), settings.gofile_api_url.clone(), settings.gofile_token.clone());

        Ok(Self {
            membership,
            files,
            chat,
            host: Some(Arc::new(host)),
            merger: Arc::new(FfmpegMerger::from_settings(settings)),
            http,
        })
    }
}

pub struct MergeService {
    settings: Arc<Settings>,
    pool: Arc<DbPool>,
    access: AccessControl,
    sessions: Arc<SessionRegistry>,
    collector: Collector,
    pipeline: MergePipeline,
    dispatcher: Arc<UploadDispatcher>,
}

impl MergeService {
    pub fn new(settings: Arc<Settings>, pool: Arc<DbPool>, parts: ServiceParts) -> Self {
        let staging = StagingArea::new(settings.staging_root());
        let sessions = Arc::new(SessionRegistry::new(staging));

        let download_retry = RetryPolicy::transfers(settings.download_max_retries);
        let delivery_retry = RetryPolicy::transfers(settings.delivery_max_retries);

        let links = LinkDownloader::new(parts.http, download_retry.clone(), settings.max_download_bytes);
        let collector = Collector::new(sessions.clone(), parts.files, links, download_retry);
        let dispatcher = Arc::new(UploadDispatcher::new(
            parts.chat,
            parts.host,
            settings.max_upload_bytes,
            delivery_retry,
        ));
        let pipeline = MergePipeline::new(pool.clone(), sessions.clone(), parts.merger, dispatcher.clone());
        let access = AccessControl::new(&settings, pool.clone(), parts.membership);

        Self {
            settings,
            pool,
            access,
            sessions,
            collector,
            pipeline,
            dispatcher,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.dispatcher.max_upload_bytes()
    }

    /// Runs the access checks for `capability` and records the interaction.
    pub async fn admit(&self, ctx: &RequestContext, capability: Capability) -> AppResult<Admission> {
        let role = self
            .access
            .check_request(ctx.user_id, ctx.chat_id, ctx.chat_kind, capability)
            .await?;
        let conn = get_connection(&self.pool)?;
        let new_user = db::touch_user(
            &conn,
            ctx.user_id,
            ctx.username.as_deref(),
            ctx.first_name.as_deref(),
            Utc::now(),
        )?;
        if new_user {
            log::info!("👤 New user {} (@{})", ctx.user_id, ctx.username.as_deref().unwrap_or("-"));
        }
        Ok(Admission { role, new_user })
    }

    /// Stages a video or link into the user's session.
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        media: IncomingMedia,
        progress: &ProgressSink,
    ) -> AppResult<Submission> {
        let admission = self.admit(ctx, Capability::UseBot).await?;
        let collected = self.collect_admitted(ctx, media, progress).await?;
        Ok(Submission { admission, collected })
    }

    /// Second half of [`submit`], for callers that ran [`admit`] with
    /// [`Capability::UseBot`] themselves to answer before the download.
    ///
    /// [`submit`]: MergeService::submit
    /// [`admit`]: MergeService::admit
    pub async fn collect_admitted(
        &self,
        ctx: &RequestContext,
        media: IncomingMedia,
        progress: &ProgressSink,
    ) -> AppResult<Collected> {
        self.collector.collect(ctx.user_id, ctx.chat_id, media, progress).await
    }

    pub fn queue(&self, user_id: i64) -> Option<SessionSnapshot> {
        self.sessions.snapshot(user_id)
    }

    /// Checks that a merge could start, without starting it.
    pub async fn preview_merge(&self, ctx: &RequestContext) -> AppResult<SessionSnapshot> {
        self.admit(ctx, Capability::UseBot).await?;
        let snapshot = self.sessions.snapshot(ctx.user_id);
        let have = snapshot.as_ref().map_or(0, |s| s.input_names.len());
        match snapshot {
            Some(s) if s.state != crate::session::SessionState::Collecting => {
                Err(SessionError::Busy { state: s.state }.into())
            }
            Some(s) if have >= crate::session::MIN_INPUTS => Ok(s),
            _ => Err(SessionError::InsufficientInputs {
                have,
                need: crate::session::MIN_INPUTS,
            }
            .into()),
        }
    }

    /// `Collecting -> Merging`. The returned job is then driven by [`run`].
    ///
    /// [`run`]: MergeService::run
    pub async fn request_merge(&self, ctx: &RequestContext, mode: DeliveryMode) -> AppResult<MergeJob> {
        self.admit(ctx, Capability::UseBot).await?;
        Ok(self.sessions.begin_merge(ctx.user_id, mode)?)
    }

    pub async fn run(&self, job: MergeJob, progress: &ProgressSink) -> AppResult<PipelineOutcome> {
        self.pipeline.run(job, progress).await
    }

    /// Cancels the user's session (and any retained output) and releases
    /// its staged files. A merge in flight is only signalled; its pipeline
    /// releases the files once ffmpeg or the upload has stopped. A no-op
    /// for idle users.
    pub async fn cancel(&self, user_id: i64) -> CancelOutcome {
        let outcome = self.sessions.cancel(user_id);
        for dir in &outcome.dirs {
            self.sessions.staging().release(dir).await;
        }
        outcome
    }

    /// Sends a retained output through the external host.
    pub async fn redeliver(&self, ctx: &RequestContext, progress: &ProgressSink) -> AppResult<DeliveryReceipt> {
        self.admit(ctx, Capability::UseBot).await?;
        let retained = self
            .sessions
            .take_retained(ctx.user_id)
            .ok_or(SessionError::NothingRetained)?;

        let cancel = CancellationToken::new();
        match self
            .dispatcher
            .deliver(retained.chat_id, &retained.output, DeliveryMode::ExternalHost, &cancel, progress)
            .await
        {
            Ok(receipt) => {
                self.sessions.staging().release(&retained.dir).await;
                Ok(receipt)
            }
            Err(e) => {
                if let Some(displaced) = self.sessions.retain_output(retained) {
                    self.sessions.staging().release(&displaced.dir).await;
                }
                Err(e.into())
            }
        }
    }

    /// Drops idle sessions and stale retained outputs. Returns the number of
    /// directories released.
    pub async fn sweep_idle(&self) -> usize {
        let dirs = self.sessions.expire_idle(self.settings.session_idle_timeout);
        for dir in &dirs {
            self.sessions.staging().release(dir).await;
        }
        if !dirs.is_empty() {
            log::info!("🧹 Swept {} idle session(s)", dirs.len());
        }
        dirs.len()
    }

    pub fn stats(&self, actor: i64) -> AppResult<ServiceStats> {
        self.access.require(actor, Capability::ViewStats)?;
        let conn = get_connection(&self.pool)?;
        Ok(ServiceStats {
            global: global_stats(&conn, Utc::now())?,
            active_sessions: self.sessions.active_count(),
            top_users: top_users(&conn, 5)?,
        })
    }

    pub fn user(&self, user_id: i64) -> AppResult<Option<User>> {
        let conn = get_connection(&self.pool)?;
        Ok(db::get_user(&conn, user_id)?)
    }

    /// Bans `target`. Staff cannot be banned and the user must be known.
    /// Any session of the target is cancelled.
    pub async fn ban(&self, actor: i64, target: i64) -> AppResult<User> {
        self.access.require(actor, Capability::ModerateUsers)?;
        if self.access.role_of(target).is_staff() {
            return Err(AppError::Validation("⛔ Admins and the owner cannot be banned.".to_string()));
        }
        let user = self.set_banned(target, true)?;
        self.cancel(target).await;
        log::info!("🚫 User {} banned by {}", target, actor);
        Ok(user)
    }

    pub fn unban(&self, actor: i64, target: i64) -> AppResult<User> {
        self.access.require(actor, Capability::ModerateUsers)?;
        let user = self.set_banned(target, false)?;
        log::info!("✅ User {} unbanned by {}", target, actor);
        Ok(user)
    }

    fn set_banned(&self, target: i64, banned: bool) -> AppResult<User> {
        let conn = get_connection(&self.pool)?;
        if !db::set_banned(&conn, target, banned)? {
            return Err(AppError::Validation(format!("❓ User {} has never used the bot.", target)));
        }
        db::get_user(&conn, target)?.ok_or_else(|| AppError::Validation(format!("❓ User {} not found.", target)))
    }

    /// Returns `false` if the chat was already authorized.
    pub fn authorize(&self, actor: i64, chat_id: i64) -> AppResult<bool> {
        self.access.require(actor, Capability::ManageChats)?;
        let conn = get_connection(&self.pool)?;
        let added = db::authorize_chat(&conn, chat_id, actor, Utc::now())?;
        if added {
            log::info!("🔓 Chat {} authorized by {}", chat_id, actor);
        }
        Ok(added)
    }

    /// Returns `false` if the chat was not authorized.
    pub fn unauthorize(&self, actor: i64, chat_id: i64) -> AppResult<bool> {
        self.access.require(actor, Capability::ManageChats)?;
        let conn = get_connection(&self.pool)?;
        let removed = db::unauthorize_chat(&conn, chat_id)?;
        if removed {
            log::info!("🔒 Chat {} unauthorized by {}", chat_id, actor);
        }
        Ok(removed)
    }

    pub async fn broadcast(&self, actor: i64, text: &str, sink: &dyn BroadcastSink) -> AppResult<BroadcastReport> {
        self.access.require(actor, Capability::Broadcast)?;
        broadcast(&self.pool, sink, actor, text, self.settings.broadcast_delay).await
    }
}

//! Per-user merge sessions.
//!
//! State machine:
//!
//! ```text
//! Idle ──input──▶ Collecting ──merge(≥2)──▶ Merging ──ok──▶ Uploading ──▶ Idle
//!                  │   ▲  │                    │ fail ─────────────────────▶ Idle
//!                  └───┘  └─cancel──▶ Cancelled ──▶ Idle ◀──cancel── Merging/Uploading
//! ```
//!
//! `Idle` is represented by the absence of an entry. At most one session
//! exists per user; new input always appends to it. All operations are
//! synchronous map updates so no shard lock is ever held across an await.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::merge::MergedOutput;
use crate::staging::StagingArea;
use crate::storage::logs::InputDescriptor;
use crate::upload::DeliveryMode;

/// Minimum number of staged inputs for a merge.
pub const MIN_INPUTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Collecting,
    Merging,
    Uploading,
    /// Transient: a cancelled session is removed immediately, so this is
    /// only ever reported as the outcome of a cancelled pipeline run.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("📎 Send at least {need} videos before merging (you have {have}).")]
    InsufficientInputs { have: usize, need: usize },

    #[error("⏳ A merge is already running. Wait for it to finish or /cancel it.")]
    Busy { state: SessionState },

    #[error("⏳ {pending} file(s) are still downloading, try again in a moment.")]
    DownloadsPending { pending: usize },

    #[error("⌛ The queue was cancelled or expired, so this file was discarded.")]
    Stale,

    #[error("📭 There is no merged file waiting to be re-sent.")]
    NothingRetained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    TelegramFile { file_id: String },
    Link { url: String },
}

impl InputSource {
    pub fn describe(&self) -> String {
        match self {
            InputSource::TelegramFile { file_id } => format!("telegram:{}", file_id),
            InputSource::Link { url } => url.clone(),
        }
    }
}

/// A file that finished downloading into a session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    /// Arrival sequence within the session; merge order follows it.
    pub seq: usize,
    pub path: PathBuf,
    pub name: String,
    pub source: InputSource,
    pub size_bytes: u64,
}

impl StagedInput {
    pub fn descriptor(&self) -> InputDescriptor {
        InputDescriptor {
            name: self.name.clone(),
            source: self.source.describe(),
            size_bytes: self.size_bytes,
        }
    }

    pub fn extension(&self) -> Option<String> {
        crate::core::utils::extension_of(&self.name)
            .or_else(|| self.path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()))
    }
}

#[derive(Debug)]
struct MergeSession {
    id: Uuid,
    chat_id: i64,
    state: SessionState,
    inputs: Vec<StagedInput>,
    pending: usize,
    next_seq: usize,
    mode: Option<DeliveryMode>,
    dir: PathBuf,
    cancel: CancellationToken,
    last_activity: Instant,
}

impl MergeSession {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Handed out when an input starts downloading. Carries the slot reserved
/// for it so concurrent downloads still merge in arrival order.
#[derive(Debug, Clone)]
pub struct InputTicket {
    pub user_id: i64,
    pub session_id: Uuid,
    pub seq: usize,
    pub dir: PathBuf,
    pub cancel: CancellationToken,
}

/// Everything the pipeline needs to run one merge.
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub user_id: i64,
    pub chat_id: i64,
    pub session_id: Uuid,
    pub inputs: Vec<StagedInput>,
    pub mode: DeliveryMode,
    pub dir: PathBuf,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub input_names: Vec<String>,
    pub pending: usize,
    pub mode: Option<DeliveryMode>,
}

/// A merged file whose delivery failed, kept so it can be re-sent.
#[derive(Debug, Clone)]
pub struct RetainedOutput {
    pub user_id: i64,
    pub chat_id: i64,
    pub output: MergedOutput,
    pub dir: PathBuf,
    pub retained_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    /// State before the cancel; `Idle` when there was no session.
    pub previous: SessionState,
    pub discarded_inputs: usize,
    /// Directories the caller should release. A session cancelled while
    /// merging or uploading is not listed; its pipeline releases it.
    pub dirs: Vec<PathBuf>,
    pub retained_discarded: bool,
}

impl CancelOutcome {
    pub fn is_noop(&self) -> bool {
        self.previous == SessionState::Idle && !self.retained_discarded
    }
}

pub struct SessionRegistry {
    sessions: DashMap<i64, MergeSession>,
    retained: DashMap<i64, RetainedOutput>,
    staging: StagingArea,
}

impl SessionRegistry {
    pub fn new(staging: StagingArea) -> Self {
        Self {
            sessions: DashMap::new(),
            retained: DashMap::new(),
            staging,
        }
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn state(&self, user_id: i64) -> SessionState {
        self.sessions
            .get(&user_id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn snapshot(&self, user_id: i64) -> Option<SessionSnapshot> {
        self.sessions.get(&user_id).map(|s| SessionSnapshot {
            session_id: s.id,
            state: s.state,
            input_names: s.inputs.iter().map(|i| i.name.clone()).collect(),
            pending: s.pending,
            mode: s.mode,
        })
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Reserves a slot for an incoming input, opening a session if the user
    /// is idle.
    pub fn begin_input(&self, user_id: i64, chat_id: i64) -> Result<InputTicket, SessionError> {
        match self.sessions.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                let session = occupied.get_mut();
                if session.state != SessionState::Collecting {
                    return Err(SessionError::Busy { state: session.state });
                }
                let seq = session.next_seq;
                session.next_seq += 1;
                session.pending += 1;
                session.touch();
                Ok(InputTicket {
                    user_id,
                    session_id: session.id,
                    seq,
                    dir: session.dir.clone(),
                    cancel: session.cancel.clone(),
                })
            }
            Entry::Vacant(vacant) => {
                let id = Uuid::new_v4();
                let dir = self.staging.session_dir(user_id, id);
                let cancel = CancellationToken::new();
                vacant.insert(MergeSession {
                    id,
                    chat_id,
                    state: SessionState::Collecting,
                    inputs: Vec::new(),
                    pending: 1,
                    next_seq: 1,
                    mode: None,
                    dir: dir.clone(),
                    cancel: cancel.clone(),
                    last_activity: Instant::now(),
                });
                log::info!("🆕 Session {} opened for user {}", id, user_id);
                Ok(InputTicket {
                    user_id,
                    session_id: id,
                    seq: 0,
                    dir,
                    cancel,
                })
            }
        }
    }

    /// Appends a finished input. Returns the number of staged inputs.
    ///
    /// Fails with [`SessionError::Stale`] when the ticket's session was
    /// cancelled or expired meanwhile; the caller must delete the file.
    pub fn push_input(&self, ticket: &InputTicket, input: StagedInput) -> Result<usize, SessionError> {
        let mut session = self
            .sessions
            .get_mut(&ticket.user_id)
            .filter(|s| s.id == ticket.session_id)
            .ok_or(SessionError::Stale)?;
        session.pending = session.pending.saturating_sub(1);
        if session.state != SessionState::Collecting {
            return Err(SessionError::Stale);
        }
        let pos = session.inputs.partition_point(|i| i.seq < input.seq);
        session.inputs.insert(pos, input);
        session.touch();
        Ok(session.inputs.len())
    }

    /// Releases the slot of an input whose download failed.
    pub fn abandon_input(&self, ticket: &InputTicket) {
        if let Some(mut session) = self.sessions.get_mut(&ticket.user_id) {
            if session.id == ticket.session_id {
                session.pending = session.pending.saturating_sub(1);
                session.touch();
            }
        }
    }

    /// `Collecting -> Merging`. Leaves the session untouched on any error.
    pub fn begin_merge(&self, user_id: i64, mode: DeliveryMode) -> Result<MergeJob, SessionError> {
        let Some(mut session) = self.sessions.get_mut(&user_id) else {
            return Err(SessionError::InsufficientInputs {
                have: 0,
                need: MIN_INPUTS,
            });
        };
        match session.state {
            SessionState::Collecting => {}
            state => return Err(SessionError::Busy { state }),
        }
        if session.inputs.len() < MIN_INPUTS {
            return Err(SessionError::InsufficientInputs {
                have: session.inputs.len(),
                need: MIN_INPUTS,
            });
        }
        if session.pending > 0 {
            return Err(SessionError::DownloadsPending {
                pending: session.pending,
            });
        }

        session.state = SessionState::Merging;
        session.mode = Some(mode);
        session.touch();
        log::info!(
            "⚙️  Session {} of user {}: merging {} inputs ({:?})",
            session.id,
            user_id,
            session.inputs.len(),
            mode
        );

        Ok(MergeJob {
            user_id,
            chat_id: session.chat_id,
            session_id: session.id,
            inputs: session.inputs.clone(),
            mode,
            dir: session.dir.clone(),
            cancel: session.cancel.clone(),
        })
    }

    /// `Merging -> Uploading`. False if the session is gone (cancelled).
    pub fn mark_uploading(&self, user_id: i64, session_id: Uuid) -> bool {
        match self.sessions.get_mut(&user_id) {
            Some(mut s) if s.id == session_id && s.state == SessionState::Merging => {
                s.state = SessionState::Uploading;
                s.touch();
                true
            }
            _ => false,
        }
    }

    /// Ends a merge run and returns the user to `Idle`. False if the session
    /// was already cancelled.
    pub fn finish(&self, user_id: i64, session_id: Uuid) -> bool {
        self.sessions
            .remove_if(&user_id, |_, s| s.id == session_id)
            .is_some()
    }

    /// Cancels whatever the user has going. Re-issuing on an idle user is a
    /// no-op.
    pub fn cancel(&self, user_id: i64) -> CancelOutcome {
        let mut outcome = CancelOutcome {
            previous: SessionState::Idle,
            discarded_inputs: 0,
            dirs: Vec::new(),
            retained_discarded: false,
        };

        if let Some((_, session)) = self.sessions.remove(&user_id) {
            session.cancel.cancel();
            log::info!(
                "🛑 Session {} of user {} cancelled in state {:?}",
                session.id,
                user_id,
                session.state
            );
            outcome.previous = session.state;
            outcome.discarded_inputs = session.inputs.len();
            if session.state == SessionState::Collecting {
                outcome.dirs.push(session.dir);
            }
        }
        if let Some((_, retained)) = self.retained.remove(&user_id) {
            outcome.retained_discarded = true;
            outcome.dirs.push(retained.dir);
        }
        outcome
    }

    /// Drops `Collecting` sessions idle for longer than `max_idle` (and with
    /// no download in flight) plus stale retained outputs. Returns the
    /// directories to release.
    pub fn expire_idle(&self, max_idle: Duration) -> Vec<PathBuf> {
        let now = Instant::now();
        let mut dirs = Vec::new();

        self.sessions.retain(|user_id, session| {
            let expired = session.state == SessionState::Collecting
                && session.pending == 0
                && now.duration_since(session.last_activity) >= max_idle;
            if expired {
                log::info!("⌛ Session {} of user {} expired", session.id, user_id);
                session.cancel.cancel();
                dirs.push(session.dir.clone());
            }
            !expired
        });

        self.retained.retain(|_, retained| {
            let expired = now.duration_since(retained.retained_at) >= max_idle;
            if expired {
                dirs.push(retained.dir.clone());
            }
            !expired
        });

        dirs
    }

    /// Stores an undelivered output. Returns a previously retained output
    /// that was displaced, for cleanup.
    pub fn retain_output(&self, output: RetainedOutput) -> Option<RetainedOutput> {
        self.retained.insert(output.user_id, output)
    }

    pub fn take_retained(&self, user_id: i64) -> Option<RetainedOutput> {
        self.retained.remove(&user_id).map(|(_, r)| r)
    }

    pub fn has_retained(&self, user_id: i64) -> bool {
        self.retained.contains_key(&user_id)
    }
}

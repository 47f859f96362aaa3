//! mergecore: everything vidmerge does that is not Telegram-specific.
//!
//! The bot crate talks to this library through a handful of traits
//! ([`access::MembershipCheck`], [`collect::FileSource`],
//! [`upload::ChatUpload`], [`broadcast::BroadcastSink`]) so that the whole
//! merge workflow can be exercised in tests without a Bot API server.

pub mod access;
pub mod broadcast;
pub mod collect;
pub mod core;
pub mod download;
pub mod merge;
pub mod pipeline;
pub mod progress;
pub mod service;
pub mod session;
pub mod staging;
pub mod storage;
pub mod upload;

pub use crate::core::config::Settings;
pub use crate::core::error::{AppError, AppResult};
pub use crate::service::{MergeService, RequestContext};

//! Common test utilities
//!
//! This module is shared across all integration tests

pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{ctx, group_ctx, video, TestEnv, TestOptions, ADMIN_ID, OWNER_ID};

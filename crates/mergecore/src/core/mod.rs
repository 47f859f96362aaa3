//! Ambient plumbing: configuration, errors, logging, retry, small helpers

pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod utils;

pub use error::{AppError, AppResult};
pub use logging::{init_logger, log_startup_configuration};

use thiserror::Error;

use crate::access::AccessDenied;
use crate::core::config::ConfigError;
use crate::download::DownloadError;
use crate::merge::MergeError;
use crate::session::SessionError;
use crate::upload::DeliveryError;

/// Centralized error type for the library
///
/// Every fallible operation in mergecore ends up here. The domain variants
/// (`Access`, `Session`, `Merge`, `Delivery`, `Download`, `Config`) wrap the
/// per-module error enums; the rest come straight from infrastructure crates.
///
/// # Example
///
/// ```no_run
/// use mergecore::AppError;
///
/// fn report(err: &AppError) -> String {
///     err.user_message()
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database connection pool errors
    #[error("Database pool error: {0}")]
    DatabasePool(#[from] r2d2::Error),

    /// HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of stored descriptors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Request rejected by access control
    #[error(transparent)]
    Access(#[from] AccessDenied),

    /// Session state machine refused the transition
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Anyhow errors (for general error handling)
    #[error("Application error: {0}")]
    Anyhow(#[from] anyhow::Error),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Text suitable for showing to a chat user. Infrastructure failures are
    /// collapsed into a generic message; their details go to the log.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Access(e) => e.to_string(),
            AppError::Session(e) => e.to_string(),
            AppError::Merge(e) => e.to_string(),
            AppError::Delivery(e) => e.to_string(),
            AppError::Download(e) => e.to_string(),
            AppError::Validation(msg) => msg.clone(),
            _ => "Internal error, please try again later.".to_string(),
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, AppError::Access(_))
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        AppError::Validation(err)
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        AppError::Validation(err.to_string())
    }
}

//! Telegram bot handler tree configuration
//!
//! The handlers are organized so that integration tests can drive the same
//! tree as production against a mocked Bot API.

mod callbacks;
mod commands;
mod media;
mod progress;
mod schema;
mod types;

pub use callbacks::outcome_text;
pub use commands::{about_text, cancel_text, help_text, queue_summary_text, welcome_text};
pub use media::{collected_text, incoming_media, link_in_text};
pub use progress::{progress_bar, progress_text, StatusProgress};
pub use schema::schema;
pub use types::{callback_context, message_context, HandlerDeps, HandlerError};

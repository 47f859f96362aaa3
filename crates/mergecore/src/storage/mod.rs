//! SQLite persistence: users, authorized chats, merge and broadcast logs

pub mod db;
pub mod logs;
pub mod migrations;

pub use db::{create_pool, get_connection, DbConnection, DbPool};

use chrono::{DateTime, SecondsFormat, Utc};

/// Canonical timestamp encoding for every TEXT time column.
pub(crate) fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn from_db_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

//! Merge and broadcast logs, plus the aggregate statistics built on them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{from_db_time, to_db_time};
use crate::core::error::AppResult;

/// What a merge input looked like when it was staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub name: String,
    /// `telegram:<file_id>` or the source URL
    pub source: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub name: String,
    pub size_bytes: u64,
    /// `stream_copy` or `reencode`
    pub strategy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Success,
    Failure,
}

impl MergeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStatus::Success => "success",
            MergeStatus::Failure => "failure",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(MergeStatus::Success),
            "failure" => Some(MergeStatus::Failure),
            _ => None,
        }
    }
}

/// Whether the merged output reached the user. Independent of
/// [`MergeStatus`]: a merge can succeed and its delivery still fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    DeliveryFailed,
    NotAttempted,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::DeliveryFailed => "delivery_failed",
            DeliveryOutcome::NotAttempted => "not_attempted",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "delivered" => Some(DeliveryOutcome::Delivered),
            "delivery_failed" => Some(DeliveryOutcome::DeliveryFailed),
            "not_attempted" => Some(DeliveryOutcome::NotAttempted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMergeLog {
    pub user_id: i64,
    pub chat_id: i64,
    pub inputs: Vec<InputDescriptor>,
    pub output: Option<OutputDescriptor>,
    pub status: MergeStatus,
    pub delivery_mode: Option<String>,
    pub delivery_outcome: DeliveryOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MergeLog {
    pub id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub inputs: Vec<InputDescriptor>,
    pub output: Option<OutputDescriptor>,
    pub status: MergeStatus,
    pub delivery_mode: Option<String>,
    pub delivery_outcome: DeliveryOutcome,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Inserts an immutable merge log entry and returns its generated id.
pub fn insert_merge_log(conn: &Connection, log: &NewMergeLog, now: DateTime<Utc>) -> AppResult<String> {
    let id = Uuid::new_v4().to_string();
    let inputs = serde_json::to_string(&log.inputs)?;
    let output = log.output.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO merge_logs
            (id, user_id, chat_id, inputs, output, status, delivery_mode, delivery_outcome, error, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            log.user_id,
            log.chat_id,
            inputs,
            output,
            log.status.as_str(),
            log.delivery_mode,
            log.delivery_outcome.as_str(),
            log.error,
            to_db_time(now),
        ],
    )?;
    Ok(id)
}

fn map_merge_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeLog> {
    let inputs: String = row.get(3)?;
    let output: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    let outcome: String = row.get(7)?;
    let created: String = row.get(9)?;

    let bad = |idx: usize, what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected {} value", what).into(),
        )
    };
    let json_err =
        |idx: usize, e: serde_json::Error| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e));

    Ok(MergeLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        chat_id: row.get(2)?,
        inputs: serde_json::from_str(&inputs).map_err(|e| json_err(3, e))?,
        output: output
            .map(|o| serde_json::from_str(&o))
            .transpose()
            .map_err(|e| json_err(4, e))?,
        status: MergeStatus::parse(&status).ok_or_else(|| bad(5, "status"))?,
        delivery_mode: row.get(6)?,
        delivery_outcome: DeliveryOutcome::parse(&outcome).ok_or_else(|| bad(7, "delivery_outcome"))?,
        error: row.get(8)?,
        created_at: from_db_time(9, &created)?,
    })
}

const MERGE_LOG_COLUMNS: &str =
    "id, user_id, chat_id, inputs, output, status, delivery_mode, delivery_outcome, error, created_at";

/// Merge logs of one user, newest first.
pub fn merge_logs_for_user(conn: &Connection, user_id: i64) -> AppResult<Vec<MergeLog>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM merge_logs WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
        MERGE_LOG_COLUMNS
    ))?;
    let rows = stmt.query_map([user_id], map_merge_log)?;
    let mut logs = Vec::new();
    for row in rows {
        logs.push(row?);
    }
    Ok(logs)
}

pub fn count_merge_logs(conn: &Connection, status: Option<MergeStatus>) -> rusqlite::Result<i64> {
    match status {
        Some(status) => conn.query_row(
            "SELECT COUNT(*) FROM merge_logs WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        ),
        None => conn.query_row("SELECT COUNT(*) FROM merge_logs", [], |row| row.get(0)),
    }
}

#[derive(Debug, Clone)]
pub struct NewBroadcastLog {
    pub message_text: String,
    pub sender_id: i64,
    pub recipient_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Failure reason -> number of recipients
    pub failure_summary: BTreeMap<String, usize>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BroadcastLog {
    pub id: i64,
    pub message_text: String,
    pub sender_id: i64,
    pub recipient_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub failure_summary: BTreeMap<String, usize>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

pub fn insert_broadcast_log(conn: &Connection, log: &NewBroadcastLog, now: DateTime<Utc>) -> AppResult<i64> {
    let summary = serde_json::to_string(&log.failure_summary)?;
    let duration_ms = i64::try_from(log.duration.as_millis()).unwrap_or(i64::MAX);
    conn.execute(
        "INSERT INTO broadcast_logs
            (message_text, sender_id, recipient_count, success_count, failure_count,
             failure_summary, duration_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            log.message_text,
            log.sender_id,
            log.recipient_count as i64,
            log.success_count as i64,
            log.failure_count as i64,
            summary,
            duration_ms,
            to_db_time(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_broadcast_log(conn: &Connection, id: i64) -> AppResult<Option<BroadcastLog>> {
    let row = conn
        .query_row(
            "SELECT id, message_text, sender_id, recipient_count, success_count, failure_count,
                    failure_summary, duration_ms, created_at
             FROM broadcast_logs WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((id, message_text, sender_id, recipients, successes, failures, summary, duration_ms, created)) = row
    else {
        return Ok(None);
    };

    Ok(Some(BroadcastLog {
        id,
        message_text,
        sender_id,
        recipient_count: usize::try_from(recipients).unwrap_or_default(),
        success_count: usize::try_from(successes).unwrap_or_default(),
        failure_count: usize::try_from(failures).unwrap_or_default(),
        failure_summary: serde_json::from_str(&summary)?,
        duration_ms: u64::try_from(duration_ms).unwrap_or_default(),
        created_at: from_db_time(8, &created)?,
    }))
}

/// Aggregate counters for `/stats` and the admin panel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub total_users: i64,
    pub banned_users: i64,
    pub active_users_24h: i64,
    pub total_merges: i64,
    pub failed_merges: i64,
    pub merges_today: i64,
    pub authorized_chats: i64,
    pub broadcasts: i64,
}

/// Computes [`GlobalStats`]. "Today" is the current UTC calendar day.
pub fn global_stats(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<GlobalStats> {
    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now);
    let day_ago = now - chrono::Duration::hours(24);

    let count = |sql: &str, param: Option<String>| -> rusqlite::Result<i64> {
        match param {
            Some(p) => conn.query_row(sql, [p], |row| row.get(0)),
            None => conn.query_row(sql, [], |row| row.get(0)),
        }
    };

    Ok(GlobalStats {
        total_users: count("SELECT COUNT(*) FROM users", None)?,
        banned_users: count("SELECT COUNT(*) FROM users WHERE is_banned = 1", None)?,
        active_users_24h: count(
            "SELECT COUNT(*) FROM users WHERE last_active_at >= ?1",
            Some(to_db_time(day_ago)),
        )?,
        total_merges: count("SELECT COUNT(*) FROM merge_logs WHERE status = 'success'", None)?,
        failed_merges: count("SELECT COUNT(*) FROM merge_logs WHERE status = 'failure'", None)?,
        merges_today: count(
            "SELECT COUNT(*) FROM merge_logs WHERE status = 'success' AND created_at >= ?1",
            Some(to_db_time(day_start)),
        )?,
        authorized_chats: count("SELECT COUNT(*) FROM authorized_chats", None)?,
        broadcasts: count("SELECT COUNT(*) FROM broadcast_logs", None)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopUser {
    pub user_id: i64,
    pub username: Option<String>,
    pub merge_count: i64,
}

/// Users with the most successful merges.
pub fn top_users(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<TopUser>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, merge_count FROM users
         WHERE merge_count > 0
         ORDER BY merge_count DESC, id
         LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        Ok(TopUser {
            user_id: row.get(0)?,
            username: row.get(1)?,
            merge_count: row.get(2)?,
        })
    })?;
    rows.collect()
}

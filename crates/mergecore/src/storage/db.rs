use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Result};
use std::time::Duration;

use super::{from_db_time, migrations, to_db_time};
use crate::core::error::AppError;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// A bot user. Created on first admitted interaction, never deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    /// Telegram user id
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Number of merges that finished with status `success`
    pub merge_count: i64,
    pub is_banned: bool,
}

impl User {
    /// `@username` when known, otherwise the first name, otherwise the id.
    pub fn display_name(&self) -> String {
        match (&self.username, &self.first_name) {
            (Some(u), _) => format!("@{}", u),
            (None, Some(name)) => name.clone(),
            (None, None) => self.id.to_string(),
        }
    }
}

/// Create a new database connection pool
///
/// Initializes a pool with up to 10 connections, switches the database to
/// WAL mode and applies the embedded migrations before returning.
///
/// # Arguments
///
/// * `database_path` - Path to SQLite database file
///
/// # Example
///
/// ```no_run
/// use mergecore::storage;
///
/// let pool = storage::create_pool("vidmerge.sqlite")?;
/// # Ok::<(), mergecore::AppError>(())
/// ```
pub fn create_pool(database_path: &str) -> Result<DbPool, AppError> {
    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")
    });
    let pool = Pool::builder().max_size(10).build(manager)?;

    let mut conn = pool.get()?;
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::debug!("SQLite journal mode: {}", mode);
    migrations::run_migrations(&mut conn)?;

    Ok(pool)
}

/// Get a connection from the pool
///
/// The connection is returned to the pool when dropped.
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

fn map_user(row: &rusqlite::Row<'_>) -> Result<User> {
    let joined: String = row.get(3)?;
    let active: String = row.get(4)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        joined_at: from_db_time(3, &joined)?,
        last_active_at: from_db_time(4, &active)?,
        merge_count: row.get(5)?,
        is_banned: row.get(6)?,
    })
}

const USER_COLUMNS: &str = "id, username, first_name, joined_at, last_active_at, merge_count, is_banned";

/// Records an interaction: creates the user on first contact, otherwise
/// refreshes the profile fields and `last_active_at`.
///
/// # Returns
///
/// `true` if the user was created by this call.
pub fn touch_user(
    conn: &Connection,
    user_id: i64,
    username: Option<&str>,
    first_name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now = to_db_time(now);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO users (id, username, first_name, joined_at, last_active_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![user_id, username, first_name, now],
    )?;
    if inserted == 0 {
        conn.execute(
            "UPDATE users
             SET username = COALESCE(?2, username),
                 first_name = COALESCE(?3, first_name),
                 last_active_at = ?4
             WHERE id = ?1",
            params![user_id, username, first_name, now],
        )?;
    }
    Ok(inserted > 0)
}

pub fn get_user(conn: &Connection, user_id: i64) -> Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
        [user_id],
        map_user,
    )
    .optional()
}

/// Unknown users are not banned.
pub fn is_banned(conn: &Connection, user_id: i64) -> Result<bool> {
    let banned: Option<bool> = conn
        .query_row("SELECT is_banned FROM users WHERE id = ?1", [user_id], |row| row.get(0))
        .optional()?;
    Ok(banned.unwrap_or(false))
}

/// Sets the ban flag.
///
/// # Returns
///
/// `false` when no such user exists.
pub fn set_banned(conn: &Connection, user_id: i64, banned: bool) -> Result<bool> {
    let changed = conn.execute("UPDATE users SET is_banned = ?2 WHERE id = ?1", params![user_id, banned])?;
    Ok(changed > 0)
}

pub fn increment_merge_count(conn: &Connection, user_id: i64) -> Result<()> {
    conn.execute("UPDATE users SET merge_count = merge_count + 1 WHERE id = ?1", [user_id])?;
    Ok(())
}

/// All user ids, oldest first. Banned users are included only on request.
pub fn all_user_ids(conn: &Connection, include_banned: bool) -> Result<Vec<i64>> {
    let sql = if include_banned {
        "SELECT id FROM users ORDER BY joined_at, id"
    } else {
        "SELECT id FROM users WHERE is_banned = 0 ORDER BY joined_at, id"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

/// Adds a chat to the authorized set.
///
/// # Returns
///
/// `true` if the chat was not authorized before.
pub fn authorize_chat(conn: &Connection, chat_id: i64, authorized_by: i64, now: DateTime<Utc>) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO authorized_chats (chat_id, authorized_by, authorized_at) VALUES (?1, ?2, ?3)",
        params![chat_id, authorized_by, to_db_time(now)],
    )?;
    Ok(inserted > 0)
}

/// # Returns
///
/// `true` if the chat was authorized before.
pub fn unauthorize_chat(conn: &Connection, chat_id: i64) -> Result<bool> {
    let removed = conn.execute("DELETE FROM authorized_chats WHERE chat_id = ?1", [chat_id])?;
    Ok(removed > 0)
}

pub fn is_chat_authorized(conn: &Connection, chat_id: i64) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM authorized_chats WHERE chat_id = ?1)",
        [chat_id],
        |row| row.get(0),
    )
}

//! Owner broadcast to every known, non-banned user.
//!
//! Best effort: each recipient gets exactly one attempt, a failure is
//! counted under its reason and the run moves on. One [`BroadcastLog`] row
//! is written at the end.
//!
//! [`BroadcastLog`]: crate::storage::logs::BroadcastLog

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::core::error::{AppError, AppResult};
use crate::core::retry::Retryable;
use crate::storage::logs::{insert_broadcast_log, NewBroadcastLog};
use crate::storage::{db, get_connection, DbPool};
use crate::upload::DeliveryError;

/// Progress is reported after this many recipients.
pub const PROGRESS_EVERY: usize = 100;

#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn deliver(&self, user_id: i64, text: &str) -> Result<(), DeliveryError>;

    async fn progress(&self, _done: usize, _total: usize) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub log_id: i64,
    pub recipients: usize,
    pub successes: usize,
    pub failures: usize,
    pub failure_summary: BTreeMap<String, usize>,
    pub duration: Duration,
}

pub async fn broadcast(
    pool: &DbPool,
    sink: &dyn BroadcastSink,
    sender_id: i64,
    text: &str,
    delay: Duration,
) -> AppResult<BroadcastReport> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AppError::Validation("Broadcast text is empty.".to_string()));
    }

    let recipients = {
        let conn = get_connection(pool)?;
        db::all_user_ids(&conn, false)?
    };
    let total = recipients.len();
    log::info!("📢 Broadcast from {} to {} users started", sender_id, total);

    let started = Instant::now();
    let mut successes = 0;
    let mut failure_summary: BTreeMap<String, usize> = BTreeMap::new();

    for (i, user_id) in recipients.iter().enumerate() {
        match sink.deliver(*user_id, text).await {
            Ok(()) => successes += 1,
            Err(e) => {
                log::debug!("Broadcast to {} failed: {}", user_id, e);
                *failure_summary.entry(e.reason().to_string()).or_default() += 1;
                // flood control: honour the server's wait before the next recipient
                if let Some(wait) = e.retry_after() {
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let done = i + 1;
        if done % PROGRESS_EVERY == 0 && done < total {
            sink.progress(done, total).await;
        }
        if done < total && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    let failures = total - successes;
    let duration = started.elapsed();
    let log_id = {
        let conn = get_connection(pool)?;
        insert_broadcast_log(
            &conn,
            &NewBroadcastLog {
                message_text: text.to_string(),
                sender_id,
                recipient_count: total,
                success_count: successes,
                failure_count: failures,
                failure_summary: failure_summary.clone(),
                duration,
            },
            Utc::now(),
        )?
    };

    log::info!(
        "📢 Broadcast #{} finished: {}/{} delivered in {:.1}s",
        log_id,
        successes,
        total,
        duration.as_secs_f64()
    );

    Ok(BroadcastReport {
        log_id,
        recipients: total,
        successes,
        failures,
        failure_summary,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::create_pool;
    use crate::storage::logs::get_broadcast_log;
    use std::sync::Mutex;

    struct RecordingSink {
        blocked: Vec<i64>,
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl BroadcastSink for RecordingSink {
        async fn deliver(&self, user_id: i64, _text: &str) -> Result<(), DeliveryError> {
            self.seen.lock().unwrap().push(user_id);
            if self.blocked.contains(&user_id) {
                Err(DeliveryError::Rejected {
                    reason: "bot was blocked by the user".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(dir.path().join("db.sqlite").to_str().unwrap()).unwrap();
        {
            let conn = get_connection(&pool).unwrap();
            for id in 1..=4 {
                db::touch_user(&conn, id, None, None, Utc::now()).unwrap();
            }
            db::set_banned(&conn, 4, true).unwrap();
        }

        let sink = RecordingSink {
            blocked: vec![1],
            seen: Mutex::new(Vec::new()),
        };
        let report = broadcast(&pool, &sink, 99, "hello", Duration::ZERO).await.unwrap();

        assert_eq!(report.recipients, 3);
        assert_eq!(report.successes, 2);
        assert_eq!(report.failures, 1);
        assert_eq!(report.failure_summary.get("rejected"), Some(&1));
        // banned users are skipped, the blocked one did not stop the rest
        assert_eq!(*sink.seen.lock().unwrap(), vec![1, 2, 3]);

        let conn = get_connection(&pool).unwrap();
        let log = get_broadcast_log(&conn, report.log_id).unwrap().unwrap();
        assert_eq!(log.success_count + log.failure_count, log.recipient_count);
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(dir.path().join("db.sqlite").to_str().unwrap()).unwrap();
        let sink = RecordingSink {
            blocked: vec![],
            seen: Mutex::new(Vec::new()),
        };
        assert!(matches!(
            broadcast(&pool, &sink, 1, "   ", Duration::ZERO).await,
            Err(AppError::Validation(_))
        ));
    }
}

//! Broadcast through `MergeService` against a mocked sink.

mod common;
mod mocks;

use common::{TestEnv, ADMIN_ID, OWNER_ID};
use mergecore::storage::get_connection;
use mergecore::storage::logs::get_broadcast_log;
use mocks::MockSink;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_broadcast_counts_failures_without_stopping() {
    let env = TestEnv::new();
    for id in 100..200 {
        env.add_user(id);
    }
    let sink = MockSink::rejecting([105, 120, 150, 170, 199]);

    let report = env.service.broadcast(OWNER_ID, "New release is out!", &sink).await.unwrap();

    assert_eq!(report.recipients, 100);
    assert_eq!(report.successes, 95);
    assert_eq!(report.failures, 5);
    assert_eq!(report.failure_summary.get("rejected"), Some(&5));
    assert_eq!(sink.delivered.lock().unwrap().len(), 95);

    let conn = get_connection(&env.pool).unwrap();
    let log = get_broadcast_log(&conn, report.log_id).unwrap().unwrap();
    assert_eq!(log.recipient_count, 100);
    assert_eq!(log.success_count, 95);
    assert_eq!(log.failure_count, 5);
    assert_eq!(log.sender_id, OWNER_ID);
    assert_eq!(log.message_text, "New release is out!");
}

#[tokio::test]
async fn test_broadcast_skips_banned_users() {
    let env = TestEnv::new();
    env.add_user(10);
    env.add_user(11);
    env.ban(12);
    let sink = MockSink::default();

    let report = env.service.broadcast(OWNER_ID, "hi", &sink).await.unwrap();

    assert_eq!(report.recipients, 2);
    assert_eq!(*sink.delivered.lock().unwrap(), vec![10, 11]);
}

#[tokio::test]
async fn test_broadcast_reports_progress_every_hundred() {
    let env = TestEnv::new();
    for id in 1000..1250 {
        env.add_user(id);
    }
    let sink = MockSink::default();

    let report = env.service.broadcast(OWNER_ID, "hello", &sink).await.unwrap();

    assert_eq!(report.successes, 250);
    assert_eq!(*sink.progress.lock().unwrap(), vec![(100, 250), (200, 250)]);
}

#[tokio::test]
async fn test_broadcast_is_owner_only() {
    let env = TestEnv::new();
    env.add_user(10);
    let sink = MockSink::default();

    let err = env.service.broadcast(ADMIN_ID, "hello", &sink).await.unwrap_err();
    assert!(err.is_access_denied());
    assert!(sink.delivered.lock().unwrap().is_empty());
}

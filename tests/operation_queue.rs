mod common;

use std::sync::Arc;

use common::{open_store, pool, record, sync_settings, FakeMessage, FakeRemote};
use mailmirror::errors::RemoteError;
use mailmirror::pool::ConnectionPool;
use mailmirror::queue::{DrainReport, OperationQueue};
use mailmirror::sync::SyncEngine;
use mailmirror::types::{OpKind, OpStatus};

const ACCOUNT: &str = "me@example.com";
const INBOX: &str = "INBOX";

async fn drain(queue: &OperationQueue, pool: &Arc<ConnectionPool>) -> DrainReport {
    let pool = pool.clone();
    queue
        .drain(move |account| (account == ACCOUNT).then(|| pool.clone()))
        .await
        .unwrap()
}

#[tokio::test]
async fn enqueue_mutates_cache_without_network() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    for uid in 1..=3 {
        store.upsert_metadata(&record(ACCOUNT, INBOX, uid, 0)).await.unwrap();
    }
    let remote = FakeRemote::new();
    let queue = OperationQueue::new(store.clone());

    let queued = queue.enqueue(ACCOUNT, INBOX, OpKind::Delete, &[1, 2]).await.unwrap();
    queue.enqueue(ACCOUNT, INBOX, OpKind::MarkRead, &[3]).await.unwrap();

    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|op| op.attempts == 0 && op.last_error.is_none()));
    assert!(store.get(ACCOUNT, INBOX, 1).await.unwrap().is_none());
    assert!(store.get(ACCOUNT, INBOX, 2).await.unwrap().is_none());
    assert!(!store.get(ACCOUNT, INBOX, 3).await.unwrap().unwrap().unread);
    assert_eq!(queue.pending(Some(ACCOUNT)).await.unwrap().len(), 3);
    assert_eq!(remote.connects(), 0);
}

#[tokio::test]
async fn delete_retries_until_remote_confirms() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    store.upsert_metadata(&record(ACCOUNT, INBOX, 42, 0)).await.unwrap();

    let remote = FakeRemote::new();
    remote.put(INBOX, vec![FakeMessage::new(42, 0)]);
    remote.fail_next("store_flag", RemoteError::Connection("connection reset".into()));
    remote.fail_next("store_flag", RemoteError::Connection("connection reset".into()));

    let pool = pool(&remote, ACCOUNT);
    let queue = OperationQueue::new(store.clone());
    queue.enqueue(ACCOUNT, INBOX, OpKind::Delete, &[42]).await.unwrap();

    for _ in 0..2 {
        let report = drain(&queue, &pool).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 0);
    }
    let pending = queue.pending(Some(ACCOUNT)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 2);
    assert!(pending[0].last_error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(store.pending_counts(ACCOUNT).await.unwrap(), (1, 1));

    let report = drain(&queue, &pool).await;
    assert_eq!(report.succeeded, 1);
    assert!(queue.pending(Some(ACCOUNT)).await.unwrap().is_empty());
    assert!(remote.uids(INBOX).is_empty());

    let log = store.op_log(ACCOUNT, 10).await.unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].status, OpStatus::Success);
    assert_eq!(log[0].uid, 42);
    assert!(log[1..].iter().all(|e| e.status == OpStatus::Failed));
}

#[tokio::test]
async fn confirmed_delete_removes_record_resurrected_by_sync() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    store.upsert_metadata(&record(ACCOUNT, INBOX, 42, 0)).await.unwrap();

    let remote = FakeRemote::new();
    remote.put(INBOX, vec![FakeMessage::new(42, 0)]);
    let pool = pool(&remote, ACCOUNT);
    let queue = OperationQueue::new(store.clone());

    queue.enqueue(ACCOUNT, INBOX, OpKind::Delete, &[42]).await.unwrap();
    // A sync that read the remote before the delete went out.
    store.upsert_metadata(&record(ACCOUNT, INBOX, 42, 0)).await.unwrap();
    assert!(store.get(ACCOUNT, INBOX, 42).await.unwrap().is_some());

    drain(&queue, &pool).await;
    assert!(store.get(ACCOUNT, INBOX, 42).await.unwrap().is_none());
}

#[tokio::test]
async fn pending_ops_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(dir.path()).await;
        store.upsert_metadata(&record(ACCOUNT, INBOX, 5, 0)).await.unwrap();
        OperationQueue::new(store.clone())
            .enqueue(ACCOUNT, INBOX, OpKind::MoveTrash, &[5])
            .await
            .unwrap();
        store.database().pool().close().await;
    }

    let store = open_store(dir.path()).await;
    let queue = OperationQueue::new(store.clone());
    let pending = queue.pending(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OpKind::MoveTrash);
    assert!(store.get(ACCOUNT, INBOX, 5).await.unwrap().is_none());

    let remote = FakeRemote::new();
    remote.put(INBOX, vec![FakeMessage::new(5, 0)]);
    let pool = pool(&remote, ACCOUNT);
    let report = drain(&queue, &pool).await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(remote.uids("Trash"), vec![5]);
    assert!(remote.uids(INBOX).is_empty());
}

#[tokio::test]
async fn drain_applies_account_ops_in_enqueue_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    store.upsert_metadata(&record(ACCOUNT, INBOX, 1, 0)).await.unwrap();

    let remote = FakeRemote::new();
    remote.put(INBOX, vec![FakeMessage::new(1, 0)]);
    let pool = pool(&remote, ACCOUNT);
    let queue = OperationQueue::new(store.clone());

    queue.enqueue(ACCOUNT, INBOX, OpKind::MarkRead, &[1]).await.unwrap();
    queue.enqueue(ACCOUNT, INBOX, OpKind::MarkUnread, &[1]).await.unwrap();
    queue.enqueue(ACCOUNT, INBOX, OpKind::MarkRead, &[1]).await.unwrap();

    let ids: Vec<i64> = queue.pending(None).await.unwrap().iter().map(|op| op.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let report = drain(&queue, &pool).await;
    assert_eq!(report.succeeded, 3);
    assert!(!remote.message(INBOX, 1).unwrap().unread);
    assert!(!store.get(ACCOUNT, INBOX, 1).await.unwrap().unwrap().unread);
    assert_eq!(remote.connects(), 1);
}

#[tokio::test]
async fn connection_failure_defers_rest_of_account() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let remote = FakeRemote::new();
    remote.put(INBOX, (1..=3).map(|uid| FakeMessage::new(uid, 0)).collect());
    remote.fail_next("connect", RemoteError::Connection("network unreachable".into()));

    let pool = pool(&remote, ACCOUNT);
    let queue = OperationQueue::new(store.clone());
    queue.enqueue(ACCOUNT, INBOX, OpKind::MarkRead, &[1, 2, 3]).await.unwrap();

    let report = drain(&queue, &pool).await;
    assert_eq!(report.failed, 3);
    assert_eq!(remote.connects(), 0);
    assert_eq!(remote.calls("connect"), 1);
    assert!(queue
        .pending(None)
        .await
        .unwrap()
        .iter()
        .all(|op| op.attempts == 1));

    let report = drain(&queue, &pool).await;
    assert_eq!(report.succeeded, 3);
}

#[tokio::test]
async fn missing_remote_message_confirms_removal_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let remote = FakeRemote::new();
    remote.put(INBOX, vec![FakeMessage::new(1, 0)]);

    let pool = pool(&remote, ACCOUNT);
    let queue = OperationQueue::new(store.clone());
    queue.enqueue(ACCOUNT, INBOX, OpKind::Delete, &[77]).await.unwrap();
    queue.enqueue(ACCOUNT, INBOX, OpKind::MarkRead, &[78]).await.unwrap();

    let report = drain(&queue, &pool).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);

    let pending = queue.pending(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].uid, 78);
    // Operation-level failure keeps the session.
    assert_eq!(remote.connects(), 1);
}

#[tokio::test]
async fn accounts_without_pool_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let remote = FakeRemote::new();
    let pool = pool(&remote, ACCOUNT);
    let queue = OperationQueue::new(store.clone());

    queue
        .enqueue("gone@example.com", INBOX, OpKind::Delete, &[1])
        .await
        .unwrap();
    let report = drain(&queue, &pool).await;

    assert_eq!(report.skipped_accounts, 1);
    assert_eq!(queue.pending(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn uid_validity_reset_drops_old_epoch_ops() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let remote = FakeRemote::new();
    remote.put(INBOX, vec![FakeMessage::new(1, 0), FakeMessage::new(2, 0)]);

    let pool = pool(&remote, ACCOUNT);
    let engine = SyncEngine::new(store.clone(), sync_settings());
    engine.run(&pool, INBOX).await.unwrap();
    let queue = OperationQueue::new(store.clone());
    queue.enqueue(ACCOUNT, INBOX, OpKind::Delete, &[1]).await.unwrap();

    // Renumbered: uid 1 now names a different message.
    remote.remove(INBOX, 1);
    remote.remove(INBOX, 2);
    remote.set_uid_validity(2);
    let mut fresh = FakeMessage::new(1, 0);
    fresh.subject = "Fresh".to_string();
    remote.put(INBOX, vec![fresh]);

    let report = engine.run(&pool, INBOX).await.unwrap();
    assert_eq!(report.new_uids, vec![1]);
    assert!(queue.pending(None).await.unwrap().is_empty());
    assert_eq!(store.get(ACCOUNT, INBOX, 1).await.unwrap().unwrap().subject, "Fresh");

    let log = store.op_log(ACCOUNT, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, OpStatus::Failed);
    assert!(log[0].error.as_deref().unwrap().contains("uidValidity"));

    let report = drain(&queue, &pool).await;
    assert_eq!(report, DrainReport::default());
    assert_eq!(remote.uids(INBOX), vec![1]);
}

#[tokio::test]
async fn drain_refuses_op_from_another_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let remote = FakeRemote::new();
    remote.put(INBOX, vec![FakeMessage::new(1, 0)]);

    let pool = pool(&remote, ACCOUNT);
    SyncEngine::new(store.clone(), sync_settings())
        .run(&pool, INBOX)
        .await
        .unwrap();
    let queue = OperationQueue::new(store.clone());
    let queued = queue.enqueue(ACCOUNT, INBOX, OpKind::Delete, &[1]).await.unwrap();
    assert_eq!(queued[0].uid_validity, Some(1));

    // Renumbered before any sync noticed.
    remote.set_uid_validity(9);
    let report = drain(&queue, &pool).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 0);
    assert!(queue.pending(None).await.unwrap().is_empty());
    assert_eq!(remote.uids(INBOX), vec![1]);
    assert!(!remote.message(INBOX, 1).unwrap().deleted);
    assert_eq!(remote.calls("store_flag"), 0);

    let log = store.op_log(ACCOUNT, 10).await.unwrap();
    assert_eq!(log[0].status, OpStatus::Failed);
    assert!(log[0].error.as_deref().unwrap().contains("uidValidity changed"));
}

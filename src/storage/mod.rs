//! Two-tier cache: SQLite is the local source of truth, the memory tier keeps
//! hot copies. Writes touching one record are linearized on a striped lock so
//! a reader never sees the two tiers disagree mid-write.
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::body::snippet_from_html;
use crate::remote::BodyContent;
use crate::types::{now_ts, EmailRecord, MailboxMetadata, OpKind, OpLogEntry, OpStatus, PendingOp, RecordKey};

pub mod db;
pub mod memory;
pub mod ops;

pub use db::{Database, DB_FILE_NAME};
use db::FlagWrite;
use memory::MemoryTier;

const LOCK_STRIPES: usize = 64;

pub const UID_EPOCH_CHANGED: &str = "uidValidity changed";

pub struct CacheStore {
    db: Database,
    memory: MemoryTier,
    stripes: Vec<Mutex<()>>,
}

fn stripe_of(key: &RecordKey) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % LOCK_STRIPES
}

impl CacheStore {
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_with_memory_capacity(path, memory::DEFAULT_MEMORY_CAPACITY).await
    }

    pub async fn open_with_memory_capacity(path: &Path, capacity: usize) -> Result<Self> {
        let db = Database::open(path).await?;
        Ok(Self {
            db,
            memory: MemoryTier::with_capacity(capacity),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    // Stripes are always taken in ascending order, so multi-key writers
    // cannot deadlock each other.
    async fn lock_keys(&self, keys: &[RecordKey]) -> Vec<MutexGuard<'_, ()>> {
        let mut idx: Vec<usize> = keys.iter().map(stripe_of).collect();
        idx.sort_unstable();
        idx.dedup();
        let mut guards = Vec::with_capacity(idx.len());
        for i in idx {
            guards.push(self.stripes[i].lock().await);
        }
        guards
    }

    async fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(LOCK_STRIPES);
        for stripe in &self.stripes {
            guards.push(stripe.lock().await);
        }
        guards
    }

    /// Persistent tier first; the memory tier only answers when it misses.
    pub async fn get(&self, account: &str, mailbox: &str, uid: u32) -> Result<Option<EmailRecord>> {
        let key = RecordKey::new(account, mailbox, uid);
        let _guard = self.lock_keys(std::slice::from_ref(&key)).await;

        match self.db.get_record(&key).await {
            Ok(Some(record)) => {
                self.memory.put(record.clone());
                Ok(Some(record))
            }
            Ok(None) => Ok(self.memory.get(&key)),
            Err(err) => match self.memory.get(&key) {
                Some(record) => {
                    warn!(account = %account, mailbox = %mailbox, uid, error = %err, "Persistent read failed, serving memory copy");
                    Ok(Some(record))
                }
                None => Err(err),
            },
        }
    }

    /// Insert-if-absent. An existing record (and its body) is never touched.
    pub async fn upsert_metadata(&self, record: &EmailRecord) -> Result<bool> {
        let key = record.key();
        let _guard = self.lock_keys(std::slice::from_ref(&key)).await;
        let mut conn = self.db.pool().acquire().await.context("acquiring connection")?;
        db::insert_if_absent(&mut *conn, record, false).await
    }

    /// Sync-side batch insert. Uids with a pending operation are skipped so a
    /// queued delete is not undone before it is confirmed. Returns the uids
    /// actually inserted.
    pub async fn insert_discovered(&self, records: &[EmailRecord]) -> Result<Vec<u32>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<RecordKey> = records.iter().map(EmailRecord::key).collect();
        let _guards = self.lock_keys(&keys).await;

        let mut tx = self.db.pool().begin().await.context("beginning transaction")?;
        let mut inserted = Vec::new();
        for record in records {
            if db::insert_if_absent(&mut *tx, record, true).await? {
                inserted.push(record.uid);
            }
        }
        tx.commit().await.context("committing metadata insert tx")?;
        Ok(inserted)
    }

    /// Fills the body of an existing record. Returns false (and writes
    /// nothing) when the record is gone.
    pub async fn upsert_body(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
        body: &BodyContent,
    ) -> Result<bool> {
        let mut body = body.clone();
        if body.snippet.is_empty() && !body.html.is_empty() {
            body.snippet = snippet_from_html(&body.html);
        }

        let key = RecordKey::new(account, mailbox, uid);
        let _guard = self.lock_keys(std::slice::from_ref(&key)).await;
        let mut conn = self.db.pool().acquire().await.context("acquiring connection")?;
        let updated =
            db::update_body(&mut *conn, &key, &body.html, &body.snippet, &body.attachments).await?;
        if updated {
            self.memory.set_body(&key, &body);
        } else {
            debug!(account = %account, mailbox = %mailbox, uid, "Body arrived for a record that no longer exists");
            self.memory.remove(&key);
        }
        Ok(updated)
    }

    pub async fn update_flags(&self, account: &str, mailbox: &str, uid: u32, unread: bool) -> Result<bool> {
        let key = RecordKey::new(account, mailbox, uid);
        let _guard = self.lock_keys(std::slice::from_ref(&key)).await;
        let mut conn = self.db.pool().acquire().await.context("acquiring connection")?;
        let changed = db::update_unread(&mut *conn, &key, unread, FlagWrite::Local).await?;
        self.memory.set_unread(&key, unread);
        Ok(changed)
    }

    /// Applies remote flag state from a sync that started at `started_ms`.
    /// A uid keeps its local flag while an operation on it is pending, and
    /// also when a local change landed after the sync started.
    pub async fn apply_remote_flags(
        &self,
        account: &str,
        mailbox: &str,
        updates: &[(u32, bool)],
        started_ms: i64,
    ) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let keys: Vec<RecordKey> = updates
            .iter()
            .map(|(uid, _)| RecordKey::new(account, mailbox, *uid))
            .collect();
        let _guards = self.lock_keys(&keys).await;

        let mut tx = self.db.pool().begin().await.context("beginning transaction")?;
        let mut changed = Vec::new();
        for (key, (_, unread)) in keys.iter().zip(updates) {
            if db::update_unread(&mut *tx, key, *unread, FlagWrite::Remote { started_ms }).await? {
                changed.push((key, *unread));
            }
        }
        tx.commit().await.context("committing flag update tx")?;

        for (key, unread) in &changed {
            self.memory.set_unread(key, *unread);
        }
        Ok(changed.len())
    }

    pub async fn delete_record(&self, account: &str, mailbox: &str, uid: u32) -> Result<bool> {
        let key = RecordKey::new(account, mailbox, uid);
        let _guard = self.lock_keys(std::slice::from_ref(&key)).await;
        let mut conn = self.db.pool().acquire().await.context("acquiring connection")?;
        let deleted = db::delete_record(&mut *conn, &key).await?;
        let in_memory = self.memory.remove(&key);
        Ok(deleted || in_memory)
    }

    /// Drops every cached record of the mailbox whose uid is not in
    /// `remote_uids`. Returns how many were removed.
    pub async fn reconcile(&self, account: &str, mailbox: &str, remote_uids: &HashSet<u32>) -> Result<usize> {
        let mut conn = self.db.pool().acquire().await.context("acquiring connection")?;
        let cached = db::uids_in_mailbox(&mut *conn, account, mailbox).await?;
        drop(conn);

        let stale: Vec<RecordKey> = cached
            .into_iter()
            .filter(|uid| !remote_uids.contains(uid))
            .map(|uid| RecordKey::new(account, mailbox, uid))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let _guards = self.lock_keys(&stale).await;
        let mut tx = self.db.pool().begin().await.context("beginning transaction")?;
        let mut removed = 0;
        for key in &stale {
            if db::delete_record(&mut *tx, key).await? {
                removed += 1;
            }
        }
        tx.commit().await.context("committing reconcile tx")?;

        for key in &stale {
            self.memory.remove(key);
        }
        Ok(removed)
    }

    /// Wipes the mailbox (records and metadata), e.g. after a uidValidity change.
    /// Pending ops for the mailbox name uids of the old epoch, so they are
    /// dropped in the same transaction and logged as failed.
    pub async fn invalidate_mailbox(&self, account: &str, mailbox: &str) -> Result<u64> {
        let _guards = self.lock_all().await;
        let mut tx = self.db.pool().begin().await.context("beginning transaction")?;
        let removed = db::delete_mailbox(&mut *tx, account, mailbox).await?;
        let dropped = ops::discard_mailbox_ops(&mut *tx, account, mailbox, UID_EPOCH_CHANGED).await?;
        tx.commit().await.context("committing mailbox wipe")?;
        if dropped > 0 {
            warn!(account = %account, mailbox = %mailbox, dropped, "Dropped pending ops from a previous uidValidity");
        }
        self.memory.remove_mailbox(account, mailbox);
        Ok(removed)
    }

    pub async fn is_fresh(&self, account: &str, mailbox: &str, window: Duration) -> Result<bool> {
        let meta = self.db.mailbox_metadata(account, mailbox).await?;
        Ok(meta.is_some_and(|m| now_ts() - m.last_sync_ts < window.as_secs() as i64))
    }

    pub async fn mailbox_metadata(&self, account: &str, mailbox: &str) -> Result<Option<MailboxMetadata>> {
        self.db.mailbox_metadata(account, mailbox).await
    }

    pub async fn save_mailbox_metadata(&self, meta: &MailboxMetadata) -> Result<()> {
        self.db.save_mailbox_metadata(meta).await
    }

    pub async fn last_sync(&self, account: &str) -> Result<Option<i64>> {
        self.db.last_sync(account).await
    }

    pub async fn list(&self, account: &str, mailbox: &str, offset: u32, limit: u32) -> Result<Vec<EmailRecord>> {
        self.db.list_records(account, mailbox, offset, limit).await
    }

    pub async fn cached_flags(&self, account: &str, mailbox: &str) -> Result<HashMap<u32, bool>> {
        self.db.unread_by_uid(account, mailbox).await
    }

    pub async fn missing_bodies(&self, account: &str, mailbox: &str, limit: u32) -> Result<Vec<u32>> {
        self.db.missing_bodies(account, mailbox, limit).await
    }

    pub async fn count(&self, account: &str, mailbox: Option<&str>) -> Result<i64> {
        self.db.count(account, mailbox).await
    }

    /// Applies a user mutation locally and records the pending operations in
    /// one transaction. Nothing is written if any step fails.
    pub async fn enqueue_ops(
        &self,
        account: &str,
        mailbox: &str,
        kind: OpKind,
        uids: &[u32],
    ) -> Result<Vec<PendingOp>> {
        let keys: Vec<RecordKey> = uids
            .iter()
            .map(|uid| RecordKey::new(account, mailbox, *uid))
            .collect();
        let epoch = self
            .db
            .mailbox_metadata(account, mailbox)
            .await?
            .map(|m| m.uid_validity);
        let _guards = self.lock_keys(&keys).await;

        let mut tx = self.db.pool().begin().await.context("beginning transaction")?;
        let mut queued = Vec::with_capacity(keys.len());
        for key in &keys {
            apply_local(&mut *tx, key, kind).await?;
            queued.push(ops::insert_op(&mut *tx, account, mailbox, kind, key.uid, epoch).await?);
        }
        tx.commit().await.context("committing enqueue tx")?;

        for key in &keys {
            self.apply_local_memory(key, kind);
        }
        Ok(queued)
    }

    /// Remote side confirmed: drop the op, apply the local change once more
    /// (a sync may have re-inserted the record meanwhile) and log success.
    pub async fn confirm_op(&self, op: &PendingOp) -> Result<()> {
        let key = RecordKey::new(&op.account, &op.mailbox, op.uid);
        let _guard = self.lock_keys(std::slice::from_ref(&key)).await;

        let mut tx = self.db.pool().begin().await.context("beginning transaction")?;
        ops::clear_op(&mut *tx, op.id).await?;
        apply_local(&mut *tx, &key, op.kind).await?;
        ops::append_log(&mut *tx, op, OpStatus::Success, None).await?;
        tx.commit().await.context("committing op confirmation")?;

        self.apply_local_memory(&key, op.kind);
        Ok(())
    }

    pub async fn fail_op(&self, op: &PendingOp, error: &str) -> Result<()> {
        let mut tx = self.db.pool().begin().await.context("beginning transaction")?;
        ops::record_failure(&mut *tx, op.id, error).await?;
        ops::append_log(&mut *tx, op, OpStatus::Failed, Some(error)).await?;
        tx.commit().await.context("committing op failure")?;
        Ok(())
    }

    /// Gives up on an op for good: removes it and logs the failure.
    pub async fn discard_op(&self, op: &PendingOp, error: &str) -> Result<()> {
        let mut tx = self.db.pool().begin().await.context("beginning transaction")?;
        ops::clear_op(&mut *tx, op.id).await?;
        ops::append_log(&mut *tx, op, OpStatus::Failed, Some(error)).await?;
        tx.commit().await.context("committing op discard")?;
        Ok(())
    }

    pub async fn pending_ops(&self, account: Option<&str>) -> Result<Vec<PendingOp>> {
        ops::list_ops(self.db.pool(), account).await
    }

    /// (pending, failing) counts; failing ops have at least one failed attempt.
    pub async fn pending_counts(&self, account: &str) -> Result<(i64, i64)> {
        ops::count_ops(self.db.pool(), account).await
    }

    pub async fn pending_uids(&self, account: &str, mailbox: &str) -> Result<HashSet<u32>> {
        ops::pending_uids(self.db.pool(), account, mailbox).await
    }

    pub async fn op_log(&self, account: &str, limit: u32) -> Result<Vec<OpLogEntry>> {
        ops::recent_log(self.db.pool(), account, limit).await
    }

    fn apply_local_memory(&self, key: &RecordKey, kind: OpKind) {
        if kind.removes_message() {
            self.memory.remove(key);
        } else if let Some(unread) = kind.unread_value() {
            self.memory.set_unread(key, unread);
        }
    }
}

async fn apply_local(conn: &mut sqlx::SqliteConnection, key: &RecordKey, kind: OpKind) -> Result<()> {
    if kind.removes_message() {
        db::delete_record(conn, key).await?;
    } else if let Some(unread) = kind.unread_value() {
        db::update_unread(conn, key, unread, FlagWrite::Local).await?;
    }
    Ok(())
}

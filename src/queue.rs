use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult, RemoteError, RemoteResult};
use crate::pool::ConnectionPool;
use crate::remote::Flag;
use crate::storage::CacheStore;
use crate::types::{OpKind, PendingOp};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Accounts with pending ops but no pool to run them on.
    pub skipped_accounts: usize,
}

/// Durable queue of user mutations awaiting remote confirmation.
pub struct OperationQueue {
    store: Arc<CacheStore>,
}

impl OperationQueue {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// Mutates the cache and records the ops. Returns once both are durable;
    /// no network I/O happens here.
    pub async fn enqueue(
        &self,
        account: &str,
        mailbox: &str,
        kind: OpKind,
        uids: &[u32],
    ) -> AppResult<Vec<PendingOp>> {
        let queued = self
            .store
            .enqueue_ops(account, mailbox, kind, uids)
            .await
            .map_err(|e| AppError::QueuePersistence(format!("{e:#}")))?;
        debug!(account = %account, mailbox = %mailbox, kind = kind.as_str(), count = queued.len(), "Queued operations");
        Ok(queued)
    }

    pub async fn pending(&self, account: Option<&str>) -> AppResult<Vec<PendingOp>> {
        self.store.pending_ops(account).await.map_err(AppError::database)
    }

    /// Drains every pending op, grouped by account in enqueue order.
    pub async fn drain<R>(&self, resolve: R) -> AppResult<DrainReport>
    where
        R: Fn(&str) -> Option<Arc<ConnectionPool>>,
    {
        let ops = self.pending(None).await?;
        let mut report = DrainReport::default();
        if ops.is_empty() {
            return Ok(report);
        }

        let mut by_account: BTreeMap<String, Vec<PendingOp>> = BTreeMap::new();
        for op in ops {
            by_account.entry(op.account.clone()).or_default().push(op);
        }

        for (account, ops) in by_account {
            let Some(pool) = resolve(&account) else {
                warn!(account = %account, pending = ops.len(), "No connection pool for account with pending ops");
                report.skipped_accounts += 1;
                continue;
            };
            self.drain_account(&pool, ops, &mut report).await?;
        }
        Ok(report)
    }

    async fn drain_account(
        &self,
        pool: &ConnectionPool,
        ops: Vec<PendingOp>,
        report: &mut DrainReport,
    ) -> AppResult<()> {
        let drain_start = Instant::now();
        let account = pool.account().address.clone();
        let mut remaining = ops.into_iter();

        while let Some(op) = remaining.next() {
            match execute_remote(pool, &op.mailbox, op.kind, op.uid, op.uid_validity).await {
                Ok(()) => self.confirm(&op, report).await?,
                // Already gone remotely: the removal holds.
                Err(RemoteError::NotFound(_)) if op.kind.removes_message() => {
                    self.confirm(&op, report).await?
                }
                // The uid now names a different message; never retried.
                Err(err @ RemoteError::EpochChanged { .. }) => {
                    self.discard(&op, &err.to_string(), report).await?
                }
                Err(err) => {
                    let message = err.to_string();
                    self.fail(&op, &message, report).await?;
                    if err.is_connection_level() {
                        for rest in remaining.by_ref() {
                            self.fail(&rest, &message, report).await?;
                        }
                        break;
                    }
                }
            }
        }

        info!(
            account = %account,
            succeeded = report.succeeded,
            failed = report.failed,
            elapsed_ms = ?drain_start.elapsed().as_millis(),
            "Queue drain finished"
        );
        Ok(())
    }

    async fn confirm(&self, op: &PendingOp, report: &mut DrainReport) -> AppResult<()> {
        self.store.confirm_op(op).await.map_err(AppError::database)?;
        report.succeeded += 1;
        debug!(account = %op.account, mailbox = %op.mailbox, uid = op.uid, kind = op.kind.as_str(), "Operation confirmed");
        Ok(())
    }

    async fn discard(&self, op: &PendingOp, message: &str, report: &mut DrainReport) -> AppResult<()> {
        self.store.discard_op(op, message).await.map_err(AppError::database)?;
        report.failed += 1;
        warn!(
            account = %op.account,
            mailbox = %op.mailbox,
            uid = op.uid,
            kind = op.kind.as_str(),
            error = %message,
            "Operation dropped"
        );
        Ok(())
    }

    async fn fail(&self, op: &PendingOp, message: &str, report: &mut DrainReport) -> AppResult<()> {
        self.store.fail_op(op, message).await.map_err(AppError::database)?;
        report.failed += 1;
        warn!(
            account = %op.account,
            mailbox = %op.mailbox,
            uid = op.uid,
            kind = op.kind.as_str(),
            attempts = op.attempts + 1,
            error = %message,
            "Operation failed, will retry"
        );
        Ok(())
    }
}

/// Applies one mutation against the remote source. A delete flags the
/// message and expunges it. With `epoch` set, the mailbox must still carry
/// that uidValidity or nothing is touched.
pub async fn execute_remote(
    pool: &ConnectionPool,
    mailbox: &str,
    kind: OpKind,
    uid: u32,
    epoch: Option<u32>,
) -> RemoteResult<()> {
    let mb = mailbox.to_string();
    let trash = pool.account().trash_mailbox.clone();
    pool.with_connection(mailbox, move |s| {
        Box::pin(async move {
            if let Some(expected) = epoch {
                let status = s.select(&mb).await?;
                if status.uid_validity != expected {
                    return Err(RemoteError::EpochChanged {
                        expected,
                        found: status.uid_validity,
                    });
                }
            }
            match kind {
                OpKind::Delete => {
                    s.store_flag(&mb, uid, Flag::Deleted, true).await?;
                    s.expunge(&mb, uid).await
                }
                OpKind::MoveTrash => s.move_to_trash(&mb, uid, &trash).await,
                OpKind::MarkRead => s.store_flag(&mb, uid, Flag::Seen, true).await,
                OpKind::MarkUnread => s.store_flag(&mb, uid, Flag::Seen, false).await,
            }
        })
    })
    .await
}

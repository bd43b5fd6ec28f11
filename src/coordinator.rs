use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::body::decode_transfer;
use crate::config::SyncSettings;
use crate::errors::{AppError, AppResult, RemoteError};
use crate::pool::ConnectionPool;
use crate::protocol::{AccountStatus, AccountSummary, Event};
use crate::queue::{execute_remote, OperationQueue};
use crate::remote::Draft;
use crate::storage::CacheStore;
use crate::sync::{SyncEngine, SyncReport};
use crate::types::{now_ts, Account, EmailRecord, OpKind};

/// Most recent hits returned for a live search.
const SEARCH_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    AlreadySyncing,
}

type SyncingSet = Arc<StdMutex<HashSet<String>>>;

fn lock_set(set: &SyncingSet) -> StdMutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a mailbox as syncing for as long as it lives.
pub struct SyncGuard {
    syncing: SyncingSet,
    mailbox: String,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        lock_set(&self.syncing).remove(&self.mailbox);
    }
}

#[derive(Debug, Default)]
struct LastResult {
    last_success: Option<i64>,
    last_error: Option<String>,
}

/// Everything that happens for one account goes through here.
pub struct AccountCoordinator {
    account: Account,
    pool: Arc<ConnectionPool>,
    store: Arc<CacheStore>,
    queue: Arc<OperationQueue>,
    engine: SyncEngine,
    events: broadcast::Sender<Event>,
    syncing: SyncingSet,
    last: StdMutex<LastResult>,
    downloads_dir: PathBuf,
}

impl AccountCoordinator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        store: Arc<CacheStore>,
        queue: Arc<OperationQueue>,
        events: broadcast::Sender<Event>,
        settings: SyncSettings,
        downloads_dir: PathBuf,
    ) -> Self {
        Self {
            account: pool.account().clone(),
            engine: SyncEngine::new(store.clone(), settings),
            pool,
            store,
            queue,
            events,
            syncing: Arc::new(StdMutex::new(HashSet::new())),
            last: StdMutex::new(LastResult::default()),
            downloads_dir,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn address(&self) -> &str {
        &self.account.address
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn last(&self) -> StdMutexGuard<'_, LastResult> {
        self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the mailbox's sync slot, or `None` when a sync already holds it.
    pub fn try_begin_sync(&self, mailbox: &str) -> Option<SyncGuard> {
        let mut set = lock_set(&self.syncing);
        if !set.insert(mailbox.to_string()) {
            return None;
        }
        Some(SyncGuard {
            syncing: self.syncing.clone(),
            mailbox: mailbox.to_string(),
        })
    }

    pub fn syncing_mailboxes(&self) -> Vec<String> {
        let mut list: Vec<String> = lock_set(&self.syncing).iter().cloned().collect();
        list.sort();
        list
    }

    /// Runs a sync in the caller's task. A second call while one is running
    /// returns `AlreadySyncing` without touching the remote side.
    pub async fn sync(&self, mailbox: &str) -> AppResult<SyncOutcome> {
        let Some(guard) = self.try_begin_sync(mailbox) else {
            debug!(account = %self.account.address, mailbox = %mailbox, "Sync already in progress");
            return Ok(SyncOutcome::AlreadySyncing);
        };
        self.run_sync(guard, mailbox)
            .await
            .map(SyncOutcome::Completed)
    }

    /// Claims the slot now and hands back the sync as a future for the
    /// caller to spawn. `None` means a sync is already running.
    pub fn begin_background_sync(
        self: &Arc<Self>,
        mailbox: &str,
    ) -> Option<impl Future<Output = ()> + Send + 'static> {
        let guard = self.try_begin_sync(mailbox)?;
        let this = self.clone();
        let mailbox = mailbox.to_string();
        Some(async move {
            let _ = this.run_sync(guard, &mailbox).await;
        })
    }

    async fn run_sync(&self, guard: SyncGuard, mailbox: &str) -> AppResult<SyncReport> {
        let account = self.account.address.clone();
        self.emit(Event::SyncStarted {
            account: account.clone(),
            mailbox: mailbox.to_string(),
        });

        let result = self.engine.run(&self.pool, mailbox).await;
        drop(guard);

        match &result {
            Ok(report) => {
                {
                    let mut last = self.last();
                    last.last_success = Some(now_ts());
                    last.last_error = None;
                }
                self.emit(Event::SyncCompleted {
                    account: account.clone(),
                    mailbox: mailbox.to_string(),
                    new: report.new,
                    updated: report.updated,
                    deleted: report.deleted,
                    total: report.total,
                });
                if !report.new_uids.is_empty() {
                    self.emit(Event::NewEmails {
                        account,
                        mailbox: mailbox.to_string(),
                        uids: report.new_uids.clone(),
                    });
                }
            }
            Err(err) => {
                let message = err.to_string();
                self.last().last_error = Some(message.clone());
                self.emit(Event::SyncError {
                    account,
                    mailbox: mailbox.to_string(),
                    message,
                });
            }
        }
        result
    }

    /// Cache-only read, newest first, plus the mailbox total.
    pub async fn get_emails(
        &self,
        mailbox: &str,
        offset: u32,
        limit: u32,
    ) -> AppResult<(Vec<EmailRecord>, i64)> {
        let emails = self
            .store
            .list(&self.account.address, mailbox, offset, limit)
            .await
            .map_err(AppError::database)?;
        let total = self
            .store
            .count(&self.account.address, Some(mailbox))
            .await
            .map_err(AppError::database)?;
        Ok((emails, total))
    }

    /// Serves the cached record, fetching the body first when it is missing.
    pub async fn get_email_with_body(&self, mailbox: &str, uid: u32) -> AppResult<EmailRecord> {
        let address = &self.account.address;
        let record = self
            .store
            .get(address, mailbox, uid)
            .await
            .map_err(AppError::database)?
            .ok_or_else(|| AppError::NotFound(format!("uid {uid} is not cached in {mailbox}")))?;
        if record.has_body() {
            return Ok(record);
        }

        let mb = mailbox.to_string();
        let fetched = self
            .pool
            .with_connection(mailbox, move |s| {
                Box::pin(async move { s.fetch_body(&mb, uid).await })
            })
            .await;

        let body = match fetched {
            Ok(body) => body,
            Err(RemoteError::NotFound(_)) => {
                info!(account = %address, mailbox = %mailbox, uid, "Message vanished remotely, dropping cached copy");
                self.store
                    .delete_record(address, mailbox, uid)
                    .await
                    .map_err(AppError::database)?;
                return Err(AppError::NotFound(
                    "email was deleted on another device".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let stored = self
            .store
            .upsert_body(address, mailbox, uid, &body)
            .await
            .map_err(AppError::database)?;
        if !stored {
            return Err(AppError::NotFound(format!("uid {uid} was removed while loading")));
        }

        self.store
            .get(address, mailbox, uid)
            .await
            .map_err(AppError::database)?
            .ok_or_else(|| AppError::NotFound(format!("uid {uid} was removed while loading")))
    }

    /// Optimistic path: the cache changes now, the remote side on a later drain.
    pub async fn queue_op(&self, mailbox: &str, kind: OpKind, uids: &[u32]) -> AppResult<usize> {
        let queued = self
            .queue
            .enqueue(&self.account.address, mailbox, kind, uids)
            .await?;
        self.emit(Event::EmailUpdated {
            account: self.account.address.clone(),
            mailbox: mailbox.to_string(),
            uids: uids.to_vec(),
        });
        Ok(queued.len())
    }

    /// Confirmed path: each uid is applied remotely before the cache changes.
    pub async fn apply_now(&self, mailbox: &str, kind: OpKind, uids: &[u32]) -> AppResult<()> {
        let address = &self.account.address;
        let mut done = Vec::with_capacity(uids.len());
        let mut failure = None;

        for &uid in uids {
            if let Err(err) = execute_remote(&self.pool, mailbox, kind, uid, None).await {
                warn!(account = %address, mailbox = %mailbox, uid, kind = kind.as_str(), error = %err, "Remote mutation failed");
                failure = Some(AppError::from(err));
                break;
            }
            let local = if kind.removes_message() {
                self.store.delete_record(address, mailbox, uid).await
            } else {
                let unread = kind.unread_value().unwrap_or(false);
                self.store.update_flags(address, mailbox, uid, unread).await
            };
            local.map_err(AppError::database)?;
            done.push(uid);
        }

        if !done.is_empty() {
            self.emit(Event::EmailUpdated {
                account: address.clone(),
                mailbox: mailbox.to_string(),
                uids: done,
            });
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Always live; results are never written to the cache.
    pub async fn search(&self, mailbox: &str, query: &str) -> AppResult<Vec<EmailRecord>> {
        let mb = mailbox.to_string();
        let query = query.to_string();
        let envelopes = self
            .pool
            .with_connection(mailbox, move |s| {
                Box::pin(async move {
                    let mut uids = s.search(&mb, &query).await?;
                    if uids.is_empty() {
                        return Ok(Vec::new());
                    }
                    uids.sort_unstable_by(|a, b| b.cmp(a));
                    uids.truncate(SEARCH_LIMIT);
                    s.fetch_metadata(&mb, &uids).await
                })
            })
            .await?;

        let mut records: Vec<EmailRecord> = envelopes
            .into_iter()
            .map(|env| env.into_record(&self.account.address, mailbox))
            .collect();
        records.sort_by(|a, b| b.internal_date.cmp(&a.internal_date));
        Ok(records)
    }

    pub async fn labels(&self) -> AppResult<Vec<String>> {
        let mut labels = self
            .pool
            .with_connection("", |s| Box::pin(async move { s.list_mailboxes().await }))
            .await?;
        labels.sort();
        Ok(labels)
    }

    pub async fn save_draft(&self, to: &str, subject: &str, body: &str) -> AppResult<()> {
        let draft = Draft {
            from: self.account.address.clone(),
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        };
        let drafts = self.account.drafts_mailbox.clone();
        self.pool
            .with_connection(&self.account.drafts_mailbox, move |s| {
                Box::pin(async move { s.append_draft(&drafts, &draft).await })
            })
            .await?;
        info!(account = %self.account.address, "Draft saved");
        Ok(())
    }

    /// Fetches one attachment, undoes its transfer encoding and writes it
    /// under the downloads directory. Returns the written path.
    pub async fn download_attachment(
        &self,
        mailbox: &str,
        uid: u32,
        part_id: &str,
    ) -> AppResult<PathBuf> {
        let record = self
            .store
            .get(&self.account.address, mailbox, uid)
            .await
            .map_err(AppError::database)?
            .ok_or_else(|| AppError::NotFound(format!("uid {uid} is not cached in {mailbox}")))?;
        let attachment = record
            .attachments
            .iter()
            .find(|a| a.part_id == part_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no attachment part {part_id} on uid {uid}")))?;

        let mb = mailbox.to_string();
        let part = part_id.to_string();
        let raw = self
            .pool
            .with_connection(mailbox, move |s| {
                Box::pin(async move { s.fetch_part(&mb, uid, &part).await })
            })
            .await?;
        let bytes = decode_transfer(&raw, &attachment.encoding)
            .map_err(|e| AppError::Io(format!("{e:#}")))?;

        tokio::fs::create_dir_all(&self.downloads_dir)
            .await
            .map_err(|e| AppError::Io(e.to_string()))?;
        let path = self
            .downloads_dir
            .join(format!("{uid}-{}", safe_file_name(&attachment.filename)));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| AppError::Io(e.to_string()))?;

        info!(account = %self.account.address, uid, path = %path.display(), bytes = bytes.len(), "Attachment saved");
        Ok(path)
    }

    pub async fn status(&self) -> AppResult<AccountStatus> {
        let address = &self.account.address;
        let (pending_ops, failing_ops) = self
            .store
            .pending_counts(address)
            .await
            .map_err(AppError::database)?;
        let last_sync = self
            .store
            .last_sync(address)
            .await
            .map_err(AppError::database)?;
        let last_error = self.last().last_error.clone();

        Ok(AccountStatus {
            account: address.clone(),
            syncing: self.syncing_mailboxes(),
            last_sync,
            last_error,
            pending_ops,
            failing_ops,
            connection: self.pool.liveness().await,
        })
    }

    pub async fn summary(&self) -> AppResult<AccountSummary> {
        let address = &self.account.address;
        let stored = self
            .store
            .last_sync(address)
            .await
            .map_err(AppError::database)?;
        let last_sync = stored.or_else(|| self.last().last_success);
        let email_count = self
            .store
            .count(address, None)
            .await
            .map_err(AppError::database)?;

        Ok(AccountSummary {
            address: address.clone(),
            provider: self.account.provider.as_str().to_string(),
            syncing: !self.syncing_mailboxes().is_empty(),
            last_sync,
            email_count,
        })
    }
}

fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();
    let trimmed = cleaned.trim_matches('.').trim();
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}

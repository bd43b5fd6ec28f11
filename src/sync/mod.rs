use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::errors::{AppError, AppResult};
use crate::pool::ConnectionPool;
use crate::remote::{EnvelopeRecord, MessageSummary};
use crate::storage::CacheStore;
use crate::types::{now_ms, now_ts, EmailRecord, MailboxMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Start,
    FetchRecent,
    FetchRecentWindow,
    ReconcileMissing,
    FetchNewMetadata,
    UpdateFlags,
    PruneStale,
    PrefetchBodies,
    PersistMetadata,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub new: usize,
    pub updated: usize,
    pub deleted: usize,
    pub total: usize,
    pub prefetched: usize,
    pub new_uids: Vec<u32>,
}

/// What the remote side looked like when the sync started. Built entirely
/// before the cache is written.
struct RemoteSnapshot {
    uid_validity: u32,
    reset: bool,
    summaries: HashMap<u32, MessageSummary>,
    cached: HashMap<u32, bool>,
    envelopes: Vec<EnvelopeRecord>,
}

/// Mirrors one mailbox: the union of the N most recent messages and every
/// message from the last D days, metadata first, bodies for the newest P.
pub struct SyncEngine {
    store: Arc<CacheStore>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(store: Arc<CacheStore>, settings: SyncSettings) -> Self {
        Self { store, settings }
    }

    pub async fn run(&self, pool: &ConnectionPool, mailbox: &str) -> AppResult<SyncReport> {
        let account = pool.account().address.clone();
        let started = Instant::now();
        let mut phase = SyncPhase::Start;

        info!(account = %account, mailbox = %mailbox, "Starting mailbox sync");
        let result = self.run_phases(pool, &account, mailbox, &mut phase).await;

        match &result {
            Ok(report) => info!(
                account = %account,
                mailbox = %mailbox,
                new = report.new,
                updated = report.updated,
                deleted = report.deleted,
                total = report.total,
                elapsed_ms = ?started.elapsed().as_millis(),
                "Mailbox sync completed"
            ),
            Err(err) => warn!(
                account = %account,
                mailbox = %mailbox,
                failed_phase = ?phase,
                phase = ?SyncPhase::Failed,
                error = %err,
                "Mailbox sync failed"
            ),
        }
        result
    }

    async fn run_phases(
        &self,
        pool: &ConnectionPool,
        account: &str,
        mailbox: &str,
        phase: &mut SyncPhase,
    ) -> AppResult<SyncReport> {
        // Local flag changes stamped after this instant outrank the snapshot.
        let started_ms = now_ms();
        let snapshot = self.fetch_remote(pool, account, mailbox, phase).await?;
        let RemoteSnapshot {
            uid_validity,
            reset,
            summaries,
            cached,
            envelopes,
        } = snapshot;

        let mut report = SyncReport::default();

        if reset {
            let wiped = self
                .store
                .invalidate_mailbox(account, mailbox)
                .await
                .map_err(AppError::database)?;
            info!(account = %account, mailbox = %mailbox, wiped, "uidValidity changed, cache reset");
        }

        let records: Vec<EmailRecord> = envelopes
            .into_iter()
            .map(|env| env.into_record(account, mailbox))
            .collect();
        report.new_uids = self
            .store
            .insert_discovered(&records)
            .await
            .map_err(AppError::database)?;
        report.new = report.new_uids.len();

        *phase = SyncPhase::UpdateFlags;
        let flag_updates: Vec<(u32, bool)> = summaries
            .values()
            .filter_map(|s| match cached.get(&s.uid) {
                Some(unread) if *unread != s.unread => Some((s.uid, s.unread)),
                _ => None,
            })
            .collect();
        report.updated = self
            .store
            .apply_remote_flags(account, mailbox, &flag_updates, started_ms)
            .await
            .map_err(AppError::database)?;
        debug!(account = %account, mailbox = %mailbox, phase = ?phase, updated = report.updated, "Flags reconciled");

        *phase = SyncPhase::PruneStale;
        let remote_uids: HashSet<u32> = summaries.keys().copied().collect();
        report.deleted = self
            .store
            .reconcile(account, mailbox, &remote_uids)
            .await
            .map_err(AppError::database)?;
        debug!(account = %account, mailbox = %mailbox, phase = ?phase, deleted = report.deleted, "Stale records pruned");

        *phase = SyncPhase::PrefetchBodies;
        report.prefetched = match self.prefetch_bodies(pool, account, mailbox).await {
            Ok(filled) => filled,
            // Bodies stay lazy; the mirror itself is already reconciled.
            Err(err) => {
                warn!(account = %account, mailbox = %mailbox, error = %err, "Body prefetch failed");
                0
            }
        };

        *phase = SyncPhase::PersistMetadata;
        self.store
            .save_mailbox_metadata(&MailboxMetadata {
                account: account.to_string(),
                mailbox: mailbox.to_string(),
                uid_validity,
                last_sync_ts: now_ts(),
            })
            .await
            .map_err(AppError::database)?;

        report.total = self
            .store
            .count(account, Some(mailbox))
            .await
            .map_err(AppError::database)? as usize;

        *phase = SyncPhase::Done;
        Ok(report)
    }

    async fn fetch_remote(
        &self,
        pool: &ConnectionPool,
        account: &str,
        mailbox: &str,
        phase: &mut SyncPhase,
    ) -> AppResult<RemoteSnapshot> {
        let status = {
            let mb = mailbox.to_string();
            pool.with_connection(mailbox, move |s| Box::pin(async move { s.select(&mb).await }))
                .await?
        };

        let previous = self
            .store
            .mailbox_metadata(account, mailbox)
            .await
            .map_err(AppError::database)?;
        let reset = previous.is_some_and(|m| m.uid_validity != status.uid_validity);

        *phase = SyncPhase::FetchRecent;
        let fetch_start = Instant::now();
        let recent = {
            let mb = mailbox.to_string();
            let count = self.settings.recent_count;
            pool.with_connection(mailbox, move |s| {
                Box::pin(async move { s.fetch_recent(&mb, count).await })
            })
            .await?
        };
        debug!(
            account = %account,
            mailbox = %mailbox,
            count = recent.len(),
            elapsed_ms = ?fetch_start.elapsed().as_millis(),
            "Fetched most recent messages"
        );

        *phase = SyncPhase::FetchRecentWindow;
        let since = (Utc::now() - chrono::Duration::days(i64::from(self.settings.recent_days)))
            .date_naive();
        let window = {
            let mb = mailbox.to_string();
            pool.with_connection(mailbox, move |s| {
                Box::pin(async move { s.search_since(&mb, since).await })
            })
            .await?
        };

        *phase = SyncPhase::ReconcileMissing;
        let mut summaries: HashMap<u32, MessageSummary> =
            recent.into_iter().map(|s| (s.uid, s)).collect();
        let extras: Vec<u32> = window
            .into_iter()
            .filter(|uid| !summaries.contains_key(uid))
            .collect();
        if !extras.is_empty() {
            debug!(account = %account, mailbox = %mailbox, extras = extras.len(), "Window uids outside the recent sample");
            let mb = mailbox.to_string();
            let more = pool
                .with_connection(mailbox, move |s| {
                    Box::pin(async move { s.fetch_summaries(&mb, &extras).await })
                })
                .await?;
            summaries.extend(more.into_iter().map(|s| (s.uid, s)));
        }

        *phase = SyncPhase::FetchNewMetadata;
        let cached = if reset {
            HashMap::new()
        } else {
            self.store
                .cached_flags(account, mailbox)
                .await
                .map_err(AppError::database)?
        };
        // Ops from the old epoch are dropped with the reset, so they do not
        // shield their uids from the new mailbox contents.
        let pending = if reset {
            HashSet::new()
        } else {
            self.store
                .pending_uids(account, mailbox)
                .await
                .map_err(AppError::database)?
        };

        let mut uncached: Vec<u32> = summaries
            .keys()
            .copied()
            .filter(|uid| !cached.contains_key(uid) && !pending.contains(uid))
            .collect();
        uncached.sort_unstable();

        let envelopes = if uncached.is_empty() {
            Vec::new()
        } else {
            let mb = mailbox.to_string();
            pool.with_connection(mailbox, move |s| {
                Box::pin(async move { s.fetch_metadata(&mb, &uncached).await })
            })
            .await?
        };
        debug!(
            account = %account,
            mailbox = %mailbox,
            remote = summaries.len(),
            fetched = envelopes.len(),
            "Remote snapshot complete"
        );

        Ok(RemoteSnapshot {
            uid_validity: status.uid_validity,
            reset,
            summaries,
            cached,
            envelopes,
        })
    }

    async fn prefetch_bodies(
        &self,
        pool: &ConnectionPool,
        account: &str,
        mailbox: &str,
    ) -> AppResult<usize> {
        if self.settings.prefetch_bodies == 0 {
            return Ok(0);
        }
        let missing = self
            .store
            .missing_bodies(account, mailbox, self.settings.prefetch_bodies)
            .await
            .map_err(AppError::database)?;
        if missing.is_empty() {
            return Ok(0);
        }

        let fetch_start = Instant::now();
        let mb = mailbox.to_string();
        let bodies = pool
            .with_connection(mailbox, move |s| {
                Box::pin(async move { s.fetch_bodies(&mb, &missing).await })
            })
            .await?;

        let mut filled = 0;
        for (uid, body) in &bodies {
            if self
                .store
                .upsert_body(account, mailbox, *uid, body)
                .await
                .map_err(AppError::database)?
            {
                filled += 1;
            }
        }
        debug!(
            account = %account,
            mailbox = %mailbox,
            filled,
            elapsed_ms = ?fetch_start.elapsed().as_millis(),
            "Prefetched bodies"
        );
        Ok(filled)
    }
}

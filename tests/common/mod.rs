#![allow(dead_code)]

//! In-process stand-in for the remote mail source, shared by the
//! integration tests.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tempfile::TempDir;
use tokio::sync::Notify;

use mailmirror::config::{PoolSettings, SyncSettings};
use mailmirror::errors::{RemoteError, RemoteResult};
use mailmirror::pool::ConnectionPool;
use mailmirror::remote::{
    BodyContent, Connector, Draft, EnvelopeRecord, Flag, MailboxStatus, MessageSummary,
    RemoteSession, SessionBox,
};
use mailmirror::storage::CacheStore;
use mailmirror::types::{Account, Attachment, EmailRecord, Endpoint, Provider};

pub const DAY: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub uid: u32,
    pub unread: bool,
    pub deleted: bool,
    pub internal_date: i64,
    pub subject: String,
    pub from: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
    pub parts: HashMap<String, Vec<u8>>,
}

impl FakeMessage {
    pub fn new(uid: u32, days_ago: i64) -> Self {
        Self {
            uid,
            unread: true,
            deleted: false,
            internal_date: Utc::now().timestamp() - days_ago * DAY - i64::from(uid),
            subject: format!("Message {uid}"),
            from: "Sender <sender@example.com>".to_string(),
            html: format!("<p>Body of message {uid}</p>"),
            attachments: Vec::new(),
            parts: HashMap::new(),
        }
    }

    pub fn read(mut self) -> Self {
        self.unread = false;
        self
    }
}

#[derive(Default)]
pub struct RemoteState {
    pub mailboxes: BTreeMap<String, Vec<FakeMessage>>,
    pub uid_validity: u32,
    pub failures: HashMap<&'static str, VecDeque<RemoteError>>,
    pub calls: HashMap<&'static str, usize>,
    pub connects: usize,
    pub closes: usize,
    pub delay: Option<Duration>,
    pub drafts: Vec<(String, Draft)>,
    pub holds: HashMap<&'static str, Arc<Hold>>,
}

/// Parks the next call of one name until the test releases it.
#[derive(Default)]
pub struct Hold {
    reached: Notify,
    release: Notify,
}

impl Hold {
    /// Resolves once the held call has started (and read nothing yet).
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Shared handle to the simulated server. Clones see the same state.
#[derive(Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        let state = RemoteState {
            uid_validity: 1,
            ..RemoteState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    pub fn put(&self, mailbox: &str, messages: Vec<FakeMessage>) {
        let mut state = self.state();
        let list = state.mailboxes.entry(mailbox.to_string()).or_default();
        list.extend(messages);
        list.sort_by_key(|m| m.uid);
    }

    pub fn remove(&self, mailbox: &str, uid: u32) {
        if let Some(list) = self.state().mailboxes.get_mut(mailbox) {
            list.retain(|m| m.uid != uid);
        }
    }

    pub fn set_unread(&self, mailbox: &str, uid: u32, unread: bool) {
        if let Some(list) = self.state().mailboxes.get_mut(mailbox) {
            for m in list.iter_mut().filter(|m| m.uid == uid) {
                m.unread = unread;
            }
        }
    }

    pub fn uids(&self, mailbox: &str) -> Vec<u32> {
        self.state()
            .mailboxes
            .get(mailbox)
            .map(|list| list.iter().map(|m| m.uid).collect())
            .unwrap_or_default()
    }

    pub fn message(&self, mailbox: &str, uid: u32) -> Option<FakeMessage> {
        self.state()
            .mailboxes
            .get(mailbox)
            .and_then(|list| list.iter().find(|m| m.uid == uid).cloned())
    }

    pub fn set_uid_validity(&self, value: u32) {
        self.state().uid_validity = value;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// The next call named `call` fails with `err`. Queued per call name.
    pub fn fail_next(&self, call: &'static str, err: RemoteError) {
        self.state().failures.entry(call).or_default().push_back(err);
    }

    /// The next call named `call` waits inside the session until released.
    pub fn hold(&self, call: &'static str) -> Arc<Hold> {
        let hold = Arc::new(Hold::default());
        self.state().holds.insert(call, hold.clone());
        hold
    }

    pub fn calls(&self, call: &'static str) -> usize {
        self.state().calls.get(call).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    async fn enter(&self, call: &'static str) -> RemoteResult<()> {
        let (delay, failure, hold) = {
            let mut state = self.state();
            *state.calls.entry(call).or_default() += 1;
            let failure = state.failures.get_mut(call).and_then(VecDeque::pop_front);
            let hold = state.holds.remove(call);
            (state.delay, failure, hold)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn messages(&self, mailbox: &str) -> RemoteResult<Vec<FakeMessage>> {
        self.state()
            .mailboxes
            .get(mailbox)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("mailbox {mailbox}")))
    }

    fn with_message<T>(
        &self,
        mailbox: &str,
        uid: u32,
        f: impl FnOnce(&mut FakeMessage) -> T,
    ) -> RemoteResult<T> {
        let mut state = self.state();
        let list = state
            .mailboxes
            .get_mut(mailbox)
            .ok_or_else(|| RemoteError::NotFound(format!("mailbox {mailbox}")))?;
        let msg = list
            .iter_mut()
            .find(|m| m.uid == uid)
            .ok_or_else(|| RemoteError::NotFound(format!("uid {uid}")))?;
        Ok(f(msg))
    }
}

fn summary(m: &FakeMessage) -> MessageSummary {
    MessageSummary {
        uid: m.uid,
        unread: m.unread,
        internal_date: m.internal_date,
    }
}

#[async_trait]
impl Connector for FakeRemote {
    async fn connect(&self, _account: &Account) -> RemoteResult<SessionBox> {
        self.enter("connect").await?;
        self.state().connects += 1;
        Ok(Box::new(FakeSession {
            remote: self.clone(),
        }))
    }
}

pub struct FakeSession {
    remote: FakeRemote,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn select(&mut self, mailbox: &str) -> RemoteResult<MailboxStatus> {
        self.remote.enter("select").await?;
        let exists = self.remote.messages(mailbox)?.len() as u32;
        Ok(MailboxStatus {
            uid_validity: self.remote.state().uid_validity,
            exists,
        })
    }

    async fn fetch_recent(&mut self, mailbox: &str, count: u32) -> RemoteResult<Vec<MessageSummary>> {
        self.remote.enter("fetch_recent").await?;
        let list = self.remote.messages(mailbox)?;
        let skip = list.len().saturating_sub(count as usize);
        Ok(list.iter().skip(skip).map(summary).collect())
    }

    async fn search_since(&mut self, mailbox: &str, since: NaiveDate) -> RemoteResult<Vec<u32>> {
        self.remote.enter("search_since").await?;
        let cutoff = since
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        Ok(self
            .remote
            .messages(mailbox)?
            .iter()
            .filter(|m| m.internal_date >= cutoff)
            .map(|m| m.uid)
            .collect())
    }

    async fn fetch_summaries(&mut self, mailbox: &str, uids: &[u32]) -> RemoteResult<Vec<MessageSummary>> {
        self.remote.enter("fetch_summaries").await?;
        Ok(self
            .remote
            .messages(mailbox)?
            .iter()
            .filter(|m| uids.contains(&m.uid))
            .map(summary)
            .collect())
    }

    async fn fetch_metadata(&mut self, mailbox: &str, uids: &[u32]) -> RemoteResult<Vec<EnvelopeRecord>> {
        self.remote.enter("fetch_metadata").await?;
        Ok(self
            .remote
            .messages(mailbox)?
            .iter()
            .filter(|m| uids.contains(&m.uid))
            .map(|m| EnvelopeRecord {
                uid: m.uid,
                message_id: format!("<{}@example.com>", m.uid),
                internal_date: m.internal_date,
                from: m.from.clone(),
                to: "me@example.com".to_string(),
                cc: String::new(),
                subject: m.subject.clone(),
                date: Some(m.internal_date),
                unread: m.unread,
            })
            .collect())
    }

    async fn fetch_body(&mut self, mailbox: &str, uid: u32) -> RemoteResult<BodyContent> {
        self.remote.enter("fetch_body").await?;
        self.remote.with_message(mailbox, uid, |m| BodyContent {
            html: m.html.clone(),
            snippet: String::new(),
            attachments: m.attachments.clone(),
        })
    }

    async fn fetch_bodies(&mut self, mailbox: &str, uids: &[u32]) -> RemoteResult<Vec<(u32, BodyContent)>> {
        self.remote.enter("fetch_bodies").await?;
        Ok(self
            .remote
            .messages(mailbox)?
            .iter()
            .filter(|m| uids.contains(&m.uid))
            .map(|m| {
                (
                    m.uid,
                    BodyContent {
                        html: m.html.clone(),
                        snippet: String::new(),
                        attachments: m.attachments.clone(),
                    },
                )
            })
            .collect())
    }

    async fn store_flag(&mut self, mailbox: &str, uid: u32, flag: Flag, value: bool) -> RemoteResult<()> {
        self.remote.enter("store_flag").await?;
        self.remote.with_message(mailbox, uid, |m| match flag {
            Flag::Seen => m.unread = !value,
            Flag::Deleted => m.deleted = value,
        })
    }

    async fn move_to_trash(&mut self, mailbox: &str, uid: u32, trash: &str) -> RemoteResult<()> {
        self.remote.enter("move_to_trash").await?;
        let moved = self.remote.with_message(mailbox, uid, |m| m.clone())?;
        self.remote.remove(mailbox, uid);
        self.remote.put(trash, vec![moved]);
        Ok(())
    }

    async fn expunge(&mut self, mailbox: &str, uid: u32) -> RemoteResult<()> {
        self.remote.enter("expunge").await?;
        let deleted = self.remote.with_message(mailbox, uid, |m| m.deleted)?;
        if deleted {
            self.remote.remove(mailbox, uid);
        }
        Ok(())
    }

    async fn search(&mut self, mailbox: &str, query: &str) -> RemoteResult<Vec<u32>> {
        self.remote.enter("search").await?;
        let needle = query.to_lowercase();
        Ok(self
            .remote
            .messages(mailbox)?
            .iter()
            .filter(|m| m.subject.to_lowercase().contains(&needle))
            .map(|m| m.uid)
            .collect())
    }

    async fn list_mailboxes(&mut self) -> RemoteResult<Vec<String>> {
        self.remote.enter("list_mailboxes").await?;
        Ok(self.remote.state().mailboxes.keys().cloned().collect())
    }

    async fn append_draft(&mut self, mailbox: &str, draft: &Draft) -> RemoteResult<()> {
        self.remote.enter("append_draft").await?;
        self.remote
            .state()
            .drafts
            .push((mailbox.to_string(), draft.clone()));
        Ok(())
    }

    async fn fetch_part(&mut self, mailbox: &str, uid: u32, part_id: &str) -> RemoteResult<Vec<u8>> {
        self.remote.enter("fetch_part").await?;
        self.remote
            .with_message(mailbox, uid, |m| m.parts.get(part_id).cloned())?
            .ok_or_else(|| RemoteError::NotFound(format!("part {part_id}")))
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.remote.state().closes += 1;
        Ok(())
    }
}

pub fn account(address: &str) -> Account {
    Account {
        address: address.to_string(),
        provider: Provider::Generic,
        endpoint: Endpoint {
            host: "imap.example.com".to_string(),
            port: 993,
        },
        username: address.to_string(),
        secret: "secret".to_string(),
        trash_mailbox: "Trash".to_string(),
        drafts_mailbox: "Drafts".to_string(),
    }
}

pub fn pool_settings() -> PoolSettings {
    PoolSettings {
        idle: Duration::from_secs(300),
        call_timeout: Duration::from_secs(5),
    }
}

pub fn sync_settings() -> SyncSettings {
    SyncSettings {
        recent_count: 100,
        recent_days: 14,
        prefetch_bodies: 10,
        ..SyncSettings::default()
    }
}

pub fn pool(remote: &FakeRemote, address: &str) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(
        account(address),
        Arc::new(remote.clone()),
        pool_settings(),
    ))
}

pub async fn open_store(dir: &Path) -> Arc<CacheStore> {
    Arc::new(
        CacheStore::open(&dir.join("mailmirror.db"))
            .await
            .expect("open cache store"),
    )
}

pub async fn temp_store() -> (TempDir, Arc<CacheStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    (dir, store)
}

/// Metadata-only record as sync would insert it.
pub fn record(account: &str, mailbox: &str, uid: u32, days_ago: i64) -> EmailRecord {
    EmailRecord {
        account: account.to_string(),
        mailbox: mailbox.to_string(),
        uid,
        message_id: format!("<{uid}@example.com>"),
        internal_date: Utc::now().timestamp() - days_ago * DAY,
        from: "Sender <sender@example.com>".to_string(),
        to: "me@example.com".to_string(),
        cc: String::new(),
        subject: format!("Message {uid}"),
        date: None,
        unread: true,
        body_html: String::new(),
        snippet: String::new(),
        attachments: Vec::new(),
    }
}

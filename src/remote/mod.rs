//! Boundary to the remote mail source. Everything above this module talks to
//! a `RemoteSession`; the IMAP client in `imap` is the production one.
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::errors::RemoteResult;
use crate::types::{Account, Attachment, EmailRecord};

pub mod imap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    pub uid_validity: u32,
    pub exists: u32,
}

/// The cheap per-message view: enough to decide what to mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSummary {
    pub uid: u32,
    pub unread: bool,
    pub internal_date: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeRecord {
    pub uid: u32,
    pub message_id: String,
    pub internal_date: i64,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub date: Option<i64>,
    pub unread: bool,
}

impl EnvelopeRecord {
    /// Metadata-only record; the body stays empty until fetched.
    pub fn into_record(self, account: &str, mailbox: &str) -> EmailRecord {
        EmailRecord {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uid: self.uid,
            message_id: self.message_id,
            internal_date: self.internal_date,
            from: self.from,
            to: self.to,
            cc: self.cc,
            subject: self.subject,
            date: self.date,
            unread: self.unread,
            body_html: String::new(),
            snippet: String::new(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyContent {
    pub html: String,
    pub snippet: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Seen,
    Deleted,
}

impl Flag {
    pub fn as_imap(&self) -> &'static str {
        match self {
            Flag::Seen => "\\Seen",
            Flag::Deleted => "\\Deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Draft {
    pub fn to_rfc822(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("From: {}\r\n", self.from));
        if !self.to.is_empty() {
            out.push_str(&format!("To: {}\r\n", self.to));
        }
        out.push_str(&format!("Subject: {}\r\n", self.subject));
        out.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
        for line in self.body.lines() {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.into_bytes()
    }
}

/// One live session against the remote source. Methods that take a mailbox
/// select it first when it is not already the selected one.
#[async_trait]
pub trait RemoteSession: Send {
    async fn select(&mut self, mailbox: &str) -> RemoteResult<MailboxStatus>;

    /// The `count` highest sequence numbers.
    async fn fetch_recent(&mut self, mailbox: &str, count: u32)
        -> RemoteResult<Vec<MessageSummary>>;

    async fn search_since(&mut self, mailbox: &str, since: NaiveDate) -> RemoteResult<Vec<u32>>;

    async fn fetch_summaries(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> RemoteResult<Vec<MessageSummary>>;

    async fn fetch_metadata(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> RemoteResult<Vec<EnvelopeRecord>>;

    /// Fails with `RemoteError::NotFound` when the uid no longer exists.
    async fn fetch_body(&mut self, mailbox: &str, uid: u32) -> RemoteResult<BodyContent>;

    /// Uids missing remotely are left out of the result.
    async fn fetch_bodies(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> RemoteResult<Vec<(u32, BodyContent)>>;

    async fn store_flag(
        &mut self,
        mailbox: &str,
        uid: u32,
        flag: Flag,
        value: bool,
    ) -> RemoteResult<()>;

    async fn move_to_trash(&mut self, mailbox: &str, uid: u32, trash: &str) -> RemoteResult<()>;

    async fn expunge(&mut self, mailbox: &str, uid: u32) -> RemoteResult<()>;

    async fn search(&mut self, mailbox: &str, query: &str) -> RemoteResult<Vec<u32>>;

    async fn list_mailboxes(&mut self) -> RemoteResult<Vec<String>>;

    async fn append_draft(&mut self, mailbox: &str, draft: &Draft) -> RemoteResult<()>;

    /// Raw, still transfer-encoded bytes of one MIME part.
    async fn fetch_part(&mut self, mailbox: &str, uid: u32, part_id: &str)
        -> RemoteResult<Vec<u8>>;

    async fn close(&mut self) -> RemoteResult<()>;
}

pub type SessionBox = Box<dyn RemoteSession>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, account: &Account) -> RemoteResult<SessionBox>;
}

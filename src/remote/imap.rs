//! IMAP implementation of the remote seam: async-imap 0.11 over tokio-rustls.
use std::pin::pin;
use std::sync::Arc;

use anyhow::Context;
use async_imap::error::Error as ImapError;
use async_imap::types::{Fetch, Flag as ImapFlag};
use async_imap::{Client, Session};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use imap_proto::types::{Address, SectionPath};
use rustls_native_certs::load_native_certs;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use super::{BodyContent, Connector, Draft, EnvelopeRecord, Flag, MailboxStatus, MessageSummary, RemoteSession, SessionBox};
use crate::body;
use crate::errors::{RemoteError, RemoteResult};
use crate::types::{Account, Provider};

type ImapStream = Compat<TlsStream<TcpStream>>;

const SUMMARY_BATCH: usize = 250;
const METADATA_BATCH: usize = 100;
const BODY_BATCH: usize = 25;

pub struct ImapConnector {
    tls: Arc<ClientConfig>,
}

impl ImapConnector {
    pub fn new() -> anyhow::Result<Self> {
        let mut root_store = RootCertStore::empty();
        for cert in load_native_certs().context("failed to load native certs")? {
            root_store
                .add(&tokio_rustls::rustls::Certificate(cert.0))
                .context("failed to add cert to root store")?;
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            tls: Arc::new(config),
        })
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(&self, account: &Account) -> RemoteResult<SessionBox> {
        let host = account.endpoint.host.as_str();
        let port = account.endpoint.port;

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| RemoteError::Connection(format!("connecting to {host}:{port}: {e}")))?;

        let server_name = ServerName::try_from(host)
            .map_err(|e| RemoteError::Connection(format!("invalid DNS name {host}: {e}")))?;
        let tls_stream = TlsConnector::from(self.tls.clone())
            .connect(server_name, tcp)
            .await
            .map_err(|e| RemoteError::Connection(format!("starting TLS for IMAP: {e}")))?;

        let mut client = Client::new(tls_stream.compat());
        client
            .read_response()
            .await
            .map_err(|e| RemoteError::Connection(format!("reading IMAP greeting: {e}")))?
            .ok_or_else(|| RemoteError::Connection("unexpected end of stream, expected greeting".to_string()))?;

        let session = client
            .login(&account.username, &account.secret)
            .await
            .map_err(|(err, _client)| match err {
                ImapError::No(_) | ImapError::Bad(_) => RemoteError::AuthExpired,
                other => map_imap_error(other),
            })?;

        debug!(account = %account.address, host = %host, "IMAP login complete");
        Ok(Box::new(ImapSession {
            session,
            selected: None,
            provider: account.provider,
        }))
    }
}

pub struct ImapSession {
    session: Session<ImapStream>,
    selected: Option<(String, MailboxStatus)>,
    provider: Provider,
}

fn map_imap_error(err: ImapError) -> RemoteError {
    match err {
        ImapError::Io(e) => RemoteError::Connection(e.to_string()),
        ImapError::ConnectionLost => RemoteError::Connection("connection lost".to_string()),
        ImapError::No(msg) => {
            let lower = msg.to_ascii_lowercase();
            if lower.contains("nonexist") || lower.contains("no such") || lower.contains("not found") {
                RemoteError::NotFound(msg)
            } else {
                RemoteError::Rejected(msg)
            }
        }
        ImapError::Bad(msg) => RemoteError::Rejected(msg),
        other => RemoteError::Connection(other.to_string()),
    }
}

/// Compresses sorted uids into an IMAP sequence set ("1:5,7,10:15").
fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(range(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range(start, end));
    parts.join(",")
}

fn range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

fn quote(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

fn is_unread(fetch: &Fetch) -> bool {
    !fetch.flags().any(|f| matches!(f, ImapFlag::Seen))
}

fn summary_of(fetch: &Fetch) -> Option<MessageSummary> {
    let uid = fetch.uid?;
    Some(MessageSummary {
        uid,
        unread: is_unread(fetch),
        internal_date: fetch.internal_date().map(|dt| dt.timestamp()).unwrap_or(0),
    })
}

fn text(raw: Option<&std::borrow::Cow<'_, [u8]>>) -> String {
    raw.map(|b| String::from_utf8_lossy(b).to_string())
        .unwrap_or_default()
}

fn decode_mime_header(header: &str) -> String {
    let header_str = format!("Subject: {header}\r\n\r\n");
    match mailparse::parse_mail(header_str.as_bytes()) {
        Ok(parsed) => parsed
            .headers
            .iter()
            .find(|h| h.get_key().eq_ignore_ascii_case("Subject"))
            .map(|h| h.get_value())
            .unwrap_or_else(|| header.to_string()),
        Err(_) => header.to_string(),
    }
}

fn format_addresses(addrs: Option<&Vec<Address<'_>>>) -> String {
    let Some(addrs) = addrs else {
        return String::new();
    };
    addrs
        .iter()
        .filter_map(|addr| {
            let mailbox = text(addr.mailbox.as_ref());
            let host = text(addr.host.as_ref());
            if mailbox.is_empty() {
                return None;
            }
            let email = if host.is_empty() {
                mailbox
            } else {
                format!("{mailbox}@{host}")
            };
            let name = decode_mime_header(&text(addr.name.as_ref()));
            Some(if name.is_empty() {
                email
            } else {
                format!("{name} <{email}>")
            })
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn envelope_of(fetch: &Fetch) -> Option<EnvelopeRecord> {
    let uid = fetch.uid?;
    let internal_date = fetch.internal_date().map(|dt| dt.timestamp()).unwrap_or(0);
    let unread = is_unread(fetch);

    let Some(env) = fetch.envelope() else {
        return Some(EnvelopeRecord {
            uid,
            message_id: String::new(),
            internal_date,
            from: String::new(),
            to: String::new(),
            cc: String::new(),
            subject: String::new(),
            date: None,
            unread,
        });
    };

    let date = env
        .date
        .as_ref()
        .and_then(|raw| mailparse::dateparse(&String::from_utf8_lossy(raw)).ok());

    Some(EnvelopeRecord {
        uid,
        message_id: text(env.message_id.as_ref()),
        internal_date,
        from: format_addresses(env.from.as_ref()),
        to: format_addresses(env.to.as_ref()),
        cc: format_addresses(env.cc.as_ref()),
        subject: decode_mime_header(&text(env.subject.as_ref())),
        date,
        unread,
    })
}

fn section_path(part_id: &str) -> RemoteResult<SectionPath> {
    let path = part_id
        .split('.')
        .map(|p| p.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| RemoteError::Rejected(format!("invalid part id {part_id}")))?;
    Ok(SectionPath::Part(path, None))
}

async fn parse_bodies(raw: Vec<(u32, Vec<u8>)>) -> RemoteResult<Vec<(u32, BodyContent)>> {
    tokio::task::spawn_blocking(move || {
        use rayon::prelude::*;
        raw.into_par_iter()
            .map(|(uid, bytes)| (uid, body::extract_lossy(&bytes)))
            .collect()
    })
    .await
    .map_err(|e| RemoteError::Connection(format!("body parsing task failed: {e}")))
}

impl ImapSession {
    async fn ensure_selected(&mut self, mailbox: &str) -> RemoteResult<MailboxStatus> {
        if let Some((name, status)) = &self.selected {
            if name == mailbox {
                return Ok(*status);
            }
        }
        self.select_fresh(mailbox).await
    }

    async fn select_fresh(&mut self, mailbox: &str) -> RemoteResult<MailboxStatus> {
        self.selected = None;
        let mb = self.session.select(mailbox).await.map_err(map_imap_error)?;
        let status = MailboxStatus {
            uid_validity: mb.uid_validity.unwrap_or(0),
            exists: mb.exists,
        };
        self.selected = Some((mailbox.to_string(), status));
        Ok(status)
    }

    async fn fetch_all(&mut self, uid_seq: &str, query: &str, by_uid: bool) -> RemoteResult<Vec<Fetch>> {
        let mut out = Vec::new();
        if by_uid {
            let mut stream = pin!(self.session.uid_fetch(uid_seq, query).await.map_err(map_imap_error)?);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(fetch) => out.push(fetch),
                    Err(e) => warn!(error = %e, "Failed to fetch message"),
                }
            }
        } else {
            let mut stream = pin!(self.session.fetch(uid_seq, query).await.map_err(map_imap_error)?);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(fetch) => out.push(fetch),
                    Err(e) => warn!(error = %e, "Failed to fetch message"),
                }
            }
        }
        Ok(out)
    }

    async fn raw_bodies(&mut self, uids: &[u32]) -> RemoteResult<Vec<(u32, Vec<u8>)>> {
        let mut raw = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(BODY_BATCH) {
            let fetches = self.fetch_all(&uid_set(chunk), "(UID BODY.PEEK[])", true).await?;
            for fetch in &fetches {
                if let (Some(uid), Some(bytes)) = (fetch.uid, fetch.body()) {
                    raw.push((uid, bytes.to_vec()));
                }
            }
        }
        Ok(raw)
    }
}

#[async_trait]
impl RemoteSession for ImapSession {
    async fn select(&mut self, mailbox: &str) -> RemoteResult<MailboxStatus> {
        self.select_fresh(mailbox).await
    }

    async fn fetch_recent(&mut self, mailbox: &str, count: u32) -> RemoteResult<Vec<MessageSummary>> {
        let status = self.select_fresh(mailbox).await?;
        if status.exists == 0 || count == 0 {
            return Ok(Vec::new());
        }
        let start = status.exists.saturating_sub(count) + 1;
        let fetches = self
            .fetch_all(&format!("{start}:*"), "(UID FLAGS INTERNALDATE)", false)
            .await?;
        Ok(fetches.iter().filter_map(summary_of).collect())
    }

    async fn search_since(&mut self, mailbox: &str, since: NaiveDate) -> RemoteResult<Vec<u32>> {
        self.ensure_selected(mailbox).await?;
        let query = format!("SINCE {}", since.format("%d-%b-%Y"));
        let uids = self.session.uid_search(&query).await.map_err(map_imap_error)?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_summaries(&mut self, mailbox: &str, uids: &[u32]) -> RemoteResult<Vec<MessageSummary>> {
        self.ensure_selected(mailbox).await?;
        let mut out = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(SUMMARY_BATCH) {
            let fetches = self
                .fetch_all(&uid_set(chunk), "(UID FLAGS INTERNALDATE)", true)
                .await?;
            out.extend(fetches.iter().filter_map(summary_of));
        }
        Ok(out)
    }

    async fn fetch_metadata(&mut self, mailbox: &str, uids: &[u32]) -> RemoteResult<Vec<EnvelopeRecord>> {
        self.ensure_selected(mailbox).await?;
        let mut out = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(METADATA_BATCH) {
            let fetches = self
                .fetch_all(&uid_set(chunk), "(UID FLAGS INTERNALDATE ENVELOPE)", true)
                .await?;
            out.extend(fetches.iter().filter_map(envelope_of));
        }
        Ok(out)
    }

    async fn fetch_body(&mut self, mailbox: &str, uid: u32) -> RemoteResult<BodyContent> {
        self.ensure_selected(mailbox).await?;
        let raw = self.raw_bodies(&[uid]).await?;
        if raw.is_empty() {
            return Err(RemoteError::NotFound(format!("uid {uid} not found in {mailbox}")));
        }
        let mut parsed = parse_bodies(raw).await?;
        parsed
            .pop()
            .map(|(_, body)| body)
            .ok_or_else(|| RemoteError::NotFound(format!("uid {uid} not found in {mailbox}")))
    }

    async fn fetch_bodies(&mut self, mailbox: &str, uids: &[u32]) -> RemoteResult<Vec<(u32, BodyContent)>> {
        self.ensure_selected(mailbox).await?;
        let raw = self.raw_bodies(uids).await?;
        parse_bodies(raw).await
    }

    async fn store_flag(&mut self, mailbox: &str, uid: u32, flag: Flag, value: bool) -> RemoteResult<()> {
        self.ensure_selected(mailbox).await?;
        let op = if value { "+" } else { "-" };
        let query = format!("{op}FLAGS.SILENT ({})", flag.as_imap());
        let mut stream = pin!(self
            .session
            .uid_store(uid.to_string(), &query)
            .await
            .map_err(map_imap_error)?);
        while let Some(item) = stream.next().await {
            item.map_err(map_imap_error)?;
        }
        Ok(())
    }

    async fn move_to_trash(&mut self, mailbox: &str, uid: u32, trash: &str) -> RemoteResult<()> {
        self.ensure_selected(mailbox).await?;
        match self.session.uid_mv(uid.to_string(), trash).await {
            Ok(()) => Ok(()),
            Err(ImapError::Bad(msg)) => {
                // No MOVE extension: copy, flag, expunge.
                debug!(error = %msg, "UID MOVE unsupported, falling back to COPY");
                self.session
                    .uid_copy(uid.to_string(), trash)
                    .await
                    .map_err(map_imap_error)?;
                self.store_flag(mailbox, uid, Flag::Deleted, true).await?;
                self.expunge(mailbox, uid).await
            }
            Err(other) => Err(map_imap_error(other)),
        }
    }

    async fn expunge(&mut self, mailbox: &str, uid: u32) -> RemoteResult<()> {
        self.ensure_selected(mailbox).await?;
        let mut stream = pin!(self
            .session
            .uid_expunge(uid.to_string())
            .await
            .map_err(map_imap_error)?);
        while let Some(item) = stream.next().await {
            item.map_err(map_imap_error)?;
        }
        Ok(())
    }

    async fn search(&mut self, mailbox: &str, query: &str) -> RemoteResult<Vec<u32>> {
        self.ensure_selected(mailbox).await?;
        let command = match self.provider {
            Provider::Gmail => format!("X-GM-RAW {}", quote(query)),
            Provider::Generic => format!("TEXT {}", quote(query)),
        };
        let uids = self.session.uid_search(&command).await.map_err(map_imap_error)?;
        Ok(uids.into_iter().collect())
    }

    async fn list_mailboxes(&mut self) -> RemoteResult<Vec<String>> {
        let mut names = Vec::new();
        let mut stream = pin!(self
            .session
            .list(Some(""), Some("*"))
            .await
            .map_err(map_imap_error)?);
        while let Some(item) = stream.next().await {
            names.push(item.map_err(map_imap_error)?.name().to_string());
        }
        Ok(names)
    }

    async fn append_draft(&mut self, mailbox: &str, draft: &Draft) -> RemoteResult<()> {
        self.session
            .append(mailbox, Some("(\\Draft \\Seen)"), None, draft.to_rfc822())
            .await
            .map_err(map_imap_error)
    }

    async fn fetch_part(&mut self, mailbox: &str, uid: u32, part_id: &str) -> RemoteResult<Vec<u8>> {
        self.ensure_selected(mailbox).await?;
        let path = section_path(part_id)?;
        let query = format!("(UID BODY.PEEK[{part_id}])");
        let fetches = self.fetch_all(&uid.to_string(), &query, true).await?;
        fetches
            .iter()
            .find(|f| f.uid == Some(uid))
            .and_then(|f| f.section(&path))
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| RemoteError::NotFound(format!("part {part_id} of uid {uid}")))
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.selected = None;
        self.session.logout().await.map_err(map_imap_error)
    }
}

use crate::types::{now_ms, now_ts, Attachment, EmailRecord, MailboxMetadata, RecordKey};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::ops;

pub const DB_FILE_NAME: &str = "mailmirror.db";

const EMAIL_COLUMNS: &str = "account, mailbox, uid, message_id, internal_date, from_addr, \
     to_addrs, cc_addrs, subject, sent_date, unread, body_html, snippet, attachments_json";

/// The persistent tier: one SQLite file in WAL mode.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Database {
            pool,
            path: db_path.to_path_buf(),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mailboxes (
                account TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid_validity INTEGER NOT NULL,
                last_sync_ts INTEGER NOT NULL,
                PRIMARY KEY (account, mailbox)
            );

            CREATE TABLE IF NOT EXISTS emails (
                account TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT NOT NULL DEFAULT '',
                internal_date INTEGER NOT NULL,
                from_addr TEXT NOT NULL DEFAULT '',
                to_addrs TEXT NOT NULL DEFAULT '',
                cc_addrs TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                sent_date INTEGER,
                unread INTEGER NOT NULL DEFAULT 1,
                body_html TEXT NOT NULL DEFAULT '',
                snippet TEXT NOT NULL DEFAULT '',
                attachments_json TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL,
                flags_changed_ms INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (account, mailbox, uid)
            );
            CREATE INDEX IF NOT EXISTS idx_emails_internal_date
                ON emails(account, mailbox, internal_date DESC);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running migrations")?;

        ops::ensure_ops_tables(&self.pool).await?;
        debug!(path = %self.path.display(), "Schema ready");
        Ok(())
    }

    pub async fn get_record(&self, key: &RecordKey) -> Result<Option<EmailRecord>> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails WHERE account = ?1 AND mailbox = ?2 AND uid = ?3"
        );
        let row = sqlx::query(&sql)
            .bind(&key.account)
            .bind(&key.mailbox)
            .bind(key.uid as i64)
            .fetch_optional(&self.pool)
            .await
            .context("loading email record")?;
        Ok(row.as_ref().map(row_to_record))
    }

    /// Newest first by internal date.
    pub async fn list_records(
        &self,
        account: &str,
        mailbox: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<EmailRecord>> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails WHERE account = ?1 AND mailbox = ?2 \
             ORDER BY internal_date DESC, uid DESC LIMIT ?3 OFFSET ?4"
        );
        let rows = sqlx::query(&sql)
            .bind(account)
            .bind(mailbox)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .context("listing email records")?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    /// uid -> cached unread flag for every record of the mailbox.
    pub async fn unread_by_uid(&self, account: &str, mailbox: &str) -> Result<HashMap<u32, bool>> {
        let rows = sqlx::query("SELECT uid, unread FROM emails WHERE account = ?1 AND mailbox = ?2")
            .bind(account)
            .bind(mailbox)
            .fetch_all(&self.pool)
            .await
            .context("loading cached uid map")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.get::<i64, _>(0) as u32, row.get::<i64, _>(1) != 0);
        }
        Ok(out)
    }

    pub async fn missing_bodies(&self, account: &str, mailbox: &str, limit: u32) -> Result<Vec<u32>> {
        let rows = sqlx::query(
            r#"
            SELECT uid FROM emails
            WHERE account = ?1 AND mailbox = ?2 AND body_html = ''
            ORDER BY internal_date DESC, uid DESC
            LIMIT ?3
            "#,
        )
        .bind(account)
        .bind(mailbox)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading records without body")?;
        Ok(rows.iter().map(|r| r.get::<i64, _>(0) as u32).collect())
    }

    pub async fn count(&self, account: &str, mailbox: Option<&str>) -> Result<i64> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM emails WHERE account = ");
        qb.push_bind(account);
        if let Some(mailbox) = mailbox {
            qb.push(" AND mailbox = ");
            qb.push_bind(mailbox);
        }
        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .context("counting email records")?;
        Ok(row.get::<i64, _>(0))
    }

    pub async fn mailbox_metadata(
        &self,
        account: &str,
        mailbox: &str,
    ) -> Result<Option<MailboxMetadata>> {
        let row = sqlx::query(
            "SELECT uid_validity, last_sync_ts FROM mailboxes WHERE account = ?1 AND mailbox = ?2",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_optional(&self.pool)
        .await
        .context("loading mailbox metadata")?;

        Ok(row.map(|row| MailboxMetadata {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uid_validity: row.get::<i64, _>(0) as u32,
            last_sync_ts: row.get(1),
        }))
    }

    pub async fn save_mailbox_metadata(&self, meta: &MailboxMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mailboxes (account, mailbox, uid_validity, last_sync_ts)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(account, mailbox) DO UPDATE SET
                uid_validity = excluded.uid_validity,
                last_sync_ts = excluded.last_sync_ts;
            "#,
        )
        .bind(&meta.account)
        .bind(&meta.mailbox)
        .bind(meta.uid_validity as i64)
        .bind(meta.last_sync_ts)
        .execute(&self.pool)
        .await
        .context("upserting mailbox metadata")?;
        Ok(())
    }

    /// Most recent sync across the account's mailboxes.
    pub async fn last_sync(&self, account: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(last_sync_ts) FROM mailboxes WHERE account = ?1")
            .bind(account)
            .fetch_one(&self.pool)
            .await
            .context("loading last sync time")?;
        Ok(row.get::<Option<i64>, _>(0))
    }
}

pub(crate) fn row_to_record(row: &SqliteRow) -> EmailRecord {
    let attachments_json: String = row.get(13);
    let attachments: Vec<Attachment> = serde_json::from_str(&attachments_json).unwrap_or_default();
    EmailRecord {
        account: row.get(0),
        mailbox: row.get(1),
        uid: row.get::<i64, _>(2) as u32,
        message_id: row.get(3),
        internal_date: row.get(4),
        from: row.get(5),
        to: row.get(6),
        cc: row.get(7),
        subject: row.get(8),
        date: row.get(9),
        unread: row.get::<i64, _>(10) != 0,
        body_html: row.get(11),
        snippet: row.get(12),
        attachments,
    }
}

/// Insert-if-absent. With `skip_pending` the row is also left alone while a
/// pending operation targets the uid. Returns whether a row was written.
pub(crate) async fn insert_if_absent(
    conn: &mut SqliteConnection,
    record: &EmailRecord,
    skip_pending: bool,
) -> Result<bool> {
    let guard = if skip_pending {
        "NOT EXISTS (SELECT 1 FROM pending_ops p WHERE p.account = ?1 AND p.mailbox = ?2 AND p.uid = ?3)"
    } else {
        "1"
    };
    let sql = format!(
        "INSERT INTO emails ({EMAIL_COLUMNS}, updated_at) \
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15 WHERE {guard} \
         ON CONFLICT(account, mailbox, uid) DO NOTHING"
    );
    let attachments = serde_json::to_string(&record.attachments).unwrap_or_else(|_| "[]".into());
    let done = sqlx::query(&sql)
        .bind(&record.account)
        .bind(&record.mailbox)
        .bind(record.uid as i64)
        .bind(&record.message_id)
        .bind(record.internal_date)
        .bind(&record.from)
        .bind(&record.to)
        .bind(&record.cc)
        .bind(&record.subject)
        .bind(record.date)
        .bind(i64::from(record.unread))
        .bind(&record.body_html)
        .bind(&record.snippet)
        .bind(attachments)
        .bind(now_ts())
        .execute(&mut *conn)
        .await
        .context("inserting email record")?;
    Ok(done.rows_affected() > 0)
}

pub(crate) async fn update_body(
    conn: &mut SqliteConnection,
    key: &RecordKey,
    html: &str,
    snippet: &str,
    attachments: &[Attachment],
) -> Result<bool> {
    let attachments = serde_json::to_string(attachments).unwrap_or_else(|_| "[]".into());
    let done = sqlx::query(
        r#"
        UPDATE emails
        SET body_html = ?1, snippet = ?2, attachments_json = ?3, updated_at = ?4
        WHERE account = ?5 AND mailbox = ?6 AND uid = ?7
        "#,
    )
    .bind(html)
    .bind(snippet)
    .bind(attachments)
    .bind(now_ts())
    .bind(&key.account)
    .bind(&key.mailbox)
    .bind(key.uid as i64)
    .execute(&mut *conn)
    .await
    .context("updating email body")?;
    Ok(done.rows_affected() > 0)
}

/// Who is writing the unread flag.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FlagWrite {
    /// A user mutation or its confirmation. Stamps `flags_changed_ms`.
    Local,
    /// A sync snapshot read no earlier than `started_ms`. Loses against a
    /// pending op or a local change made after the sync began.
    Remote { started_ms: i64 },
}

pub(crate) async fn update_unread(
    conn: &mut SqliteConnection,
    key: &RecordKey,
    unread: bool,
    write: FlagWrite,
) -> Result<bool> {
    let changed = match write {
        FlagWrite::Local => sqlx::query(
            "UPDATE emails SET unread = ?1, updated_at = ?5 \
             WHERE account = ?2 AND mailbox = ?3 AND uid = ?4 AND unread <> ?1",
        )
        .bind(i64::from(unread))
        .bind(&key.account)
        .bind(&key.mailbox)
        .bind(key.uid as i64)
        .bind(now_ts())
        .execute(&mut *conn)
        .await
        .context("updating unread flag")?,
        FlagWrite::Remote { started_ms } => sqlx::query(
            "UPDATE emails SET unread = ?1, updated_at = ?5 \
             WHERE account = ?2 AND mailbox = ?3 AND uid = ?4 AND unread <> ?1 \
             AND flags_changed_ms < ?6 \
             AND NOT EXISTS (SELECT 1 FROM pending_ops p \
                 WHERE p.account = ?2 AND p.mailbox = ?3 AND p.uid = ?4)",
        )
        .bind(i64::from(unread))
        .bind(&key.account)
        .bind(&key.mailbox)
        .bind(key.uid as i64)
        .bind(now_ts())
        .bind(started_ms)
        .execute(&mut *conn)
        .await
        .context("applying remote unread flag")?,
    };

    if matches!(write, FlagWrite::Local) {
        // Stamped even when the value is unchanged: a confirmation still
        // outranks any remote snapshot taken before it.
        sqlx::query(
            "UPDATE emails SET flags_changed_ms = ?1 WHERE account = ?2 AND mailbox = ?3 AND uid = ?4",
        )
        .bind(now_ms())
        .bind(&key.account)
        .bind(&key.mailbox)
        .bind(key.uid as i64)
        .execute(&mut *conn)
        .await
        .context("stamping local flag change")?;
    }
    Ok(changed.rows_affected() > 0)
}

pub(crate) async fn delete_record(conn: &mut SqliteConnection, key: &RecordKey) -> Result<bool> {
    let done = sqlx::query("DELETE FROM emails WHERE account = ?1 AND mailbox = ?2 AND uid = ?3")
        .bind(&key.account)
        .bind(&key.mailbox)
        .bind(key.uid as i64)
        .execute(&mut *conn)
        .await
        .context("deleting email record")?;
    Ok(done.rows_affected() > 0)
}

pub(crate) async fn uids_in_mailbox(
    conn: &mut SqliteConnection,
    account: &str,
    mailbox: &str,
) -> Result<Vec<u32>> {
    let rows = sqlx::query("SELECT uid FROM emails WHERE account = ?1 AND mailbox = ?2")
        .bind(account)
        .bind(mailbox)
        .fetch_all(&mut *conn)
        .await
        .context("loading cached uids")?;
    Ok(rows.iter().map(|r| r.get::<i64, _>(0) as u32).collect())
}

pub(crate) async fn delete_mailbox(
    conn: &mut SqliteConnection,
    account: &str,
    mailbox: &str,
) -> Result<u64> {
    let done = sqlx::query("DELETE FROM emails WHERE account = ?1 AND mailbox = ?2")
        .bind(account)
        .bind(mailbox)
        .execute(&mut *conn)
        .await
        .context("deleting mailbox records")?;
    sqlx::query("DELETE FROM mailboxes WHERE account = ?1 AND mailbox = ?2")
        .bind(account)
        .bind(mailbox)
        .execute(&mut *conn)
        .await
        .context("deleting mailbox metadata")?;
    Ok(done.rows_affected())
}

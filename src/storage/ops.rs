use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::types::{now_ts, OpKind, OpLogEntry, OpStatus, PendingOp};

pub async fn ensure_ops_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_ops (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account TEXT NOT NULL,
            mailbox TEXT NOT NULL,
            kind TEXT NOT NULL,
            uid INTEGER NOT NULL,
            uid_validity INTEGER,
            created_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_ops_account ON pending_ops(account, id);
        CREATE INDEX IF NOT EXISTS idx_ops_target ON pending_ops(account, mailbox, uid);

        CREATE TABLE IF NOT EXISTS op_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account TEXT NOT NULL,
            mailbox TEXT NOT NULL,
            kind TEXT NOT NULL,
            uid INTEGER NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            queued_at INTEGER NOT NULL,
            processed_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_op_log_account ON op_log(account, processed_at DESC);
        "#,
    )
    .execute(pool)
    .await
    .context("creating pending_ops/op_log tables")?;
    Ok(())
}

pub(crate) async fn insert_op(
    conn: &mut SqliteConnection,
    account: &str,
    mailbox: &str,
    kind: OpKind,
    uid: u32,
    uid_validity: Option<u32>,
) -> Result<PendingOp> {
    let created_at = now_ts();
    let done = sqlx::query(
        r#"
        INSERT INTO pending_ops (account, mailbox, kind, uid, uid_validity, created_at, attempts)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0);
        "#,
    )
    .bind(account)
    .bind(mailbox)
    .bind(kind.as_str())
    .bind(uid as i64)
    .bind(uid_validity.map(i64::from))
    .bind(created_at)
    .execute(&mut *conn)
    .await
    .context("enqueue pending op")?;

    Ok(PendingOp {
        id: done.last_insert_rowid(),
        account: account.to_string(),
        mailbox: mailbox.to_string(),
        kind,
        uid,
        uid_validity,
        created_at,
        attempts: 0,
        last_error: None,
    })
}

fn row_to_op(row: &SqliteRow) -> Result<PendingOp> {
    let kind: String = row.get(3);
    Ok(PendingOp {
        id: row.get(0),
        account: row.get(1),
        mailbox: row.get(2),
        kind: kind.parse().map_err(|e: String| anyhow!(e))?,
        uid: row.get::<i64, _>(4) as u32,
        uid_validity: row.get::<Option<i64>, _>(8).map(|v| v as u32),
        created_at: row.get(5),
        attempts: row.get::<i64, _>(6) as u32,
        last_error: row.get(7),
    })
}

/// All pending ops in enqueue order, optionally for one account.
pub async fn list_ops(pool: &SqlitePool, account: Option<&str>) -> Result<Vec<PendingOp>> {
    let rows = match account {
        Some(account) => sqlx::query(
            r#"
            SELECT id, account, mailbox, kind, uid, created_at, attempts, last_error, uid_validity
            FROM pending_ops
            WHERE account = ?1
            ORDER BY id ASC;
            "#,
        )
        .bind(account)
        .fetch_all(pool)
        .await,
        None => sqlx::query(
            r#"
            SELECT id, account, mailbox, kind, uid, created_at, attempts, last_error, uid_validity
            FROM pending_ops
            ORDER BY id ASC;
            "#,
        )
        .fetch_all(pool)
        .await,
    }
    .context("list pending ops")?;

    rows.iter().map(row_to_op).collect()
}

pub async fn count_ops(pool: &SqlitePool, account: &str) -> Result<(i64, i64)> {
    let row = sqlx::query(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN attempts > 0 THEN 1 ELSE 0 END), 0) \
         FROM pending_ops WHERE account = ?1",
    )
    .bind(account)
    .fetch_one(pool)
    .await
    .context("count pending ops")?;
    Ok((row.get::<i64, _>(0), row.get::<i64, _>(1)))
}

pub async fn pending_uids(
    pool: &SqlitePool,
    account: &str,
    mailbox: &str,
) -> Result<std::collections::HashSet<u32>> {
    let rows = sqlx::query("SELECT DISTINCT uid FROM pending_ops WHERE account = ?1 AND mailbox = ?2")
        .bind(account)
        .bind(mailbox)
        .fetch_all(pool)
        .await
        .context("loading uids with pending ops")?;
    Ok(rows.iter().map(|r| r.get::<i64, _>(0) as u32).collect())
}

pub(crate) async fn clear_op(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let done = sqlx::query("DELETE FROM pending_ops WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("clear pending op")?;
    Ok(done.rows_affected() > 0)
}

pub(crate) async fn record_failure(conn: &mut SqliteConnection, id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE pending_ops SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2")
        .bind(error)
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("recording pending op failure")?;
    Ok(())
}

pub(crate) async fn append_log(
    conn: &mut SqliteConnection,
    op: &PendingOp,
    status: OpStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO op_log (account, mailbox, kind, uid, status, error, queued_at, processed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);
        "#,
    )
    .bind(&op.account)
    .bind(&op.mailbox)
    .bind(op.kind.as_str())
    .bind(op.uid as i64)
    .bind(status.as_str())
    .bind(error)
    .bind(op.created_at)
    .bind(now_ts())
    .execute(&mut *conn)
    .await
    .context("appending op log entry")?;
    Ok(())
}

/// Removes every pending op of the mailbox, logging each as failed with
/// `reason`. Returns how many were dropped.
pub(crate) async fn discard_mailbox_ops(
    conn: &mut SqliteConnection,
    account: &str,
    mailbox: &str,
    reason: &str,
) -> Result<usize> {
    let rows = sqlx::query(
        r#"
        SELECT id, account, mailbox, kind, uid, created_at, attempts, last_error, uid_validity
        FROM pending_ops
        WHERE account = ?1 AND mailbox = ?2
        ORDER BY id ASC;
        "#,
    )
    .bind(account)
    .bind(mailbox)
    .fetch_all(&mut *conn)
    .await
    .context("loading mailbox pending ops")?;
    let dropped = rows.iter().map(row_to_op).collect::<Result<Vec<_>>>()?;

    for op in &dropped {
        append_log(conn, op, OpStatus::Failed, Some(reason)).await?;
    }
    sqlx::query("DELETE FROM pending_ops WHERE account = ?1 AND mailbox = ?2")
        .bind(account)
        .bind(mailbox)
        .execute(&mut *conn)
        .await
        .context("dropping mailbox pending ops")?;
    Ok(dropped.len())
}

/// Newest entries first.
pub async fn recent_log(pool: &SqlitePool, account: &str, limit: u32) -> Result<Vec<OpLogEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT account, mailbox, kind, uid, status, error, queued_at, processed_at
        FROM op_log
        WHERE account = ?1
        ORDER BY id DESC
        LIMIT ?2;
        "#,
    )
    .bind(account)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    .context("loading op log")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.get(2);
        let status: String = row.get(4);
        out.push(OpLogEntry {
            account: row.get(0),
            mailbox: row.get(1),
            kind: kind.parse().map_err(|e: String| anyhow!(e))?,
            uid: row.get::<i64, _>(3) as u32,
            status: OpStatus::from_str_lossy(&status),
            error: row.get(5),
            queued_at: row.get(6),
            processed_at: row.get(7),
        });
    }
    Ok(out)
}

use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::domain::email::{EmailRecord, EmailStats, Priority, PriorityBreakdown, SenderCount};
use crate::error::{Error, Result};
use crate::store::repo::EmailRepository;

const LAST_SYNC_KEY: &str = "last_sync";
const TOP_SENDERS: i64 = 5;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS emails (
        id              TEXT PRIMARY KEY,
        sender          TEXT NOT NULL DEFAULT '',
        sender_name     TEXT NOT NULL DEFAULT '',
        subject         TEXT NOT NULL DEFAULT '',
        body            TEXT NOT NULL DEFAULT '',
        timestamp       TEXT NOT NULL DEFAULT '',
        summary         TEXT NOT NULL DEFAULT '',
        has_reply       INTEGER NOT NULL DEFAULT 0,
        draft_reply     TEXT NOT NULL DEFAULT '',
        is_relevant     INTEGER NOT NULL DEFAULT 1,
        processed_at    TEXT NOT NULL DEFAULT '',
        conversation_id TEXT NOT NULL DEFAULT '',
        priority        TEXT NOT NULL DEFAULT 'medium'
    );

    CREATE TABLE IF NOT EXISTS sync_metadata (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
"#;

/// Columns added after the first schema; existing databases get them on open.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("sender_name", "TEXT NOT NULL DEFAULT ''"),
    ("summary", "TEXT NOT NULL DEFAULT ''"),
    ("has_reply", "INTEGER NOT NULL DEFAULT 0"),
    ("draft_reply", "TEXT NOT NULL DEFAULT ''"),
    ("is_relevant", "INTEGER NOT NULL DEFAULT 1"),
    ("processed_at", "TEXT NOT NULL DEFAULT ''"),
    ("conversation_id", "TEXT NOT NULL DEFAULT ''"),
    ("priority", "TEXT NOT NULL DEFAULT 'medium'"),
];

const INDEXES: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_emails_timestamp ON emails(timestamp DESC);
    CREATE INDEX IF NOT EXISTS idx_emails_has_reply ON emails(has_reply);
    CREATE INDEX IF NOT EXISTS idx_emails_is_relevant ON emails(is_relevant);
    CREATE INDEX IF NOT EXISTS idx_emails_priority ON emails(priority);
    CREATE INDEX IF NOT EXISTS idx_emails_sender ON emails(sender);
"#;

// COALESCE keeps rows written by older schemas readable.
const SELECT_RECORD: &str = r#"
    SELECT id,
           COALESCE(sender, ''), COALESCE(sender_name, ''), COALESCE(subject, ''),
           COALESCE(body, ''), COALESCE(timestamp, ''), COALESCE(summary, ''),
           COALESCE(has_reply, 0), COALESCE(draft_reply, ''), COALESCE(is_relevant, 1),
           COALESCE(conversation_id, ''), COALESCE(priority, 'medium'),
           COALESCE(processed_at, '')
    FROM emails
"#;

pub struct SqliteRepo {
    conn: Mutex<Connection>,
}

impl SqliteRepo {
    /// Opens or creates the store. An unreadable file is moved aside to
    /// `<path>.backup_<timestamp>` and a fresh schema is created in its place.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = match open_and_migrate(path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("store at {} is unreadable ({e}); recreating", path.display());
                let backup = backup_path(path);
                fs::rename(path, &backup)?;
                info!("previous store saved as {}", backup.display());
                open_and_migrate(path).map_err(|e| Error::StoreCorrupt(e.to_string()))?
            }
        };

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        f(&conn)
    }

    fn query_records(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<EmailRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, row_to_record)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

fn open_and_migrate(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    migrate(&conn)?;
    Ok(conn)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".backup_{}", Utc::now().format("%Y%m%d_%H%M%S")));
    PathBuf::from(name)
}

fn existing_columns(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA table_info(emails)")?;
    let names = stmt.query_map([], |r| r.get::<_, String>(1))?;
    Ok(names.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Additive only: tables and columns are created, never dropped or altered.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let have = existing_columns(conn)?;
    for (column, decl) in ADDITIVE_COLUMNS {
        if !have.iter().any(|c| c == column) {
            info!("adding column emails.{column}");
            conn.execute_batch(&format!("ALTER TABLE emails ADD COLUMN {column} {decl}"))?;
        }
    }

    conn.execute_batch(INDEXES)?;
    Ok(())
}

fn row_to_record(r: &Row<'_>) -> rusqlite::Result<EmailRecord> {
    Ok(EmailRecord {
        id: r.get(0)?,
        sender: r.get(1)?,
        sender_name: r.get(2)?,
        subject: r.get(3)?,
        body: r.get(4)?,
        timestamp: r.get(5)?,
        summary: r.get(6)?,
        has_reply: r.get(7)?,
        draft_reply: r.get(8)?,
        is_relevant: r.get(9)?,
        conversation_id: r.get(10)?,
        priority: Priority::parse(&r.get::<_, String>(11)?),
        processed_at: r.get(12)?,
    })
}

fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 2);
    out.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn count(conn: &Connection, sql: &str) -> Result<i64> {
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}

fn reply_rate(replied: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = replied as f64 / total as f64 * 100.0;
    (pct * 10.0).round() / 10.0
}

impl EmailRepository for SqliteRepo {
    fn upsert(&self, record: &EmailRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO emails
                  (id, sender, sender_name, subject, body, timestamp, summary,
                   has_reply, draft_reply, is_relevant, processed_at, conversation_id, priority)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    record.id,
                    record.sender,
                    record.sender_name,
                    record.subject,
                    record.body,
                    record.timestamp,
                    record.summary,
                    record.has_reply,
                    record.draft_reply,
                    record.is_relevant,
                    record.processed_at,
                    record.conversation_id,
                    record.priority.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    fn get_by_id(&self, id: &str) -> Result<Option<EmailRecord>> {
        self.with_conn(|conn| {
            let sql = format!("{SELECT_RECORD} WHERE id = ?1 AND is_relevant = 1");
            Ok(conn.query_row(&sql, params![id], row_to_record).optional()?)
        })
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<EmailRecord>> {
        let sql = format!(
            "{SELECT_RECORD} WHERE is_relevant = 1 ORDER BY timestamp DESC LIMIT ?1"
        );
        self.query_records(&sql, params![limit as i64])
    }

    fn list_by_priority(&self, priority: Priority) -> Result<Vec<EmailRecord>> {
        let sql = format!(
            "{SELECT_RECORD} WHERE is_relevant = 1 AND priority = ?1 ORDER BY timestamp DESC"
        );
        self.query_records(&sql, params![priority.as_str()])
    }

    fn list_unreplied(&self) -> Result<Vec<EmailRecord>> {
        let sql = format!(
            "{SELECT_RECORD} WHERE is_relevant = 1 AND has_reply = 0 ORDER BY timestamp DESC"
        );
        self.query_records(&sql, [])
    }

    fn mark_replied(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("UPDATE emails SET has_reply = 1 WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    fn update_draft(&self, id: &str, draft: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE emails SET draft_reply = ?2 WHERE id = ?1",
                params![id, draft],
            )?;
            Ok(n > 0)
        })
    }

    fn stats(&self) -> Result<EmailStats> {
        self.with_conn(|conn| {
            let total = count(conn, "SELECT COUNT(*) FROM emails WHERE is_relevant = 1")?;
            let unreplied = count(
                conn,
                "SELECT COUNT(*) FROM emails WHERE is_relevant = 1 AND has_reply = 0",
            )?;
            let replied = count(
                conn,
                "SELECT COUNT(*) FROM emails WHERE is_relevant = 1 AND has_reply = 1",
            )?;
            let last_24h = count(
                conn,
                "SELECT COUNT(*) FROM emails WHERE is_relevant = 1 \
                 AND datetime(timestamp) > datetime('now', '-1 day')",
            )?;

            let mut by_priority = PriorityBreakdown::default();
            let mut stmt = conn.prepare(
                "SELECT priority, COUNT(*) FROM emails WHERE is_relevant = 1 GROUP BY priority",
            )?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (p, n) = row?;
                by_priority.add(Priority::parse(&p), n);
            }

            let mut stmt = conn.prepare(
                r#"
                SELECT sender, COUNT(*) AS n FROM emails
                WHERE is_relevant = 1
                GROUP BY sender
                ORDER BY n DESC, sender ASC
                LIMIT ?1
                "#,
            )?;
            let top_senders = stmt
                .query_map(params![TOP_SENDERS], |r| {
                    Ok(SenderCount {
                        sender: r.get(0)?,
                        count: r.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(EmailStats {
                total,
                unreplied,
                replied,
                last_24h,
                reply_rate: reply_rate(replied, total),
                by_priority,
                top_senders,
            })
        })
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<EmailRecord>> {
        let sql = format!(
            r#"{SELECT_RECORD}
            WHERE is_relevant = 1
              AND (subject LIKE ?1 ESCAPE '\' OR sender LIKE ?1 ESCAPE '\' OR body LIKE ?1 ESCAPE '\')
            ORDER BY timestamp DESC
            LIMIT ?2"#
        );
        self.query_records(&sql, params![escape_like(query), limit as i64])
    }

    fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM sync_metadata WHERE key = ?1",
                    params![LAST_SYNC_KEY],
                    |r| r.get(0),
                )
                .optional()?)
        })?;

        Ok(raw.and_then(|s| match DateTime::parse_from_rfc3339(&s) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(e) => {
                warn!("ignoring unreadable last sync marker {s:?}: {e}");
                None
            }
        }))
    }

    fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO sync_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
                params![LAST_SYNC_KEY, at.to_rfc3339(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn prune_older_than(&self, days: u32) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM emails WHERE datetime(timestamp) < datetime('now', ?1)",
                params![format!("-{days} days")],
            )?;
            Ok(n)
        })
    }
}

//! SQLite-backed secondary index over delivered messages.
//!
//! One row per (message id, target). Mailbox deliveries use the endpoint hash
//! as target; adapter deliveries use `adapter:<adapter_id>`. The mailbox store
//! stays authoritative and [`MessageIndex::rebuild`] can regenerate every
//! mailbox row from it.

use crate::envelope::{Envelope, MessageStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;

const PRAGMA_SQL: &str =
    "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;";

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS messages (
    id         TEXT NOT NULL,
    target     TEXT NOT NULL,
    subject    TEXT NOT NULL,
    sender     TEXT NOT NULL,
    reply_to   TEXT,
    status     TEXT NOT NULL,
    envelope   TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (id, target)
);
CREATE INDEX IF NOT EXISTS idx_messages_target ON messages(target, id);
CREATE INDEX IF NOT EXISTS idx_messages_subject ON messages(subject, id);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender, id);";

const ADAPTER_TARGET_PREFIX: &str = "adapter:";

/// Default and maximum page sizes for listing queries.
pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

/// Index key for a delivery made through an adapter.
pub fn adapter_target(adapter_id: &str) -> String {
    format!("{ADAPTER_TARGET_PREFIX}{adapter_id}")
}

pub fn is_adapter_target(target: &str) -> bool {
    target.starts_with(ADAPTER_TARGET_PREFIX)
}

#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub subject: Option<String>,
    pub status: Option<MessageStatus>,
    pub from: Option<String>,
    /// Restrict to one target (endpoint hash or adapter key).
    pub target: Option<String>,
    /// Exclusive lower bound on message id.
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

impl MessageQuery {
    fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }
}

/// One message with every target it was indexed under.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedMessage {
    pub envelope: Envelope,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass back as `cursor` to fetch the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

pub struct MessageIndex {
    conn: Mutex<Connection>,
}

impl MessageIndex {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create index directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open index DB: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("Failed to open in-memory index")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(PRAGMA_SQL)
            .context("Failed to set index pragmas")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to create index schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record (or refresh) a delivery of `envelope` to `target`.
    pub fn record(&self, envelope: &Envelope, target: &str, status: MessageStatus) -> Result<()> {
        let conn = self.conn.lock();
        insert_row(&conn, envelope, target, status)
    }

    pub fn update_status(&self, id: &str, target: &str, status: MessageStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE messages SET status = ?3, updated_at = ?4 WHERE id = ?1 AND target = ?2",
                params![id, target, status.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to update message status")?;
        Ok(changed > 0)
    }

    /// Drop every row for a target (endpoint unregistration).
    pub fn delete_target(&self, target: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM messages WHERE target = ?1", params![target])
            .context("Failed to delete index rows")
    }

    /// Replace all mailbox rows with `entries`; adapter rows are kept since
    /// adapters leave nothing on disk to rebuild from.
    pub fn rebuild(&self, entries: &[(String, Envelope)]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin index rebuild")?;
        tx.execute(
            "DELETE FROM messages WHERE target NOT LIKE 'adapter:%'",
            [],
        )
        .context("Failed to clear mailbox rows")?;
        for (target, envelope) in entries {
            insert_row(&tx, envelope, target, envelope.status)?;
        }
        tx.commit().context("Failed to commit index rebuild")?;
        Ok(entries.len())
    }

    /// Every indexed row for one message, mailbox targets first.
    pub fn get(&self, id: &str) -> Result<Option<IndexedMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT target, status, envelope FROM messages WHERE id = ?1
             ORDER BY (target LIKE 'adapter:%'), target",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read index rows")?;
        Ok(group_rows(rows)?.into_iter().next())
    }

    /// Paginated listing. Pages are over distinct message ids, so a message
    /// indexed under several targets never straddles two pages.
    pub fn query(&self, query: &MessageQuery) -> Result<Page<IndexedMessage>> {
        let limit = query.effective_limit();

        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(subject) = &query.subject {
            values.push(subject.clone());
            clauses.push(format!("subject = ?{}", values.len()));
        }
        if let Some(status) = query.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(from) = &query.from {
            values.push(from.clone());
            clauses.push(format!("sender = ?{}", values.len()));
        }
        if let Some(target) = &query.target {
            values.push(target.clone());
            clauses.push(format!("target = ?{}", values.len()));
        }
        let filter = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };

        let mut id_values = values.clone();
        let cursor_clause = match &query.cursor {
            Some(cursor) => {
                id_values.push(cursor.clone());
                format!(" AND id > ?{}", id_values.len())
            }
            None => String::new(),
        };

        let conn = self.conn.lock();

        // one extra id tells us whether another page exists
        let id_sql = format!(
            "SELECT DISTINCT id FROM messages WHERE {filter}{cursor_clause} ORDER BY id LIMIT {}",
            limit + 1
        );
        let mut ids = {
            let mut stmt = conn.prepare(&id_sql).context("Failed to prepare id query")?;
            let ids = stmt
                .query_map(params_from_iter(id_values.iter()), |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to list message ids")?;
            ids
        };

        let has_more = ids.len() > limit;
        ids.truncate(limit);
        if ids.is_empty() {
            return Ok(Page {
                items: Vec::new(),
                next_cursor: None,
            });
        }

        let mut row_values = values;
        let placeholders: Vec<String> = ids
            .iter()
            .map(|id| {
                row_values.push(id.clone());
                format!("?{}", row_values.len())
            })
            .collect();
        let row_sql = format!(
            "SELECT target, status, envelope FROM messages
             WHERE {filter} AND id IN ({})
             ORDER BY id, (target LIKE 'adapter:%'), target",
            placeholders.join(", ")
        );
        let rows = {
            let mut stmt = conn.prepare(&row_sql).context("Failed to prepare row query")?;
            let rows = stmt
                .query_map(params_from_iter(row_values.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read index rows")?;
            rows
        };

        let items = group_rows(rows)?;
        let next_cursor = if has_more {
            items.last().map(|m| m.envelope.id.clone())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    /// Distinct indexed messages.
    pub fn count_messages(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(DISTINCT id) FROM messages", [], |row| row.get(0))
            .context("Failed to count messages")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn insert_row(conn: &Connection, envelope: &Envelope, target: &str, status: MessageStatus) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO messages (id, target, subject, sender, reply_to, status, envelope, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id, target) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
        params![
            envelope.id,
            target,
            envelope.subject,
            envelope.from,
            envelope.reply_to,
            status.as_str(),
            serde_json::to_string(envelope)?,
            envelope.created_at.to_rfc3339(),
            now,
        ],
    )
    .context("Failed to insert index row")?;
    Ok(())
}

/// Collapse rows ordered by id into one entry per message. The first row of
/// each id supplies the reported status.
fn group_rows(rows: Vec<(String, String, String)>) -> Result<Vec<IndexedMessage>> {
    let mut grouped: Vec<IndexedMessage> = Vec::new();
    for (target, status, envelope_json) in rows {
        let envelope: Envelope =
            serde_json::from_str(&envelope_json).context("Malformed envelope in index")?;
        if let Some(last) = grouped.last_mut() {
            if last.envelope.id == envelope.id {
                last.targets.push(target);
                continue;
            }
        }
        let status: MessageStatus = status.parse()?;
        grouped.push(IndexedMessage {
            envelope: envelope.with_status(status),
            targets: vec![target],
        });
    }
    Ok(grouped)
}

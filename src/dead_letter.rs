//! Persistent dead-letter sink, keyed by message id.

use crate::envelope::Envelope;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

const PRAGMA_SQL: &str =
    "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;";

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS dead_letters (
    message_id    TEXT PRIMARY KEY,
    subject       TEXT NOT NULL,
    endpoint_hash TEXT NOT NULL,
    reason        TEXT NOT NULL,
    envelope      TEXT NOT NULL,
    rejected_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_endpoint ON dead_letters(endpoint_hash, rejected_at);
CREATE INDEX IF NOT EXISTS idx_dead_letters_rejected ON dead_letters(rejected_at);";

const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message_id: String,
    pub subject: String,
    /// Mailbox the message would have reached.
    pub endpoint_hash: String,
    pub reason: String,
    pub envelope: Envelope,
    pub rejected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub endpoint_hash: Option<String>,
    pub subject: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PurgeFilter {
    pub endpoint_hash: Option<String>,
    /// Only entries rejected strictly before this instant.
    pub older_than: Option<DateTime<Utc>>,
}

pub struct DeadLetterQueue {
    conn: Mutex<Connection>,
}

impl DeadLetterQueue {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create dead letter directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open dead letter DB: {}", path.display()))?;
        conn.execute_batch(PRAGMA_SQL)
            .context("Failed to set dead letter pragmas")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to create dead letter schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append an entry. Returns false when the message was already
    /// dead-lettered; the original entry is kept untouched.
    pub fn reject(&self, endpoint_hash: &str, envelope: &Envelope, reason: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO dead_letters
                    (message_id, subject, endpoint_hash, reason, envelope, rejected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    envelope.id,
                    envelope.subject,
                    endpoint_hash,
                    reason,
                    serde_json::to_string(envelope)?,
                    Utc::now().timestamp_millis(),
                ],
            )
            .context("Failed to insert dead letter")?;
        Ok(inserted > 0)
    }

    /// Entries newest first.
    pub fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(hash) = &filter.endpoint_hash {
            values.push(hash.clone());
            clauses.push(format!("endpoint_hash = ?{}", values.len()));
        }
        if let Some(subject) = &filter.subject {
            values.push(subject.clone());
            clauses.push(format!("subject = ?{}", values.len()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT message_id, subject, endpoint_hash, reason, envelope, rejected_at
             FROM dead_letters {where_sql}
             ORDER BY rejected_at DESC, message_id DESC
             LIMIT {limit}"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list dead letters")?;
        rows.into_iter().map(into_entry).collect()
    }

    pub fn get(&self, message_id: &str) -> Result<Option<DeadLetterEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT message_id, subject, endpoint_hash, reason, envelope, rejected_at
                 FROM dead_letters WHERE message_id = ?1",
                params![message_id],
                map_row,
            )
            .optional()
            .context("Failed to read dead letter")?;
        row.map(into_entry).transpose()
    }

    /// Delete matching entries. An empty filter clears the queue.
    pub fn purge(&self, filter: &PurgeFilter) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = match (&filter.endpoint_hash, filter.older_than) {
            (Some(hash), Some(cutoff)) => conn.execute(
                "DELETE FROM dead_letters WHERE endpoint_hash = ?1 AND rejected_at < ?2",
                params![hash, cutoff.timestamp_millis()],
            ),
            (Some(hash), None) => conn.execute(
                "DELETE FROM dead_letters WHERE endpoint_hash = ?1",
                params![hash],
            ),
            (None, Some(cutoff)) => conn.execute(
                "DELETE FROM dead_letters WHERE rejected_at < ?1",
                params![cutoff.timestamp_millis()],
            ),
            (None, None) => conn.execute("DELETE FROM dead_letters", []),
        }
        .context("Failed to purge dead letters")?;
        Ok(deleted)
    }

    /// Retention sweep: drop entries older than `days`. Zero keeps everything.
    pub fn purge_expired(&self, days: u32) -> Result<usize> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let purged = self.purge(&PurgeFilter {
            endpoint_hash: None,
            older_than: Some(cutoff),
        })?;
        if purged > 0 {
            tracing::info!(purged, retention_days = days, "Expired dead letters purged");
        }
        Ok(purged)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))
            .context("Failed to count dead letters")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

type RawRow = (String, String, String, String, String, i64);

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_entry(row: RawRow) -> Result<DeadLetterEntry> {
    let (message_id, subject, endpoint_hash, reason, envelope, rejected_at) = row;
    Ok(DeadLetterEntry {
        envelope: serde_json::from_str(&envelope)
            .with_context(|| format!("Malformed envelope for dead letter {message_id}"))?,
        rejected_at: DateTime::from_timestamp_millis(rejected_at)
            .context("Dead letter timestamp out of range")?,
        message_id,
        subject,
        endpoint_hash,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::envelope::{MessageIdGenerator, MessageStatus};
    use tempfile::TempDir;

    fn envelope(ids: &MessageIdGenerator, subject: &str) -> Envelope {
        Envelope {
            id: ids.next_id(),
            subject: subject.into(),
            from: "relay.test.sender".into(),
            reply_to: None,
            payload: serde_json::json!({"x": 1}),
            created_at: Utc::now(),
            budget: Budget {
                max_hops: 5,
                hop_count: 1,
                ttl: Utc::now() + Duration::minutes(5),
                call_budget_remaining: None,
            },
            status: MessageStatus::New,
        }
    }

    fn queue(tmp: &TempDir) -> DeadLetterQueue {
        DeadLetterQueue::open(&tmp.path().join("dead_letters.db")).unwrap()
    }

    #[test]
    fn reject_is_idempotent_per_message_id() {
        let tmp = TempDir::new().unwrap();
        let dlq = queue(&tmp);
        let ids = MessageIdGenerator::new();
        let e = envelope(&ids, "relay.agent.unknown");

        assert!(dlq.reject("h1", &e, "no matching endpoints or adapters").unwrap());
        assert!(!dlq.reject("h1", &e, "second reason").unwrap());
        assert_eq!(dlq.count().unwrap(), 1);
        assert_eq!(
            dlq.get(&e.id).unwrap().unwrap().reason,
            "no matching endpoints or adapters"
        );
    }

    #[test]
    fn entries_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let ids = MessageIdGenerator::new();
        let e = envelope(&ids, "relay.agent.unknown");
        {
            let dlq = queue(&tmp);
            dlq.reject("h1", &e, "gone").unwrap();
        }
        let dlq = queue(&tmp);
        let entry = dlq.get(&e.id).unwrap().unwrap();
        assert_eq!(entry.envelope, e);
        assert_eq!(entry.subject, "relay.agent.unknown");
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let tmp = TempDir::new().unwrap();
        let dlq = queue(&tmp);
        let ids = MessageIdGenerator::new();
        let a = envelope(&ids, "relay.a");
        let b = envelope(&ids, "relay.b");
        let c = envelope(&ids, "relay.a");
        dlq.reject("ha", &a, "x").unwrap();
        dlq.reject("hb", &b, "x").unwrap();
        dlq.reject("ha", &c, "x").unwrap();

        let all = dlq.list(&DeadLetterFilter::default()).unwrap();
        let order: Vec<&str> = all.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(order, vec![c.id.as_str(), b.id.as_str(), a.id.as_str()]);

        let only_a = dlq
            .list(&DeadLetterFilter {
                endpoint_hash: Some("ha".into()),
                limit: Some(1),
                ..DeadLetterFilter::default()
            })
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].message_id, c.id);

        let by_subject = dlq
            .list(&DeadLetterFilter {
                subject: Some("relay.b".into()),
                ..DeadLetterFilter::default()
            })
            .unwrap();
        assert_eq!(by_subject.len(), 1);
    }

    #[test]
    fn purge_by_endpoint_and_age() {
        let tmp = TempDir::new().unwrap();
        let dlq = queue(&tmp);
        let ids = MessageIdGenerator::new();
        dlq.reject("ha", &envelope(&ids, "relay.a"), "x").unwrap();
        dlq.reject("hb", &envelope(&ids, "relay.b"), "x").unwrap();
        dlq.reject("hb", &envelope(&ids, "relay.b"), "x").unwrap();

        let none_old = dlq
            .purge(&PurgeFilter {
                endpoint_hash: None,
                older_than: Some(Utc::now() - Duration::hours(1)),
            })
            .unwrap();
        assert_eq!(none_old, 0);
        assert_eq!(dlq.purge_expired(30).unwrap(), 0);
        assert_eq!(dlq.purge_expired(0).unwrap(), 0);

        let purged = dlq
            .purge(&PurgeFilter {
                endpoint_hash: Some("hb".into()),
                older_than: None,
            })
            .unwrap();
        assert_eq!(purged, 2);
        assert_eq!(dlq.count().unwrap(), 1);

        let everything = dlq
            .purge(&PurgeFilter {
                endpoint_hash: None,
                older_than: Some(Utc::now() + Duration::seconds(1)),
            })
            .unwrap();
        assert_eq!(everything, 1);
        assert_eq!(dlq.count().unwrap(), 0);
    }
}

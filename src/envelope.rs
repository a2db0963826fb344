//! The unit of transport.

use crate::budget::Budget;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    New,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(Self::New),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown message status '{other}' (expected new, delivered, failed)"),
        }
    }
}

/// A routed message. Never mutated after construction; state changes produce
/// a new value via [`Envelope::with_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub subject: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub budget: Budget,
    pub status: MessageStatus,
}

impl Envelope {
    pub fn with_status(self, status: MessageStatus) -> Self {
        Self { status, ..self }
    }
}

/// Monotonic ULID source.
///
/// Ids minted within the same millisecond still sort in creation order, so
/// string order of ids equals publish order within one relay instance.
pub struct MessageIdGenerator {
    inner: Mutex<ulid::Generator>,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ulid::Generator::new()),
        }
    }

    pub fn next_id(&self) -> String {
        let mut generator = self.inner.lock();
        match generator.generate() {
            Ok(id) => id.to_string(),
            // random component overflowed within one millisecond
            Err(_) => ulid::Ulid::new().to_string(),
        }
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_creation_order() {
        let generator = MessageIdGenerator::new();
        let ids: Vec<String> = (0..500).map(|_| generator.next_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids[0].len(), 26);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("NEW".parse::<MessageStatus>().unwrap(), MessageStatus::New);
        assert_eq!(
            " delivered ".parse::<MessageStatus>().unwrap(),
            MessageStatus::Delivered
        );
        assert!("pending".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn envelope_serializes_with_lowercase_status_and_omits_empty_reply() {
        let envelope = Envelope {
            id: "01HZZZZZZZZZZZZZZZZZZZZZZZ".into(),
            subject: "relay.agent.backend".into(),
            from: "relay.agent.frontend".into(),
            reply_to: None,
            payload: serde_json::json!({"text": "hi"}),
            created_at: Utc::now(),
            budget: Budget {
                max_hops: 5,
                hop_count: 1,
                ttl: Utc::now(),
                call_budget_remaining: None,
            },
            status: MessageStatus::New,
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["status"], "new");
        assert!(json.get("reply_to").is_none());

        let failed = envelope.clone().with_status(MessageStatus::Failed);
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.id, envelope.id);
    }
}

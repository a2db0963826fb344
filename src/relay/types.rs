use crate::adapters::{AdapterStatus, DeliveryResult};
use crate::budget::Budget;
use crate::envelope::{Envelope, MessageStatus};
use crate::reliability::{CircuitState, Rejection};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Sender subject.
    pub from: String,
    pub reply_to: Option<String>,
    /// Budget carried in from an upstream hop; defaults from `[budget]`.
    pub budget: Option<Budget>,
}

impl PublishOptions {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            from: sender.into(),
            reply_to: None,
            budget: None,
        }
    }

    #[must_use]
    pub fn reply_to(mut self, subject: impl Into<String>) -> Self {
        self.reply_to = Some(subject.into());
        self
    }

    #[must_use]
    pub fn budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// Complete account of one publish.
#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    pub message_id: String,
    /// Mailbox writes plus a successful adapter delivery.
    pub delivered_to: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_result: Option<DeliveryResult>,
    pub subscribers_notified: usize,
    pub dead_lettered: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InboxQuery {
    pub status: Option<MessageStatus>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageListQuery {
    pub subject: Option<String>,
    pub status: Option<MessageStatus>,
    pub from: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Envelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayMetrics {
    pub total_messages: usize,
    pub total_endpoints: usize,
    pub dead_letter_count: usize,
    pub published_total: u64,
    pub delivered_total: u64,
    pub rejected_total: u64,
    pub adapter_failures_total: u64,
    pub dead_lettered_total: u64,
    pub subscriber_drops_total: u64,
    pub active_subscriptions: usize,
    /// Endpoints whose circuit is open or half-open.
    pub open_circuits: Vec<CircuitStatus>,
    pub adapters: Vec<AdapterStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub endpoint: String,
    pub state: CircuitState,
}

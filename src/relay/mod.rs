//! The relay: publish orchestration over mailboxes, adapters and live
//! subscriptions.
//!
//! Every publish tries all three delivery classes in order (endpoint mailbox,
//! adapter, subscribers) and only dead-letters once none of the durable
//! targets accepted the message.

pub mod cli;
pub mod error;
pub mod types;

pub use error::{RelayError, RelayResult};
pub use types::{
    CircuitStatus, InboxQuery, MessageListQuery, MessagePage, PublishOptions, PublishResult,
    RelayMetrics,
};

use crate::access::{AccessAction, AccessControl, AccessRule};
use crate::adapters::{self, AdapterRegistry, AdapterStatus, DeliveryResult, RelayAdapter};
use crate::budget::{self, Budget, BudgetOperation};
use crate::config::{BudgetConfig, Config};
use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterQueue, PurgeFilter};
use crate::endpoints::{endpoint_hash, Endpoint, EndpointRegistry};
use crate::envelope::{Envelope, MessageIdGenerator, MessageStatus};
use crate::index::{self, MessageIndex, MessageQuery};
use crate::mailbox::{MailboxError, MailboxStore};
use crate::reliability::{CircuitState, RejectReason, Rejection, ReliabilityPolicies};
use crate::subject;
use crate::subscriptions::{Subscription, SubscriptionRegistry};
use anyhow::Context;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const MAILBOX_DIR: &str = "mailboxes";
const INDEX_FILE: &str = "index.db";
const DEAD_LETTER_FILE: &str = "dead_letters.db";
const ACCESS_RULES_FILE: &str = "access-rules.json";

pub const NO_TARGETS_REASON: &str = "no matching endpoints or adapters";

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
    adapter_failures: AtomicU64,
    dead_lettered: AtomicU64,
}

pub struct Relay {
    data_dir: PathBuf,
    max_payload_bytes: usize,
    namespace_depth: usize,
    budget_defaults: BudgetConfig,
    mailboxes: MailboxStore,
    index: MessageIndex,
    endpoints: EndpointRegistry,
    subscriptions: SubscriptionRegistry,
    policies: ReliabilityPolicies,
    access: AccessControl,
    dead_letters: DeadLetterQueue,
    adapters: AdapterRegistry,
    ids: MessageIdGenerator,
    registration: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
    counters: Counters,
}

impl Relay {
    /// Open (or create) the relay state under the configured data directory
    /// and start the adapters declared in config.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let data_dir = config.resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let mailboxes = MailboxStore::open(data_dir.join(MAILBOX_DIR), config.storage.fsync).await?;
        let discarded = mailboxes.recover_staging().await?;
        if discarded > 0 {
            tracing::warn!(discarded, "Discarded staged messages left by an interrupted write");
        }
        let endpoints = EndpointRegistry::with_endpoints(mailboxes.load_endpoints().await?);

        let index = MessageIndex::open(&data_dir.join(INDEX_FILE))?;
        let dead_letters = DeadLetterQueue::open(&data_dir.join(DEAD_LETTER_FILE))?;
        dead_letters.purge_expired(config.dead_letter.retention_days)?;
        let access = AccessControl::open(data_dir.join(ACCESS_RULES_FILE)).await?;

        let relay = Self {
            max_payload_bytes: config.limits.max_payload_bytes,
            namespace_depth: config.access.namespace_depth,
            budget_defaults: config.budget.clone(),
            mailboxes,
            index,
            endpoints,
            subscriptions: SubscriptionRegistry::new(config.subscriptions.channel_capacity),
            policies: ReliabilityPolicies::from_config(&config.reliability),
            access,
            dead_letters,
            adapters: AdapterRegistry::new(Duration::from_secs(
                config.adapters.delivery_timeout_secs,
            )),
            ids: MessageIdGenerator::new(),
            registration: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            counters: Counters::default(),
            data_dir,
        };

        for adapter in adapters::from_config(&config.adapters) {
            relay.adapters.register(adapter).await?;
        }

        tracing::info!(
            data_dir = %relay.data_dir.display(),
            endpoints = relay.endpoints.len(),
            adapters = relay.adapters.len(),
            "Relay opened"
        );
        Ok(relay)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn ensure_running(&self) -> RelayResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RelayError::ShuttingDown);
        }
        Ok(())
    }

    // ── Publish ──────────────────────────────────────────────────

    pub async fn publish(
        &self,
        subject: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> RelayResult<PublishResult> {
        self.ensure_running()?;
        self.validate_request(subject, &options.from, options.reply_to.as_deref(), &payload)?;
        self.check_access(&options.from, subject)?;

        let now = Utc::now();
        let incoming = options
            .budget
            .unwrap_or_else(|| Budget::from_config(&self.budget_defaults, now));
        let budget = budget::check(&incoming, BudgetOperation::Publish, now)?;

        self.deliver(subject, payload, options.from, options.reply_to, budget)
            .await
    }

    /// Republish `envelope`'s payload to `subject` as the next hop. The new
    /// envelope keeps the original `reply_to` and spends one call from the
    /// carried budget.
    pub async fn forward(
        &self,
        envelope: &Envelope,
        subject: &str,
        from: &str,
    ) -> RelayResult<PublishResult> {
        self.ensure_running()?;
        self.validate_request(subject, from, envelope.reply_to.as_deref(), &envelope.payload)?;
        self.check_access(from, subject)?;

        let budget = budget::check(&envelope.budget, BudgetOperation::Forward, Utc::now())?;
        tracing::debug!(
            original = %envelope.id,
            subject,
            hop = budget.hop_count,
            "Forwarding message"
        );

        self.deliver(
            subject,
            envelope.payload.clone(),
            from.to_string(),
            envelope.reply_to.clone(),
            budget,
        )
        .await
    }

    fn validate_request(
        &self,
        subject: &str,
        from: &str,
        reply_to: Option<&str>,
        payload: &serde_json::Value,
    ) -> RelayResult<()> {
        subject::validate_subject(subject).map_err(|e| RelayError::subject(subject, e))?;
        subject::validate_subject(from).map_err(|e| RelayError::subject(from, e))?;
        if let Some(reply_to) = reply_to {
            subject::validate_subject(reply_to).map_err(|e| RelayError::subject(reply_to, e))?;
        }

        if payload.is_null() {
            return Err(RelayError::InvalidPayload("payload must not be null".into()));
        }
        let size = serde_json::to_vec(payload)
            .map_err(|e| RelayError::InvalidPayload(e.to_string()))?
            .len();
        if size > self.max_payload_bytes {
            return Err(RelayError::InvalidPayload(format!(
                "payload is {size} bytes, limit is {}",
                self.max_payload_bytes
            )));
        }
        Ok(())
    }

    fn check_access(&self, from: &str, subject: &str) -> RelayResult<()> {
        let source_namespace = subject::namespace(from, self.namespace_depth);
        let target_namespace = subject::namespace(subject, self.namespace_depth);
        let decision = self.access.evaluate(&source_namespace, &target_namespace);
        if decision.allowed {
            return Ok(());
        }
        tracing::info!(
            from,
            subject,
            rule_seq = decision.rule.as_ref().map(|r| r.seq),
            "Publish denied by access rule"
        );
        Err(RelayError::AccessDenied {
            source_namespace,
            target_namespace,
        })
    }

    /// Steps after request validation: mailbox, adapter, subscribers, and the
    /// dead-letter decision.
    async fn deliver(
        &self,
        subject: &str,
        payload: serde_json::Value,
        from: String,
        reply_to: Option<String>,
        budget: Budget,
    ) -> RelayResult<PublishResult> {
        let envelope = Envelope {
            id: self.ids.next_id(),
            subject: subject.to_string(),
            from,
            reply_to,
            payload,
            created_at: Utc::now(),
            budget,
            status: MessageStatus::New,
        };
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered_to = 0usize;
        let mut rejected = Vec::new();

        if let Some(endpoint) = self.endpoints.get(subject) {
            match self.write_to_mailbox(&endpoint, &envelope).await? {
                Ok(()) => delivered_to += 1,
                Err(reason) => rejected.push(Rejection {
                    endpoint_hash: endpoint.hash.clone(),
                    reason,
                }),
            }
        }

        let adapter_result = self.adapters.deliver(subject, &envelope).await;
        if let Some(result) = &adapter_result {
            if result.success {
                delivered_to += 1;
                self.index_record(&envelope, &index::adapter_target(&result.adapter_id), MessageStatus::Delivered);
            } else {
                self.counters.adapter_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let dispatch = self.subscriptions.dispatch(&envelope);

        let dead_lettered = if delivered_to == 0 {
            let reason = dead_letter_reason(&rejected, adapter_result.as_ref());
            let inserted = self
                .dead_letters
                .reject(&endpoint_hash(subject), &envelope, &reason)?;
            if inserted {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            }
            tracing::warn!(message_id = %envelope.id, subject, %reason, "Message dead-lettered");
            true
        } else {
            false
        };

        self.counters
            .delivered
            .fetch_add(delivered_to as u64, Ordering::Relaxed);
        self.counters
            .rejected
            .fetch_add(rejected.len() as u64, Ordering::Relaxed);

        tracing::debug!(
            message_id = %envelope.id,
            subject,
            delivered_to,
            rejected = rejected.len(),
            subscribers = dispatch.notified,
            "Published"
        );

        Ok(PublishResult {
            message_id: envelope.id,
            delivered_to,
            rejected,
            adapter_result,
            subscribers_notified: dispatch.notified,
            dead_lettered,
        })
    }

    /// Run the reliability policies and write. The outer `Result` carries
    /// storage failures; the inner one a per-target rejection.
    async fn write_to_mailbox(
        &self,
        endpoint: &Endpoint,
        envelope: &Envelope,
    ) -> RelayResult<Result<(), RejectReason>> {
        let hash = endpoint.hash.as_str();
        let permit = match self.policies.admit(hash) {
            Ok(permit) => permit,
            Err(reason) => return Ok(Err(reason)),
        };

        let written = self
            .mailboxes
            .write_admitted(hash, envelope, self.policies.needs_pressure(), |pending| {
                self.policies.check_capacity(hash, pending)
            })
            .await;

        match written {
            Ok(Ok(())) => {
                permit.commit();
                self.index_record(envelope, hash, MessageStatus::New);
                Ok(Ok(()))
            }
            Ok(Err(reason)) => {
                tracing::debug!(endpoint_hash = hash, %reason, "Mailbox write refused");
                Ok(Err(reason))
            }
            // unregistered between lookup and write
            Err(MailboxError::EndpointNotFound(_)) => Ok(Err(RejectReason::EndpointNotFound)),
            Err(e) => {
                permit.commit();
                self.policies.record_failure(hash, &e.to_string());
                tracing::error!(endpoint_hash = hash, message_id = %envelope.id, "Mailbox write failed: {e}");
                Err(e.into())
            }
        }
    }

    fn index_record(&self, envelope: &Envelope, target: &str, status: MessageStatus) {
        if let Err(e) = self.index.record(envelope, target, status) {
            tracing::warn!(message_id = %envelope.id, target, "Index update failed: {e:#}");
        }
    }

    fn index_update(&self, id: &str, target: &str, status: MessageStatus) {
        if let Err(e) = self.index.update_status(id, target, status) {
            tracing::warn!(message_id = id, target, "Index update failed: {e:#}");
        }
    }

    // ── Endpoints ────────────────────────────────────────────────

    /// Register a concrete subject. Registering an existing subject returns
    /// the original registration.
    pub async fn register_endpoint(
        &self,
        subject: &str,
        description: Option<String>,
    ) -> RelayResult<Endpoint> {
        self.ensure_running()?;
        subject::validate_subject(subject).map_err(|e| RelayError::subject(subject, e))?;

        let _guard = self.registration.lock().await;
        if let Some(existing) = self.endpoints.get(subject) {
            return Ok(existing);
        }
        let endpoint = Endpoint::new(subject, description);
        self.mailboxes.create(&endpoint).await?;
        let (endpoint, _) = self.endpoints.insert_if_absent(endpoint);
        tracing::info!(subject, endpoint_hash = %endpoint.hash, "Endpoint registered");
        Ok(endpoint)
    }

    /// Remove an endpoint with its mailbox and index rows.
    pub async fn unregister_endpoint(&self, subject: &str) -> RelayResult<bool> {
        let _guard = self.registration.lock().await;
        let Some(endpoint) = self.endpoints.remove(subject) else {
            return Ok(false);
        };
        self.mailboxes.remove(&endpoint.hash).await?;
        let rows = self.index.delete_target(&endpoint.hash)?;
        self.policies.forget(&endpoint.hash);
        tracing::info!(subject, endpoint_hash = %endpoint.hash, rows, "Endpoint unregistered");
        Ok(true)
    }

    pub fn list_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.list()
    }

    /// Messages waiting to be claimed.
    pub async fn pending_depth(&self, subject: &str) -> RelayResult<usize> {
        let endpoint = self.endpoint(subject)?;
        Ok(self.mailboxes.pressure(&endpoint.hash).await?)
    }

    /// Breaker state for a registered endpoint.
    pub fn circuit_state(&self, subject: &str) -> Option<CircuitState> {
        self.endpoints
            .get(subject)
            .map(|endpoint| self.policies.circuit_state(&endpoint.hash))
    }

    fn endpoint(&self, subject: &str) -> RelayResult<Endpoint> {
        self.endpoints
            .get(subject)
            .ok_or_else(|| RelayError::EndpointNotFound(subject.to_string()))
    }

    // ── Consumer side ────────────────────────────────────────────

    /// Page through an endpoint's mailbox in id order.
    pub async fn read_inbox(&self, subject: &str, query: InboxQuery) -> RelayResult<MessagePage> {
        let endpoint = self.endpoint(subject)?;
        let limit = query
            .limit
            .unwrap_or(index::DEFAULT_PAGE_LIMIT)
            .clamp(1, index::MAX_PAGE_LIMIT);

        let mut messages: Vec<Envelope> = self
            .mailboxes
            .list(&endpoint.hash, query.status)
            .await?
            .into_iter()
            .filter(|e| query.cursor.as_deref().is_none_or(|c| e.id.as_str() > c))
            .take(limit + 1)
            .collect();

        let next_cursor = if messages.len() > limit {
            messages.truncate(limit);
            messages.last().map(|e| e.id.clone())
        } else {
            None
        };
        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    /// Move the oldest pending message to delivered and return it. A claim
    /// counts as a successful delivery for the endpoint's circuit.
    pub async fn claim_next(&self, subject: &str) -> RelayResult<Option<Envelope>> {
        let endpoint = self.endpoint(subject)?;
        let claimed = self.mailboxes.claim_next(&endpoint.hash).await?;
        if let Some(envelope) = &claimed {
            self.policies.record_success(&endpoint.hash);
            self.index_update(&envelope.id, &endpoint.hash, MessageStatus::Delivered);
        }
        Ok(claimed)
    }

    /// Consumer-reported failure: the message moves to `failed/`, counts
    /// against the endpoint's circuit and is dead-lettered. Failing a claimed
    /// message also takes back the success its claim recorded.
    pub async fn fail_message(&self, subject: &str, id: &str, reason: &str) -> RelayResult<Envelope> {
        let endpoint = self.endpoint(subject)?;
        let (envelope, origin) = self.mailboxes.fail(&endpoint.hash, id, reason).await?;
        if origin == MessageStatus::Delivered {
            self.policies.record_claimed_failure(&endpoint.hash, reason);
        } else {
            self.policies.record_failure(&endpoint.hash, reason);
        }
        self.index_update(id, &endpoint.hash, MessageStatus::Failed);
        if self.dead_letters.reject(&endpoint.hash, &envelope, reason)? {
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(subject, message_id = id, reason, "Message failed by consumer");
        Ok(envelope)
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn list_messages(&self, query: MessageListQuery) -> RelayResult<MessagePage> {
        let page = self.index.query(&MessageQuery {
            subject: query.subject,
            status: query.status,
            from: query.from,
            target: None,
            cursor: query.cursor,
            limit: query.limit,
        })?;
        Ok(MessagePage {
            messages: page.items.into_iter().map(|m| m.envelope).collect(),
            next_cursor: page.next_cursor,
        })
    }

    /// Look a message up: mailboxes first (authoritative status), then
    /// adapter-only index rows, then the dead-letter queue.
    pub async fn get_message(&self, id: &str) -> RelayResult<Option<Envelope>> {
        let indexed = self.index.get(id)?;
        if let Some(indexed) = &indexed {
            for target in indexed.targets.iter().filter(|t| !index::is_adapter_target(t)) {
                match self.mailboxes.get(target, id).await {
                    Ok(Some(envelope)) => return Ok(Some(envelope)),
                    Ok(None) | Err(MailboxError::EndpointNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        // the index is not authoritative; fall back to scanning mailboxes
        for endpoint in self.endpoints.list() {
            match self.mailboxes.get(&endpoint.hash, id).await {
                Ok(Some(envelope)) => return Ok(Some(envelope)),
                Ok(None) | Err(MailboxError::EndpointNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(indexed) = indexed {
            if indexed.targets.iter().any(|t| index::is_adapter_target(t)) {
                return Ok(Some(indexed.envelope));
            }
        }

        Ok(self
            .dead_letters
            .get(id)?
            .map(|entry| entry.envelope.with_status(MessageStatus::Failed)))
    }

    pub fn list_dead_letters(&self, filter: &DeadLetterFilter) -> RelayResult<Vec<DeadLetterEntry>> {
        Ok(self.dead_letters.list(filter)?)
    }

    pub fn purge_dead_letters(&self, filter: &PurgeFilter) -> RelayResult<usize> {
        let purged = self.dead_letters.purge(filter)?;
        tracing::info!(purged, "Dead letters purged");
        Ok(purged)
    }

    /// Regenerate every mailbox row of the index from the mailboxes.
    pub async fn rebuild_index(&self) -> RelayResult<usize> {
        let mut entries = Vec::new();
        for endpoint in self.endpoints.list() {
            for envelope in self.mailboxes.list(&endpoint.hash, None).await? {
                entries.push((endpoint.hash.clone(), envelope));
            }
        }
        let rows = self.index.rebuild(&entries)?;
        tracing::info!(rows, "Index rebuilt");
        Ok(rows)
    }

    pub fn metrics(&self) -> RelayResult<RelayMetrics> {
        Ok(RelayMetrics {
            total_messages: self.index.count_messages()?,
            total_endpoints: self.endpoints.len(),
            dead_letter_count: self.dead_letters.count()?,
            published_total: self.counters.published.load(Ordering::Relaxed),
            delivered_total: self.counters.delivered.load(Ordering::Relaxed),
            rejected_total: self.counters.rejected.load(Ordering::Relaxed),
            adapter_failures_total: self.counters.adapter_failures.load(Ordering::Relaxed),
            dead_lettered_total: self.counters.dead_lettered.load(Ordering::Relaxed),
            subscriber_drops_total: self.subscriptions.total_dropped(),
            active_subscriptions: self.subscriptions.active(),
            open_circuits: self
                .policies
                .tripped_circuits()
                .into_iter()
                .filter_map(|(hash, state)| {
                    let endpoint = self.endpoints.get_by_hash(&hash)?;
                    Some(CircuitStatus {
                        endpoint: endpoint.subject,
                        state,
                    })
                })
                .collect(),
            adapters: self.adapters.statuses(),
        })
    }

    // ── Subscriptions ────────────────────────────────────────────

    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> RelayResult<Subscription>
    where
        F: Fn(Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        self.subscriptions
            .subscribe(pattern, callback)
            .map_err(|e| RelayError::subject(pattern, e))
    }

    pub fn subscribe_channel(
        &self,
        pattern: &str,
    ) -> RelayResult<(Subscription, mpsc::Receiver<Envelope>)> {
        self.ensure_running()?;
        self.subscriptions
            .subscribe_channel(pattern)
            .map_err(|e| RelayError::subject(pattern, e))
    }

    // ── Access control ───────────────────────────────────────────

    pub async fn allow_cross_namespace(&self, source: &str, target: &str) -> RelayResult<AccessRule> {
        Ok(self.access.add(source, target, AccessAction::Allow).await?)
    }

    pub async fn deny_cross_namespace(&self, source: &str, target: &str) -> RelayResult<AccessRule> {
        Ok(self.access.add(source, target, AccessAction::Deny).await?)
    }

    pub async fn remove_access_rule(&self, source: &str, target: &str) -> RelayResult<usize> {
        Ok(self.access.remove(source, target).await?)
    }

    pub fn access_rules(&self) -> Vec<AccessRule> {
        self.access.rules()
    }

    // ── Adapters ─────────────────────────────────────────────────

    pub async fn register_adapter(&self, adapter: Arc<dyn RelayAdapter>) -> RelayResult<()> {
        self.ensure_running()?;
        Ok(self.adapters.register(adapter).await?)
    }

    pub async fn unregister_adapter(&self, id: &str) -> bool {
        self.adapters.unregister(id).await
    }

    pub fn adapter_statuses(&self) -> Vec<AdapterStatus> {
        self.adapters.statuses()
    }

    /// Stop adapters, drop subscriptions and refuse further publishes.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.adapters.shutdown().await;
        self.subscriptions.shutdown();
        tracing::info!("Relay shut down");
    }
}

/// Why nothing accepted a message. Mailbox rejections and an adapter failure
/// are both reported when both happened.
fn dead_letter_reason(rejected: &[Rejection], adapter_result: Option<&DeliveryResult>) -> String {
    let adapter_error = adapter_result.filter(|r| !r.success).map(|r| {
        format!(
            "adapter {} failed: {}",
            r.adapter_id,
            r.error.as_deref().unwrap_or("unknown error")
        )
    });

    if rejected.is_empty() {
        return adapter_error.unwrap_or_else(|| NO_TARGETS_REASON.to_string());
    }

    let reasons = rejected
        .iter()
        .map(|r| r.reason.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    match adapter_error {
        Some(adapter_error) => format!("all targets rejected: {reasons}; {adapter_error}"),
        None => format!("all targets rejected: {reasons}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn relay(tmp: &TempDir) -> Relay {
        let mut config = Config::default();
        config.data_dir = tmp.path().join("data");
        Relay::open(&config).await.unwrap()
    }

    #[test]
    fn dead_letter_reasons() {
        assert_eq!(dead_letter_reason(&[], None), NO_TARGETS_REASON);

        let failed = DeliveryResult {
            adapter_id: "ops".into(),
            success: false,
            error: Some("HTTP 500".into()),
            duration_ms: 3,
        };
        assert_eq!(
            dead_letter_reason(&[], Some(&failed)),
            "adapter ops failed: HTTP 500"
        );

        let rejected = vec![Rejection {
            endpoint_hash: "h".into(),
            reason: RejectReason::CircuitOpen,
        }];
        assert_eq!(
            dead_letter_reason(&rejected, None),
            "all targets rejected: circuit_open"
        );
        assert_eq!(
            dead_letter_reason(&rejected, Some(&failed)),
            "all targets rejected: circuit_open; adapter ops failed: HTTP 500"
        );
    }

    #[tokio::test]
    async fn publish_to_registered_endpoint_lands_in_inbox() {
        let tmp = TempDir::new().unwrap();
        let relay = relay(&tmp).await;
        relay.register_endpoint("relay.agent.alpha", None).await.unwrap();

        let result = relay
            .publish(
                "relay.agent.alpha",
                json!({"task": "summarize"}),
                PublishOptions::new("relay.agent.beta"),
            )
            .await
            .unwrap();
        assert_eq!(result.delivered_to, 1);
        assert!(!result.dead_lettered);
        assert!(result.adapter_result.is_none());

        let inbox = relay
            .read_inbox("relay.agent.alpha", InboxQuery::default())
            .await
            .unwrap();
        assert_eq!(inbox.messages.len(), 1);
        assert_eq!(inbox.messages[0].id, result.message_id);
        assert_eq!(inbox.messages[0].budget.hop_count, 1);
    }

    #[tokio::test]
    async fn request_level_rejections_are_errors_not_dead_letters() {
        let tmp = TempDir::new().unwrap();
        let relay = relay(&tmp).await;

        let err = relay
            .publish("relay..x", json!(1), PublishOptions::new("relay.a.b"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SUBJECT");

        let err = relay
            .publish("relay.a.b", serde_json::Value::Null, PublishOptions::new("relay.a.c"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYLOAD");

        relay.deny_cross_namespace("*", "relay.secure.vault").await.unwrap();
        let err = relay
            .publish("relay.secure.vault", json!(1), PublishOptions::new("relay.agent.a"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACCESS_DENIED");

        assert_eq!(relay.metrics().unwrap().dead_letter_count, 0);
    }

    #[tokio::test]
    async fn get_message_falls_back_to_dead_letters() {
        let tmp = TempDir::new().unwrap();
        let relay = relay(&tmp).await;
        let result = relay
            .publish("relay.nobody.home", json!("hello"), PublishOptions::new("relay.agent.a"))
            .await
            .unwrap();
        assert!(result.dead_lettered);

        let found = relay.get_message(&result.message_id).await.unwrap().unwrap();
        assert_eq!(found.status, MessageStatus::Failed);
        assert!(relay.get_message("01NOTAREALID").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_refuses_further_work() {
        let tmp = TempDir::new().unwrap();
        let relay = relay(&tmp).await;
        relay.shutdown().await;
        relay.shutdown().await;

        let err = relay
            .publish("relay.a.b", json!(1), PublishOptions::new("relay.a.c"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ShuttingDown));
        assert!(relay.subscribe_channel("relay.>").is_err());
    }
}

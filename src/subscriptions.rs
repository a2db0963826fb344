//! Live, ephemeral pattern subscriptions.
//!
//! Each subscriber owns a bounded channel. Dispatch never awaits: a full
//! channel drops that one message for that one subscriber and bumps its drop
//! counter, so a slow consumer can't stall a publish.

use crate::envelope::Envelope;
use crate::subject::{self, SubjectError};
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Slot {
    id: String,
    pattern: String,
    sender: mpsc::Sender<Envelope>,
    dropped: AtomicU64,
}

struct RegistryInner {
    slots: RwLock<Vec<Arc<Slot>>>,
    capacity: usize,
    total_dropped: AtomicU64,
    shutdown: CancellationToken,
}

impl RegistryInner {
    fn remove(&self, id: &str) -> bool {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }
}

/// Outcome of handing one envelope to every matching subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub notified: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: RwLock::new(Vec::new()),
                capacity: channel_capacity.max(1),
                total_dropped: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn register(&self, pattern: &str) -> Result<(Arc<Slot>, mpsc::Receiver<Envelope>), SubjectError> {
        subject::validate_pattern(pattern)?;
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let slot = Arc::new(Slot {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: pattern.to_string(),
            sender,
            dropped: AtomicU64::new(0),
        });
        self.inner.slots.write().push(Arc::clone(&slot));
        tracing::debug!(id = %slot.id, pattern, "Subscription registered");
        Ok((slot, receiver))
    }

    /// Subscribe with a receiver the caller drains itself.
    pub fn subscribe_channel(
        &self,
        pattern: &str,
    ) -> Result<(Subscription, mpsc::Receiver<Envelope>), SubjectError> {
        let (slot, receiver) = self.register(pattern)?;
        Ok((self.handle(slot, None), receiver))
    }

    /// Subscribe with a callback run on a dedicated task. Errors and panics
    /// from the callback are logged and confined to this subscription.
    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> Result<Subscription, SubjectError>
    where
        F: Fn(Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (slot, mut receiver) = self.register(pattern)?;
        let shutdown = self.inner.shutdown.clone();
        let id = slot.id.clone();

        let task = tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    () = shutdown.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let message_id = envelope.id.clone();
                match std::panic::catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(subscription = %id, message_id = %message_id, "Subscriber callback failed: {e}");
                    }
                    Err(_) => {
                        tracing::error!(subscription = %id, message_id = %message_id, "Subscriber callback panicked");
                    }
                }
            }
        });

        Ok(self.handle(slot, Some(task)))
    }

    fn handle(&self, slot: Arc<Slot>, task: Option<JoinHandle<()>>) -> Subscription {
        Subscription {
            slot,
            registry: Arc::downgrade(&self.inner),
            task,
        }
    }

    /// Hand `envelope` to every subscription whose pattern matches its subject.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        let matching: Vec<Arc<Slot>> = self
            .inner
            .slots
            .read()
            .iter()
            .filter(|slot| subject::matches(&envelope.subject, &slot.pattern))
            .cloned()
            .collect();

        let mut outcome = DispatchOutcome::default();
        for slot in matching {
            match slot.sender.try_send(envelope.clone()) {
                Ok(()) => outcome.notified += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                    self.inner.total_dropped.fetch_add(1, Ordering::Relaxed);
                    outcome.dropped += 1;
                    tracing::warn!(
                        subscription = %slot.id,
                        pattern = %slot.pattern,
                        message_id = %envelope.id,
                        "Subscriber channel full; message dropped for this subscriber"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // receiver gone without unsubscribing
                    self.inner.remove(&slot.id);
                }
            }
        }
        outcome
    }

    pub fn active(&self) -> usize {
        self.inner.slots.read().len()
    }

    pub fn total_dropped(&self) -> u64 {
        self.inner.total_dropped.load(Ordering::Relaxed)
    }

    /// Stop every callback task and forget all subscriptions.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.slots.write().clear();
    }
}

/// Handle for one live subscription. Dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<Slot>,
    registry: Weak<RegistryInner>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.slot.id
    }

    pub fn pattern(&self) -> &str {
        &self.slot.pattern
    }

    /// Messages dropped for this subscriber because its channel was full.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(&self.slot.id) {
                tracing::debug!(id = %self.slot.id, "Subscription removed");
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.slot.id)
            .field("pattern", &self.slot.pattern)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::envelope::MessageStatus;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn envelope(subject: &str) -> Envelope {
        Envelope {
            id: ulid::Ulid::new().to_string(),
            subject: subject.into(),
            from: "relay.test.sender".into(),
            reply_to: None,
            payload: serde_json::json!({"n": 1}),
            created_at: Utc::now(),
            budget: Budget {
                max_hops: 5,
                hop_count: 1,
                ttl: Utc::now() + chrono::Duration::minutes(1),
                call_budget_remaining: None,
            },
            status: MessageStatus::New,
        }
    }

    #[tokio::test]
    async fn channel_subscriber_receives_matching_messages_only() {
        let registry = SubscriptionRegistry::new(8);
        let (_sub, mut rx) = registry.subscribe_channel("relay.agent.*").unwrap();

        let outcome = registry.dispatch(&envelope("relay.agent.backend"));
        assert_eq!(outcome.notified, 1);
        let outcome = registry.dispatch(&envelope("relay.agent.backend.deep"));
        assert_eq!(outcome.notified, 0);

        let got = rx.recv().await.unwrap();
        assert_eq!(got.subject, "relay.agent.backend");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_drops_for_that_subscriber_only() {
        let registry = SubscriptionRegistry::new(1);
        let (slow, _slow_rx) = registry.subscribe_channel("relay.>").unwrap();
        let (_fast, mut fast_rx) = registry.subscribe_channel("relay.>").unwrap();

        let first = registry.dispatch(&envelope("relay.a"));
        assert_eq!(first.notified, 2);
        fast_rx.recv().await.unwrap();

        let second = registry.dispatch(&envelope("relay.b"));
        assert_eq!(second.notified, 1);
        assert_eq!(second.dropped, 1);
        assert_eq!(slow.dropped(), 1);
        assert_eq!(registry.total_dropped(), 1);
        assert_eq!(fast_rx.recv().await.unwrap().subject, "relay.b");
    }

    #[tokio::test]
    async fn dropping_handle_unsubscribes_synchronously() {
        let registry = SubscriptionRegistry::new(4);
        let (sub, _rx) = registry.subscribe_channel("relay.>").unwrap();
        assert_eq!(registry.active(), 1);
        sub.unsubscribe();
        assert_eq!(registry.active(), 0);
        assert_eq!(registry.dispatch(&envelope("relay.a")).notified, 0);
    }

    #[tokio::test]
    async fn callback_errors_and_panics_do_not_stop_the_subscription() {
        let registry = SubscriptionRegistry::new(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        let _sub = registry
            .subscribe("relay.>", move |env| {
                let n = seen_cb.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => anyhow::bail!("first call fails"),
                    1 => panic!("second call panics"),
                    _ => {
                        assert_eq!(env.subject, "relay.c");
                        Ok(())
                    }
                }
            })
            .unwrap();

        for subject in ["relay.a", "relay.b", "relay.c"] {
            registry.dispatch(&envelope(subject));
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned() {
        let registry = SubscriptionRegistry::new(4);
        let (_sub, rx) = registry.subscribe_channel("relay.>").unwrap();
        drop(rx);
        assert_eq!(registry.dispatch(&envelope("relay.a")).notified, 0);
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected() {
        let registry = SubscriptionRegistry::new(4);
        assert!(registry.subscribe_channel("relay.>.x").is_err());
    }

    #[tokio::test]
    async fn shutdown_clears_all_subscriptions() {
        let registry = SubscriptionRegistry::new(4);
        let _a = registry.subscribe("relay.>", |_| Ok(())).unwrap();
        let (_b, _rx) = registry.subscribe_channel("relay.x").unwrap();
        registry.shutdown();
        assert_eq!(registry.active(), 0);
    }
}

//! Adapter lookup, timeout-bounded delivery and per-adapter status.

use super::traits::{AdapterContext, DeliveryResult, RelayAdapter};
use crate::envelope::Envelope;
use crate::subject::{self, SubjectError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter '{0}' is already registered")]
    Duplicate(String),
    #[error("adapter '{0}' declares no subject prefixes")]
    NoPrefixes(String),
    #[error("adapter '{id}' prefix '{prefix}' is invalid: {source}")]
    InvalidPrefix {
        id: String,
        prefix: String,
        #[source]
        source: SubjectError,
    },
    #[error("adapter '{id}' failed to start: {source}")]
    StartFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStatus {
    pub id: String,
    pub subject_prefixes: Vec<String>,
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery_at: Option<DateTime<Utc>>,
}

struct Registered {
    adapter: Arc<dyn RelayAdapter>,
    prefixes: Vec<String>,
    status: Mutex<AdapterStatus>,
}

/// `subject` is routed to `prefix` when the prefix is a matching wildcard
/// pattern, equals the subject, or is a whole-segment prefix of it.
pub fn prefix_matches(subject: &str, prefix: &str) -> bool {
    if subject::is_wildcard(prefix) {
        return subject::matches(subject, prefix);
    }
    subject == prefix
        || subject
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

pub struct AdapterRegistry {
    adapters: RwLock<Vec<Arc<Registered>>>,
    timeout: Duration,
}

impl AdapterRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            adapters: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Validate, start and register an adapter. Registration order decides
    /// precedence when several adapters match a subject.
    pub async fn register(&self, adapter: Arc<dyn RelayAdapter>) -> Result<(), AdapterError> {
        let id = adapter.id().to_string();
        let prefixes = adapter.subject_prefixes();
        if prefixes.is_empty() {
            return Err(AdapterError::NoPrefixes(id));
        }
        for prefix in &prefixes {
            subject::validate_pattern(prefix).map_err(|source| AdapterError::InvalidPrefix {
                id: id.clone(),
                prefix: prefix.clone(),
                source,
            })?;
        }
        if self.contains(&id) {
            return Err(AdapterError::Duplicate(id));
        }

        adapter
            .start()
            .await
            .map_err(|source| AdapterError::StartFailed {
                id: id.clone(),
                source,
            })?;

        let registered = Arc::new(Registered {
            adapter,
            status: Mutex::new(AdapterStatus {
                id: id.clone(),
                subject_prefixes: prefixes.clone(),
                ..AdapterStatus::default()
            }),
            prefixes,
        });

        {
            let mut adapters = self.adapters.write();
            // a concurrent register may have won the race while we were starting
            if adapters.iter().any(|r| r.adapter.id() == id) {
                drop(adapters);
                self.stop_one(&registered).await;
                return Err(AdapterError::Duplicate(id));
            }
            adapters.push(registered);
        }

        tracing::info!(adapter = %id, "Adapter registered");
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.adapters.read().iter().any(|r| r.adapter.id() == id)
    }

    /// Remove and stop an adapter. Returns false if it was not registered.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = {
            let mut adapters = self.adapters.write();
            adapters
                .iter()
                .position(|r| r.adapter.id() == id)
                .map(|pos| adapters.remove(pos))
        };
        match removed {
            Some(registered) => {
                self.stop_one(&registered).await;
                tracing::info!(adapter = id, "Adapter unregistered");
                true
            }
            None => false,
        }
    }

    fn find(&self, subject: &str) -> Option<(Arc<Registered>, String)> {
        self.adapters.read().iter().find_map(|registered| {
            registered
                .prefixes
                .iter()
                .find(|prefix| prefix_matches(subject, prefix))
                .map(|prefix| (Arc::clone(registered), prefix.clone()))
        })
    }

    /// Id of the adapter that would receive `subject`.
    pub fn route(&self, subject: &str) -> Option<String> {
        self.find(subject)
            .map(|(registered, _)| registered.adapter.id().to_string())
    }

    /// Deliver through the first matching adapter, bounded by the registry
    /// timeout. `None` when no adapter matches.
    pub async fn deliver(&self, subject: &str, envelope: &Envelope) -> Option<DeliveryResult> {
        let (registered, matched_prefix) = self.find(subject)?;
        let adapter_id = registered.adapter.id().to_string();
        let context = AdapterContext {
            matched_prefix,
            timeout: self.timeout,
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.timeout,
            registered.adapter.deliver(subject, envelope, &context),
        )
        .await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (error, timed_out) = match outcome {
            Ok(Ok(())) => (None, false),
            Ok(Err(e)) => (Some(format!("{e:#}")), false),
            Err(_) => (
                Some(format!(
                    "adapter delivery timed out after {}ms",
                    self.timeout.as_millis()
                )),
                true,
            ),
        };

        {
            let mut status = registered.status.lock();
            status.last_delivery_at = Some(Utc::now());
            match &error {
                None => status.delivered += 1,
                Some(err) => {
                    status.failed += 1;
                    if timed_out {
                        status.timed_out += 1;
                    }
                    status.last_error = Some(err.clone());
                }
            }
        }

        match &error {
            None => tracing::debug!(adapter = %adapter_id, subject, duration_ms, "Adapter delivered"),
            Some(err) => tracing::warn!(
                adapter = %adapter_id,
                subject,
                message_id = %envelope.id,
                duration_ms,
                "Adapter delivery failed: {err}"
            ),
        }

        Some(DeliveryResult {
            adapter_id,
            success: error.is_none(),
            error,
            duration_ms,
        })
    }

    pub fn statuses(&self) -> Vec<AdapterStatus> {
        self.adapters
            .read()
            .iter()
            .map(|r| r.status.lock().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn stop_one(&self, registered: &Registered) {
        let id = registered.adapter.id();
        match tokio::time::timeout(self.timeout, registered.adapter.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(adapter = id, "Adapter stop failed: {e:#}"),
            Err(_) => tracing::warn!(adapter = id, "Adapter stop timed out"),
        }
    }

    /// Stop every adapter concurrently and empty the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Registered>> = std::mem::take(&mut *self.adapters.write());
        if drained.is_empty() {
            return;
        }
        let count = drained.len();
        futures_util::future::join_all(drained.iter().map(|r| self.stop_one(r))).await;
        tracing::info!(adapters = count, "Adapters stopped");
    }
}

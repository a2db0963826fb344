use super::traits::{AdapterContext, RelayAdapter};
use crate::envelope::Envelope;
use crate::subject::{self, SubjectError};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;

pub type InternalHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Route {
    pattern: String,
    handler: InternalHandler,
}

/// Routes envelopes to in-process async handlers by subject pattern.
///
/// Every handler whose pattern matches runs, in registration order. A subject
/// that no handler accepts is a failed delivery.
pub struct InternalDispatcher {
    id: String,
    subject_prefixes: Vec<String>,
    routes: RwLock<Vec<Route>>,
}

impl InternalDispatcher {
    pub fn new(id: impl Into<String>, subject_prefixes: Vec<String>) -> Self {
        Self {
            id: id.into(),
            subject_prefixes,
            routes: RwLock::new(Vec::new()),
        }
    }

    pub fn on<F, Fut>(&self, pattern: &str, handler: F) -> Result<(), SubjectError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        subject::validate_pattern(pattern)?;
        let handler: InternalHandler = Arc::new(move |envelope| Box::pin(handler(envelope)));
        self.routes.write().push(Route {
            pattern: pattern.to_string(),
            handler,
        });
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.routes.read().len()
    }
}

#[async_trait]
impl RelayAdapter for InternalDispatcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn subject_prefixes(&self) -> Vec<String> {
        self.subject_prefixes.clone()
    }

    async fn deliver(
        &self,
        subject: &str,
        envelope: &Envelope,
        _context: &AdapterContext,
    ) -> anyhow::Result<()> {
        let handlers: Vec<InternalHandler> = self
            .routes
            .read()
            .iter()
            .filter(|route| subject::matches(subject, &route.pattern))
            .map(|route| Arc::clone(&route.handler))
            .collect();

        if handlers.is_empty() {
            anyhow::bail!("no internal handler for {subject}");
        }

        let mut errors = Vec::new();
        for handler in handlers {
            if let Err(e) = handler(envelope.clone()).await {
                errors.push(format!("{e:#}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("{}", errors.join("; "))
        }
    }
}

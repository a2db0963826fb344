use crate::envelope::Envelope;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Per-delivery information handed to an adapter.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// The registered prefix or pattern that routed this subject here.
    pub matched_prefix: String,
    /// Budget the registry will enforce on this call.
    pub timeout: Duration,
}

/// Outcome of one adapter delivery, returned verbatim on the publish result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub adapter_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Non-durable delivery target selected by subject prefix.
#[async_trait]
pub trait RelayAdapter: Send + Sync {
    /// Unique adapter id, also used in index keys (`adapter:<id>`).
    fn id(&self) -> &str;

    /// Plain prefixes (`relay.webhook.ops`) or wildcard patterns
    /// (`relay.human.*`) this adapter accepts.
    fn subject_prefixes(&self) -> Vec<String>;

    /// Called once when the adapter is registered.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on unregistration and relay shutdown.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Deliver one envelope. Errors are recorded on the publish result; they
    /// never abort the publish.
    async fn deliver(
        &self,
        subject: &str,
        envelope: &Envelope,
        context: &AdapterContext,
    ) -> anyhow::Result<()>;
}

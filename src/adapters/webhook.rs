use super::traits::{AdapterContext, RelayAdapter};
use crate::config::WebhookAdapterConfig;
use crate::envelope::Envelope;
use crate::util::truncate_with_ellipsis;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

pub const SIGNATURE_HEADER: &str = "X-Relay-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Relay-Timestamp";
pub const MESSAGE_ID_HEADER: &str = "X-Relay-Message-Id";
pub const SUBJECT_HEADER: &str = "X-Relay-Subject";

/// Default replay window accepted by [`verify_signature`].
pub const SIGNATURE_TOLERANCE_SECS: u64 = 300;

/// POSTs each routed envelope as JSON to a fixed URL.
pub struct WebhookAdapter {
    id: String,
    url: String,
    subject_prefixes: Vec<String>,
    secret: Option<String>,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(id: String, url: String, subject_prefixes: Vec<String>) -> Self {
        Self {
            id,
            url,
            subject_prefixes,
            secret: None,
            headers: HashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &WebhookAdapterConfig) -> Self {
        let mut adapter = Self::new(
            config.id.clone(),
            config.url.clone(),
            config.subject_prefixes.clone(),
        );
        adapter.secret = config.secret.clone().filter(|s| !s.is_empty());
        adapter.headers = config.headers.clone();
        adapter
    }

    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Hex HMAC-SHA256 over `"{timestamp}.{body}"`, prefixed with `sha256=`.
pub fn sign(secret: &str, body: &str, timestamp: &str) -> anyhow::Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {e}"))?;
    mac.update(format!("{timestamp}.{body}").as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check a signature produced by this adapter. Receivers call this with the
/// raw request body and the timestamp/signature headers.
pub fn verify_signature(
    secret: &str,
    body: &str,
    timestamp: &str,
    signature: &str,
    tolerance_secs: u64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        tracing::warn!("Webhook: invalid signature timestamp: {timestamp}");
        return false;
    };
    let now = chrono::Utc::now().timestamp();
    if (now - ts).unsigned_abs() > tolerance_secs {
        tracing::warn!("Webhook: rejecting stale signature timestamp ({ts}, now={now})");
        return false;
    }

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{timestamp}.{body}").as_bytes());
    let signature_hex = signature
        .trim()
        .strip_prefix("sha256=")
        .unwrap_or(signature);
    let Ok(provided) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    mac.verify_slice(&provided).is_ok()
}

#[async_trait]
impl RelayAdapter for WebhookAdapter {
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
        context: &AdapterContext,
    ) -> anyhow::Result<()> {
        let body = serde_json::to_string(&serde_json::json!({
            "subject": subject,
            "envelope": envelope,
        }))?;
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let mut request = self
            .client
            .post(&self.url)
            .timeout(context.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, &timestamp)
            .header(MESSAGE_ID_HEADER, &envelope.id)
            .header(SUBJECT_HEADER, subject);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body, &timestamp)?);
        }

        let resp = request.body(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Webhook {} returned {status}: {}",
                self.id,
                truncate_with_ellipsis(&err, 200)
            );
        }
        Ok(())
    }
}

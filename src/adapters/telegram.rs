use super::traits::{AdapterContext, RelayAdapter};
use crate::config::TelegramAdapterConfig;
use crate::envelope::Envelope;
use crate::util::truncate_with_ellipsis;
use async_trait::async_trait;

/// Telegram's hard limit on message text, in characters.
pub const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Sends envelopes addressed to `<prefix>.<chat_id>` to that Telegram chat
/// through the Bot API.
pub struct TelegramAdapter {
    bot_token: String,
    subject_prefix: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramAdapter {
    pub fn new(bot_token: String, subject_prefix: String) -> Self {
        Self {
            bot_token,
            subject_prefix,
            api_base: "https://api.telegram.org".into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &TelegramAdapterConfig) -> Self {
        Self::new(config.bot_token.clone(), config.subject_prefix.clone())
            .with_api_base(config.api_base.clone())
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// The chat id is the single segment following the prefix.
    pub fn chat_id_for<'a>(&self, subject: &'a str) -> Option<&'a str> {
        let rest = subject
            .strip_prefix(self.subject_prefix.as_str())?
            .strip_prefix('.')?;
        (!rest.is_empty() && !rest.contains('.')).then_some(rest)
    }
}

/// Render a payload as chat text: plain strings go through as-is, objects
/// contribute their `text` or `content` field, anything else is sent as JSON.
pub fn payload_text(payload: &serde_json::Value) -> String {
    if let Some(text) = payload.as_str() {
        return text.to_string();
    }
    if let Some(text) = payload
        .get("text")
        .or_else(|| payload.get("content"))
        .and_then(serde_json::Value::as_str)
    {
        return text.to_string();
    }
    payload.to_string()
}

#[async_trait]
impl RelayAdapter for TelegramAdapter {
    fn id(&self) -> &str {
        "telegram"
    }

    fn subject_prefixes(&self) -> Vec<String> {
        vec![format!("{}.*", self.subject_prefix)]
    }

    async fn deliver(
        &self,
        subject: &str,
        envelope: &Envelope,
        context: &AdapterContext,
    ) -> anyhow::Result<()> {
        let chat_id = self
            .chat_id_for(subject)
            .ok_or_else(|| anyhow::anyhow!("No Telegram chat id in subject {subject}"))?;

        let text = truncate_with_ellipsis(
            &payload_text(&envelope.payload),
            TELEGRAM_MAX_MESSAGE_LENGTH - 3,
        );
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .timeout(context.timeout)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Telegram sendMessage failed ({status}): {}",
                truncate_with_ellipsis(&err, 200)
            );
        }

        tracing::debug!(chat_id, message_id = %envelope.id, "Telegram message sent");
        Ok(())
    }
}

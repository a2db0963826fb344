use crate::budget::MAX_TTL_SECS;
use crate::subject;
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "ZEROCLAW_RELAY_CONFIG_DIR";
const DATA_DIR_ENV: &str = "ZEROCLAW_RELAY_DATA_DIR";
const ADAPTER_TIMEOUT_ENV: &str = "ZEROCLAW_RELAY_ADAPTER_TIMEOUT_SECS";

// ── Top-level config ─────────────────────────────────────────────

/// Relay configuration, persisted as `config.toml` in the config directory.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path of the loaded config file (computed, never serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Root directory for mailboxes, index, dead letters and access rules.
    /// A leading `~` is expanded at open time.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.zeroclaw-relay/data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            data_dir: default_data_dir(),
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            budget: BudgetConfig::default(),
            access: AccessConfig::default(),
            reliability: ReliabilityConfig::default(),
            subscriptions: SubscriptionsConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            adapters: AdaptersConfig::default(),
        }
    }
}

// ── Storage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// fsync staged message files before they become visible. Disabling trades
    /// crash durability for throughput.
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { fsync: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LimitsConfig {
    /// Maximum serialized payload size accepted by `publish`.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

// ── Budget / access ──────────────────────────────────────────────

/// Budget applied to publishes that do not carry one.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BudgetConfig {
    #[serde(default = "default_max_hops")]
    pub default_max_hops: u32,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Unlimited when unset.
    #[serde(default)]
    pub default_call_budget: Option<u32>,
}

fn default_max_hops() -> u32 {
    5
}

fn default_ttl_secs() -> u64 {
    3600
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_max_hops: default_max_hops(),
            default_ttl_secs: default_ttl_secs(),
            default_call_budget: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccessConfig {
    /// Number of leading subject segments that form a namespace
    /// (`relay.agent.backend` with depth 3).
    #[serde(default = "default_namespace_depth")]
    pub namespace_depth: usize,
}

fn default_namespace_depth() -> usize {
    3
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            namespace_depth: default_namespace_depth(),
        }
    }
}

// ── Reliability ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReliabilityConfig {
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BackpressureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Writes are refused once this many messages are pending in a mailbox.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_max_pending() -> usize {
    1000
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pending: default_max_pending(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive failures (within the window) that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// How long an open circuit refuses writes before admitting a trial.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bucket capacity per endpoint.
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    /// Bucket table cardinality cap; idle buckets are evicted past this.
    #[serde(default = "default_max_tracked_endpoints")]
    pub max_tracked_endpoints: usize,
}

fn default_burst() -> u32 {
    100
}

fn default_refill_per_sec() -> f64 {
    50.0
}

fn default_max_tracked_endpoints() -> usize {
    10_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            burst: default_burst(),
            refill_per_sec: default_refill_per_sec(),
            max_tracked_endpoints: default_max_tracked_endpoints(),
        }
    }
}

// ── Subscriptions / dead letters ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubscriptionsConfig {
    /// Per-subscriber channel depth. A full channel drops new messages for
    /// that subscriber only.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeadLetterConfig {
    /// Entries older than this are purged when the relay opens. `0` keeps
    /// entries until purged explicitly.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

// ── Adapters ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AdaptersConfig {
    /// Upper bound on a single adapter delivery.
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
    #[serde(default)]
    pub webhooks: Vec<WebhookAdapterConfig>,
    #[serde(default)]
    pub telegram: Option<TelegramAdapterConfig>,
}

fn default_delivery_timeout_secs() -> u64 {
    30
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_secs: default_delivery_timeout_secs(),
            webhooks: Vec::new(),
            telegram: None,
        }
    }
}

/// Outbound HTTP POST target.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WebhookAdapterConfig {
    pub id: String,
    pub url: String,
    /// Subject prefixes or wildcard patterns routed to this webhook.
    pub subject_prefixes: Vec<String>,
    /// HMAC-SHA256 signing secret. Requests are unsigned when unset.
    #[serde(default)]
    pub secret: Option<String>,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TelegramAdapterConfig {
    pub bot_token: String,
    /// Messages under `<prefix>.<chat_id>` are sent to that chat.
    #[serde(default = "default_telegram_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

fn default_telegram_prefix() -> String {
    "relay.human.telegram".into()
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}

// ── Loading / saving ─────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".zeroclaw-relay"))
}

/// Resolve the config directory: explicit override, then
/// `ZEROCLAW_RELAY_CONFIG_DIR`, then `~/.zeroclaw-relay`.
pub fn resolve_config_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    if let Ok(custom) = std::env::var(CONFIG_DIR_ENV) {
        let custom = custom.trim();
        if !custom.is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(custom).as_ref()));
        }
    }
    default_config_dir()
}

impl Config {
    pub async fn load_or_init(override_dir: Option<&Path>) -> Result<Self> {
        let config_dir = resolve_config_dir(override_dir)?;
        Self::load_or_init_in(&config_dir).await
    }

    /// Load `config.toml` from `config_dir`, writing defaults when absent.
    pub async fn load_or_init_in(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        fs::create_dir_all(config_dir).await.with_context(|| {
            format!("Failed to create config directory: {}", config_dir.display())
        })?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config {
                data_dir: config_dir.join("data"),
                ..Config::default()
            };
            config.config_path = config_path.clone();
            config.save().await?;
            config
        } else {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            data_dir = %config.resolve_data_dir().display(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// `data_dir` with a leading `~` expanded.
    pub fn resolve_data_dir(&self) -> PathBuf {
        let raw = self.data_dir.to_string_lossy();
        PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(raw) = std::env::var(ADAPTER_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.adapters.delivery_timeout_secs = secs,
                _ => tracing::warn!(
                    value = %raw,
                    "Ignoring invalid {ADAPTER_TIMEOUT_ENV}; expected a positive integer"
                ),
            }
        }
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data_dir must not be empty");
        }
        if self.limits.max_payload_bytes == 0 {
            anyhow::bail!("limits.max_payload_bytes must be greater than 0");
        }

        if self.budget.default_max_hops == 0 {
            anyhow::bail!("budget.default_max_hops must be greater than 0");
        }
        if self.budget.default_ttl_secs == 0 || self.budget.default_ttl_secs > MAX_TTL_SECS {
            anyhow::bail!("budget.default_ttl_secs must be between 1 and {MAX_TTL_SECS}");
        }
        if self.access.namespace_depth == 0 {
            anyhow::bail!("access.namespace_depth must be greater than 0");
        }

        let reliability = &self.reliability;
        if reliability.backpressure.max_pending == 0 {
            anyhow::bail!("reliability.backpressure.max_pending must be greater than 0");
        }
        let breaker = &reliability.circuit_breaker;
        if breaker.failure_threshold == 0 {
            anyhow::bail!("reliability.circuit_breaker.failure_threshold must be greater than 0");
        }
        if breaker.failure_window_secs == 0 || breaker.cooldown_secs == 0 {
            anyhow::bail!(
                "reliability.circuit_breaker.failure_window_secs and cooldown_secs must be greater than 0"
            );
        }
        let rate = &reliability.rate_limit;
        if rate.burst == 0 {
            anyhow::bail!("reliability.rate_limit.burst must be greater than 0");
        }
        if !rate.refill_per_sec.is_finite() || rate.refill_per_sec <= 0.0 {
            anyhow::bail!("reliability.rate_limit.refill_per_sec must be a positive number");
        }
        if rate.max_tracked_endpoints == 0 {
            anyhow::bail!("reliability.rate_limit.max_tracked_endpoints must be greater than 0");
        }

        if self.subscriptions.channel_capacity == 0 {
            anyhow::bail!("subscriptions.channel_capacity must be greater than 0");
        }

        self.validate_adapters()
    }

    fn validate_adapters(&self) -> Result<()> {
        if self.adapters.delivery_timeout_secs == 0 {
            anyhow::bail!("adapters.delivery_timeout_secs must be greater than 0");
        }

        let mut seen = HashSet::new();
        for (i, webhook) in self.adapters.webhooks.iter().enumerate() {
            let id = webhook.id.trim();
            if id.is_empty() {
                anyhow::bail!("adapters.webhooks[{i}].id must not be empty");
            }
            if !seen.insert(id.to_string()) {
                anyhow::bail!("adapters.webhooks[{i}].id '{id}' is duplicated");
            }
            let url = reqwest::Url::parse(webhook.url.trim())
                .with_context(|| format!("adapters.webhooks[{i}].url is not a valid URL"))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("adapters.webhooks[{i}].url must use http or https");
            }
            if webhook.subject_prefixes.is_empty() {
                anyhow::bail!("adapters.webhooks[{i}].subject_prefixes must not be empty");
            }
            for prefix in &webhook.subject_prefixes {
                subject::validate_pattern(prefix).with_context(|| {
                    format!("adapters.webhooks[{i}].subject_prefixes entry '{prefix}' is invalid")
                })?;
            }
        }

        if let Some(telegram) = &self.adapters.telegram {
            if telegram.bot_token.trim().is_empty() {
                anyhow::bail!("adapters.telegram.bot_token must not be empty");
            }
            subject::validate_subject(&telegram.subject_prefix)
                .context("adapters.telegram.subject_prefix must be a concrete subject")?;
        }

        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE_NAME);
        let backup_path = parent_dir.join(format!("{file_name}.bak"));

        let had_existing_config = self.config_path.exists();
        if had_existing_config {
            fs::copy(&self.config_path, &backup_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create config backup before atomic replace: {}",
                        backup_path.display()
                    )
                })?;
        }

        if let Err(e) = crate::util::atomic_write(&self.config_path, toml_str.as_bytes()).await {
            if had_existing_config && backup_path.exists() {
                fs::copy(&backup_path, &self.config_path)
                    .await
                    .context("Failed to restore config backup")?;
            }
            return Err(e);
        }

        if had_existing_config {
            let _ = fs::remove_file(&backup_path).await;
        }

        // Restrict permissions: webhook secrets and bot tokens live here
        #[cfg(unix)]
        {
            use std::{fs::Permissions, os::unix::fs::PermissionsExt};
            let _ = fs::set_permissions(&self.config_path, Permissions::from_mode(0o600)).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.budget.default_max_hops, 5);
        assert_eq!(config.adapters.delivery_timeout_secs, 30);
        assert_eq!(config.access.namespace_depth, 3);
        assert!(config.reliability.circuit_breaker.enabled);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
data_dir = "/var/lib/relay"

[reliability.circuit_breaker]
failure_threshold = 2

[[adapters.webhooks]]
id = "ops"
url = "https://hooks.example.com/relay"
subject_prefixes = ["relay.webhook.ops"]
"#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/relay"));
        assert_eq!(config.reliability.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.reliability.circuit_breaker.cooldown_secs, 30);
        assert_eq!(config.reliability.rate_limit.burst, 100);
        assert_eq!(config.adapters.webhooks.len(), 1);
        assert!(config.adapters.webhooks[0].secret.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_thresholds() {
        let mut config = Config::default();
        config.reliability.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.subscriptions.channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reliability.rate_limit.refill_per_sec = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_webhooks() {
        let webhook = WebhookAdapterConfig {
            id: "ops".into(),
            url: "ftp://example.com".into(),
            subject_prefixes: vec!["relay.webhook".into()],
            secret: None,
            headers: HashMap::new(),
        };

        let mut config = Config::default();
        config.adapters.webhooks.push(webhook.clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("http or https"));

        let mut config = Config::default();
        let mut bad_prefix = webhook.clone();
        bad_prefix.url = "https://example.com".into();
        bad_prefix.subject_prefixes = vec!["relay.>.x".into()];
        config.adapters.webhooks.push(bad_prefix);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        let mut ok = webhook;
        ok.url = "https://example.com".into();
        config.adapters.webhooks.push(ok.clone());
        config.adapters.webhooks.push(ok);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicated"));
    }

    #[test]
    fn validate_rejects_empty_telegram_token() {
        let mut config = Config::default();
        config.adapters.telegram = Some(TelegramAdapterConfig {
            bot_token: "  ".into(),
            subject_prefix: default_telegram_prefix(),
            api_base: default_telegram_api_base(),
        });
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn load_or_init_writes_defaults_then_reloads_edits() {
        let tmp = TempDir::new().unwrap();

        let first = Config::load_or_init_in(tmp.path()).await.unwrap();
        assert!(first.config_path.exists());
        assert_eq!(first.data_dir, tmp.path().join("data"));

        let mut edited = first.clone();
        edited.reliability.backpressure.max_pending = 7;
        edited.save().await.unwrap();

        let reloaded = Config::load_or_init_in(tmp.path()).await.unwrap();
        assert_eq!(reloaded.reliability.backpressure.max_pending, 7);
        assert!(!tmp.path().join("config.toml.bak").exists());
    }

    #[tokio::test]
    async fn load_rejects_invalid_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[limits]\nmax_payload_bytes = 0\n",
        )
        .await
        .unwrap();
        assert!(Config::load_or_init_in(tmp.path()).await.is_err());
    }

    #[test]
    fn resolve_data_dir_expands_tilde() {
        let config = Config::default();
        let resolved = config.resolve_data_dir();
        assert!(!resolved.to_string_lossy().starts_with('~'));
        assert!(resolved.ends_with(".zeroclaw-relay/data"));
    }

    #[test]
    fn explicit_override_wins_config_dir_resolution() {
        let dir = resolve_config_dir(Some(Path::new("/tmp/relay-config"))).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/relay-config"));
    }

    #[test]
    fn schema_covers_sections() {
        let schema = schemars::schema_for!(Config);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("circuit_breaker"));
        assert!(json.contains("delivery_timeout_secs"));
    }
}

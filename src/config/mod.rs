pub mod schema;

#[allow(unused_imports)]
pub use schema::{
    resolve_config_dir, AccessConfig, AdaptersConfig, BackpressureConfig, BudgetConfig,
    CircuitBreakerConfig, Config, DeadLetterConfig, LimitsConfig, RateLimitConfig,
    ReliabilityConfig, StorageConfig, SubscriptionsConfig, TelegramAdapterConfig,
    WebhookAdapterConfig,
};

pub mod internal;
pub mod registry;
pub mod telegram;
pub mod traits;
pub mod webhook;

pub use internal::InternalDispatcher;
pub use registry::{prefix_matches, AdapterError, AdapterRegistry, AdapterStatus};
pub use telegram::TelegramAdapter;
pub use traits::{AdapterContext, DeliveryResult, RelayAdapter};
pub use webhook::WebhookAdapter;

use crate::config::AdaptersConfig;
use std::sync::Arc;

/// Instantiate the adapters declared in `[adapters]`, in declaration order:
/// webhooks first, then Telegram.
pub fn from_config(config: &AdaptersConfig) -> Vec<Arc<dyn RelayAdapter>> {
    let mut adapters: Vec<Arc<dyn RelayAdapter>> = config
        .webhooks
        .iter()
        .map(|webhook| Arc::new(WebhookAdapter::from_config(webhook)) as Arc<dyn RelayAdapter>)
        .collect();

    if let Some(ref tg) = config.telegram {
        adapters.push(Arc::new(TelegramAdapter::from_config(tg)));
    }

    adapters
}

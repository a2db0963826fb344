//! Registered endpoints: concrete subjects that own a durable mailbox.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub subject: String,
    /// On-disk mailbox directory name, see [`endpoint_hash`].
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn new(subject: &str, description: Option<String>) -> Self {
        Self {
            subject: subject.to_string(),
            hash: endpoint_hash(subject),
            description,
            created_at: Utc::now(),
        }
    }
}

/// Filesystem-safe mailbox identifier: hex of the first 16 bytes of
/// SHA-256(subject).
pub fn endpoint_hash(subject: &str) -> String {
    let digest = Sha256::digest(subject.as_bytes());
    hex::encode(&digest[..16])
}

/// In-memory subject → endpoint map. Rebuilt from the mailbox store at open.
pub struct EndpointRegistry {
    by_subject: RwLock<HashMap<String, Endpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            by_subject: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let registry = Self::new();
        {
            let mut map = registry.by_subject.write();
            for endpoint in endpoints {
                map.insert(endpoint.subject.clone(), endpoint);
            }
        }
        registry
    }

    pub fn get(&self, subject: &str) -> Option<Endpoint> {
        self.by_subject.read().get(subject).cloned()
    }

    pub fn get_by_hash(&self, hash: &str) -> Option<Endpoint> {
        self.by_subject
            .read()
            .values()
            .find(|endpoint| endpoint.hash == hash)
            .cloned()
    }

    /// Insert unless the subject is already registered; returns the record
    /// that ends up in the registry and whether it was newly added.
    pub fn insert_if_absent(&self, endpoint: Endpoint) -> (Endpoint, bool) {
        let mut map = self.by_subject.write();
        if let Some(existing) = map.get(&endpoint.subject) {
            return (existing.clone(), false);
        }
        map.insert(endpoint.subject.clone(), endpoint.clone());
        (endpoint, true)
    }

    pub fn remove(&self, subject: &str) -> Option<Endpoint> {
        self.by_subject.write().remove(subject)
    }

    /// All endpoints ordered by subject.
    pub fn list(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.by_subject.read().values().cloned().collect();
        endpoints.sort_by(|a, b| a.subject.cmp(&b.subject));
        endpoints
    }

    pub fn len(&self) -> usize {
        self.by_subject.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Namespace-scoped allow/deny rules for cross-namespace publishes.
//!
//! Publishing within one namespace is always allowed. For a cross-namespace
//! pair, the matching rule with the highest specificity wins (specificity is
//! the number of fields that are not `*`); ties go to the most recently added
//! rule. With no matching rule the publish is allowed.

use crate::subject;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Matches any namespace in a rule.
pub const ANY_NAMESPACE: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAction {
    Allow,
    Deny,
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub source: String,
    pub target: String,
    pub action: AccessAction,
    /// Insertion order; larger is more recent.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl AccessRule {
    fn specificity(&self) -> u8 {
        u8::from(self.source != ANY_NAMESPACE) + u8::from(self.target != ANY_NAMESPACE)
    }

    fn applies_to(&self, source: &str, target: &str) -> bool {
        (self.source == ANY_NAMESPACE || self.source == source)
            && (self.target == ANY_NAMESPACE || self.target == target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    /// The rule that decided, if any.
    pub rule: Option<AccessRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RuleSet {
    #[serde(default)]
    next_seq: u64,
    #[serde(default)]
    rules: Vec<AccessRule>,
}

pub struct AccessControl {
    path: PathBuf,
    state: RwLock<RuleSet>,
    persist: tokio::sync::Mutex<()>,
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace == ANY_NAMESPACE {
        return Ok(());
    }
    subject::validate_subject(namespace)
        .with_context(|| format!("'{namespace}' is not a valid namespace or '*'"))
}

impl AccessControl {
    /// Load rules from `path`, starting empty when the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<RuleSet>(&bytes)
                .with_context(|| format!("Failed to parse access rules: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RuleSet::default(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read access rules: {}", path.display())
                })
            }
        };
        tracing::debug!(rules = state.rules.len(), path = %path.display(), "Access rules loaded");
        Ok(Self {
            path,
            state: RwLock::new(state),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn evaluate(&self, source_namespace: &str, target_namespace: &str) -> AccessDecision {
        if source_namespace == target_namespace {
            return AccessDecision {
                allowed: true,
                rule: None,
            };
        }

        let state = self.state.read();
        let winner = state
            .rules
            .iter()
            .filter(|rule| rule.applies_to(source_namespace, target_namespace))
            .max_by_key(|rule| (rule.specificity(), rule.seq))
            .cloned();

        AccessDecision {
            allowed: winner
                .as_ref()
                .is_none_or(|rule| rule.action == AccessAction::Allow),
            rule: winner,
        }
    }

    pub async fn allow(&self, source: &str, target: &str) -> Result<AccessRule> {
        self.add(source, target, AccessAction::Allow).await
    }

    pub async fn deny(&self, source: &str, target: &str) -> Result<AccessRule> {
        self.add(source, target, AccessAction::Deny).await
    }

    /// Add a rule. Re-adding an identical rule refreshes its recency instead
    /// of duplicating it.
    pub async fn add(&self, source: &str, target: &str, action: AccessAction) -> Result<AccessRule> {
        validate_namespace(source)?;
        validate_namespace(target)?;

        let _persist = self.persist.lock().await;
        let mut next = self.state.read().clone();
        next.rules
            .retain(|r| !(r.source == source && r.target == target && r.action == action));
        next.next_seq += 1;
        let rule = AccessRule {
            source: source.to_string(),
            target: target.to_string(),
            action,
            seq: next.next_seq,
            created_at: Utc::now(),
        };
        next.rules.push(rule.clone());

        self.commit(next).await?;
        tracing::info!(source, target, %action, seq = rule.seq, "Access rule added");
        Ok(rule)
    }

    /// Remove every rule for the exact (source, target) pair.
    pub async fn remove(&self, source: &str, target: &str) -> Result<usize> {
        let _persist = self.persist.lock().await;
        let mut next = self.state.read().clone();
        let before = next.rules.len();
        next.rules
            .retain(|r| !(r.source == source && r.target == target));
        let removed = before - next.rules.len();
        if removed > 0 {
            self.commit(next).await?;
            tracing::info!(source, target, removed, "Access rules removed");
        }
        Ok(removed)
    }

    /// Persist `next`, then make it the live rule set. Callers hold `persist`.
    async fn commit(&self, next: RuleSet) -> Result<()> {
        let snapshot = serde_json::to_vec_pretty(&next)?;
        crate::util::atomic_write(&self.path, &snapshot).await?;
        *self.state.write() = next;
        Ok(())
    }

    /// Rules ordered oldest first.
    pub fn rules(&self) -> Vec<AccessRule> {
        let mut rules = self.state.read().rules.clone();
        rules.sort_by_key(|r| r.seq);
        rules
    }
}

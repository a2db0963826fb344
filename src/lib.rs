#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_cast,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps,
    dead_code
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod access;
pub mod adapters;
pub mod budget;
pub mod config;
pub mod dead_letter;
pub mod endpoints;
pub mod envelope;
pub mod index;
pub mod mailbox;
pub mod relay;
pub mod reliability;
pub mod subject;
pub mod subscriptions;
pub mod util;

pub use config::Config;
pub use envelope::{Envelope, MessageStatus};
pub use relay::{PublishOptions, PublishResult, Relay, RelayError};

/// Commands that operate on an opened relay
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayCommands {
    /// Publish a message to a subject
    #[command(long_about = "\
Publish a message to a subject.

The payload is parsed as JSON; anything that is not valid JSON is sent \
as a plain string.

Examples:
  zeroclaw-relay publish relay.agent.alpha '{\"task\":\"summarize\"}' --from relay.agent.beta
  zeroclaw-relay publish relay.human.telegram.42 'build is green' --from relay.system.ci")]
    Publish {
        /// Concrete destination subject
        subject: String,
        /// JSON payload (or plain text)
        payload: String,
        /// Sender subject
        #[arg(long)]
        from: String,
        /// Subject replies should go to
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Manage endpoints (durable mailboxes)
    Endpoint {
        #[command(subcommand)]
        endpoint_command: EndpointCommands,
    },
    /// List an endpoint's mailbox
    Inbox {
        subject: String,
        /// Only messages in this state (new, delivered, failed)
        #[arg(long)]
        status: Option<String>,
        /// Resume after this message id
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Claim the oldest pending message of an endpoint
    Claim { subject: String },
    /// Mark a message failed and dead-letter it
    Fail {
        subject: String,
        id: String,
        #[arg(long, default_value = "rejected by consumer")]
        reason: String,
    },
    /// Query the message index
    Messages {
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one message by id
    Get { id: String },
    /// Inspect or purge the dead-letter queue
    DeadLetters {
        #[command(subcommand)]
        dead_letter_command: DeadLetterCommands,
    },
    /// Manage cross-namespace access rules
    Acl {
        #[command(subcommand)]
        acl_command: AclCommands,
    },
    /// Show configured adapters and their delivery counters
    Adapters,
    /// Print relay metrics as JSON
    Metrics,
    /// Maintain the message index
    Index {
        #[command(subcommand)]
        index_command: IndexCommands,
    },
}

#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EndpointCommands {
    /// Register a concrete subject as an endpoint (idempotent)
    Register {
        subject: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Remove an endpoint with its mailbox
    Unregister { subject: String },
    /// List registered endpoints
    List,
}

#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeadLetterCommands {
    /// List dead letters, newest first
    List {
        /// Endpoint hash
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete dead letters
    Purge {
        /// Endpoint hash
        #[arg(long)]
        endpoint: Option<String>,
        /// Only entries older than this many days
        #[arg(long)]
        older_than_days: Option<u32>,
        /// Required when no other filter is given
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AclCommands {
    /// Allow publishes from one namespace to another ('*' matches any)
    Allow { source: String, target: String },
    /// Deny publishes from one namespace to another ('*' matches any)
    Deny { source: String, target: String },
    /// Remove every rule for a (source, target) pair
    Remove { source: String, target: String },
    /// List rules, oldest first
    List,
}

#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IndexCommands {
    /// Regenerate the index from the mailboxes
    Rebuild,
}

use super::{InboxQuery, MessageListQuery, MessagePage, PublishOptions, Relay};
use crate::dead_letter::{DeadLetterFilter, PurgeFilter};
use crate::envelope::{Envelope, MessageStatus};
use crate::util::truncate_with_ellipsis;
use crate::{AclCommands, DeadLetterCommands, EndpointCommands, IndexCommands, RelayCommands};
use anyhow::{bail, Result};
use chrono::Utc;

fn parse_status(raw: Option<&str>) -> Result<Option<MessageStatus>> {
    raw.map(str::parse::<MessageStatus>).transpose()
}

/// Payloads that are not JSON travel as plain strings.
fn parse_payload(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn status_style(status: MessageStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        MessageStatus::New => console::style(text).cyan(),
        MessageStatus::Delivered => console::style(text).green(),
        MessageStatus::Failed => console::style(text).red(),
    }
}

fn print_envelope_line(envelope: &Envelope) {
    println!(
        "  {} {} {} {}",
        console::style(&envelope.id).dim(),
        status_style(envelope.status),
        console::style(&envelope.subject).white().bold(),
        truncate_with_ellipsis(&envelope.payload.to_string(), 80),
    );
}

fn print_page(page: &MessagePage) {
    if page.messages.is_empty() {
        println!("No messages.");
        return;
    }
    for envelope in &page.messages {
        print_envelope_line(envelope);
    }
    if let Some(cursor) = &page.next_cursor {
        println!("\n  more: --cursor {cursor}");
    }
}

pub async fn handle_command(command: RelayCommands, relay: &Relay) -> Result<()> {
    match command {
        RelayCommands::Publish {
            subject,
            payload,
            from,
            reply_to,
        } => {
            let mut options = PublishOptions::new(from);
            options.reply_to = reply_to;
            let result = relay
                .publish(&subject, parse_payload(&payload), options)
                .await?;

            let marker = if result.dead_lettered {
                console::style("✗").red().bold()
            } else {
                console::style("✓").green().bold()
            };
            println!(
                "{marker} {} delivered_to={} subscribers={}",
                result.message_id, result.delivered_to, result.subscribers_notified
            );
            for rejection in &result.rejected {
                println!("  rejected {} ({})", rejection.endpoint_hash, rejection.reason);
            }
            if let Some(adapter) = &result.adapter_result {
                match &adapter.error {
                    None => println!("  adapter {} ok ({}ms)", adapter.adapter_id, adapter.duration_ms),
                    Some(err) => println!("  adapter {} failed: {err}", adapter.adapter_id),
                }
            }
            if result.dead_lettered {
                println!("  {}", console::style("dead-lettered").yellow());
            }
            Ok(())
        }

        RelayCommands::Endpoint { endpoint_command } => match endpoint_command {
            EndpointCommands::Register {
                subject,
                description,
            } => {
                let endpoint = relay.register_endpoint(&subject, description).await?;
                println!(
                    "{} {} ({})",
                    console::style("✓").green().bold(),
                    endpoint.subject,
                    console::style(&endpoint.hash).dim()
                );
                Ok(())
            }
            EndpointCommands::Unregister { subject } => {
                if relay.unregister_endpoint(&subject).await? {
                    println!("Unregistered {subject}");
                } else {
                    println!("No endpoint registered for {subject}");
                }
                Ok(())
            }
            EndpointCommands::List => {
                let endpoints = relay.list_endpoints();
                if endpoints.is_empty() {
                    println!("No endpoints registered.");
                    println!("\nUsage:");
                    println!("  zeroclaw-relay endpoint register relay.agent.alpha");
                    return Ok(());
                }
                println!("Endpoints ({}):", endpoints.len());
                for endpoint in endpoints {
                    let pending = relay.pending_depth(&endpoint.subject).await?;
                    println!(
                        "  {} {} pending={} {}",
                        console::style(&endpoint.subject).white().bold(),
                        console::style(&endpoint.hash).dim(),
                        pending,
                        endpoint.description.unwrap_or_default()
                    );
                }
                Ok(())
            }
        },

        RelayCommands::Inbox {
            subject,
            status,
            cursor,
            limit,
        } => {
            let page = relay
                .read_inbox(
                    &subject,
                    InboxQuery {
                        status: parse_status(status.as_deref())?,
                        cursor,
                        limit,
                    },
                )
                .await?;
            print_page(&page);
            Ok(())
        }

        RelayCommands::Claim { subject } => {
            match relay.claim_next(&subject).await? {
                Some(envelope) => println!("{}", serde_json::to_string_pretty(&envelope)?),
                None => println!("No pending messages for {subject}"),
            }
            Ok(())
        }

        RelayCommands::Fail {
            subject,
            id,
            reason,
        } => {
            let envelope = relay.fail_message(&subject, &id, &reason).await?;
            println!("Failed {} ({reason})", envelope.id);
            Ok(())
        }

        RelayCommands::Messages {
            subject,
            status,
            from,
            cursor,
            limit,
        } => {
            let page = relay.list_messages(MessageListQuery {
                subject,
                status: parse_status(status.as_deref())?,
                from,
                cursor,
                limit,
            })?;
            print_page(&page);
            Ok(())
        }

        RelayCommands::Get { id } => match relay.get_message(&id).await? {
            Some(envelope) => {
                println!("{}", serde_json::to_string_pretty(&envelope)?);
                Ok(())
            }
            None => bail!("Message not found: {id}"),
        },

        RelayCommands::DeadLetters {
            dead_letter_command,
        } => match dead_letter_command {
            DeadLetterCommands::List {
                endpoint,
                subject,
                limit,
            } => {
                let entries = relay.list_dead_letters(&DeadLetterFilter {
                    endpoint_hash: endpoint,
                    subject,
                    limit,
                })?;
                if entries.is_empty() {
                    println!("Dead-letter queue is empty.");
                    return Ok(());
                }
                for entry in entries {
                    println!(
                        "  {} {} {} {}",
                        console::style(&entry.message_id).dim(),
                        entry.rejected_at.to_rfc3339(),
                        console::style(&entry.subject).white().bold(),
                        console::style(&entry.reason).yellow()
                    );
                }
                Ok(())
            }
            DeadLetterCommands::Purge {
                endpoint,
                older_than_days,
                all,
            } => {
                if endpoint.is_none() && older_than_days.is_none() && !all {
                    bail!("Refusing to purge everything without --all");
                }
                let purged = relay.purge_dead_letters(&PurgeFilter {
                    endpoint_hash: endpoint,
                    older_than: older_than_days
                        .map(|days| Utc::now() - chrono::Duration::days(i64::from(days))),
                })?;
                println!("Purged {purged} dead letter(s)");
                Ok(())
            }
        },

        RelayCommands::Acl { acl_command } => match acl_command {
            AclCommands::Allow { source, target } => {
                let rule = relay.allow_cross_namespace(&source, &target).await?;
                println!(
                    "{} allow {} → {} (#{})",
                    console::style("✓").green().bold(),
                    rule.source,
                    rule.target,
                    rule.seq
                );
                Ok(())
            }
            AclCommands::Deny { source, target } => {
                let rule = relay.deny_cross_namespace(&source, &target).await?;
                println!(
                    "{} deny {} → {} (#{})",
                    console::style("✓").green().bold(),
                    rule.source,
                    rule.target,
                    rule.seq
                );
                Ok(())
            }
            AclCommands::Remove { source, target } => {
                let removed = relay.remove_access_rule(&source, &target).await?;
                println!("Removed {removed} rule(s)");
                Ok(())
            }
            AclCommands::List => {
                let rules = relay.access_rules();
                if rules.is_empty() {
                    println!("No access rules; cross-namespace publishes are allowed.");
                    return Ok(());
                }
                for rule in rules {
                    println!("  #{} {} {} → {}", rule.seq, rule.action, rule.source, rule.target);
                }
                Ok(())
            }
        },

        RelayCommands::Adapters => {
            let statuses = relay.adapter_statuses();
            if statuses.is_empty() {
                println!("No adapters configured.");
                return Ok(());
            }
            for status in statuses {
                println!(
                    "  {} [{}] delivered={} failed={} timed_out={}",
                    console::style(&status.id).white().bold(),
                    status.subject_prefixes.join(", "),
                    status.delivered,
                    status.failed,
                    status.timed_out
                );
                if let Some(err) = status.last_error {
                    println!("    last error: {err}");
                }
            }
            Ok(())
        }

        RelayCommands::Metrics => {
            println!("{}", serde_json::to_string_pretty(&relay.metrics()?)?);
            Ok(())
        }

        RelayCommands::Index { index_command } => match index_command {
            IndexCommands::Rebuild => {
                let rows = relay.rebuild_index().await?;
                println!("Index rebuilt: {rows} mailbox row(s)");
                Ok(())
            }
        },
    }
}

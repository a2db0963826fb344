//! Durable per-endpoint mailboxes in maildir layout.
//!
//! ```text
//! <root>/<endpoint_hash>/
//!     endpoint.json   registration record
//!     tmp/            staging, never visible to readers
//!     new/            pending
//!     cur/            delivered (claimed)
//!     failed/         rejected by a consumer
//! ```
//!
//! Every state change is a `rename(2)` inside one mailbox directory, so a
//! message file exists in exactly one member set at any instant. Operations on
//! one mailbox are serialized by a per-mailbox async mutex; distinct mailboxes
//! never contend.

use crate::endpoints::Endpoint;
use crate::envelope::{Envelope, MessageStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;

const ENDPOINT_FILE: &str = "endpoint.json";
const STAGING_DIR: &str = "tmp";
const PENDING_DIR: &str = "new";
const DELIVERED_DIR: &str = "cur";
const FAILED_DIR: &str = "failed";
const MESSAGE_EXT: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("no mailbox for endpoint {0}")]
    EndpointNotFound(String),
    #[error("message {id} not found in mailbox {hash}")]
    MessageNotFound { hash: String, id: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed mailbox file {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> MailboxError {
    let context = context.into();
    move |source| MailboxError::Io { context, source }
}

fn dir_for(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::New => PENDING_DIR,
        MessageStatus::Delivered => DELIVERED_DIR,
        MessageStatus::Failed => FAILED_DIR,
    }
}

/// Message ids double as file names; refuse anything that could escape the
/// mailbox directory.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_alphanumeric())
}

fn message_file_name(id: &str) -> String {
    format!("{id}.{MESSAGE_EXT}")
}

fn id_from_file_name(name: &str) -> Option<&str> {
    name.strip_suffix(".json").filter(|id| is_safe_id(id))
}

async fn fsync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path).await?.sync_all().await
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

pub struct MailboxStore {
    root: PathBuf,
    fsync: bool,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MailboxStore {
    pub async fn open(root: impl Into<PathBuf>, fsync: bool) -> Result<Self, MailboxError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(io_err(format!("creating mailbox root {}", root.display())))?;
        Ok(Self {
            root,
            fsync,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mailbox_dir(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    fn lock_for(&self, hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(hash.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn exists(&self, hash: &str) -> bool {
        self.mailbox_dir(hash).join(ENDPOINT_FILE).exists()
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        if self.fsync {
            file.sync_all().await?;
        }
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Provision the directory tree and registration record. Re-creating an
    /// existing mailbox keeps its contents and rewrites `endpoint.json`.
    pub async fn create(&self, endpoint: &Endpoint) -> Result<(), MailboxError> {
        let lock = self.lock_for(&endpoint.hash);
        let _guard = lock.lock().await;

        let dir = self.mailbox_dir(&endpoint.hash);
        for sub in [STAGING_DIR, PENDING_DIR, DELIVERED_DIR, FAILED_DIR] {
            fs::create_dir_all(dir.join(sub))
                .await
                .map_err(io_err(format!("creating {}/{sub}", dir.display())))?;
        }

        let record = serde_json::to_vec_pretty(endpoint).map_err(|source| {
            MailboxError::Malformed {
                path: dir.join(ENDPOINT_FILE),
                source,
            }
        })?;
        let staged = dir
            .join(STAGING_DIR)
            .join(format!("{ENDPOINT_FILE}.{}", uuid::Uuid::new_v4()));
        self.write_file(&staged, &record)
            .await
            .map_err(io_err("staging endpoint record"))?;
        fs::rename(&staged, dir.join(ENDPOINT_FILE))
            .await
            .map_err(io_err("publishing endpoint record"))?;
        if self.fsync {
            fsync_dir(&dir).await.map_err(io_err("syncing mailbox dir"))?;
        }

        tracing::debug!(endpoint = %endpoint.subject, hash = %endpoint.hash, "Mailbox created");
        Ok(())
    }

    /// Delete a mailbox and everything in it. Returns false if it did not exist.
    pub async fn remove(&self, hash: &str) -> Result<bool, MailboxError> {
        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        let dir = self.mailbox_dir(hash);
        let removed = match fs::remove_dir_all(&dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_err(format!("removing {}", dir.display()))(e)),
        };
        self.locks.lock().remove(hash);
        Ok(removed)
    }

    /// Read every `endpoint.json` under the root. Unreadable records are
    /// skipped with a warning.
    pub async fn load_endpoints(&self) -> Result<Vec<Endpoint>, MailboxError> {
        let mut endpoints = Vec::new();
        for dir in self.mailbox_dirs().await? {
            let path = dir.join(ENDPOINT_FILE);
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(format!("reading {}", path.display()))(e)),
            };
            match serde_json::from_slice::<Endpoint>(&bytes) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping malformed endpoint record: {e}");
                }
            }
        }
        Ok(endpoints)
    }

    /// Remove staging leftovers from an interrupted write. They were never
    /// visible, so dropping them loses nothing that was acknowledged.
    pub async fn recover_staging(&self) -> Result<usize, MailboxError> {
        let mut removed = 0;
        for dir in self.mailbox_dirs().await? {
            let staging = dir.join(STAGING_DIR);
            for name in list_names(&staging).await? {
                match fs::remove_file(staging.join(&name)).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(format!("removing staged {name}"))(e)),
                }
            }
        }
        if removed > 0 {
            tracing::warn!(removed, "Discarded staged files left by an interrupted write");
        }
        Ok(removed)
    }

    async fn mailbox_dirs(&self) -> Result<Vec<PathBuf>, MailboxError> {
        let entries = fs::read_dir(&self.root)
            .await
            .map_err(io_err(format!("listing {}", self.root.display())))?;
        let mut stream = ReadDirStream::new(entries);
        let mut dirs = Vec::new();
        while let Some(entry) = stream.next().await {
            let entry = entry.map_err(io_err("reading mailbox root entry"))?;
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    // ── Message operations ───────────────────────────────────────

    /// Stage then atomically publish `envelope` into the pending set, unless
    /// `admit` refuses it. `admit` runs under the mailbox lock and sees the
    /// pending depth (always zero when `measure_pressure` is false).
    pub async fn write_admitted<R>(
        &self,
        hash: &str,
        envelope: &Envelope,
        measure_pressure: bool,
        admit: impl FnOnce(usize) -> Result<(), R>,
    ) -> Result<Result<(), R>, MailboxError> {
        if !is_safe_id(&envelope.id) {
            return Err(MailboxError::MessageNotFound {
                hash: hash.to_string(),
                id: envelope.id.clone(),
            });
        }

        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        if !self.exists(hash) {
            return Err(MailboxError::EndpointNotFound(hash.to_string()));
        }

        let dir = self.mailbox_dir(hash);
        let pending = if measure_pressure {
            list_ids(&dir.join(PENDING_DIR)).await?.len()
        } else {
            0
        };
        if let Err(refused) = admit(pending) {
            return Ok(Err(refused));
        }

        let file_name = message_file_name(&envelope.id);
        let staged = dir.join(STAGING_DIR).join(&file_name);
        let target = dir.join(PENDING_DIR).join(&file_name);

        let stored = envelope.clone().with_status(MessageStatus::New);
        let bytes = serde_json::to_vec(&stored).map_err(|source| MailboxError::Malformed {
            path: staged.clone(),
            source,
        })?;

        if let Err(e) = self.write_file(&staged, &bytes).await {
            let _ = fs::remove_file(&staged).await;
            return Err(not_found_as_missing_endpoint(hash, e, "staging message"));
        }
        if let Err(e) = fs::rename(&staged, &target).await {
            let _ = fs::remove_file(&staged).await;
            return Err(not_found_as_missing_endpoint(hash, e, "publishing message"));
        }
        if self.fsync {
            fsync_dir(&dir.join(PENDING_DIR))
                .await
                .map_err(io_err("syncing pending dir"))?;
        }
        Ok(Ok(()))
    }

    /// Move the oldest pending message into the delivered set and return it.
    pub async fn claim_next(&self, hash: &str) -> Result<Option<Envelope>, MailboxError> {
        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        if !self.exists(hash) {
            return Err(MailboxError::EndpointNotFound(hash.to_string()));
        }

        let dir = self.mailbox_dir(hash);
        let Some(oldest) = list_ids(&dir.join(PENDING_DIR)).await?.into_iter().next() else {
            return Ok(None);
        };

        let file_name = message_file_name(&oldest);
        let delivered = dir.join(DELIVERED_DIR).join(&file_name);
        fs::rename(dir.join(PENDING_DIR).join(&file_name), &delivered)
            .await
            .map_err(io_err(format!("claiming {oldest}")))?;

        let envelope = read_envelope(&delivered).await?;
        Ok(Some(envelope.with_status(MessageStatus::Delivered)))
    }

    /// Move a pending or delivered message into the failed set. Returns the
    /// failed envelope and the set it was taken from.
    pub async fn fail(
        &self,
        hash: &str,
        id: &str,
        reason: &str,
    ) -> Result<(Envelope, MessageStatus), MailboxError> {
        let not_found = || MailboxError::MessageNotFound {
            hash: hash.to_string(),
            id: id.to_string(),
        };
        if !is_safe_id(id) {
            return Err(not_found());
        }

        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        if !self.exists(hash) {
            return Err(MailboxError::EndpointNotFound(hash.to_string()));
        }

        let dir = self.mailbox_dir(hash);
        let file_name = message_file_name(id);
        let failed = dir.join(FAILED_DIR).join(&file_name);

        for origin in [MessageStatus::New, MessageStatus::Delivered] {
            let source_dir = dir_for(origin);
            let source = dir.join(source_dir).join(&file_name);
            match fs::rename(&source, &failed).await {
                Ok(()) => {
                    tracing::info!(hash, id, reason, from = source_dir, "Message failed");
                    let envelope = read_envelope(&failed).await?;
                    return Ok((envelope.with_status(MessageStatus::Failed), origin));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(format!("failing {id}"))(e)),
            }
        }

        Err(not_found())
    }

    /// Current pending depth.
    pub async fn pressure(&self, hash: &str) -> Result<usize, MailboxError> {
        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;
        Ok(list_ids(&self.mailbox_dir(hash).join(PENDING_DIR)).await?.len())
    }

    /// Messages in id order, optionally restricted to one member set. The
    /// scan holds the mailbox lock, so each message shows up exactly once.
    pub async fn list(
        &self,
        hash: &str,
        status: Option<MessageStatus>,
    ) -> Result<Vec<Envelope>, MailboxError> {
        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        if !self.exists(hash) {
            return Err(MailboxError::EndpointNotFound(hash.to_string()));
        }

        let statuses = match status {
            Some(status) => vec![status],
            None => vec![
                MessageStatus::New,
                MessageStatus::Delivered,
                MessageStatus::Failed,
            ],
        };

        let dir = self.mailbox_dir(hash);
        let mut envelopes = Vec::new();
        for status in statuses {
            let member_dir = dir.join(dir_for(status));
            for id in list_ids(&member_dir).await? {
                let envelope = read_envelope(&member_dir.join(message_file_name(&id))).await?;
                envelopes.push(envelope.with_status(status));
            }
        }
        envelopes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(envelopes)
    }

    /// Look a message up in any member set.
    pub async fn get(&self, hash: &str, id: &str) -> Result<Option<Envelope>, MailboxError> {
        if !is_safe_id(id) {
            return Ok(None);
        }
        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        let dir = self.mailbox_dir(hash);
        for status in [
            MessageStatus::New,
            MessageStatus::Delivered,
            MessageStatus::Failed,
        ] {
            let path = dir.join(dir_for(status)).join(message_file_name(id));
            match read_envelope(&path).await {
                Ok(envelope) => return Ok(Some(envelope.with_status(status))),
                Err(MailboxError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

fn not_found_as_missing_endpoint(hash: &str, e: io::Error, context: &str) -> MailboxError {
    if e.kind() == io::ErrorKind::NotFound {
        MailboxError::EndpointNotFound(hash.to_string())
    } else {
        io_err(context)(e)
    }
}

async fn read_envelope(path: &Path) -> Result<Envelope, MailboxError> {
    let bytes = fs::read(path)
        .await
        .map_err(io_err(format!("reading {}", path.display())))?;
    serde_json::from_slice(&bytes).map_err(|source| MailboxError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

async fn list_names(dir: &Path) -> Result<Vec<String>, MailboxError> {
    let entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(format!("listing {}", dir.display()))(e)),
    };
    let mut stream = ReadDirStream::new(entries);
    let mut names = Vec::new();
    while let Some(entry) = stream.next().await {
        let entry = entry.map_err(io_err(format!("reading entry in {}", dir.display())))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Message ids in a member directory, ascending.
async fn list_ids(dir: &Path) -> Result<Vec<String>, MailboxError> {
    let mut ids: Vec<String> = list_names(dir)
        .await?
        .iter()
        .filter_map(|name| id_from_file_name(name).map(str::to_string))
        .collect();
    ids.sort();
    Ok(ids)
}

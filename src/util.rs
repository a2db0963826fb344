//! Utility functions shared across the relay.
//!
//! Text truncation for operator-facing strings and the atomic file replace
//! used by every component that persists a single JSON/TOML document.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Works on character boundaries, so multi-byte UTF-8 input (emoji, CJK) is
/// never split mid-codepoint.
///
/// ```ignore
/// use zeroclaw_relay::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Replace `path` with `contents` so readers see either the old or the new
/// document, never a torn write.
///
/// Writes a sibling temp file, fsyncs it, renames it over the target and
/// finally fsyncs the parent directory so the rename itself is durable.
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent_dir = path
        .parent()
        .context("Atomic write target must have a parent directory")?;
    fs::create_dir_all(parent_dir)
        .await
        .with_context(|| format!("Failed to create directory: {}", parent_dir.display()))?;

    let file_name = path
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("document");
    let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

    let mut temp_file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("Failed to create temporary file: {}", temp_path.display()))?;
    temp_file
        .write_all(contents)
        .await
        .context("Failed to write temporary file contents")?;
    temp_file
        .sync_all()
        .await
        .context("Failed to fsync temporary file")?;
    drop(temp_file);

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        anyhow::bail!("Failed to atomically replace {}: {e}", path.display());
    }

    sync_directory(parent_dir).await
}

/// Flush directory metadata (new entries, renames) to disk. No-op off unix.
pub async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn truncate_leaves_short_strings_alone() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn truncate_cuts_ascii_and_trims_trailing_space() {
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        assert_eq!(truncate_with_ellipsis("hello world", 6), "hello...");
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        assert_eq!(truncate_with_ellipsis("Hello 🦀 World", 7), "Hello 🦀...");
        assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
        assert_eq!(truncate_with_ellipsis("日本語テキスト", 3), "日本語...");
    }

    #[tokio::test]
    async fn atomic_write_creates_and_replaces() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("nested").join("doc.json");

        atomic_write(&target, b"{\"v\":1}").await.unwrap();
        assert_eq!(fs::read_to_string(&target).await.unwrap(), "{\"v\":1}");

        atomic_write(&target, b"{\"v\":2}").await.unwrap();
        assert_eq!(fs::read_to_string(&target).await.unwrap(), "{\"v\":2}");

        let mut leftovers = 0;
        let mut entries = fs::read_dir(target.parent().unwrap()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains(".tmp-") {
                leftovers += 1;
            }
        }
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn sync_directory_handles_existing_directory() {
        let tmp = TempDir::new().unwrap();
        sync_directory(tmp.path()).await.unwrap();
    }
}

//! Writing received files to disk.
//!
//! Peer-supplied names are untrusted: they are reduced to a single safe
//! path component, and never overwrite an existing file. Writes go to a
//! temporary file first and are renamed into place once complete.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use uuid::Uuid;

/// Longest file name we write, in characters.
const MAX_NAME_CHARS: usize = 200;

/// Reduce a peer-supplied name to one safe path component.
///
/// - Normalizes `\` to `/` and keeps only the last component.
/// - Keeps alphanumerics plus `.`, `-`, `_` and ` `.
/// - Falls back to `"file"` when nothing usable is left.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|part| !part.is_empty() && !matches!(*part, "." | ".."))
        .last()
        .unwrap_or("");
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .take(MAX_NAME_CHARS)
        .collect();
    let safe = safe.trim_matches(|c| c == '.' || c == ' ');
    if safe.is_empty() {
        "file".to_owned()
    } else {
        safe.to_owned()
    }
}

/// First path in `dir` for `name` that does not exist yet:
/// `report.pdf`, `report (1).pdf`, `report (2).pdf`, ...
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Write `data` under `dir` using the sanitized `name`. Returns the final
/// path.
pub async fn write_received(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let name = sanitize_file_name(name);
    let path = unique_path(dir, &name);
    // Sanitized names never start with '.', so this cannot match a delivery.
    let tmp_path = dir.join(format!(".{name}.{}.part", Uuid::new_v4().simple()));

    if let Err(e) = tokio::fs::write(&tmp_path, data).await {
        error!(event = "write_failure", path = %tmp_path.display(), error = %e);
        return Err(e).with_context(|| format!("writing {}", tmp_path.display()));
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
        error!(event = "rename_failure", from = %tmp_path.display(), to = %path.display(), error = %e);
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e).with_context(|| format!("moving file to {}", path.display()));
    }

    info!(event = "file_saved", path = %path.display(), bytes = data.len());
    Ok(path)
}

//! Reconcile a directory on disk to exactly match a virtual filesystem.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::VirtualFileSystem;
use crate::error::MaterializeError;
use crate::resolver::to_slash;

/// Counts from one reconcile pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeStats {
    pub written: usize,
    pub unchanged: usize,
    /// Files and directories deleted because the view no longer has them
    pub removed: usize,
    pub dirs_created: usize,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> MaterializeError + '_ {
    move |source| MaterializeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
fn validate_path(root: &Path, relative: &str) -> Result<PathBuf, MaterializeError> {
    let unsafe_path = |reason| MaterializeError::UnsafePath {
        path: relative.to_string(),
        reason,
    };

    if relative.is_empty() {
        return Err(unsafe_path("empty path"));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(unsafe_path("absolute path"));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => return Err(unsafe_path("path traversal")),
            Component::Prefix(_) => return Err(unsafe_path("windows prefix")),
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(unsafe_path("escapes target directory"));
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// Make `target` hold exactly the files of `vfs`.
///
/// Files whose bytes already match are left alone, so a second pass with an
/// unchanged view writes nothing.
pub async fn materialize(
    vfs: &VirtualFileSystem,
    target: &Path,
) -> Result<MaterializeStats, MaterializeError> {
    let mut stats = MaterializeStats::default();

    if fs::metadata(target).await.is_err() {
        fs::create_dir_all(target).await.map_err(io_err(target))?;
        stats.dirs_created += 1;
    }

    stats.removed = remove_stale(vfs, target).await?;

    let mut known_dirs: HashSet<PathBuf> = HashSet::new();
    for (rel, data) in vfs.files() {
        let full = validate_path(target, rel)?;

        if let Some(parent) = full.parent() {
            if known_dirs.insert(parent.to_path_buf()) && fs::metadata(parent).await.is_err() {
                fs::create_dir_all(parent).await.map_err(io_err(parent))?;
                stats.dirs_created += 1;
            }
        }

        match fs::read(&full).await {
            Ok(existing) if existing == data.as_ref() => {
                stats.unchanged += 1;
                continue;
            }
            _ => {}
        }

        write_atomic(&full, data).await?;
        tracing::debug!("Wrote {}", rel);
        stats.written += 1;
    }

    tracing::info!(
        dest = %target.display(),
        written = stats.written,
        unchanged = stats.unchanged,
        removed = stats.removed,
        "Materialized"
    );
    Ok(stats)
}

/// Delete every entry under `target` the view does not contain. Returns the
/// number of top-most entries removed.
async fn remove_stale(vfs: &VirtualFileSystem, target: &Path) -> Result<usize, MaterializeError> {
    let mut removed = 0;
    let mut stack = vec![target.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir).await.map_err(io_err(&dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(target) else {
                continue;
            };
            let rel = to_slash(rel);
            let file_type = entry.file_type().await.map_err(io_err(&path))?;

            if file_type.is_dir() {
                if vfs.is_dir(&rel) {
                    stack.push(path);
                } else {
                    fs::remove_dir_all(&path).await.map_err(io_err(&path))?;
                    tracing::debug!("Removed directory {}", rel);
                    removed += 1;
                }
            } else if vfs.stat(&rel).map_or(true, |m| !m.is_file()) {
                fs::remove_file(&path).await.map_err(io_err(&path))?;
                tracing::debug!("Removed {}", rel);
                removed += 1;
            }
        }
    }

    Ok(removed)
}

/// Write through a temporary sibling and rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), MaterializeError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.srctunnel.tmp", name));

    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(source) = result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(MaterializeError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

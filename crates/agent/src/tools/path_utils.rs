//! Workspace-confined path resolution

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathValidationError {
    #[error("PATH {path} IS OUTSIDE WORKSPACE {workspace}")]
    OutsideWorkspace { path: String, workspace: String },

    #[error("PATH RESOLUTION FAILED: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolve `path` against `workspace_root` and refuse anything that escapes it.
///
/// Relative paths are joined to the workspace, `~/` expands to the home
/// directory. The deepest existing ancestor is canonicalised so symlinks
/// cannot smuggle a path out; the non-existent remainder is normalised
/// lexically.
pub async fn validate_workspace_path(
    path: &str,
    workspace_root: &Path,
) -> Result<PathBuf, PathValidationError> {
    let expanded = if path.starts_with('/') || path.starts_with('~') {
        expand_tilde(path)
    } else {
        workspace_root.join(path)
    };

    let absolute = resolve(&expanded).await?;
    let workspace = resolve(workspace_root).await?;

    if !absolute.starts_with(&workspace) {
        return Err(PathValidationError::OutsideWorkspace {
            path: path.to_string(),
            workspace: workspace.display().to_string(),
        });
    }
    Ok(absolute)
}

/// Canonicalise the longest existing prefix, then append the rest lexically
async fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        if tokio::fs::metadata(existing).await.is_ok() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(normalized),
        }
    }

    let mut resolved = tokio::fs::canonicalize(existing).await?;
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Fold `.` and `..` without touching the filesystem
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Path shown to the model: relative to the workspace when possible
pub fn display_path(path: &Path, workspace_root: &Path) -> String {
    let workspace = std::fs::canonicalize(workspace_root).unwrap_or_else(|_| workspace_root.to_path_buf());
    path.strip_prefix(&workspace)
        .unwrap_or(path)
        .display()
        .to_string()
}

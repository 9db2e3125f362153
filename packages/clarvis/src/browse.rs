//! Directory listing for the session-creation picker, confined to an
//! allow-list of root directories.

use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::AppState;
use crate::error::ProxyError;

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl DirectoryEntry {
    fn directory(name: String, path: &Path) -> Self {
        Self {
            name,
            path: path.to_string_lossy().to_string(),
            kind: "directory".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub entries: Vec<DirectoryEntry>,
    pub path: String,
    pub is_root: bool,
}

/// Roots that listings may not leave. Read-only after startup.
#[derive(Debug, Clone)]
pub struct AllowList {
    roots: Vec<PathBuf>,
    /// Symlink-resolved forms of `roots`, for checking canonical targets.
    canonical: Vec<PathBuf>,
}

impl AllowList {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let roots: Vec<PathBuf> = roots.iter().map(|r| normalize(r)).collect();
        let canonical = roots
            .iter()
            .map(|r| r.canonicalize().unwrap_or_else(|_| r.clone()))
            .collect();
        Self { roots, canonical }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// True when `path` equals a root or sits below one. `Path::starts_with`
    /// compares whole components, so `/home/user2` is not under `/home/user`.
    pub fn permits(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    fn permits_canonical(&self, path: &Path) -> bool {
        self.canonical.iter().any(|root| path.starts_with(root))
    }

    /// Listing of the roots themselves, each named by its last component.
    pub fn root_listing(&self) -> DirectoryListing {
        let entries = self
            .roots
            .iter()
            .map(|root| {
                let name = root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| root.to_string_lossy().to_string());
                DirectoryEntry::directory(name, root)
            })
            .collect();
        DirectoryListing {
            entries,
            path: String::new(),
            is_root: true,
        }
    }

    /// Lists the visible subdirectories of `requested`.
    ///
    /// Blocking: reads the filesystem.
    pub fn list(&self, requested: &str) -> Result<DirectoryListing, ProxyError> {
        let target = normalize(Path::new(requested));
        if !target.is_absolute() || !self.permits(&target) {
            return Err(ProxyError::AccessDenied);
        }
        if !target.exists() {
            return Err(ProxyError::NotFound);
        }

        let resolved = target.canonicalize()?;
        if !self.permits_canonical(&resolved) {
            return Err(ProxyError::AccessDenied);
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&resolved)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            // file_type does not follow symlinks
            if !entry.file_type()?.is_dir() {
                continue;
            }
            entries.push(DirectoryEntry::directory(name, &target.join(entry.file_name())));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(DirectoryListing {
            entries,
            path: target.to_string_lossy().to_string(),
            is_root: false,
        })
    }
}

/// Resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
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

/// `GET /api/browse?path=`
pub async fn browse_handler(
    State(state): State<AppState>,
    Query(query): Query<BrowseQuery>,
) -> Result<Json<DirectoryListing>, ProxyError> {
    let allow: Arc<AllowList> = state.allow_list.clone();
    let listing = match query.path.filter(|p| !p.is_empty()) {
        None => allow.root_listing(),
        Some(path) => tokio::task::spawn_blocking(move || allow.list(&path))
            .await
            .map_err(|e| ProxyError::ReadFailed(std::io::Error::other(e)))??,
    };
    Ok(Json(listing))
}

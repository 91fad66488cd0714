//! Workspace lifetime
//!
//! A run owns exactly one workspace directory. The [`WorkspaceLease`] is taken
//! before fetching starts and handed to [`WorkspaceCleaner::release`] once the
//! run's stages have returned, whatever they returned.
//!
//! Workspaces live in [`WORKSPACE_ROOT`] under the configured base, never
//! directly in it. Nothing outside that root is ever removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::{AgentError, CleanupError};
use crate::filesys::dir::Dir;

/// Directory under the workspace base that holds every workspace
pub const WORKSPACE_ROOT: &str = "tagflash";

/// Fallback directory name when the clone URL has no usable last segment
const DEFAULT_WORKSPACE_NAME: &str = "workspace";

/// A checkout pinned to the commit a tag resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    path: PathBuf,
    reference: String,
    commit: String,
}

impl Workspace {
    pub fn new(path: impl Into<PathBuf>, reference: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reference: reference.into(),
            commit: commit.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tag name the workspace was checked out for
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Full commit hash at HEAD
    pub fn commit(&self) -> &str {
        &self.commit
    }
}

/// Ownership of a workspace path for the duration of one run.
///
/// Dropping an unreleased lease removes the directory synchronously.
#[derive(Debug)]
pub struct WorkspaceLease {
    path: PathBuf,
    released: bool,
}

impl WorkspaceLease {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "Workspace lease for {} dropped without release, removing it",
            self.path.display()
        );
        match std::fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
            _ => {}
        }
    }
}

/// Deletes a directory tree
#[async_trait]
pub trait TreeRemover: Send + Sync {
    /// Remove `path` and everything below it. An absent path is not an error.
    async fn remove_tree(&self, path: &Path) -> Result<(), AgentError>;
}

/// [`TreeRemover`] over the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FsTreeRemover;

#[async_trait]
impl TreeRemover for FsTreeRemover {
    async fn remove_tree(&self, path: &Path) -> Result<(), AgentError> {
        Dir::new(path).delete().await
    }
}

/// Removes workspaces
#[derive(Clone)]
pub struct WorkspaceCleaner {
    remover: Arc<dyn TreeRemover>,
}

impl Default for WorkspaceCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceCleaner {
    pub fn new() -> Self {
        Self::with_remover(Arc::new(FsTreeRemover))
    }

    pub fn with_remover(remover: Arc<dyn TreeRemover>) -> Self {
        Self { remover }
    }

    /// Remove the leased tree. An already absent path counts as removed.
    pub async fn release(&self, mut lease: WorkspaceLease) -> Result<(), CleanupError> {
        lease.released = true;
        self.remove(&lease.path).await
    }

    /// Remove whatever is at `path` without giving up a lease. Used to clear
    /// a partial clone before retrying and to evict a stale workspace.
    pub async fn remove(&self, path: &Path) -> Result<(), CleanupError> {
        debug!("Removing workspace {}", path.display());
        self.remover.remove_tree(path).await.map_err(|e| CleanupError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("Removed workspace {}", path.display());
        Ok(())
    }
}

/// Daemon-owned directory holding the workspaces under `base`
pub fn workspace_root(base: &Path) -> PathBuf {
    base.join(WORKSPACE_ROOT)
}

/// `<base>/tagflash/<repository name>` for a clone URL, e.g.
/// `https://github.com/acme/firmware.git` → `<base>/tagflash/firmware`
pub fn workspace_path(base: &Path, repository_url: &str) -> PathBuf {
    workspace_root(base).join(repository_name(repository_url))
}

fn repository_name(repository_url: &str) -> String {
    let last_segment = match Url::parse(repository_url) {
        Ok(url) => url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string),
        // scp-like `git@host:owner/repo.git` and plain paths
        Err(_) => repository_url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .map(str::to_string),
    };

    let name = last_segment
        .map(|s| s.strip_suffix(".git").map(str::to_string).unwrap_or(s))
        .unwrap_or_default();

    let usable = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control);
    if usable {
        name
    } else {
        DEFAULT_WORKSPACE_NAME.to_string()
    }
}

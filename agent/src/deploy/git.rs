//! Source retrieval pinned to a tag
//!
//! The checkout is made at the commit the tag resolved to, not at the tag
//! name, so a tag moved mid-run cannot change what gets flashed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::deploy::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::deploy::workspace::Workspace;
use crate::errors::FetchError;
use crate::filesys::dir::Dir;

/// Git invocation settings
#[derive(Debug, Clone)]
pub struct GitOptions {
    /// Git executable
    pub program: String,

    /// Limit for each git invocation (the clone dominates)
    pub timeout: Duration,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Materializes a repository at a tag
pub struct SourceFetcher {
    runner: Arc<dyn CommandRunner>,
    options: GitOptions,
}

impl SourceFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>, options: GitOptions) -> Self {
        Self { runner, options }
    }

    /// Clone `repository_url` into `destination` and check out the commit
    /// `tag` names.
    ///
    /// `destination` must not exist. On failure whatever was created stays on
    /// disk for the caller to remove.
    pub async fn fetch(
        &self,
        repository_url: &str,
        tag: &str,
        destination: &Path,
    ) -> Result<Workspace, FetchError> {
        validate_tag(tag)?;

        if Dir::new(destination).exists().await {
            return Err(FetchError::Clone {
                url: repository_url.to_string(),
                reason: format!("destination {} already exists", destination.display()),
            });
        }

        info!("Cloning {} into {}", repository_url, destination.display());
        self.clone_repository(repository_url, destination).await?;

        let commit = self.resolve_tag(tag, destination).await?;
        debug!("Tag {} resolved to {}", tag, commit);

        self.checkout(&commit, destination).await?;
        info!("Checked out {} at {}", tag, commit);

        Ok(Workspace::new(destination, tag, commit))
    }

    async fn clone_repository(&self, url: &str, destination: &Path) -> Result<(), FetchError> {
        let destination_arg = destination.to_string_lossy().into_owned();
        let spec = self.git([
            "clone",
            "--no-checkout",
            "--quiet",
            "--",
            url,
            destination_arg.as_str(),
        ]);

        let clone_error = |reason: String| FetchError::Clone {
            url: url.to_string(),
            reason,
        };
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| clone_error(e.to_string()))?;
        if !output.success() {
            return Err(clone_error(failure_reason(&output)));
        }
        Ok(())
    }

    async fn resolve_tag(&self, tag: &str, workspace: &Path) -> Result<String, FetchError> {
        let rev = format!("refs/tags/{}^{{commit}}", tag);
        let spec = self.git_in(workspace, ["rev-parse", "--verify", "--quiet", rev.as_str()]);

        let not_found = |reason: String| FetchError::RefNotFound {
            reference: tag.to_string(),
            reason,
        };
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| not_found(e.to_string()))?;
        let commit = output.stdout_string();
        if !output.success() || commit.is_empty() {
            return Err(not_found("tag does not exist in the cloned repository".to_string()));
        }
        Ok(commit)
    }

    async fn checkout(&self, commit: &str, workspace: &Path) -> Result<(), FetchError> {
        let checkout_error = |reason: String| FetchError::Checkout {
            commit: commit.to_string(),
            reason,
        };

        let spec = self.git_in(workspace, ["checkout", "--detach", "--quiet", commit]);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| checkout_error(e.to_string()))?;
        if !output.success() {
            return Err(checkout_error(failure_reason(&output)));
        }

        let spec = self.git_in(workspace, ["rev-parse", "HEAD"]);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| checkout_error(e.to_string()))?;
        let head = output.stdout_string();
        if !output.success() || head != commit {
            return Err(checkout_error(format!("HEAD is at {:?}", head)));
        }
        Ok(())
    }

    fn git<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        CommandSpec::new(self.options.program.as_str(), args).timeout(self.options.timeout)
    }

    fn git_in<'a>(&self, workspace: &Path, args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        let mut full = vec!["-C".to_string(), workspace.to_string_lossy().into_owned()];
        full.extend(args.into_iter().map(str::to_string));
        CommandSpec::new(self.options.program.as_str(), full).timeout(self.options.timeout)
    }
}

fn failure_reason(output: &CommandOutput) -> String {
    let stderr = output.stderr_string();
    match (output.code, stderr.is_empty()) {
        (Some(code), true) => format!("git exited with status {}", code),
        (Some(code), false) => format!("git exited with status {}: {}", code, stderr),
        (None, _) => "git was killed by a signal".to_string(),
    }
}

/// Reject names git would refuse or could read as an option
fn validate_tag(tag: &str) -> Result<(), FetchError> {
    let invalid = tag.is_empty()
        || tag.starts_with('-')
        || tag.starts_with('/')
        || tag.ends_with('/')
        || tag.ends_with(".lock")
        || tag.contains("..")
        || tag.contains("@{")
        || tag
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));

    if invalid {
        return Err(FetchError::RefNotFound {
            reference: tag.to_string(),
            reason: "not a valid tag name".to_string(),
        });
    }
    Ok(())
}

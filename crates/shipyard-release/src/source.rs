//! Source-control collaborator.
//!
//! Everything shipyard needs from the repository goes through
//! [`SourceControl`]: branch heads and tags for triggers, the full tag
//! history for version computation, commit subjects for release notes and
//! tag creation. [`GitCli`] implements it by shelling out to `git`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use shipyard_core::{PipelineError, ValidationError};

use crate::{ReleaseErrorKind, ReleaseResult};

/// A named reference and the commit it points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GitRef {
    /// Branch or tag name
    pub name: String,
    /// Commit id
    pub commit: String,
}

impl GitRef {
    /// Creates a reference
    pub fn new(name: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit: commit.into(),
        }
    }
}

/// Source-control platform contract
#[async_trait]
pub trait SourceControl: Send + Sync + std::fmt::Debug {
    /// Pulls new commits and tags from the remote, if any
    async fn refresh(&self) -> ReleaseResult {
        Ok(())
    }

    /// Resolves a branch, tag or commit to a commit id
    async fn resolve(&self, reference: &str) -> ReleaseResult<String>;

    /// Every branch with its head commit
    async fn branches(&self) -> ReleaseResult<Vec<GitRef>>;

    /// Every tag with the commit it points at
    async fn tags(&self) -> ReleaseResult<Vec<GitRef>>;

    /// Returns true if the local history is truncated
    async fn is_shallow(&self) -> ReleaseResult<bool>;

    /// Returns true if `commit` is reachable from `branch`
    async fn contains(&self, branch: &str, commit: &str) -> ReleaseResult<bool>;

    /// Subjects of the commits after `since` up to and including `until`, newest first
    async fn subjects(&self, since: Option<&str>, until: &str) -> ReleaseResult<Vec<String>>;

    /// Creates an annotated tag
    async fn create_tag(&self, name: &str, commit: &str, message: &str) -> ReleaseResult;

    /// Tags, refusing a truncated history
    ///
    /// Version computation needs every tag; a shallow clone may be missing
    /// some and is rejected as a configuration error.
    async fn full_tags(&self) -> ReleaseResult<Vec<GitRef>> {
        if self.is_shallow().await? {
            return Err(PipelineError::from(ValidationError::SourceControl {
                reason: "repository is a shallow clone; fetch the full history to compute versions".to_string(),
            })
            .into());
        }
        self.tags().await
    }
}

/// [`SourceControl`] over the `git` command line
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    remote: Option<String>,
}

impl GitCli {
    /// Adapter for the repository at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remote: None,
        }
    }

    /// Fetches from and pushes tags to `remote`
    #[must_use]
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    /// Repository root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, args: &[&str]) -> ReleaseResult<String> {
        debug!(root = %self.root.display(), ?args, "git");
        let output = Command::new("git")
            .current_dir(&self.root)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ReleaseErrorKind::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReleaseErrorKind::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                reason: stderr.trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn parse_refs(output: &str) -> Vec<GitRef> {
        output
            .lines()
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let name = fields.next()?.trim();
                let object = fields.next()?.trim();
                // Annotated tags carry the tagged commit in the peeled field.
                let peeled = fields.next().map(str::trim).unwrap_or_default();
                let commit = if peeled.is_empty() { object } else { peeled };
                (!name.is_empty() && !commit.is_empty()).then(|| GitRef::new(name, commit))
            })
            .collect()
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn refresh(&self) -> ReleaseResult {
        if let Some(remote) = &self.remote {
            self.git(&["fetch", "--quiet", "--tags", "--prune", remote]).await?;
        }
        Ok(())
    }

    async fn resolve(&self, reference: &str) -> ReleaseResult<String> {
        let spec = format!("{reference}^{{commit}}");
        Ok(self.git(&["rev-parse", "--verify", &spec]).await?.trim().to_string())
    }

    async fn branches(&self) -> ReleaseResult<Vec<GitRef>> {
        let output = match &self.remote {
            Some(remote) => {
                let prefix = format!("refs/remotes/{remote}");
                let out = self
                    .git(&["for-each-ref", "--format=%(refname:lstrip=3)\t%(objectname)", &prefix])
                    .await?;
                out.lines()
                    .filter(|line| !line.starts_with("HEAD\t"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            None => {
                self.git(&["for-each-ref", "--format=%(refname:short)\t%(objectname)", "refs/heads"])
                    .await?
            }
        };
        Ok(Self::parse_refs(&output))
    }

    async fn tags(&self) -> ReleaseResult<Vec<GitRef>> {
        let output = self
            .git(&[
                "for-each-ref",
                "--format=%(refname:short)\t%(objectname)\t%(*objectname)",
                "refs/tags",
            ])
            .await?;
        Ok(Self::parse_refs(&output))
    }

    async fn is_shallow(&self) -> ReleaseResult<bool> {
        Ok(self.git(&["rev-parse", "--is-shallow-repository"]).await?.trim() == "true")
    }

    async fn contains(&self, branch: &str, commit: &str) -> ReleaseResult<bool> {
        let branch = match &self.remote {
            Some(remote) => format!("{remote}/{branch}"),
            None => branch.to_string(),
        };
        let output = Command::new("git")
            .current_dir(&self.root)
            .args(["merge-base", "--is-ancestor", commit, &branch])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ReleaseErrorKind::Git {
                command: "merge-base".to_string(),
                reason: e.to_string(),
            })?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(ReleaseErrorKind::Git {
                command: "merge-base".to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into()),
        }
    }

    async fn subjects(&self, since: Option<&str>, until: &str) -> ReleaseResult<Vec<String>> {
        let range = match since {
            Some(since) => format!("{since}..{until}"),
            None => until.to_string(),
        };
        let output = self.git(&["log", "--format=%s", &range]).await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    async fn create_tag(&self, name: &str, commit: &str, message: &str) -> ReleaseResult {
        self.git(&["tag", "--annotate", name, commit, "--message", message]).await?;
        if let Some(remote) = &self.remote {
            self.git(&["push", "--quiet", remote, &format!("refs/tags/{name}")]).await?;
        }
        Ok(())
    }
}

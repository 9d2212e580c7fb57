//! Version tagging.
//!
//! The next version is the highest existing version tag bumped by the
//! requested policy. A repository without version tags starts from `0.0.0`.
//! Creating a release is idempotent per commit: a commit that already
//! carries a version tag, or a computed tag that already exists in the
//! repository or in history, yields [`PipelineError::NoOpRelease`].
//!
//! The tag is created before the release is recorded. If recording fails, a
//! rerun on the same commit finds the tag, records the missing release and
//! still reports the no-op.

use std::sync::Arc;
use tracing::{debug, info, warn};

use shipyard_core::{BumpPolicy, PipelineError, Release, ValidationError, Version};
use shipyard_events::{EventEnvelope, EventStore, History, ReleaseEvent};

use crate::{ReleaseErrorKind, ReleaseResult};
use crate::source::{GitRef, SourceControl};

/// Notes written when no commit landed since the previous tag
pub const EMPTY_NOTES: &str = "No changes";

/// What a release would create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePlan {
    /// Full commit id being released
    pub commit: String,
    /// Highest version tag before this release
    pub previous: Option<GitRef>,
    /// Version to create
    pub version: Version,
    /// Generated notes
    pub notes: String,
}

impl ReleasePlan {
    /// Tag name to create
    #[must_use]
    pub fn tag(&self) -> String {
        self.version.tag()
    }
}

/// Computes versions and creates releases
#[derive(Debug, Clone)]
pub struct ReleaseController {
    source: Arc<dyn SourceControl>,
    store: Arc<dyn EventStore>,
    release_branch: Option<String>,
}

impl ReleaseController {
    /// Controller over `source`, recording releases to `store`
    #[must_use]
    pub fn new(source: Arc<dyn SourceControl>, store: Arc<dyn EventStore>) -> Self {
        Self {
            source,
            store,
            release_branch: None,
        }
    }

    /// Only release commits reachable from `branch`
    #[must_use]
    pub fn with_release_branch(mut self, branch: Option<String>) -> Self {
        self.release_branch = branch;
        self
    }

    /// Source-control collaborator
    #[must_use]
    pub fn source(&self) -> &Arc<dyn SourceControl> {
        &self.source
    }

    /// Computes the release `commit` would get under `bump`, without creating it
    pub async fn plan(&self, commit: &str, bump: BumpPolicy) -> ReleaseResult<ReleasePlan> {
        let commit = self.source.resolve(commit).await?;
        let tags = self.source.full_tags().await?;
        let versions: Vec<(&GitRef, Version)> = tags
            .iter()
            .filter_map(|r| Version::parse_tag(&r.name).map(|v| (r, v)))
            .collect();

        if let Some((existing, _)) = versions
            .iter()
            .filter(|(r, _)| r.commit == commit)
            .max_by(|(_, a), (_, b)| a.cmp(b))
        {
            return Err(PipelineError::NoOpRelease {
                tag: existing.name.clone(),
                commit,
            }
            .into());
        }

        let previous = versions.iter().max_by(|(_, a), (_, b)| a.cmp(b));
        let version = previous
            .map_or_else(|| Version::new(0, 0, 0), |(_, v)| v.clone())
            .bump(bump);

        let history = History::load(self.store.as_ref()).await?;
        let clash = versions
            .iter()
            .find(|(_, v)| *v == version)
            .map(|(r, _)| r.commit.clone())
            .or_else(|| history.release(&version.tag()).map(|r| r.commit.clone()));
        if let Some(tagged) = clash {
            return Err(PipelineError::NoOpRelease {
                tag: version.tag(),
                commit: tagged,
            }
            .into());
        }

        let previous = previous.map(|(r, _)| (*r).clone());
        let subjects = self
            .source
            .subjects(previous.as_ref().map(|r| r.name.as_str()), &commit)
            .await?;
        debug!(commit = %commit, version = %version, changes = subjects.len(), "release planned");

        Ok(ReleasePlan {
            commit,
            previous,
            version,
            notes: render_notes(&subjects),
        })
    }

    /// Tags `commit` with the next version and records the release
    pub async fn release(&self, commit: &str, bump: BumpPolicy, artifacts: Vec<String>) -> ReleaseResult<Release> {
        self.source.refresh().await?;
        if let Some(branch) = &self.release_branch
            && !self.source.contains(branch, commit).await?
        {
            return Err(PipelineError::from(ValidationError::SourceControl {
                reason: format!("commit {commit} is not on release branch '{branch}'"),
            })
            .into());
        }

        let plan = match self.plan(commit, bump).await {
            Ok(plan) => plan,
            Err(e) => {
                if let ReleaseErrorKind::Pipeline(PipelineError::NoOpRelease { tag, commit: tagged }) = e.kind()
                    && self.source.resolve(commit).await? == *tagged
                {
                    self.record_missing(tag, tagged, artifacts).await?;
                }
                return Err(e);
            }
        };
        let tag = plan.tag();
        self.source.create_tag(&tag, &plan.commit, &plan.notes).await?;

        let release = Release::new(plan.version, plan.commit, plan.notes).with_artifacts(artifacts);
        self.record(&release).await?;
        info!(tag = %release.tag, commit = %release.commit, "release created");
        Ok(release)
    }

    async fn record(&self, release: &Release) -> ReleaseResult {
        self.store
            .append(&[EventEnvelope::record(
                ReleaseEvent::Created {
                    release: release.clone(),
                },
                "release",
            )])
            .await?;
        Ok(())
    }

    /// Records the release behind version tag `tag` on `commit` unless
    /// history already has it
    async fn record_missing(&self, tag: &str, commit: &str, artifacts: Vec<String>) -> ReleaseResult {
        let Some(version) = Version::parse_tag(tag) else {
            return Ok(());
        };
        if History::load(self.store.as_ref()).await?.release(tag).is_some() {
            return Ok(());
        }

        let tags = self.source.full_tags().await?;
        let previous = tags
            .iter()
            .filter_map(|r| Version::parse_tag(&r.name).map(|v| (r, v)))
            .filter(|(_, v)| *v < version)
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(r, _)| r.name.clone());
        let subjects = self.source.subjects(previous.as_deref(), commit).await?;

        let release = Release::new(version, commit, render_notes(&subjects)).with_artifacts(artifacts);
        self.record(&release).await?;
        warn!(tag = %release.tag, commit = %release.commit, "recorded release missing from history");
        Ok(())
    }
}

fn render_notes(subjects: &[String]) -> String {
    if subjects.is_empty() {
        return EMPTY_NOTES.to_string();
    }
    subjects
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n")
}

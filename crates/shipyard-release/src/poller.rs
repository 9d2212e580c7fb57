//! Polling trigger source.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use shipyard_core::TriggerEvent;

use crate::ReleaseResult;
use crate::source::SourceControl;

/// Turns branch moves and new tags into trigger events
///
/// The first poll only records the current state; every later poll reports
/// what changed since the previous one.
#[derive(Debug)]
pub struct GitPoller {
    source: Arc<dyn SourceControl>,
    heads: BTreeMap<String, String>,
    tags: BTreeSet<String>,
    primed: bool,
}

impl GitPoller {
    /// Poller over `source`
    #[must_use]
    pub fn new(source: Arc<dyn SourceControl>) -> Self {
        Self {
            source,
            heads: BTreeMap::new(),
            tags: BTreeSet::new(),
            primed: false,
        }
    }

    /// Fetches and reports pushes, then new tags
    pub async fn poll(&mut self) -> ReleaseResult<Vec<TriggerEvent>> {
        self.source.refresh().await?;
        let branches = self.source.branches().await?;
        let tags = self.source.tags().await?;

        let mut events = Vec::new();
        for branch in branches {
            let moved = self.heads.get(&branch.name) != Some(&branch.commit);
            if self.primed && moved {
                events.push(TriggerEvent::Push {
                    branch: branch.name.clone(),
                    commit: branch.commit.clone(),
                });
            }
            self.heads.insert(branch.name, branch.commit);
        }
        for tag in tags {
            if self.tags.insert(tag.name.clone()) && self.primed {
                events.push(TriggerEvent::Tag {
                    name: tag.name,
                    commit: tag.commit,
                });
            }
        }

        debug!(events = events.len(), primed = self.primed, "polled source control");
        self.primed = true;
        Ok(events)
    }
}

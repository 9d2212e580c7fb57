//! Append-only JSON-lines event store.
//!
//! One envelope per line, flushed to disk before `append` returns. Several
//! processes may append to the same file: the scheduler records run progress
//! while `shipyard approve` records grants.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

use super::{EventStore, EventStoreError};
use crate::types::EventEnvelope;
use crate::{EventsError, EventsResult};

/// File name of the log inside a state directory
pub const EVENTS_FILE: &str = "events.jsonl";

/// Event store backed by a JSON-lines file
#[derive(Debug)]
pub struct FileEventStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl FileEventStore {
    /// Store at `path`; the file is created on first append
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    /// Store at `<state_dir>/events.jsonl`
    pub fn in_dir(state_dir: impl AsRef<Path>) -> Self {
        Self::new(state_dir.as_ref().join(EVENTS_FILE))
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, error: &std::io::Error) -> EventsError {
        EventStoreError::Storage {
            path: self.path.display().to_string(),
            reason: error.to_string(),
        }
        .into()
    }

    /// Cuts a partial last line left by an interrupted append, so the next
    /// envelope starts on a line of its own
    async fn repair_torn_tail(&self) -> std::io::Result<()> {
        let mut file = match tokio::fs::OpenOptions::new().read(true).write(true).open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(());
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1)).await?;
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok(());
        }

        file.seek(SeekFrom::Start(0)).await?;
        let mut content = Vec::with_capacity(usize::try_from(len).unwrap_or_default());
        file.read_to_end(&mut content).await?;
        let keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        warn!(
            path = %self.path.display(),
            dropped_bytes = content.len() - keep,
            "truncating torn last event before append"
        );
        file.set_len(keep as u64).await?;
        file.sync_all().await
    }

    fn decode(&self, content: &str) -> EventsResult<Vec<EventEnvelope>> {
        let lines: Vec<&str> = content.lines().collect();
        let mut events = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(envelope) => events.push(envelope),
                // A crash mid-append leaves at most one torn line, at the end.
                Err(e) if index + 1 == lines.len() && !content.ends_with('\n') => {
                    warn!(path = %self.path.display(), error = %e, "ignoring torn last event");
                }
                Err(e) => {
                    return Err(EventStoreError::Corrupt {
                        path: self.path.display().to_string(),
                        line: index + 1,
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, events: &[EventEnvelope]) -> EventsResult {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for envelope in events {
            serde_json::to_writer(&mut buf, envelope)?;
            buf.push(b'\n');
        }

        let _guard = self.write.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.storage_error(&e))?;
        }
        self.repair_torn_tail().await.map_err(|e| self.storage_error(&e))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.storage_error(&e))?;
        file.write_all(&buf).await.map_err(|e| self.storage_error(&e))?;
        file.sync_all().await.map_err(|e| self.storage_error(&e))?;
        Ok(())
    }

    async fn events(&self) -> EventsResult<Vec<EventEnvelope>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => self.decode(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.storage_error(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnyEvent, ApprovalEvent};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn granted(run_id: Uuid, identity: &str) -> EventEnvelope {
        EventEnvelope::record(
            ApprovalEvent::Granted {
                run_id,
                job: "deploy".to_string(),
                identity: identity.to_string(),
            },
            "test",
        )
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let run = Uuid::new_v4();
        {
            let store = FileEventStore::in_dir(dir.path().join("state"));
            store.append(&[granted(run, "alice"), granted(run, "bob")]).await.unwrap();
        }

        let reopened = FileEventStore::in_dir(dir.path().join("state"));
        let identities: Vec<String> = reopened
            .events_for(&run)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.event {
                AnyEvent::Approval(ApprovalEvent::Granted { identity, .. }) => Some(identity),
                _ => None,
            })
            .collect();
        assert_eq!(identities, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileEventStore::in_dir(dir.path());
        assert!(store.events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored_but_corruption_is_not() {
        let dir = TempDir::new().unwrap();
        let store = FileEventStore::in_dir(dir.path());
        store.append(&[granted(Uuid::new_v4(), "alice")]).await.unwrap();

        let mut content = std::fs::read_to_string(store.path()).unwrap();
        content.push_str("{\"event\":");
        std::fs::write(store.path(), &content).unwrap();
        assert_eq!(store.events().await.unwrap().len(), 1);

        std::fs::write(store.path(), format!("garbage\n{content}")).unwrap();
        let err = store.events().await.unwrap_err();
        assert!(err.to_string().contains(":1:"), "{err}");
    }

    #[tokio::test]
    async fn test_append_after_torn_tail_keeps_log_readable() {
        let dir = TempDir::new().unwrap();
        let store = FileEventStore::in_dir(dir.path());
        let run = Uuid::new_v4();
        store.append(&[granted(run, "alice")]).await.unwrap();

        let mut content = std::fs::read_to_string(store.path()).unwrap();
        content.push_str("{\"event\":");
        std::fs::write(store.path(), &content).unwrap();

        store.append(&[granted(run, "bob")]).await.unwrap();
        let events = store.events().await.unwrap();
        assert_eq!(events.len(), 2);
        let written = std::fs::read_to_string(store.path()).unwrap();
        assert!(!written.contains("{\"event\":\n"));
        assert!(written.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_append_after_torn_only_line() {
        let dir = TempDir::new().unwrap();
        let store = FileEventStore::in_dir(dir.path());
        std::fs::write(store.path(), "{\"ev").unwrap();

        store.append(&[granted(Uuid::new_v4(), "alice")]).await.unwrap();
        assert_eq!(store.events().await.unwrap().len(), 1);
    }
}

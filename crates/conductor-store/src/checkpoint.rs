use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CheckpointEntry
// ---------------------------------------------------------------------------

/// One record in an append-only checkpoint stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: Uuid,
    /// Name of the stream this entry belongs to (e.g. `"events"`).
    pub stream: String,
    /// Position within the stream; replay is ordered by this value.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Record discriminator, e.g. `"task:completed"`.
    pub kind: String,
    pub data: serde_json::Value,
}

impl CheckpointEntry {
    /// Entry stamped with the current time.
    pub fn new(
        stream: impl Into<String>,
        sequence: u64,
        kind: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream: stream.into(),
            sequence,
            timestamp: Utc::now(),
            kind: kind.into(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointLog trait
// ---------------------------------------------------------------------------

/// Append-only log with ordered replay.
#[async_trait]
pub trait CheckpointLog: Send + Sync {
    async fn append(&self, entry: CheckpointEntry) -> ConductorResult<()>;
    /// All entries of `stream`, ordered by sequence then timestamp.
    async fn replay(&self, stream: &str) -> ConductorResult<Vec<CheckpointEntry>>;
    async fn streams(&self) -> ConductorResult<Vec<String>>;
}

/// Stream names and snapshot keys become file names, so they are restricted
/// to a conservative character set.
pub(crate) fn validate_name(name: &str) -> ConductorResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ConductorError::Store(format!("invalid name '{name}'")))
    }
}

fn sort_entries(entries: &mut [CheckpointEntry]) {
    entries.sort_by(|a, b| {
        a.sequence
            .cmp(&b.sequence)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
}

// ---------------------------------------------------------------------------
// FileCheckpointLog
// ---------------------------------------------------------------------------

/// One JSONL file per stream; every append is flushed before returning.
pub struct FileCheckpointLog {
    dir: PathBuf,
}

const LOG_SUFFIX: &str = ".log.jsonl";

impl FileCheckpointLog {
    /// Log under `dir`, which is created if missing.
    pub async fn new(dir: PathBuf) -> ConductorResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn stream_path(&self, stream: &str) -> PathBuf {
        self.dir.join(format!("{stream}{LOG_SUFFIX}"))
    }
}

#[async_trait]
impl CheckpointLog for FileCheckpointLog {
    async fn append(&self, entry: CheckpointEntry) -> ConductorResult<()> {
        validate_name(&entry.stream)?;
        let path = self.stream_path(&entry.stream);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn replay(&self, stream: &str) -> ConductorResult<Vec<CheckpointEntry>> {
        validate_name(stream)?;
        let path = self.stream_path(stream);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut entries: Vec<CheckpointEntry> = data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn streams(&self) -> ConductorResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(LOG_SUFFIX) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointLog
// ---------------------------------------------------------------------------

/// In-process log, useful for tests and for hosts that only need replay
/// within a single run.
#[derive(Default)]
pub struct MemoryCheckpointLog {
    streams: Mutex<HashMap<String, Vec<CheckpointEntry>>>,
}

impl MemoryCheckpointLog {
    /// Empty in-memory log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all streams.
    pub async fn len(&self) -> usize {
        self.streams.lock().await.values().map(Vec::len).sum()
    }

    /// Whether no stream has any entry.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CheckpointLog for MemoryCheckpointLog {
    async fn append(&self, entry: CheckpointEntry) -> ConductorResult<()> {
        validate_name(&entry.stream)?;
        let mut streams = self.streams.lock().await;
        streams.entry(entry.stream.clone()).or_default().push(entry);
        Ok(())
    }

    async fn replay(&self, stream: &str) -> ConductorResult<Vec<CheckpointEntry>> {
        let streams = self.streams.lock().await;
        let mut entries = streams.get(stream).cloned().unwrap_or_default();
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn streams(&self) -> ConductorResult<Vec<String>> {
        let streams = self.streams.lock().await;
        let mut names: Vec<String> = streams.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(stream: &str, sequence: u64, kind: &str) -> CheckpointEntry {
        CheckpointEntry::new(stream, sequence, kind, serde_json::json!({"seq": sequence}))
    }

    #[tokio::test]
    async fn append_and_replay_round_trip() {
        let tmp = TempDir::new().unwrap();
        let log = FileCheckpointLog::new(tmp.path().to_path_buf())
            .await
            .unwrap();

        let e = entry("events", 1, "task:queued");
        log.append(e.clone()).await.unwrap();

        let entries = log.replay("events").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, e.id);
        assert_eq!(entries[0].kind, "task:queued");
        assert_eq!(entries[0].data["seq"], 1);
    }

    #[tokio::test]
    async fn missing_stream_replays_empty() {
        let tmp = TempDir::new().unwrap();
        let log = FileCheckpointLog::new(tmp.path().to_path_buf())
            .await
            .unwrap();
        assert!(log.replay("nothing-here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_is_ordered_by_sequence() {
        let tmp = TempDir::new().unwrap();
        let log = FileCheckpointLog::new(tmp.path().to_path_buf())
            .await
            .unwrap();

        log.append(entry("events", 3, "c")).await.unwrap();
        log.append(entry("events", 1, "a")).await.unwrap();
        log.append(entry("events", 2, "b")).await.unwrap();

        let kinds: Vec<String> = log
            .replay("events")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn streams_are_isolated_and_listed() {
        let tmp = TempDir::new().unwrap();
        let log = FileCheckpointLog::new(tmp.path().to_path_buf())
            .await
            .unwrap();

        log.append(entry("events", 1, "a")).await.unwrap();
        log.append(entry("audit", 1, "b")).await.unwrap();

        assert_eq!(log.replay("events").await.unwrap().len(), 1);
        assert_eq!(log.replay("audit").await.unwrap().len(), 1);
        assert_eq!(log.streams().await.unwrap(), vec!["audit", "events"]);
    }

    #[tokio::test]
    async fn rejects_path_like_stream_names() {
        let tmp = TempDir::new().unwrap();
        let log = FileCheckpointLog::new(tmp.path().to_path_buf())
            .await
            .unwrap();
        let err = log.append(entry("../escape", 1, "x")).await.unwrap_err();
        assert!(err.to_string().contains("invalid name"));
        assert!(log.replay("").await.is_err());
    }

    #[tokio::test]
    async fn persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_path_buf();
        {
            let log = FileCheckpointLog::new(dir.clone()).await.unwrap();
            log.append(entry("events", 1, "persist")).await.unwrap();
        }
        let log = FileCheckpointLog::new(dir).await.unwrap();
        let entries = log.replay("events").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "persist");
    }

    #[tokio::test]
    async fn memory_log_orders_and_counts() {
        let log = MemoryCheckpointLog::new();
        assert!(log.is_empty().await);
        log.append(entry("events", 2, "b")).await.unwrap();
        log.append(entry("events", 1, "a")).await.unwrap();
        log.append(entry("other", 1, "z")).await.unwrap();

        assert_eq!(log.len().await, 3);
        let entries = log.replay("events").await.unwrap();
        assert_eq!(entries[0].kind, "a");
        assert_eq!(entries[1].kind, "b");
        assert_eq!(log.streams().await.unwrap(), vec!["events", "other"]);
    }
}

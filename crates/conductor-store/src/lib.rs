//! Persistence for the Conductor orchestration engine.
//!
//! Two small seams, each with a file-backed implementation:
//!
//! - [`CheckpointLog`] — append-only JSONL streams with ordered replay.
//! - [`SnapshotStore`] — point-in-time JSON documents keyed by name.

/// Append-only entry streams.
pub mod checkpoint;
/// Keyed JSON snapshots.
pub mod snapshot;

pub use checkpoint::{CheckpointEntry, CheckpointLog, FileCheckpointLog, MemoryCheckpointLog};
pub use snapshot::{FileSnapshotStore, SnapshotStore};

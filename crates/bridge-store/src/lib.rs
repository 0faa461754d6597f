#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bridge-store** – Append-only event log and projection engine.
//!
//! The log is the single source of truth for the entire bridge: every
//! decision, mutation, and exchange is an event here, and all other state is
//! a projection of it. This crate owns:
//!
//! * the single-writer batching task that assigns totally ordered ids and
//!   commits fsynced, hash-chained batches ([`EventLog`]);
//! * the storage drivers behind it – in-memory for tests and ephemeral use
//!   ([`MemoryBackend`]), segmented files with an offset index for
//!   durability ([`DiskBackend`]);
//! * the projection engine that folds the log into per-aggregate state with
//!   snapshot + tail replay ([`ProjectionEngine`]).
//!
//! Readers never block the writer; they see the committed prefix only.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod backend;
mod disk;
mod memory;
mod projection;
mod segment;
mod snapshot;
mod writer;

pub use backend::{LogBackend, RecoveredTail};
pub use disk::DiskBackend;
pub use memory::MemoryBackend;
pub use projection::{Projection, ProjectionEngine, ProjectionStats, RebuildReport};
pub use snapshot::{Snapshot, SnapshotStore};
pub use writer::{EventLog, LogHealth};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tunables for the event log writer and its storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Node component stamped into every assigned event id.
    pub node_id: u16,
    /// Maximum events drained into one committed batch.
    pub max_batch: usize,
    /// Maximum time the writer waits to fill a batch.
    #[serde(with = "duration_millis")]
    pub max_batch_delay: Duration,
    /// Depth of the producer queue; a full queue yields `Busy`.
    pub queue_depth: usize,
    /// Roll to a new segment once the current one exceeds this size.
    pub segment_max_bytes: u64,
    /// Refuse new batches once total storage exceeds this size.
    pub high_water_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            max_batch: 256,
            max_batch_delay: Duration::from_millis(2),
            queue_depth: 4096,
            segment_max_bytes: 100 * 1024 * 1024,
            high_water_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

/// Snapshotting policy for projections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Snapshot after this many applied events.
    pub every_events: u64,
    /// Also snapshot after this much time with pending changes.
    #[serde(with = "duration_millis")]
    pub every_interval: Duration,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self { every_events: 1000, every_interval: Duration::from_secs(60) }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

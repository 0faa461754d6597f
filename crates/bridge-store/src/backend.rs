//! Storage driver contract shared by the disk and memory backends.

use async_trait::async_trait;

use bridge_types::{BridgeResult, ChainDigest, Event, EventFilter, EventId, CHAIN_ROOT};

/// State of the log tail after a recovery pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredTail {
    /// Last durable event id, if the log is non-empty.
    pub last_id: Option<EventId>,
    /// Chain head the next batch must extend.
    pub chain_head: ChainDigest,
    /// Frames discarded as torn during recovery.
    pub torn_discarded: usize,
}

impl RecoveredTail {
    /// Tail of an empty log.
    pub fn empty() -> Self {
        Self { last_id: None, chain_head: CHAIN_ROOT, torn_discarded: 0 }
    }
}

/// Abstraction over the persistence layer under the single writer.
///
/// Only the writer task calls [`persist`](LogBackend::persist); any number of
/// readers call [`scan`](LogBackend::scan) concurrently and observe the
/// committed prefix only. A batch is atomic: after a crash, recovery sees
/// either all of it or none of it.
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Durably store a sealed batch. Returns only after the batch would
    /// survive a crash. Re-persisting ids at or below the current tail is a
    /// `Replay` error and leaves the log unchanged. Storage exhaustion is a
    /// `Degraded` error.
    async fn persist(&self, batch: &[Event]) -> BridgeResult<()>;

    /// Read committed events with id strictly greater than `from`, in id
    /// order, applying `filter` during the scan, up to `limit` events.
    async fn scan(&self, from: EventId, limit: usize, filter: &EventFilter)
        -> BridgeResult<Vec<Event>>;

    /// Verify the stored tail and report the id and chain head to resume
    /// from. Torn frames past the last intact chain link are discarded.
    async fn recover(&self) -> BridgeResult<RecoveredTail>;

    /// Bytes currently occupied by the log, for high-water checks.
    async fn size_bytes(&self) -> BridgeResult<u64>;
}

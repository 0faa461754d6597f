//! In-memory log driver for tests, development, and ephemeral bridges.

use async_trait::async_trait;
use tokio::sync::RwLock;

use bridge_types::{BridgeError, BridgeResult, Event, EventFilter, EventId};

use crate::backend::{LogBackend, RecoveredTail};

/// A non-persistent, in-process log driver.
///
/// Events live in an ordered vector; all data is lost when the process
/// terminates. Semantics (atomic batches, replay rejection, committed-prefix
/// reads) match the disk driver so tests exercise the same contract.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    events: RwLock<Vec<Event>>,
}

impl MemoryBackend {
    /// Create an empty in-memory driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed events.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl LogBackend for MemoryBackend {
    async fn persist(&self, batch: &[Event]) -> BridgeResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut events = self.events.write().await;
        if let Some(last) = events.last() {
            if batch[0].id <= last.id {
                return Err(BridgeError::Replay(format!(
                    "batch head {} is not past the log tail {}",
                    batch[0].id, last.id
                )));
            }
        }
        events.extend_from_slice(batch);
        Ok(())
    }

    async fn scan(
        &self,
        from: EventId,
        limit: usize,
        filter: &EventFilter,
    ) -> BridgeResult<Vec<Event>> {
        let events = self.events.read().await;
        let start = events.partition_point(|e| e.id <= from);
        Ok(events[start..]
            .iter()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recover(&self) -> BridgeResult<RecoveredTail> {
        let events = self.events.read().await;
        Ok(match events.last() {
            Some(last) => RecoveredTail {
                last_id: Some(last.id),
                chain_head: last.integrity.hash,
                torn_discarded: 0,
            },
            None => RecoveredTail::empty(),
        })
    }

    async fn size_bytes(&self) -> BridgeResult<u64> {
        // Approximation is fine: the memory driver is never the durable tier.
        Ok(self.events.read().await.len() as u64 * 512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_types::{
        AgentId, EventDraft, EventPayload, StreamId, SystemRecovered, CHAIN_ROOT,
    };

    fn sealed(ns: u64) -> Event {
        let draft = EventDraft::new(
            StreamId::system(),
            EventPayload::SystemRecovered(SystemRecovered { operator: AgentId::from("op") }),
            AgentId::from("op"),
        );
        Event::seal(EventId::new(ns, 0, 0), draft, 0, CHAIN_ROOT).unwrap()
    }

    #[tokio::test]
    async fn rejects_replayed_batch() {
        let backend = MemoryBackend::new();
        let batch = vec![sealed(1), sealed(2)];
        backend.persist(&batch).await.unwrap();

        let err = backend.persist(&batch).await.unwrap_err();
        assert_eq!(err.code(), "replay");
        assert_eq!(backend.event_count().await, 2);
    }

    #[tokio::test]
    async fn scan_is_exclusive_of_cursor() {
        let backend = MemoryBackend::new();
        backend.persist(&[sealed(1), sealed(2), sealed(3)]).await.unwrap();

        let out = backend
            .scan(EventId::new(1, 0, 0), 10, &EventFilter::all())
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, EventId::new(2, 0, 0));
    }
}

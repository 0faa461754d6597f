//! The projection engine: deterministic folds of the log into per-aggregate
//! state, with snapshot + tail rebuild and read-your-writes waiting.

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info};

use bridge_types::{
    BridgeError, BridgeResult, Event, EventFilter, EventId,
};

use crate::snapshot::{Snapshot, SnapshotStore};
use crate::writer::EventLog;
use crate::SnapshotPolicy;

/// Page size used when replaying the log tail during a rebuild.
const REPLAY_PAGE: usize = 512;

//─────────────────────────────
//  Projection trait
//─────────────────────────────

/// A deterministic fold over a filtered view of the log.
///
/// `apply` must be pure and total over the kinds selected by `interest`:
/// the same event prefix yields the same state on any machine, which is
/// what makes snapshots interchangeable with full replay. An event the
/// projection selected but cannot interpret is an integrity error, never
/// something to skip silently.
pub trait Projection: Send + Sync + 'static {
    /// Materialized state of this projection.
    type State: Default + Clone + Serialize + DeserializeOwned + Send + Sync;

    /// Stable name, used for snapshot directories and logging.
    fn name(&self) -> &'static str;

    /// The slice of the log this projection folds.
    fn interest(&self) -> EventFilter;

    /// Fold one event into the state.
    fn apply(&self, state: &mut Self::State, event: &Event) -> BridgeResult<()>;
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// Counters exposed for tests and the health surface.
#[derive(Debug, Clone, Default)]
pub struct ProjectionStats {
    /// Events folded since construction.
    pub events_applied: u64,
    /// Snapshots written since construction.
    pub snapshots_written: u64,
}

/// Outcome of a rebuild pass.
#[derive(Debug, Clone)]
pub struct RebuildReport {
    /// Snapshot the rebuild started from, if one was usable.
    pub from_snapshot: Option<EventId>,
    /// Events replayed from the log after the snapshot.
    pub events_replayed: u64,
    /// Snapshot files quarantined during the load.
    pub quarantined: Vec<String>,
}

struct Tracked<S> {
    state: S,
    last_applied: EventId,
    since_snapshot: u64,
    last_snapshot_at: Instant,
}

/// Engine driving one projection: holds the in-memory table, applies
/// committed events in id order, and writes snapshots per policy.
pub struct ProjectionEngine<P: Projection> {
    projection: P,
    inner: RwLock<Tracked<P::State>>,
    advanced: Notify,
    snapshots: SnapshotStore,
    policy: SnapshotPolicy,
    stats: RwLock<ProjectionStats>,
}

impl<P: Projection> ProjectionEngine<P> {
    /// Create an engine with empty state.
    pub fn new(projection: P, snapshots: SnapshotStore, policy: SnapshotPolicy) -> Arc<Self> {
        Arc::new(Self {
            projection,
            inner: RwLock::new(Tracked {
                state: P::State::default(),
                last_applied: EventId::ZERO,
                since_snapshot: 0,
                last_snapshot_at: Instant::now(),
            }),
            advanced: Notify::new(),
            snapshots,
            policy,
            stats: RwLock::new(ProjectionStats::default()),
        })
    }

    /// Stable name of the underlying projection.
    pub fn name(&self) -> &'static str {
        self.projection.name()
    }

    /// The filter the runtime should subscribe with.
    pub fn interest(&self) -> EventFilter {
        self.projection.interest()
    }

    /// Rebuild from the newest usable snapshot plus the log tail.
    pub async fn rebuild(&self, log: &EventLog) -> BridgeResult<RebuildReport> {
        let head = log.latest_id();
        let (snapshot, quarantined) =
            self.snapshots.load_latest(self.projection.name(), head).await?;

        let (mut state, mut cursor, from_snapshot) = match snapshot {
            Some(snap) => {
                let state: P::State = rmp_serde::from_slice(&snap.state_bytes).map_err(|e| {
                    BridgeError::IntegrityBreak(format!(
                        "snapshot for {} does not decode: {e}",
                        self.projection.name()
                    ))
                })?;
                (state, snap.up_to, Some(snap.up_to))
            }
            None => (P::State::default(), EventId::ZERO, None),
        };

        let filter = self.projection.interest();
        let mut replayed = 0u64;
        loop {
            let page = log.read(cursor, REPLAY_PAGE, &filter).await?;
            if page.is_empty() {
                break;
            }
            for event in &page {
                self.projection.apply(&mut state, event)?;
                replayed += 1;
            }
            cursor = page[page.len() - 1].id;
        }

        let mut inner = self.inner.write().await;
        inner.state = state;
        inner.last_applied = cursor;
        inner.since_snapshot = 0;
        drop(inner);
        self.advanced.notify_waiters();

        info!(
            projection = self.projection.name(),
            ?from_snapshot,
            replayed,
            "projection rebuilt"
        );
        Ok(RebuildReport { from_snapshot, events_replayed: replayed, quarantined })
    }

    /// Fold one committed event. Events at or below the applied cursor are
    /// ignored so catch-up and live feeds can overlap without double-apply.
    ///
    /// Returns the descriptor of a snapshot written as a side effect, if
    /// any; the caller records the matching `SnapshotTaken` event.
    pub async fn apply_live(&self, event: &Event) -> BridgeResult<Option<Snapshot>> {
        if !self.projection.interest().matches(event) {
            return Ok(None);
        }
        let mut inner = self.inner.write().await;
        if event.id <= inner.last_applied {
            return Ok(None);
        }
        self.projection.apply(&mut inner.state, event)?;
        inner.last_applied = event.id;
        inner.since_snapshot += 1;
        let due = inner.since_snapshot >= self.policy.every_events
            || inner.last_snapshot_at.elapsed() >= self.policy.every_interval;

        let snapshot = if due {
            let bytes = rmp_serde::to_vec_named(&inner.state)
                .map_err(|e| BridgeError::Internal(format!("snapshot encode: {e}")))?;
            let up_to = inner.last_applied;
            let written = self.snapshots.save(self.projection.name(), up_to, &bytes).await?;
            inner.since_snapshot = 0;
            inner.last_snapshot_at = Instant::now();
            if written.is_some() {
                self.stats.write().await.snapshots_written += 1;
            }
            written
        } else {
            None
        };
        drop(inner);

        self.stats.write().await.events_applied += 1;
        self.advanced.notify_waiters();
        Ok(snapshot)
    }

    /// Run a lookup against the current state under a read lock held only
    /// for the duration of the closure.
    pub async fn read<R>(&self, f: impl FnOnce(&P::State) -> R) -> R {
        let inner = self.inner.read().await;
        f(&inner.state)
    }

    /// The id of the last applied event.
    pub async fn last_applied(&self) -> EventId {
        self.inner.read().await.last_applied
    }

    /// Block cooperatively until `last_applied >= await_id` (read-your-writes),
    /// failing with `Busy` after `timeout`.
    pub async fn await_applied(
        &self,
        await_id: EventId,
        timeout: std::time::Duration,
    ) -> BridgeResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.read().await.last_applied >= await_id {
                return Ok(());
            }
            let notified = self.advanced.notified();
            if self.inner.read().await.last_applied >= await_id {
                return Ok(());
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(BridgeError::Busy(format!(
                        "projection {} lagging behind {await_id}",
                        self.projection.name()
                    )));
                }
            }
        }
    }

    /// Counters for tests and health reporting.
    pub async fn stats(&self) -> ProjectionStats {
        self.stats.read().await.clone()
    }

    /// Consume a feed of committed events until the channel closes.
    ///
    /// The runtime wires this to a subscription-hub channel; snapshot
    /// notifications are reported through `on_snapshot` drafts appended by
    /// the caller side.
    pub async fn pump(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Event>,
        mut on_snapshot: impl FnMut(Snapshot) + Send,
    ) -> BridgeResult<()> {
        debug!(projection = self.name(), "projection pump started");
        while let Some(event) = rx.recv().await {
            if let Some(snapshot) = self.apply_live(&event).await? {
                on_snapshot(snapshot);
            }
        }
        debug!(projection = self.name(), "projection pump stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::LogConfig;
    use bridge_types::{
        AgentId, EventDraft, EventKind, EventPayload, FileMutated, StreamId,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Counts mutations per file path.
    struct FileTouches;

    impl Projection for FileTouches {
        type State = BTreeMap<String, u64>;

        fn name(&self) -> &'static str {
            "file-touches"
        }

        fn interest(&self) -> EventFilter {
            EventFilter::kinds([EventKind::FileMutated])
        }

        fn apply(&self, state: &mut Self::State, event: &Event) -> BridgeResult<()> {
            match &event.payload {
                EventPayload::FileMutated(m) => {
                    *state.entry(m.path.clone()).or_default() += 1;
                    Ok(())
                }
                other => Err(BridgeError::IntegrityBreak(format!(
                    "file-touches cannot fold {}",
                    other.kind()
                ))),
            }
        }
    }

    fn mutation(path: &str) -> EventDraft {
        EventDraft::new(
            StreamId::file(path),
            EventPayload::FileMutated(FileMutated {
                path: path.into(),
                mutation: "write".into(),
                agent: AgentId::from("alpha"),
                content_hash: None,
            }),
            AgentId::from("alpha"),
        )
    }

    async fn test_log() -> EventLog {
        EventLog::start(Arc::new(MemoryBackend::new()), LogConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rebuild_then_live_apply() {
        let log = test_log().await;
        log.append(vec![mutation("a.rs"), mutation("a.rs"), mutation("b.rs")])
            .await
            .unwrap();

        let engine = ProjectionEngine::new(
            FileTouches,
            SnapshotStore::disabled(),
            SnapshotPolicy::default(),
        );
        let report = engine.rebuild(&log).await.unwrap();
        assert_eq!(report.events_replayed, 3);
        assert_eq!(engine.read(|s| s["a.rs"]).await, 2);

        // Live events past the rebuilt cursor fold in.
        let id = log.append_one(mutation("a.rs")).await.unwrap();
        let events = log.read(EventId::ZERO, 100, &EventFilter::all()).await.unwrap();
        let live = events.into_iter().find(|e| e.id == id).unwrap();
        engine.apply_live(&live).await.unwrap();
        assert_eq!(engine.read(|s| s["a.rs"]).await, 3);

        // Replayed events do not double-apply.
        engine.apply_live(&live).await.unwrap();
        assert_eq!(engine.read(|s| s["a.rs"]).await, 3);
    }

    #[tokio::test]
    async fn await_applied_times_out_and_succeeds() {
        let log = test_log().await;
        let engine = ProjectionEngine::new(
            FileTouches,
            SnapshotStore::disabled(),
            SnapshotPolicy::default(),
        );

        let id = log.append_one(mutation("a.rs")).await.unwrap();
        let err = engine
            .await_applied(id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "busy");

        engine.rebuild(&log).await.unwrap();
        engine.await_applied(id, Duration::from_millis(20)).await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_equivalent_to_full_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log().await;
        for i in 0..10 {
            log.append_one(mutation(&format!("f{}.rs", i % 3))).await.unwrap();
        }

        // Engine A snapshots aggressively while applying live.
        let policy = SnapshotPolicy { every_events: 4, every_interval: Duration::from_secs(3600) };
        let a = ProjectionEngine::new(
            FileTouches,
            SnapshotStore::on_disk(dir.path()),
            policy.clone(),
        );
        a.rebuild(&log).await.unwrap();
        let mut cursor = a.last_applied().await;
        let mut snapshots = 0;
        for i in 0..6 {
            log.append_one(mutation(&format!("f{}.rs", i % 3))).await.unwrap();
            for live in log.read(cursor, 100, &EventFilter::all()).await.unwrap() {
                cursor = live.id;
                if a.apply_live(&live).await.unwrap().is_some() {
                    snapshots += 1;
                }
            }
        }
        assert!(snapshots >= 1, "snapshot policy should have fired");

        // Engine B rebuilds fresh: snapshot + tail must equal full replay.
        let b = ProjectionEngine::new(
            FileTouches,
            SnapshotStore::on_disk(dir.path()),
            policy,
        );
        let report = b.rebuild(&log).await.unwrap();
        assert!(report.from_snapshot.is_some());
        assert_eq!(a.read(|s| s.clone()).await, b.read(|s| s.clone()).await);
        assert_eq!(a.last_applied().await, b.last_applied().await);
    }
}

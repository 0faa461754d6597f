#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bridge-hub** – Filtered real-time fan-out of committed events.
//!
//! The hub sits between the event log's commit feed and every live
//! consumer: projection tasks, agent subscriptions on the gateway, the
//! dispatcher's invalidation listener. Each subscription has its own
//! bounded buffer and receives matching events in strictly increasing id
//! order. A slow subscriber never blocks the writer or other subscribers:
//! when its buffer overflows, the hub records its cursor, parks it, and the
//! subscriber catches back up from the log before rejoining the live feed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use bridge_store::EventLog;
use bridge_types::{BridgeResult, Event, EventFilter, EventId};

/// Default per-subscription buffer depth.
pub const DEFAULT_BUFFER: usize = 1024;

/// Page size used while catching a resumed subscriber up from the log.
const CATCHUP_PAGE: usize = 256;

//─────────────────────────────
//  Hub
//─────────────────────────────

struct SubEntry {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
    parked: Arc<AtomicBool>,
}

struct HubInner {
    log: EventLog,
    subs: DashMap<u64, SubEntry>,
    next_id: AtomicU64,
    buffer: usize,
}

/// Fan-out hub over the log's commit feed.
///
/// Cheap to clone. [`SubscriptionHub::start`] spawns the pump task that
/// drains committed batches and distributes them.
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    /// Start the hub over `log`'s commit feed with the given per-subscriber
    /// buffer depth.
    pub fn start(log: EventLog, buffer: usize) -> Self {
        let inner = Arc::new(HubInner {
            log: log.clone(),
            subs: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer,
        });
        let pump = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut commits = pump.log.subscribe_commits();
            loop {
                match commits.recv().await {
                    Ok(batch) => pump.distribute(&batch),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // The hub itself fell behind the commit feed. Events
                        // were skipped, so every subscriber must re-read the
                        // log from its own cursor.
                        warn!(missed, "hub lagged the commit feed; parking all subscribers");
                        pump.park_all();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("subscription hub pump stopped");
        });
        Self { inner }
    }

    /// Subscribe to events matching `filter`, live from now on.
    ///
    /// Use [`SubscriptionHub::resume`] to join with history from a cursor.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let parked = Arc::new(AtomicBool::new(false));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cursor = self.inner.log.latest_id();
        self.inner.subs.insert(
            id,
            SubEntry { filter: filter.clone(), tx, parked: Arc::clone(&parked) },
        );
        Subscription {
            id,
            hub: Arc::clone(&self.inner),
            filter,
            catchup: VecDeque::new(),
            rx,
            cursor,
            parked,
        }
    }

    /// Subscribe from `cursor`: events after it are replayed from the log,
    /// then delivery switches to the live feed with no gap or duplicate.
    pub async fn resume(&self, filter: EventFilter, cursor: EventId) -> BridgeResult<Subscription> {
        // Register for live delivery first so nothing committed during the
        // catch-up scan is missed; duplicates are dropped by the cursor.
        let mut sub = self.subscribe(filter.clone());
        sub.cursor = cursor;

        let mut from = cursor;
        loop {
            let page = self.inner.log.read(from, CATCHUP_PAGE, &filter).await?;
            if page.is_empty() {
                break;
            }
            from = page[page.len() - 1].id;
            sub.catchup.extend(page);
        }
        Ok(sub)
    }

    /// Number of live (non-parked) subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.len()
    }
}

impl HubInner {
    fn distribute(&self, batch: &[Event]) {
        let mut to_park = Vec::new();
        for entry in self.subs.iter() {
            let (id, sub) = (entry.key(), entry.value());
            for event in batch {
                if !sub.filter.matches(event) {
                    continue;
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Buffer at high-water: park. The subscriber keeps
                        // its cursor at the last event it actually consumed
                        // and re-reads the rest from the log on resume.
                        sub.parked.store(true, Ordering::Release);
                        to_park.push(*id);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        to_park.push(*id);
                        break;
                    }
                }
            }
        }
        for id in to_park {
            debug!(subscription = id, "parking subscriber");
            self.subs.remove(&id);
        }
    }

    fn park_all(&self) {
        let ids: Vec<u64> = self.subs.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, sub)) = self.subs.remove(&id) {
                sub.parked.store(true, Ordering::Release);
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        // Idempotent: removing an already-removed subscription is a no-op.
        self.subs.remove(&id);
    }
}

//─────────────────────────────
//  Subscription handle
//─────────────────────────────

/// What a subscriber sees on each turn of its delivery loop.
#[derive(Debug)]
pub enum Delivery {
    /// The next matching event, in id order.
    Event(Event),
    /// The hub parked this subscription; re-join with
    /// [`SubscriptionHub::resume`] from the given cursor.
    Lagged {
        /// Last id that was delivered; resume strictly after it.
        resume_from: EventId,
    },
}

/// One consumer's handle onto the hub.
pub struct Subscription {
    id: u64,
    hub: Arc<HubInner>,
    filter: EventFilter,
    /// Events replayed from the log ahead of the live feed.
    catchup: VecDeque<Event>,
    rx: mpsc::Receiver<Event>,
    cursor: EventId,
    parked: Arc<AtomicBool>,
}

impl Subscription {
    /// Receive the next delivery. Returns `None` when the subscription was
    /// cancelled or the hub shut down.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some(event) = self.catchup.pop_front() {
                if event.id <= self.cursor {
                    continue;
                }
                self.cursor = event.id;
                return Some(Delivery::Event(event));
            }
            match self.rx.recv().await {
                Some(event) => {
                    // Drop anything the catch-up scan already produced.
                    if event.id <= self.cursor {
                        continue;
                    }
                    self.cursor = event.id;
                    return Some(Delivery::Event(event));
                }
                None => {
                    if self.parked.load(Ordering::Acquire) {
                        return Some(Delivery::Lagged { resume_from: self.cursor });
                    }
                    return None;
                }
            }
        }
    }

    /// Last event id this subscription has observed.
    pub fn cursor(&self) -> EventId {
        self.cursor
    }

    /// The filter this subscription was created with.
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Cancel delivery. Idempotent; a later [`SubscriptionHub::resume`] with
    /// the recorded cursor picks up where this left off.
    pub fn cancel(&mut self) {
        self.hub.unsubscribe(self.id);
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_store::{LogConfig, MemoryBackend};
    use bridge_types::{
        AgentId, EventDraft, EventKind, EventPayload, FileMutated, StreamId,
    };
    use std::time::Duration;

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
    async fn filtered_delivery_in_id_order() {
        let log = test_log().await;
        let hub = SubscriptionHub::start(log.clone(), DEFAULT_BUFFER);
        let mut sub = hub.subscribe(EventFilter::stream("file:src/"));

        log.append(vec![mutation("src/a.rs"), mutation("docs/x.md"), mutation("src/b.rs")])
            .await
            .unwrap();

        let first = match sub.next().await.unwrap() {
            Delivery::Event(e) => e,
            other => panic!("unexpected {other:?}"),
        };
        let second = match sub.next().await.unwrap() {
            Delivery::Event(e) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert!(first.id < second.id);
        assert!(first.stream_id.has_prefix("file:src/"));
        assert!(second.stream_id.has_prefix("file:src/"));
    }

    #[tokio::test]
    async fn slow_subscriber_is_parked_not_blocking() {
        let log = test_log().await;
        let hub = SubscriptionHub::start(log.clone(), 2); // tiny buffer
        let mut sub = hub.subscribe(EventFilter::all());

        // Overflow the buffer without draining it. The writer keeps going.
        for i in 0..10 {
            log.append_one(mutation(&format!("f{i}.rs"))).await.unwrap();
        }

        let mut lagged_at = None;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(1), sub.next()).await {
                Ok(Some(Delivery::Event(_))) => continue,
                Ok(Some(Delivery::Lagged { resume_from })) => {
                    lagged_at = Some(resume_from);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        let resume_from = lagged_at.expect("subscriber should have been parked");

        // Resume via the log: every event is seen exactly once overall.
        let mut resumed = hub.resume(EventFilter::all(), resume_from).await.unwrap();
        let mut seen = resume_from;
        let mut count = 0;
        while seen < log.latest_id() {
            match tokio::time::timeout(Duration::from_secs(1), resumed.next())
                .await
                .unwrap()
                .unwrap()
            {
                Delivery::Event(e) => {
                    assert!(e.id > seen, "duplicate or regression");
                    seen = e.id;
                    count += 1;
                }
                Delivery::Lagged { .. } => panic!("resumed subscriber lagged again"),
            }
        }
        assert!(count > 0);
    }

    #[tokio::test]
    async fn resume_is_gap_free_across_live_commits() {
        let log = test_log().await;
        let hub = SubscriptionHub::start(log.clone(), DEFAULT_BUFFER);

        for i in 0..5 {
            log.append_one(mutation(&format!("old-{i}.rs"))).await.unwrap();
        }
        let cursor = EventId::ZERO;
        let mut sub = hub.resume(EventFilter::kinds([EventKind::FileMutated]), cursor)
            .await
            .unwrap();
        for i in 0..3 {
            log.append_one(mutation(&format!("new-{i}.rs"))).await.unwrap();
        }

        let mut prev = EventId::ZERO;
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_secs(1), sub.next())
                .await
                .unwrap()
                .unwrap()
            {
                Delivery::Event(e) => {
                    assert!(e.id > prev);
                    prev = e.id;
                }
                Delivery::Lagged { .. } => panic!("unexpected lag"),
            }
        }
        assert_eq!(prev, log.latest_id());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let log = test_log().await;
        let hub = SubscriptionHub::start(log.clone(), DEFAULT_BUFFER);
        let mut sub = hub.subscribe(EventFilter::all());
        assert_eq!(hub.subscriber_count(), 1);
        sub.cancel();
        sub.cancel();
        assert_eq!(hub.subscriber_count(), 0);
    }
}

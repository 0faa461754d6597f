//! The single-writer batching task and the [`EventLog`] handle around it.
//!
//! One task owns the log tail: it drains queued drafts, assigns contiguous
//! hybrid-logical-clock ids, seals each event into the hash chain, and
//! persists the whole batch in one fsynced write. Producers get their ack
//! only after durability is confirmed. Because a single task does all id
//! assignment, there are no ordering races and no locks on the hot path.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bridge_types::{
    BridgeError, BridgeResult, ChainDigest, Event, EventDraft, EventFilter, EventId, HlcClock,
};

use crate::backend::LogBackend;
use crate::LogConfig;

/// Capacity of the committed-batch broadcast feeding the subscription hub.
const COMMIT_CHANNEL_CAPACITY: usize = 1024;

//─────────────────────────────
//  Health
//─────────────────────────────

/// Writer-side health signals observed by the degradation controller.
#[derive(Debug, Clone, Default)]
pub struct LogHealth {
    /// Wall time the most recent batch took from drain to fsync ack.
    pub last_batch_latency: Duration,
    /// Producer backlog observed after the most recent drain.
    pub backlog: usize,
    /// Whether the backend reported storage at or past high-water.
    pub storage_high_water: bool,
    /// Code of the most recent persist error, if any.
    pub last_error: Option<String>,
}

//─────────────────────────────
//  Writer protocol
//─────────────────────────────

enum WriteRequest {
    Append {
        drafts: Vec<EventDraft>,
        ack: oneshot::Sender<BridgeResult<(EventId, EventId)>>,
    },
    /// Advance the hybrid clock past an observed peer timestamp.
    Observe(u64),
    /// Commit what is queued, then stop. Other handle clones may still
    /// exist; their appends fail once the writer is gone.
    Shutdown,
}

//─────────────────────────────
//  EventLog handle
//─────────────────────────────

/// Handle to the append-only event log.
///
/// Cheap to clone; all clones feed the same writer task. Reads go straight
/// to the backend and never block the writer.
#[derive(Clone)]
pub struct EventLog {
    tx: mpsc::Sender<WriteRequest>,
    backend: Arc<dyn LogBackend>,
    latest: watch::Receiver<EventId>,
    health: watch::Receiver<LogHealth>,
    commits: broadcast::Sender<Arc<Vec<Event>>>,
    writer: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl EventLog {
    /// Recover the backend's tail and start the writer task.
    pub async fn start(backend: Arc<dyn LogBackend>, config: LogConfig) -> BridgeResult<Self> {
        let tail = backend.recover().await?;
        if tail.torn_discarded > 0 {
            warn!(discarded = tail.torn_discarded, "recovery discarded torn frames");
        }
        let last_id = tail.last_id.unwrap_or(EventId::ZERO);
        info!(%last_id, "event log recovered");

        let clock = HlcClock::resume(config.node_id, last_id);
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let (latest_tx, latest) = watch::channel(last_id);
        let (health_tx, health) = watch::channel(LogHealth::default());
        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);

        let task = WriterTask {
            backend: Arc::clone(&backend),
            config,
            clock,
            chain_head: tail.chain_head,
            latest: latest_tx,
            health: health_tx,
            commits: commits.clone(),
        };
        let handle = tokio::spawn(task.run(rx));

        Ok(Self {
            tx,
            backend,
            latest,
            health,
            commits,
            writer: Arc::new(std::sync::Mutex::new(Some(handle))),
        })
    }

    /// Atomically append a batch of drafts.
    ///
    /// Returns the first and last assigned ids once the batch is durable.
    /// The whole batch is rejected if any draft fails validation; the
    /// producer retries valid drafts individually.
    pub async fn append(&self, drafts: Vec<EventDraft>) -> BridgeResult<(EventId, EventId)> {
        if drafts.is_empty() {
            return Err(BridgeError::SchemaViolation("empty batch".into()));
        }
        for draft in &drafts {
            draft.validate()?;
        }
        let (ack, done) = oneshot::channel();
        self.tx
            .try_send(WriteRequest::Append { drafts, ack })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    BridgeError::Busy("writer queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    BridgeError::Internal("writer stopped".into())
                }
            })?;
        done.await
            .map_err(|_| BridgeError::Internal("writer dropped the batch ack".into()))?
    }

    /// Append a single draft, returning its assigned id.
    pub async fn append_one(&self, draft: EventDraft) -> BridgeResult<EventId> {
        let (first, _last) = self.append(vec![draft]).await?;
        Ok(first)
    }

    /// Read committed events after `from`, in id order.
    pub async fn read(
        &self,
        from: EventId,
        limit: usize,
        filter: &EventFilter,
    ) -> BridgeResult<Vec<Event>> {
        self.backend.scan(from, limit, filter).await
    }

    /// The id of the most recently committed event.
    pub fn latest_id(&self) -> EventId {
        *self.latest.borrow()
    }

    /// Watch channel following the committed tail id.
    pub fn watch_latest(&self) -> watch::Receiver<EventId> {
        self.latest.clone()
    }

    /// Writer health signals.
    pub fn health(&self) -> watch::Receiver<LogHealth> {
        self.health.clone()
    }

    /// Subscribe to committed batches. The subscription hub is the primary
    /// consumer; per-agent delivery happens there, not here.
    pub fn subscribe_commits(&self) -> broadcast::Receiver<Arc<Vec<Event>>> {
        self.commits.subscribe()
    }

    /// Advance the writer's hybrid clock past a peer timestamp.
    pub async fn observe_peer(&self, peer_ns: u64) -> BridgeResult<()> {
        self.tx
            .send(WriteRequest::Observe(peer_ns))
            .await
            .map_err(|_| BridgeError::Internal("writer stopped".into()))
    }

    /// Commit everything queued ahead of this call, then stop the writer.
    pub async fn close(self) -> BridgeResult<()> {
        let handle = self.writer.lock().expect("writer mutex").take();
        let _ = self.tx.send(WriteRequest::Shutdown).await;
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| BridgeError::Internal(format!("writer task panicked: {e}")))?;
        }
        Ok(())
    }
}

//─────────────────────────────
//  Writer task
//─────────────────────────────

struct WriterTask {
    backend: Arc<dyn LogBackend>,
    config: LogConfig,
    clock: HlcClock,
    chain_head: ChainDigest,
    latest: watch::Sender<EventId>,
    health: watch::Sender<LogHealth>,
    commits: broadcast::Sender<Arc<Vec<Event>>>,
}

struct PendingAck {
    ack: oneshot::Sender<BridgeResult<(EventId, EventId)>>,
    first: EventId,
    last: EventId,
}

impl WriterTask {
    async fn run(mut self, mut rx: mpsc::Receiver<WriteRequest>) {
        debug!("log writer started");
        let mut stopping = false;
        while !stopping {
            let Some(first) = rx.recv().await else { break };
            let mut requests = Vec::new();
            let mut drafted = 0usize;
            stopping |= self.admit(first, &mut requests, &mut drafted);

            // Fill the batch until the size or time budget is spent.
            let deadline = tokio::time::Instant::now() + self.config.max_batch_delay;
            while !stopping && drafted < self.config.max_batch {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    req = rx.recv() => match req {
                        Some(req) => stopping |= self.admit(req, &mut requests, &mut drafted),
                        None => break,
                    },
                }
            }

            if !requests.is_empty() {
                self.commit(requests, rx.len()).await;
            }
        }
        debug!("log writer stopped");
    }

    /// Returns `true` when the writer should stop after the current batch.
    fn admit(
        &mut self,
        req: WriteRequest,
        requests: &mut Vec<(Vec<EventDraft>, oneshot::Sender<BridgeResult<(EventId, EventId)>>)>,
        drafted: &mut usize,
    ) -> bool {
        match req {
            WriteRequest::Append { drafts, ack } => {
                *drafted += drafts.len();
                requests.push((drafts, ack));
                false
            }
            WriteRequest::Observe(peer_ns) => {
                self.clock.observe(peer_ns);
                false
            }
            WriteRequest::Shutdown => true,
        }
    }

    async fn commit(
        &mut self,
        requests: Vec<(Vec<EventDraft>, oneshot::Sender<BridgeResult<(EventId, EventId)>>)>,
        backlog: usize,
    ) {
        let started = Instant::now();
        let mut batch: Vec<Event> = Vec::new();
        let mut acks: Vec<PendingAck> = Vec::new();
        let mut head = self.chain_head;

        let sealed: BridgeResult<()> = (|| {
            for (drafts, ack) in requests {
                let mut first = None;
                let mut last = EventId::ZERO;
                for draft in drafts {
                    let id = self.clock.tick(wall_clock_ns());
                    let event = Event::seal(id, draft, self.config.node_id, head)?;
                    head = event.integrity.hash;
                    first.get_or_insert(id);
                    last = id;
                    batch.push(event);
                }
                acks.push(PendingAck {
                    ack,
                    first: first.expect("non-empty request"),
                    last,
                });
            }
            Ok(())
        })();

        if let Err(e) = sealed {
            error!(error = %e, "failed to seal batch");
            for pending in acks {
                let _ = pending.ack.send(Err(e.clone()));
            }
            return;
        }

        match self.backend.persist(&batch).await {
            Ok(()) => {
                self.chain_head = head;
                let last = batch[batch.len() - 1].id;
                let _ = self.latest.send(last);
                let _ = self.commits.send(Arc::new(batch));
                for pending in acks {
                    let _ = pending.ack.send(Ok((pending.first, pending.last)));
                }
                let _ = self.health.send(LogHealth {
                    last_batch_latency: started.elapsed(),
                    backlog,
                    storage_high_water: false,
                    last_error: None,
                });
            }
            Err(e) => {
                // The batch never became durable, so the chain head must
                // not move. The clock keeps its tick; ids are promised to
                // be monotonic, not dense.
                warn!(error = %e, "batch persist failed");
                let high_water = matches!(e, BridgeError::Degraded(_));
                for pending in acks {
                    let _ = pending.ack.send(Err(e.clone()));
                }
                let _ = self.health.send(LogHealth {
                    last_batch_latency: started.elapsed(),
                    backlog,
                    storage_high_water: high_water,
                    last_error: Some(e.code().to_string()),
                });
            }
        }
    }
}

/// Physical clock reading feeding the hybrid clock.
fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

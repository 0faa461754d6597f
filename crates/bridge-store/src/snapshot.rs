//! Projection snapshots: cached state at a specific event id.
//!
//! Snapshots are optimizations, never authoritative. Any snapshot can be
//! discarded and the projection rebuilt from the log; a snapshot that fails
//! its integrity check is quarantined, not trusted.

use std::path::PathBuf;

use tokio::fs;
use tracing::{info, warn};

use bridge_types::{BridgeError, BridgeResult, EventId, Fingerprint};

/// A serialized projection state at `up_to`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Projection the snapshot belongs to.
    pub projection: String,
    /// Last event id folded into the state.
    pub up_to: EventId,
    /// MessagePack-encoded state.
    pub state_bytes: Vec<u8>,
    /// Blake3 digest of `state_bytes`.
    pub integrity: Fingerprint,
}

/// Files under `<dir>/<projection>/`: `<up_to>.snap` holds the state bytes,
/// `<up_to>.snap.sum` holds the hex blake3 digest.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: Option<PathBuf>,
}

impl SnapshotStore {
    /// Store snapshots under `dir`.
    pub fn on_disk(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Some(dir.into()) }
    }

    /// No-op store for memory-backed bridges; every rebuild replays the log.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Persist a snapshot, returning its descriptor (or `None` when the
    /// store is disabled).
    pub async fn save(
        &self,
        projection: &str,
        up_to: EventId,
        state_bytes: &[u8],
    ) -> BridgeResult<Option<Snapshot>> {
        let Some(dir) = &self.dir else { return Ok(None) };
        let pdir = dir.join(projection);
        fs::create_dir_all(&pdir)
            .await
            .map_err(|e| BridgeError::Internal(format!("snapshot dir: {e}")))?;

        let integrity = Fingerprint::of_bytes(state_bytes);
        let snap_path = pdir.join(format!("{up_to}.snap"));
        let sum_path = pdir.join(format!("{up_to}.snap.sum"));
        fs::write(&snap_path, state_bytes)
            .await
            .map_err(|e| BridgeError::Internal(format!("snapshot write: {e}")))?;
        fs::write(&sum_path, integrity.to_hex())
            .await
            .map_err(|e| BridgeError::Internal(format!("snapshot sum write: {e}")))?;

        info!(projection, %up_to, bytes = state_bytes.len(), "snapshot written");
        Ok(Some(Snapshot {
            projection: projection.to_string(),
            up_to,
            state_bytes: state_bytes.to_vec(),
            integrity,
        }))
    }

    /// Load the newest snapshot with `up_to <= max`, verifying integrity.
    ///
    /// Corrupted snapshots are quarantined (renamed aside) and skipped; the
    /// returned list names what was quarantined so the caller can raise an
    /// integrity alert.
    pub async fn load_latest(
        &self,
        projection: &str,
        max: EventId,
    ) -> BridgeResult<(Option<Snapshot>, Vec<String>)> {
        let Some(dir) = &self.dir else { return Ok((None, Vec::new())) };
        let pdir = dir.join(projection);
        let mut candidates: Vec<EventId> = Vec::new();
        let mut entries = match fs::read_dir(&pdir).await {
            Ok(entries) => entries,
            Err(_) => return Ok((None, Vec::new())),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".snap") {
                if let Ok(id) = stem.parse::<EventId>() {
                    if id <= max {
                        candidates.push(id);
                    }
                }
            }
        }
        candidates.sort();

        let mut quarantined = Vec::new();
        while let Some(up_to) = candidates.pop() {
            let snap_path = pdir.join(format!("{up_to}.snap"));
            let sum_path = pdir.join(format!("{up_to}.snap.sum"));

            let state_bytes = match fs::read(&snap_path).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            let stored_sum = fs::read_to_string(&sum_path).await.unwrap_or_default();
            let actual = Fingerprint::of_bytes(&state_bytes);

            let stored = Fingerprint::from_hex(stored_sum.trim()).ok();
            if stored != Some(actual) {
                warn!(projection, %up_to, "snapshot failed integrity check; quarantining");
                let q = snap_path.with_extension("snap.quarantined");
                let _ = fs::rename(&snap_path, &q).await;
                let _ = fs::remove_file(&sum_path).await;
                quarantined.push(q.display().to_string());
                continue;
            }

            return Ok((
                Some(Snapshot {
                    projection: projection.to_string(),
                    up_to,
                    state_bytes,
                    integrity: actual,
                }),
                quarantined,
            ));
        }
        Ok((None, quarantined))
    }
}

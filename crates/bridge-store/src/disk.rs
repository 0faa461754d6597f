//! Durable log driver: segmented append-only files with offset indexes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use bridge_types::{BridgeError, BridgeResult, Event, EventFilter, EventId};

use crate::backend::{LogBackend, RecoveredTail};
use crate::segment::{
    encode_frame, encode_index_record, index_file_name, parse_index, parse_segment,
    parse_segment_name, segment_file_name,
};
use crate::LogConfig;

/// One live segment file.
#[derive(Debug, Clone)]
struct SegmentInfo {
    first_id: EventId,
    path: PathBuf,
    index_path: PathBuf,
    len_bytes: u64,
}

#[derive(Debug, Default)]
struct DiskState {
    /// Segments sorted by first id.
    segments: Vec<SegmentInfo>,
    total_bytes: u64,
    last_id: Option<EventId>,
}

/// Persistent log driver writing hash-chained frames into ≤`segment_max_bytes`
/// segment files under a data directory.
///
/// The writer task is the only caller of [`persist`](LogBackend::persist);
/// readers share the segment list and scan files directly, so they observe
/// the committed prefix without coordinating with the writer.
#[derive(Debug)]
pub struct DiskBackend {
    dir: PathBuf,
    segment_max_bytes: u64,
    high_water_bytes: u64,
    state: RwLock<DiskState>,
}

impl DiskBackend {
    /// Open (or create) a log directory.
    pub async fn open(dir: impl AsRef<Path>, config: &LogConfig) -> BridgeResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| BridgeError::Internal(format!("cannot create log dir: {e}")))?;

        let mut segments = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| BridgeError::Internal(format!("cannot list log dir: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BridgeError::Internal(format!("cannot list log dir: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(first_id) = parse_segment_name(&name) {
                let len_bytes = entry
                    .metadata()
                    .await
                    .map_err(|e| BridgeError::Internal(format!("cannot stat segment: {e}")))?
                    .len();
                segments.push(SegmentInfo {
                    first_id,
                    path: dir.join(&name),
                    index_path: dir.join(index_file_name(first_id)),
                    len_bytes,
                });
            }
        }
        segments.sort_by_key(|s| s.first_id);
        let total_bytes = segments.iter().map(|s| s.len_bytes).sum();

        info!(dir = %dir.display(), segments = segments.len(), "opened event log directory");
        Ok(Self {
            dir,
            segment_max_bytes: config.segment_max_bytes,
            high_water_bytes: config.high_water_bytes,
            state: RwLock::new(DiskState { segments, total_bytes, last_id: None }),
        })
    }

    /// Read and parse a whole segment, optionally starting at an indexed
    /// offset. Falls back to a full parse when the offset is not frame
    /// aligned (a stale or torn index).
    async fn load_segment(
        &self,
        seg: &SegmentInfo,
        from_offset: u64,
    ) -> BridgeResult<Vec<Event>> {
        let bytes = fs::read(&seg.path)
            .await
            .map_err(|e| BridgeError::Internal(format!("cannot read segment: {e}")))?;
        let slice_from = (from_offset as usize).min(bytes.len());
        let parsed = parse_segment(&bytes[slice_from..]);
        if parsed.events.is_empty() && slice_from != 0 {
            // Index pointed into garbage; reparse from the segment start.
            let full = parse_segment(&bytes);
            return Ok(full.events.into_iter().map(|(_, e)| e).collect());
        }
        Ok(parsed.events.into_iter().map(|(_, e)| e).collect())
    }

    /// Locate the index offset of the first frame that could hold an event
    /// with id greater than `from`.
    async fn seek_offset(&self, seg: &SegmentInfo, from: EventId) -> u64 {
        match fs::read(&seg.index_path).await {
            Ok(bytes) => {
                let index = parse_index(&bytes);
                // Last record with id <= from: events before it cannot match.
                let pos = index.partition_point(|(id, _)| *id <= from);
                if pos == 0 {
                    0
                } else {
                    index[pos - 1].1
                }
            }
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl LogBackend for DiskBackend {
    async fn persist(&self, batch: &[Event]) -> BridgeResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;

        if let Some(last) = state.last_id {
            if batch[0].id <= last {
                return Err(BridgeError::Replay(format!(
                    "batch head {} is not past the log tail {}",
                    batch[0].id, last
                )));
            }
        }
        if state.total_bytes >= self.high_water_bytes {
            return Err(BridgeError::Degraded(format!(
                "log storage at high-water ({} bytes)",
                state.total_bytes
            )));
        }

        // Roll to a fresh segment when the current one is over budget.
        let need_new = match state.segments.last() {
            Some(seg) => seg.len_bytes >= self.segment_max_bytes,
            None => true,
        };
        if need_new {
            let first_id = batch[0].id;
            let info = SegmentInfo {
                first_id,
                path: self.dir.join(segment_file_name(first_id)),
                index_path: self.dir.join(index_file_name(first_id)),
                len_bytes: 0,
            };
            debug!(segment = %info.path.display(), "rolling to new segment");
            state.segments.push(info);
        }
        let seg = state.segments.last_mut().expect("segment exists");

        // Encode the whole batch into one buffer so it hits the file in a
        // single write, then fsync before acknowledging.
        let base_offset = seg.len_bytes;
        let mut frames = Vec::new();
        let mut index_records = Vec::new();
        for event in batch {
            index_records
                .extend_from_slice(&encode_index_record(event.id, base_offset + frames.len() as u64));
            frames.extend(encode_frame(event)?);
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&seg.path)
            .await
            .map_err(|e| map_io("segment open", e))?;
        file.write_all(&frames).await.map_err(|e| map_io("segment write", e))?;
        file.sync_data().await.map_err(|e| map_io("segment fsync", e))?;

        // The index is a rebuildable optimization; it is appended after the
        // data sync and not itself fsynced.
        let mut index_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&seg.index_path)
            .await
            .map_err(|e| map_io("index open", e))?;
        index_file
            .write_all(&index_records)
            .await
            .map_err(|e| map_io("index write", e))?;

        seg.len_bytes += frames.len() as u64;
        state.total_bytes += frames.len() as u64;
        state.last_id = Some(batch[batch.len() - 1].id);
        Ok(())
    }

    async fn scan(
        &self,
        from: EventId,
        limit: usize,
        filter: &EventFilter,
    ) -> BridgeResult<Vec<Event>> {
        let segments: Vec<SegmentInfo> = self.state.read().await.segments.clone();
        // Start at the last segment whose first id is <= from; earlier
        // segments cannot contain anything past the cursor.
        let start = segments.partition_point(|s| s.first_id <= from).saturating_sub(1);

        let mut out = Vec::new();
        let mut prev_hash: Option<bridge_types::ChainDigest> = None;
        for seg in &segments[start..] {
            let offset = self.seek_offset(seg, from).await;
            for event in self.load_segment(seg, offset).await? {
                // Linkage check across the events this scan actually decodes.
                if let Some(prev) = prev_hash {
                    if event.integrity.prev != prev {
                        return Err(BridgeError::IntegrityBreak(format!(
                            "chain break before event {}",
                            event.id
                        )));
                    }
                }
                prev_hash = Some(event.integrity.hash);

                if event.id > from && filter.matches(&event) {
                    out.push(event);
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
            // Chain linkage does not carry across a segment seek: the next
            // segment starts a fresh local check.
            prev_hash = None;
        }
        Ok(out)
    }

    async fn recover(&self) -> BridgeResult<RecoveredTail> {
        let mut state = self.state.write().await;
        let mut torn_discarded = 0usize;

        // Walk segments from the tail, dropping ones with no intact frame.
        while let Some(seg) = state.segments.last().cloned() {
            let bytes = fs::read(&seg.path)
                .await
                .map_err(|e| map_io("segment read", e))?;
            let parsed = parse_segment(&bytes);

            // Verify the chain within the segment; truncate at the first
            // frame that fails to extend it.
            let mut intact: Vec<(u64, Event)> = Vec::new();
            let mut valid_len = 0u64;
            for (offset, event) in parsed.events {
                let prev = match intact.last() {
                    Some((_, prev_event)) => prev_event.integrity.hash,
                    None => event.integrity.prev, // segment head links to the prior segment
                };
                match event.verify_chain(&prev) {
                    Ok(()) => {
                        valid_len = offset + frame_len(&bytes, offset);
                        intact.push((offset, event));
                    }
                    Err(_) => {
                        torn_discarded += 1;
                        break;
                    }
                }
            }
            torn_discarded += if parsed.torn_tail { 1 } else { 0 };

            if intact.is_empty() {
                warn!(segment = %seg.path.display(), "discarding segment with no intact frames");
                let _ = fs::remove_file(&seg.path).await;
                let _ = fs::remove_file(&seg.index_path).await;
                state.total_bytes = state.total_bytes.saturating_sub(seg.len_bytes);
                state.segments.pop();
                continue;
            }

            if valid_len < bytes.len() as u64 {
                info!(
                    segment = %seg.path.display(),
                    torn_bytes = bytes.len() as u64 - valid_len,
                    "truncating torn tail"
                );
                truncate_file(&seg.path, valid_len).await?;
                // Rebuild the tail segment's index from the intact frames.
                let mut index_bytes = Vec::new();
                for (offset, event) in &intact {
                    index_bytes.extend_from_slice(&encode_index_record(event.id, *offset));
                }
                fs::write(&seg.index_path, index_bytes)
                    .await
                    .map_err(|e| map_io("index rewrite", e))?;
                let delta = seg.len_bytes - valid_len;
                let tail = state.segments.last_mut().expect("segment exists");
                tail.len_bytes = valid_len;
                state.total_bytes = state.total_bytes.saturating_sub(delta);
            }

            let (_, last_event) = intact.last().expect("non-empty");
            state.last_id = Some(last_event.id);
            return Ok(RecoveredTail {
                last_id: Some(last_event.id),
                chain_head: last_event.integrity.hash,
                torn_discarded,
            });
        }

        Ok(RecoveredTail { torn_discarded, ..RecoveredTail::empty() })
    }

    async fn size_bytes(&self) -> BridgeResult<u64> {
        Ok(self.state.read().await.total_bytes)
    }
}

/// Length of the frame starting at `offset`, including its length prefix.
fn frame_len(bytes: &[u8], offset: u64) -> u64 {
    let pos = offset as usize;
    let len =
        u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]) as u64;
    4 + len
}

async fn truncate_file(path: &Path, len: u64) -> BridgeResult<()> {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| map_io("truncate open", e))?;
    file.set_len(len).await.map_err(|e| map_io("truncate", e))?;
    file.sync_data().await.map_err(|e| map_io("truncate fsync", e))?;
    Ok(())
}

fn map_io(op: &str, e: std::io::Error) -> BridgeError {
    if e.kind() == std::io::ErrorKind::StorageFull {
        BridgeError::Degraded(format!("{op}: storage full"))
    } else {
        BridgeError::Internal(format!("{op}: {e}"))
    }
}

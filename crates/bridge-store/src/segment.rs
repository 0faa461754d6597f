//! On-disk segment format: length-prefixed MessagePack frames plus an
//! offset index sidecar.
//!
//! A segment file `segment-<first_id>.log` holds consecutive frames of
//! `u32-le length ‖ rmp(Event)`. Integrity comes from the blake3 chain
//! stored inside each event, not from per-frame checksums: a torn tail is
//! detected because its frame fails to decode or fails to extend the chain.
//! The sidecar `segment-<first_id>.idx` holds fixed-width `(id, offset)`
//! records and is a rebuildable optimization.

use bridge_types::{BridgeError, BridgeResult, Event, EventId};

/// Fixed width of one index record: ns(8) + seq(4) + node(2) + offset(8).
pub(crate) const INDEX_RECORD_LEN: usize = 22;

/// File name of the segment whose first event is `id`.
pub(crate) fn segment_file_name(id: EventId) -> String {
    format!("segment-{id}.log")
}

/// File name of the index sidecar for the segment starting at `id`.
pub(crate) fn index_file_name(id: EventId) -> String {
    format!("segment-{id}.idx")
}

/// Parse the first event id out of a segment file name.
pub(crate) fn parse_segment_name(name: &str) -> Option<EventId> {
    name.strip_prefix("segment-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

//─────────────────────────────
//  Frames
//─────────────────────────────

/// Encode one event as a length-prefixed frame.
pub(crate) fn encode_frame(event: &Event) -> BridgeResult<Vec<u8>> {
    let body = rmp_serde::to_vec_named(event)
        .map_err(|e| BridgeError::Internal(format!("frame encode failed: {e}")))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Result of parsing a segment's bytes.
pub(crate) struct ParsedSegment {
    /// Decoded events with the byte offset each frame starts at.
    pub events: Vec<(u64, Event)>,
    /// Offset one past the last intact frame; bytes beyond this are torn.
    pub valid_len: u64,
    /// Whether trailing bytes failed to decode.
    pub torn_tail: bool,
}

/// Decode consecutive frames from raw segment bytes, stopping at the first
/// frame that cannot be decoded. The caller decides what to do with the
/// torn remainder (recovery truncates it; reads treat it as an error).
pub(crate) fn parse_segment(bytes: &[u8]) -> ParsedSegment {
    let mut events = Vec::new();
    let mut pos: usize = 0;
    loop {
        if pos + 4 > bytes.len() {
            break;
        }
        let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let start = pos + 4;
        let end = match start.checked_add(len) {
            Some(end) if end <= bytes.len() => end,
            _ => break,
        };
        match rmp_serde::from_slice::<Event>(&bytes[start..end]) {
            Ok(event) => {
                events.push((pos as u64, event));
                pos = end;
            }
            Err(_) => break,
        }
    }
    ParsedSegment {
        events,
        valid_len: pos as u64,
        torn_tail: pos < bytes.len(),
    }
}

//─────────────────────────────
//  Index records
//─────────────────────────────

/// Encode one `(id, offset)` index record.
pub(crate) fn encode_index_record(id: EventId, offset: u64) -> [u8; INDEX_RECORD_LEN] {
    let mut rec = [0u8; INDEX_RECORD_LEN];
    rec[0..8].copy_from_slice(&id.ns.to_le_bytes());
    rec[8..12].copy_from_slice(&id.seq.to_le_bytes());
    rec[12..14].copy_from_slice(&id.node.to_le_bytes());
    rec[14..22].copy_from_slice(&offset.to_le_bytes());
    rec
}

/// Decode index records, ignoring a torn trailing record.
pub(crate) fn parse_index(bytes: &[u8]) -> Vec<(EventId, u64)> {
    bytes
        .chunks_exact(INDEX_RECORD_LEN)
        .map(|rec| {
            let ns = u64::from_le_bytes(rec[0..8].try_into().expect("chunk width"));
            let seq = u32::from_le_bytes(rec[8..12].try_into().expect("chunk width"));
            let node = u16::from_le_bytes(rec[12..14].try_into().expect("chunk width"));
            let offset = u64::from_le_bytes(rec[14..22].try_into().expect("chunk width"));
            (EventId::new(ns, seq, node), offset)
        })
        .collect()
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

    #[test]
    fn segment_name_round_trip() {
        let id = EventId::new(123_456, 7, 1);
        let name = segment_file_name(id);
        assert_eq!(parse_segment_name(&name), Some(id));
        assert_eq!(parse_segment_name("segment-junk.log"), None);
        assert_eq!(parse_segment_name("other.log"), None);
    }

    #[test]
    fn frame_round_trip() {
        let e1 = sealed(1);
        let e2 = sealed(2);
        let mut bytes = encode_frame(&e1).unwrap();
        bytes.extend(encode_frame(&e2).unwrap());

        let parsed = parse_segment(&bytes);
        assert_eq!(parsed.events.len(), 2);
        assert!(!parsed.torn_tail);
        assert_eq!(parsed.valid_len, bytes.len() as u64);
        assert_eq!(parsed.events[0].1, e1);
        assert_eq!(parsed.events[1].1, e2);
    }

    #[test]
    fn torn_tail_is_detected_and_prefix_kept() {
        let e1 = sealed(1);
        let mut bytes = encode_frame(&e1).unwrap();
        let intact = bytes.len() as u64;
        // Simulate a crash mid-write: a frame header promising more bytes
        // than were flushed.
        bytes.extend_from_slice(&(1_000u32).to_le_bytes());
        bytes.extend_from_slice(b"partial");

        let parsed = parse_segment(&bytes);
        assert_eq!(parsed.events.len(), 1);
        assert!(parsed.torn_tail);
        assert_eq!(parsed.valid_len, intact);
    }

    #[test]
    fn index_round_trip_ignores_torn_record() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_index_record(EventId::new(1, 0, 0), 0));
        bytes.extend_from_slice(&encode_index_record(EventId::new(2, 0, 0), 100));
        bytes.extend_from_slice(&[0xff; 5]); // torn tail

        let index = parse_index(&bytes);
        assert_eq!(index.len(), 2);
        assert_eq!(index[1], (EventId::new(2, 0, 0), 100));
    }
}

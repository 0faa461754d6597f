//! Event identifiers and the hybrid logical clock that mints them.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Identifier of the node that assigned an event id.
///
/// The bridge assumes a single writer node, but every id reserves room for a
/// node component so logs from distinct nodes remain totally ordered if they
/// are ever interleaved.
pub type NodeId = u16;

//─────────────────────────────
//  Event id
//─────────────────────────────

/// Totally ordered identifier of a committed event.
///
/// The triple `(ns, seq, node)` is compared lexicographically. `ns` comes
/// from a hybrid logical clock and never decreases; `seq` disambiguates
/// events minted within the same nanosecond tick; `node` breaks the
/// (theoretical) remaining ties.
///
/// Serialized everywhere (JSON, query strings, `Last-Event-ID`) in its
/// zero-padded hex rendering, whose lexicographic order equals the numeric
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    /// Hybrid-logical-clock nanosecond component.
    pub ns: u64,
    /// Same-tick sequence number, starting at 0.
    pub seq: u32,
    /// Assigning node.
    pub node: NodeId,
}

impl EventId {
    /// The id ordered before every assignable id; used as a "from the
    /// beginning" cursor.
    pub const ZERO: EventId = EventId { ns: 0, seq: 0, node: 0 };

    /// Construct an id from its components.
    pub const fn new(ns: u64, seq: u32, node: NodeId) -> Self {
        Self { ns, seq, node }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Zero-padded hex so the textual order equals the numeric order.
        // This is what `Last-Event-ID` carries on the stream surface.
        write!(f, "{:016x}-{:08x}-{:04x}", self.ns, self.seq, self.node)
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for EventId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        fn parse<'a>(p: Option<&'a str>, s: &str) -> Result<&'a str, BridgeError> {
            p.ok_or_else(|| BridgeError::SchemaViolation(format!("malformed event id: {s}")))
        }
        let ns = u64::from_str_radix(parse(parts.next(), s)?, 16)
            .map_err(|_| BridgeError::SchemaViolation(format!("malformed event id: {s}")))?;
        let seq = u32::from_str_radix(parse(parts.next(), s)?, 16)
            .map_err(|_| BridgeError::SchemaViolation(format!("malformed event id: {s}")))?;
        let node = u16::from_str_radix(parse(parts.next(), s)?, 16)
            .map_err(|_| BridgeError::SchemaViolation(format!("malformed event id: {s}")))?;
        Ok(Self { ns, seq, node })
    }
}

//─────────────────────────────
//  Hybrid logical clock
//─────────────────────────────

/// Hybrid logical clock owned by the single log writer.
///
/// `tick(now)` assigns ids that are strictly monotonic even when the
/// underlying clock source stalls or jumps backwards: the ns component is
/// `max(now, last_ns + 1)` whenever the physical reading does not advance,
/// and the sequence counter resets only when it does.
#[derive(Debug)]
pub struct HlcClock {
    node: NodeId,
    last_ns: u64,
    last_seq: u32,
}

impl HlcClock {
    /// Create a clock for `node`, resuming from the last durably assigned id
    /// (or [`EventId::ZERO`] for an empty log).
    pub fn resume(node: NodeId, last: EventId) -> Self {
        Self { node, last_ns: last.ns, last_seq: last.seq }
    }

    /// Assign the next id given a physical clock reading of `now_ns`.
    pub fn tick(&mut self, now_ns: u64) -> EventId {
        if now_ns > self.last_ns {
            self.last_ns = now_ns;
            self.last_seq = 0;
        } else {
            // Clock stalled or regressed: stay on the logical tick and
            // disambiguate by sequence, rolling ns forward on overflow.
            match self.last_seq.checked_add(1) {
                Some(seq) => self.last_seq = seq,
                None => {
                    self.last_ns += 1;
                    self.last_seq = 0;
                }
            }
        }
        EventId { ns: self.last_ns, seq: self.last_seq, node: self.node }
    }

    /// Advance the clock past an observed peer timestamp.
    ///
    /// After `observe(peer)`, every id assigned by this clock orders after
    /// `peer`. This is the receive-side half of the hybrid clock protocol.
    pub fn observe(&mut self, peer_ns: u64) {
        if peer_ns >= self.last_ns {
            self.last_ns = peer_ns + 1;
            self.last_seq = 0;
        }
    }

    /// The ns component of the most recently assigned id.
    pub fn last_ns(&self) -> u64 {
        self.last_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn display_round_trip() {
        let id = EventId::new(1_700_000_000_123_456_789, 42, 3);
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_uses_the_string_form() {
        let id = EventId::new(5, 1, 2);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn textual_order_matches_numeric_order() {
        let a = EventId::new(10, 999, 0);
        let b = EventId::new(11, 0, 0);
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn tick_is_strictly_monotonic_under_regression() {
        let mut clock = HlcClock::resume(0, EventId::ZERO);
        let a = clock.tick(100);
        let b = clock.tick(50); // clock jumped backwards
        let c = clock.tick(100); // clock stalled
        let d = clock.tick(200);
        assert!(a < b && b < c && c < d);
        assert_eq!(b.ns, 100);
        assert_eq!(d, EventId::new(200, 0, 0));
    }

    #[test]
    fn seq_resets_when_clock_advances() {
        let mut clock = HlcClock::resume(7, EventId::ZERO);
        let a = clock.tick(10);
        let b = clock.tick(10);
        let c = clock.tick(20);
        assert_eq!((a.seq, b.seq, c.seq), (0, 1, 0));
        assert_eq!(c.node, 7);
    }

    #[test]
    fn observe_advances_past_peer() {
        let mut clock = HlcClock::resume(0, EventId::ZERO);
        clock.tick(100);
        clock.observe(5_000);
        let id = clock.tick(100);
        assert!(id.ns > 5_000);
    }

    proptest! {
        #[test]
        fn ids_are_strictly_increasing(readings in proptest::collection::vec(0u64..1_000, 1..200)) {
            let mut clock = HlcClock::resume(0, EventId::ZERO);
            let mut prev = EventId::ZERO;
            for now in readings {
                let id = clock.tick(now);
                prop_assert!(id > prev);
                prev = id;
            }
        }

        #[test]
        fn parse_display_round_trip(ns in any::<u64>(), seq in any::<u32>(), node in any::<u16>()) {
            let id = EventId::new(ns, seq, node);
            let back: EventId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, back);
        }
    }
}

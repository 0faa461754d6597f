//! Stream identifiers – named partitions of the event log.

use serde::{Deserialize, Serialize};

/// Partition key of an event.
///
/// Streams give every aggregate its own totally ordered sub-log: all events
/// for elicitation X live on `elicitation:X`, all events about an agent's
/// session live on `agent:X`, and so on. Filters match on exact stream or
/// stream prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Stream carrying an agent's session and security events.
    pub fn agent(id: impl AsRef<str>) -> Self {
        Self(format!("agent:{}", id.as_ref()))
    }

    /// Stream carrying one elicitation's lifecycle.
    pub fn elicitation(id: impl AsRef<str>) -> Self {
        Self(format!("elicitation:{}", id.as_ref()))
    }

    /// Stream carrying validation traffic for one request fingerprint.
    pub fn validation(fingerprint: impl AsRef<str>) -> Self {
        Self(format!("validation:{}", fingerprint.as_ref()))
    }

    /// Stream carrying system-wide control events (degradation, integrity).
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Stream carrying file mutation events from the virtual filesystem.
    pub fn file(path: impl AsRef<str>) -> Self {
        Self(format!("file:{}", path.as_ref()))
    }

    /// Construct from a raw partition key.
    pub fn raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the raw partition key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix match used by subscription and read filters.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

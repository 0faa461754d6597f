//! System-wide degradation state.

use serde::{Deserialize, Serialize};

/// Authoritative operating state of the bridge.
///
/// All components read the current state atomically (via a watch channel
/// owned by the degradation controller) and adjust which operations they
/// accept. Transitions are themselves events on the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    /// Full service.
    Normal,
    /// Writes are refused except recovery/control traffic; reads continue.
    Emergency,
    /// Operator-supervised path back to normal operation.
    Recovering,
}

impl SystemState {
    /// Whether general (non-recovery) writes are accepted in this state.
    pub fn accepts_writes(&self) -> bool {
        matches!(self, SystemState::Normal)
    }

    /// Whether new elicitations may be created in this state.
    pub fn accepts_elicitation_create(&self) -> bool {
        matches!(self, SystemState::Normal)
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SystemState::Normal => "normal",
            SystemState::Emergency => "emergency",
            SystemState::Recovering => "recovering",
        };
        f.write_str(s)
    }
}

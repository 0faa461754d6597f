//! Validation requests and decisions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use bridge_types::{
    canonical_json, AgentId, BridgeResult, DecidedBy, Fingerprint, RiskLevel, TierTrace, Verdict,
};

/// A request to validate one tool invocation before it executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Tool the agent wants to invoke.
    pub tool: String,
    /// Tool arguments; canonicalized before fingerprinting.
    pub args: Value,
    /// Invoking agent.
    pub agent: AgentId,
}

impl ValidationRequest {
    /// Cache key: `blake3(tool ‖ 0x00 ‖ canonical(args))`.
    ///
    /// The invoking agent is deliberately not part of the key: identical
    /// actions get identical answers, which is what makes the cache and the
    /// stampede coalescing effective.
    pub fn fingerprint(&self) -> BridgeResult<Fingerprint> {
        let mut input = Vec::with_capacity(self.tool.len() + 64);
        input.extend_from_slice(self.tool.as_bytes());
        input.push(0);
        input.extend_from_slice(&canonical_json(&self.args)?);
        Ok(Fingerprint::of_bytes(&input))
    }
}

/// Outcome of a validation check, with the audit trail of every tier
/// consulted on the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Final outcome. Never `Escalate`: escalation is internal.
    pub verdict: Verdict,
    /// Assessed risk.
    pub risk: RiskLevel,
    /// Explanation suitable for audit.
    pub reasoning: String,
    /// Tier that produced the answer.
    pub decided_by: DecidedBy,
    /// Tiers consulted, in order.
    pub trace: Vec<TierTrace>,
}

impl Decision {
    /// Whether the requested action may proceed.
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }
}

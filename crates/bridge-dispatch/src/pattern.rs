//! Pattern tier: a learned classifier behind a trait.
//!
//! The dispatcher only trusts this tier when its confidence clears the
//! configured threshold; anything less falls through to expert escalation.
//! The default implementation is a deterministic feature scorer so the tier
//! works out of the box; a real model plugs in behind the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use bridge_types::{BridgeResult, RiskLevel, Verdict};

use crate::request::ValidationRequest;

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternScore {
    /// Proposed outcome; never `Escalate` (low confidence expresses that).
    pub verdict: Verdict,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Assessed risk.
    pub risk: RiskLevel,
    /// Explanation recorded in the decision trace.
    pub reasoning: String,
}

/// A classifier over request features.
#[async_trait]
pub trait PatternClassifier: Send + Sync {
    /// Score one request.
    async fn classify(&self, req: &ValidationRequest) -> BridgeResult<PatternScore>;
}

//─────────────────────────────
//  Default feature scorer
//─────────────────────────────

/// Deterministic scorer over tool names and argument text.
///
/// Known-safe tools approve with high confidence, known-dangerous argument
/// markers deny with high confidence, and everything else lands under the
/// acceptance threshold so it escalates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureClassifier {
    /// Tools considered side-effect free.
    pub safe_tools: Vec<String>,
    /// Argument substrings that indicate destructive intent.
    pub danger_markers: Vec<String>,
}

impl Default for FeatureClassifier {
    fn default() -> Self {
        Self {
            safe_tools: vec![
                "file_read".into(),
                "grep".into(),
                "glob".into(),
                "list_dir".into(),
            ],
            danger_markers: vec![
                "rm -rf".into(),
                "sudo ".into(),
                "mkfs".into(),
                "> /dev/".into(),
                "chmod 777".into(),
                "curl | sh".into(),
            ],
        }
    }
}

#[async_trait]
impl PatternClassifier for FeatureClassifier {
    async fn classify(&self, req: &ValidationRequest) -> BridgeResult<PatternScore> {
        let args_text = req.args.to_string();

        if let Some(marker) = self.danger_markers.iter().find(|m| args_text.contains(m.as_str()))
        {
            return Ok(PatternScore {
                verdict: Verdict::Denied,
                confidence: 0.95,
                risk: RiskLevel::Critical,
                reasoning: format!("arguments match destructive marker {marker:?}"),
            });
        }
        if self.safe_tools.iter().any(|t| t == &req.tool) {
            return Ok(PatternScore {
                verdict: Verdict::Approved,
                confidence: 0.93,
                risk: RiskLevel::Low,
                reasoning: format!("tool {:?} is side-effect free", req.tool),
            });
        }
        Ok(PatternScore {
            verdict: Verdict::Approved,
            confidence: 0.5,
            risk: RiskLevel::Medium,
            reasoning: "no strong feature matched".into(),
        })
    }
}

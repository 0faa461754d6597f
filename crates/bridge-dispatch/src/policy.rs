//! Policy tier: ordered declarative rules over the structured request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use bridge_types::RiskLevel;

use crate::request::ValidationRequest;

/// What a matched rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    /// Approve without consulting later tiers.
    Allow,
    /// Deny without consulting later tiers.
    Deny,
    /// Skip the pattern tier and go straight to an expert.
    Escalate,
}

/// Predicate over one dotted path into the argument object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgPredicate {
    /// Dotted path, e.g. `cmd` or `options.recursive`.
    pub path: String,
    /// Matches when the value at `path` equals this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    /// Matches when the string at `path` contains this substring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
}

impl ArgPredicate {
    fn matches(&self, args: &Value) -> bool {
        let Some(value) = lookup_path(args, &self.path) else { return false };
        if let Some(expected) = &self.equals {
            if value != expected {
                return false;
            }
        }
        if let Some(needle) = &self.contains {
            match value.as_str() {
                Some(s) if s.contains(needle.as_str()) => {}
                _ => return false,
            }
        }
        true
    }
}

/// One declarative rule. All present clauses must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule name, recorded in the decision trace.
    pub name: String,
    /// Tool pattern: exact name, or a prefix ending in `*`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Restrict to one invoking agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Predicates over the argument object.
    #[serde(default)]
    pub args: Vec<ArgPredicate>,
    /// Decision when the rule matches.
    pub effect: PolicyEffect,
    /// Risk attached to the decision.
    pub risk: RiskLevel,
    /// Explanation recorded in the decision.
    pub reason: String,
}

impl PolicyRule {
    fn matches(&self, req: &ValidationRequest) -> bool {
        if let Some(pattern) = &self.tool {
            if !glob_matches(pattern, &req.tool) {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            if req.agent.as_str() != agent {
                return false;
            }
        }
        self.args.iter().all(|p| p.matches(&req.args))
    }
}

fn glob_matches(pattern: &str, tool: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => tool.starts_with(prefix),
        None => pattern == tool,
    }
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// A matched rule's contribution to the decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyMatch {
    /// The effect to apply.
    pub effect: PolicyEffect,
    /// Risk from the rule.
    pub risk: RiskLevel,
    /// Name of the matched rule.
    pub rule: String,
    /// The rule's reason text.
    pub reason: String,
}

/// Ordered rule set, first match wins. Hot-swappable: a `PolicyUpdated`
/// event carries a revision and the dispatcher replaces the set atomically.
pub struct PolicyTier {
    rules: RwLock<(u64, Vec<PolicyRule>)>,
}

impl PolicyTier {
    /// Create the tier with an initial rule set at revision 0.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules: RwLock::new((0, rules)) }
    }

    /// Evaluate rules in order; `None` means no rule matched.
    pub async fn evaluate(&self, req: &ValidationRequest) -> Option<PolicyMatch> {
        let guard = self.rules.read().await;
        guard.1.iter().find(|r| r.matches(req)).map(|r| PolicyMatch {
            effect: r.effect,
            risk: r.risk,
            rule: r.name.clone(),
            reason: r.reason.clone(),
        })
    }

    /// Replace the rule set if `revision` is newer.
    pub async fn replace(&self, revision: u64, rules: Vec<PolicyRule>) -> bool {
        let mut guard = self.rules.write().await;
        if revision <= guard.0 && guard.0 != 0 {
            return false;
        }
        *guard = (revision, rules);
        true
    }

    /// Current revision.
    pub async fn revision(&self) -> u64 {
        self.rules.read().await.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_types::AgentId;
    use serde_json::json;

    fn req(tool: &str, args: Value) -> ValidationRequest {
        ValidationRequest { tool: tool.into(), args, agent: AgentId::from("alpha") }
    }

    fn rules() -> Vec<PolicyRule> {
        vec![
            PolicyRule {
                name: "deny-force-remove".into(),
                tool: Some("shell".into()),
                agent: None,
                args: vec![ArgPredicate {
                    path: "cmd".into(),
                    equals: None,
                    contains: Some("rm -rf".into()),
                }],
                effect: PolicyEffect::Deny,
                risk: RiskLevel::Critical,
                reason: "recursive force removal".into(),
            },
            PolicyRule {
                name: "allow-readonly".into(),
                tool: Some("file_read*".into()),
                agent: None,
                args: vec![],
                effect: PolicyEffect::Allow,
                risk: RiskLevel::Low,
                reason: "read-only tool".into(),
            },
        ]
    }

    #[tokio::test]
    async fn first_match_wins_in_order() {
        let tier = PolicyTier::new(rules());

        let denied = tier
            .evaluate(&req("shell", json!({"cmd": "rm -rf /"})))
            .await
            .unwrap();
        assert_eq!(denied.effect, PolicyEffect::Deny);
        assert_eq!(denied.rule, "deny-force-remove");

        let allowed = tier
            .evaluate(&req("file_read_lines", json!({"path": "a.rs"})))
            .await
            .unwrap();
        assert_eq!(allowed.effect, PolicyEffect::Allow);

        assert!(tier.evaluate(&req("shell", json!({"cmd": "ls"}))).await.is_none());
    }

    #[tokio::test]
    async fn nested_path_predicates() {
        let tier = PolicyTier::new(vec![PolicyRule {
            name: "deny-recursive".into(),
            tool: None,
            agent: None,
            args: vec![ArgPredicate {
                path: "options.recursive".into(),
                equals: Some(json!(true)),
                contains: None,
            }],
            effect: PolicyEffect::Escalate,
            risk: RiskLevel::High,
            reason: "recursive operation".into(),
        }]);

        assert!(tier
            .evaluate(&req("delete", json!({"options": {"recursive": true}})))
            .await
            .is_some());
        assert!(tier
            .evaluate(&req("delete", json!({"options": {"recursive": false}})))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn stale_revision_is_ignored() {
        let tier = PolicyTier::new(rules());
        assert!(tier.replace(5, vec![]).await);
        assert!(!tier.replace(3, rules()).await);
        assert_eq!(tier.revision().await, 5);
        assert!(tier.evaluate(&req("file_read", json!({}))).await.is_none());
    }
}

//! Capability scope grammar.
//!
//! A scope is `<base>[:<qualifier>]` where the base names an operation
//! family and the qualifier bounds the resources it reaches: `:own` (the
//! agent's own streams), `:all`, or a literal stream prefix. The grammar is
//! closed; unknown bases are rejected at parse time rather than silently
//! granting nothing.

use serde::{Deserialize, Serialize};

use bridge_types::{AgentId, BridgeError, BridgeResult, StreamId};

/// Operation family a scope applies to. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeBase {
    /// Read events from the log and subscribe to streams.
    EventsRead,
    /// Append events.
    EventsWrite,
    /// Open elicitations toward other agents.
    ElicitationCreate,
    /// Respond to elicitations addressed to the agent.
    ElicitationRespond,
    /// Submit validation requests to the speed layer.
    ValidationCheck,
    /// Drive degradation state transitions.
    AdminDegrade,
}

impl ScopeBase {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "events.read" => ScopeBase::EventsRead,
            "events.write" => ScopeBase::EventsWrite,
            "elicitation.create" => ScopeBase::ElicitationCreate,
            "elicitation.respond" => ScopeBase::ElicitationRespond,
            "validation.check" => ScopeBase::ValidationCheck,
            "admin.degrade" => ScopeBase::AdminDegrade,
            _ => return None,
        })
    }

    /// Wire spelling of the base.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeBase::EventsRead => "events.read",
            ScopeBase::EventsWrite => "events.write",
            ScopeBase::ElicitationCreate => "elicitation.create",
            ScopeBase::ElicitationRespond => "elicitation.respond",
            ScopeBase::ValidationCheck => "validation.check",
            ScopeBase::AdminDegrade => "admin.degrade",
        }
    }
}

/// Resource bound of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qualifier {
    /// The agent's own streams only. This is the default.
    Own,
    /// Every stream.
    All,
    /// Streams under a literal prefix.
    Stream(String),
}

/// What an operation is about to touch, checked against a scope.
#[derive(Debug, Clone)]
pub struct ScopeTarget<'a> {
    /// The authenticated caller.
    pub agent: &'a AgentId,
    /// Stream the operation touches, when it touches one.
    pub stream: Option<&'a StreamId>,
}

/// One parsed capability scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Operation family.
    pub base: ScopeBase,
    /// Resource bound.
    pub qualifier: Qualifier,
}

impl Scope {
    /// Parse `<base>[:own|:all|:<stream-prefix>]`.
    pub fn parse(s: &str) -> BridgeResult<Self> {
        let (base_str, qualifier) = match s.split_once(':') {
            Some((base, "own")) => (base, Qualifier::Own),
            Some((base, "all")) => (base, Qualifier::All),
            Some((base, prefix)) if !prefix.is_empty() => {
                (base, Qualifier::Stream(prefix.to_string()))
            }
            Some((_, _)) => {
                return Err(BridgeError::SchemaViolation(format!("empty scope qualifier: {s}")))
            }
            None => (s, Qualifier::Own),
        };
        let base = ScopeBase::parse(base_str)
            .ok_or_else(|| BridgeError::SchemaViolation(format!("unknown scope: {s}")))?;
        Ok(Self { base, qualifier })
    }

    /// Whether this scope permits `base` against `target`.
    pub fn permits(&self, base: ScopeBase, target: &ScopeTarget<'_>) -> bool {
        if self.base != base {
            return false;
        }
        match (&self.qualifier, target.stream) {
            (Qualifier::All, _) => true,
            // Operations with no stream target (health, validation submit,
            // admin transitions) are bounded by the base alone.
            (_, None) => true,
            (Qualifier::Own, Some(stream)) => {
                stream.has_prefix(&format!("agent:{}", target.agent))
            }
            (Qualifier::Stream(prefix), Some(stream)) => stream.has_prefix(prefix),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.qualifier {
            Qualifier::Own => write!(f, "{}:own", self.base.as_str()),
            Qualifier::All => write!(f, "{}:all", self.base.as_str()),
            Qualifier::Stream(p) => write!(f, "{}:{}", self.base.as_str(), p),
        }
    }
}

//─────────────────────────────
//  Capability sets
//─────────────────────────────

/// The parsed capabilities carried by one token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    scopes: Vec<Scope>,
}

impl CapabilitySet {
    /// Parse a list of scope strings, rejecting any unknown entry.
    pub fn parse(raw: &[String]) -> BridgeResult<Self> {
        let scopes = raw.iter().map(|s| Scope::parse(s)).collect::<BridgeResult<Vec<_>>>()?;
        Ok(Self { scopes })
    }

    /// Whether any held scope permits `base` against `target`.
    pub fn allows(&self, base: ScopeBase, target: &ScopeTarget<'_>) -> bool {
        self.scopes.iter().any(|s| s.permits(base, target))
    }

    /// The held scopes.
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target<'a>(agent: &'a AgentId, stream: Option<&'a StreamId>) -> ScopeTarget<'a> {
        ScopeTarget { agent, stream }
    }

    #[test]
    fn parse_grammar() {
        assert_eq!(
            Scope::parse("events.read").unwrap(),
            Scope { base: ScopeBase::EventsRead, qualifier: Qualifier::Own }
        );
        assert_eq!(
            Scope::parse("events.write:all").unwrap().qualifier,
            Qualifier::All
        );
        assert_eq!(
            Scope::parse("events.read:elicitation:").unwrap().qualifier,
            Qualifier::Stream("elicitation:".into())
        );
        assert!(Scope::parse("events.delete").is_err());
        assert!(Scope::parse("events.read:").is_err());
    }

    #[test]
    fn own_is_bounded_to_the_callers_streams() {
        let alice = AgentId::from("alice");
        let own_stream = StreamId::agent("alice");
        let other_stream = StreamId::agent("bob");
        let scope = Scope::parse("events.write:own").unwrap();

        assert!(scope.permits(ScopeBase::EventsWrite, &target(&alice, Some(&own_stream))));
        assert!(!scope.permits(ScopeBase::EventsWrite, &target(&alice, Some(&other_stream))));
    }

    #[test]
    fn stream_prefix_qualifier() {
        let alice = AgentId::from("alice");
        let scope = Scope::parse("events.read:file:src/").unwrap();
        let src = StreamId::file("src/main.rs");
        let docs = StreamId::file("docs/readme.md");

        assert!(scope.permits(ScopeBase::EventsRead, &target(&alice, Some(&src))));
        assert!(!scope.permits(ScopeBase::EventsRead, &target(&alice, Some(&docs))));
    }

    #[test]
    fn capability_set_is_a_union() {
        let alice = AgentId::from("alice");
        let caps = CapabilitySet::parse(&[
            "events.read:all".to_string(),
            "elicitation.respond".to_string(),
        ])
        .unwrap();

        let any = StreamId::agent("bob");
        assert!(caps.allows(ScopeBase::EventsRead, &target(&alice, Some(&any))));
        assert!(caps.allows(ScopeBase::ElicitationRespond, &target(&alice, None)));
        assert!(!caps.allows(ScopeBase::AdminDegrade, &target(&alice, None)));

        assert!(CapabilitySet::parse(&["nope".to_string()]).is_err());
    }
}

//! Per-agent, per-operation-class token buckets.
//!
//! Refills are computed on access from elapsed time; there are no background
//! timers. Exceeding a bucket yields `RateLimited` with a retry hint, and
//! the caller may record a security event, sampled so a misbehaving agent
//! cannot spam the log with its own violations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use bridge_types::{AgentId, BridgeError, BridgeResult};

/// Operation classes with independent buckets.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpClass {
    ElicitationCreate,
    ElicitationRespond,
    EventsWrite,
    ValidationCheck,
}

/// Sustained rate and burst capacity for one class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Tokens refilled per minute.
    pub per_minute: f64,
    /// Bucket capacity (burst).
    pub burst: u64,
}

/// Bucket configuration per operation class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimits {
    /// Bucket for opening elicitations.
    pub elicitation_create: BucketConfig,
    /// Bucket for responding to elicitations.
    pub elicitation_respond: BucketConfig,
    /// Bucket for event appends.
    pub events_write: BucketConfig,
    /// Bucket for validation checks.
    pub validation_check: BucketConfig,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            elicitation_create: BucketConfig { per_minute: 10.0, burst: 20 },
            elicitation_respond: BucketConfig { per_minute: 20.0, burst: 40 },
            events_write: BucketConfig { per_minute: 100.0, burst: 200 },
            validation_check: BucketConfig { per_minute: 120.0, burst: 240 },
        }
    }
}

impl RateLimits {
    fn for_class(&self, class: OpClass) -> BucketConfig {
        match class {
            OpClass::ElicitationCreate => self.elicitation_create,
            OpClass::ElicitationRespond => self.elicitation_respond,
            OpClass::EventsWrite => self.events_write,
            OpClass::ValidationCheck => self.validation_check,
        }
    }
}

#[derive(Debug, Clone)]
struct BucketState {
    tokens: f64,
    last_refill: DateTime<Utc>,
    /// Last time a violation on this bucket was reported; used for sampling.
    last_reported: Option<DateTime<Utc>>,
}

impl BucketState {
    fn new(config: &BucketConfig, now: DateTime<Utc>) -> Self {
        Self { tokens: config.burst as f64, last_refill: now, last_reported: None }
    }

    fn refill(&mut self, config: &BucketConfig, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        let refill_per_sec = config.per_minute / 60.0;
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(config.burst as f64);
        self.last_refill = now;
    }

    fn try_consume(&mut self, config: &BucketConfig, now: DateTime<Utc>) -> Result<(), Duration> {
        self.refill(config, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let secs = deficit / (config.per_minute / 60.0);
            Err(Duration::from_millis((secs * 1000.0).ceil() as u64))
        }
    }
}

/// Sampling window for violation reporting.
const REPORT_WINDOW_SECS: i64 = 60;

/// Token-bucket rate limiter over `(agent, class)` pairs.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    buckets: DashMap<(AgentId, OpClass), BucketState>,
}

impl RateLimiter {
    /// Create a limiter with the given per-class limits.
    pub fn new(limits: RateLimits) -> Self {
        Self { limits, buckets: DashMap::new() }
    }

    /// Charge one operation, failing with `RateLimited` when the bucket is
    /// empty.
    pub fn charge(&self, agent: &AgentId, class: OpClass) -> BridgeResult<()> {
        self.charge_at(agent, class, Utc::now())
    }

    /// Clock-injected variant of [`charge`](RateLimiter::charge) for tests.
    pub fn charge_at(
        &self,
        agent: &AgentId,
        class: OpClass,
        now: DateTime<Utc>,
    ) -> BridgeResult<()> {
        let config = self.limits.for_class(class);
        let mut bucket = self
            .buckets
            .entry((agent.clone(), class))
            .or_insert_with(|| BucketState::new(&config, now));
        bucket
            .try_consume(&config, now)
            .map_err(|retry_after| BridgeError::RateLimited { retry_after })
    }

    /// Whether a violation on `(agent, class)` should be recorded as a
    /// security event right now. At most one report per sampling window.
    pub fn sample_violation(&self, agent: &AgentId, class: OpClass) -> bool {
        self.sample_violation_at(agent, class, Utc::now())
    }

    /// Clock-injected variant of [`sample_violation`](RateLimiter::sample_violation).
    pub fn sample_violation_at(
        &self,
        agent: &AgentId,
        class: OpClass,
        now: DateTime<Utc>,
    ) -> bool {
        let config = self.limits.for_class(class);
        let mut bucket = self
            .buckets
            .entry((agent.clone(), class))
            .or_insert_with(|| BucketState::new(&config, now));
        let due = match bucket.last_reported {
            None => true,
            Some(last) => (now - last).num_seconds() >= REPORT_WINDOW_SECS,
        };
        if due {
            bucket.last_reported = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn burst_then_limited_then_refilled() {
        let limiter = RateLimiter::new(RateLimits {
            elicitation_create: BucketConfig { per_minute: 60.0, burst: 3 },
            ..RateLimits::default()
        });
        let agent = AgentId::from("alpha");
        let t0 = Utc::now();

        for _ in 0..3 {
            limiter.charge_at(&agent, OpClass::ElicitationCreate, t0).unwrap();
        }
        let err = limiter.charge_at(&agent, OpClass::ElicitationCreate, t0).unwrap_err();
        let BridgeError::RateLimited { retry_after } = err else {
            panic!("expected rate limit")
        };
        assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(1));

        // One token refills per second at 60/min.
        let t1 = t0 + ChronoDuration::milliseconds(1100);
        limiter.charge_at(&agent, OpClass::ElicitationCreate, t1).unwrap();
    }

    #[test]
    fn buckets_are_per_agent_and_class() {
        let limiter = RateLimiter::new(RateLimits {
            elicitation_create: BucketConfig { per_minute: 60.0, burst: 1 },
            ..RateLimits::default()
        });
        let t0 = Utc::now();
        let alpha = AgentId::from("alpha");
        let beta = AgentId::from("beta");

        limiter.charge_at(&alpha, OpClass::ElicitationCreate, t0).unwrap();
        assert!(limiter.charge_at(&alpha, OpClass::ElicitationCreate, t0).is_err());
        // A different agent and a different class are unaffected.
        limiter.charge_at(&beta, OpClass::ElicitationCreate, t0).unwrap();
        limiter.charge_at(&alpha, OpClass::EventsWrite, t0).unwrap();
    }

    #[test]
    fn violation_reports_are_sampled() {
        let limiter = RateLimiter::new(RateLimits::default());
        let agent = AgentId::from("alpha");
        let t0 = Utc::now();

        assert!(limiter.sample_violation_at(&agent, OpClass::EventsWrite, t0));
        assert!(!limiter.sample_violation_at(&agent, OpClass::EventsWrite, t0));
        let later = t0 + ChronoDuration::seconds(REPORT_WINDOW_SECS + 1);
        assert!(limiter.sample_violation_at(&agent, OpClass::EventsWrite, later));
    }
}

//! Per-market circuit breakers.
//!
//! Closed → Open after `failure_threshold` consecutive failures. Open →
//! HalfOpen once the recovery timeout elapses. HalfOpen admits a bounded
//! number of probes: one success closes the breaker, one failure reopens it.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::GateError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_ms: i64,
    half_open_inflight: u32,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at_ms: 0,
            half_open_inflight: 0,
        }
    }
}

pub struct BreakerMap {
    failure_threshold: u32,
    recovery_timeout_ms: i64,
    half_open_max_requests: u32,
    breakers: HashMap<String, Breaker>,
}

impl BreakerMap {
    pub fn new(failure_threshold: u32, recovery_timeout_seconds: i64, half_open_max_requests: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout_ms: recovery_timeout_seconds * 1000,
            half_open_max_requests: half_open_max_requests.max(1),
            breakers: HashMap::new(),
        }
    }

    /// Admission check. An Open breaker whose recovery timeout elapsed moves
    /// to HalfOpen and admits the caller as a probe.
    pub fn admit(&mut self, token_id: &str, now_ms: i64) -> Result<(), GateError> {
        let breaker = self
            .breakers
            .entry(token_id.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if now_ms - breaker.opened_at_ms >= self.recovery_timeout_ms {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.half_open_inflight = 1;
                    debug!(token_id, "breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(GateError::BreakerOpen(token_id.to_string()))
                }
            }
            BreakerState::HalfOpen => {
                if breaker.half_open_inflight < self.half_open_max_requests {
                    breaker.half_open_inflight += 1;
                    Ok(())
                } else {
                    Err(GateError::BreakerOpen(token_id.to_string()))
                }
            }
        }
    }

    /// Record the result of an admitted execution.
    pub fn record(&mut self, token_id: &str, success: bool, now_ms: i64) {
        let breaker = self
            .breakers
            .entry(token_id.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::Closed => {
                if success {
                    breaker.consecutive_failures = 0;
                } else {
                    breaker.consecutive_failures += 1;
                    if breaker.consecutive_failures >= self.failure_threshold {
                        breaker.state = BreakerState::Open;
                        breaker.opened_at_ms = now_ms;
                        warn!(token_id, failures = breaker.consecutive_failures, "breaker opened");
                    }
                }
            }
            BreakerState::HalfOpen => {
                breaker.half_open_inflight = breaker.half_open_inflight.saturating_sub(1);
                if success {
                    breaker.state = BreakerState::Closed;
                    breaker.consecutive_failures = 0;
                    breaker.half_open_inflight = 0;
                    debug!(token_id, "breaker closed after successful probe");
                } else {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at_ms = now_ms;
                    breaker.half_open_inflight = 0;
                    warn!(token_id, "breaker reopened after failed probe");
                }
            }
            // A late result for an order admitted before the breaker opened.
            BreakerState::Open => {}
        }
    }

    /// Hand back a HalfOpen probe slot granted by `admit` when the caller
    /// abandons the attempt before dispatch (e.g. a downstream denial).
    pub fn cancel_probe(&mut self, token_id: &str) {
        if let Some(breaker) = self.breakers.get_mut(token_id) {
            if breaker.state == BreakerState::HalfOpen {
                breaker.half_open_inflight = breaker.half_open_inflight.saturating_sub(1);
            }
        }
    }

    pub fn state(&self, token_id: &str) -> BreakerState {
        self.breakers
            .get(token_id)
            .map_or(BreakerState::Closed, |b| b.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_map() -> BreakerMap {
        BreakerMap::new(3, 60, 1)
    }

    /// Scenario: Market N fails three consecutive times (threshold 3).
    /// Expected: Breaker opens on the third failure; the next admission is denied BreakerOpen.
    #[test]
    fn test_opens_after_consecutive_failures() {
        let mut map = make_map();
        for _ in 0..3 {
            assert!(map.admit("n", 1000).is_ok());
            map.record("n", false, 1000);
        }
        assert_eq!(map.state("n"), BreakerState::Open);
        assert!(matches!(map.admit("n", 2000), Err(GateError::BreakerOpen(_))));
    }

    /// Scenario: Two failures, then a success, then two more failures.
    /// Expected: Breaker stays closed -- the counter requires CONSECUTIVE failures.
    #[test]
    fn test_success_resets_consecutive_count() {
        let mut map = make_map();
        map.record("n", false, 1000);
        map.record("n", false, 1000);
        map.record("n", true, 1000);
        map.record("n", false, 1000);
        map.record("n", false, 1000);
        assert_eq!(map.state("n"), BreakerState::Closed);
    }

    /// Scenario: Breaker opened at t=1000 with a 60s recovery timeout; admission at t=60.999s and at t=61s.
    /// Expected: Denied just before the timeout, admitted as a HalfOpen probe at the timeout.
    #[test]
    fn test_open_to_half_open_on_timeout() {
        let mut map = make_map();
        for _ in 0..3 {
            map.admit("n", 1000).unwrap();
            map.record("n", false, 1000);
        }
        assert!(map.admit("n", 60_999).is_err());
        assert!(map.admit("n", 61_000).is_ok());
        assert_eq!(map.state("n"), BreakerState::HalfOpen);
    }

    /// Scenario: HalfOpen with half_open_max_requests = 1; a second admission arrives while the probe is in flight.
    /// Expected: Second admission refused BreakerOpen.
    #[test]
    fn test_half_open_probe_cap() {
        let mut map = make_map();
        for _ in 0..3 {
            map.admit("n", 0).unwrap();
            map.record("n", false, 0);
        }
        assert!(map.admit("n", 61_000).is_ok()); // probe admitted
        assert!(matches!(map.admit("n", 61_001), Err(GateError::BreakerOpen(_))));
    }

    /// Scenario: HalfOpen probe succeeds.
    /// Expected: Breaker closes and subsequent admissions flow freely.
    #[test]
    fn test_half_open_success_closes() {
        let mut map = make_map();
        for _ in 0..3 {
            map.admit("n", 0).unwrap();
            map.record("n", false, 0);
        }
        map.admit("n", 61_000).unwrap();
        map.record("n", true, 61_100);
        assert_eq!(map.state("n"), BreakerState::Closed);
        assert!(map.admit("n", 61_200).is_ok());
    }

    /// Scenario: HalfOpen probe fails at t=61s.
    /// Expected: Breaker reopens; denied until a fresh recovery timeout from the reopen instant.
    #[test]
    fn test_half_open_failure_reopens() {
        let mut map = make_map();
        for _ in 0..3 {
            map.admit("n", 0).unwrap();
            map.record("n", false, 0);
        }
        map.admit("n", 61_000).unwrap();
        map.record("n", false, 61_000);
        assert_eq!(map.state("n"), BreakerState::Open);
        assert!(map.admit("n", 100_000).is_err());
        assert!(map.admit("n", 121_000).is_ok());
    }

    /// Scenario: Failures on market A while market B trades cleanly.
    /// Expected: Breakers are independent per token; B is never affected.
    #[test]
    fn test_breakers_independent_per_token() {
        let mut map = make_map();
        for _ in 0..3 {
            map.admit("a", 0).unwrap();
            map.record("a", false, 0);
        }
        assert_eq!(map.state("a"), BreakerState::Open);
        assert_eq!(map.state("b"), BreakerState::Closed);
        assert!(map.admit("b", 0).is_ok());
    }
}

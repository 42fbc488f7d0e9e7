//! Expiration-sniping eligibility predicate.
//!
//! Pure and deterministic over a market snapshot and a timestamp. A market
//! qualifies when it is close enough to expiry, its ask still trades at a
//! discount to parity, and the discount clears the minimum edge. Both time
//! and price bounds are strict: a market exactly at the eligibility window
//! or exactly at the price cap does not qualify.
//!
//! The predicate is not side-aware. It evaluates whatever outcome token's
//! quote is in the snapshot; sniping the complement means feeding the
//! complement token's market through the same predicate.

use crate::engine::lifecycle::{MarketPhase, MarketSnapshot};

#[derive(Clone, Copy, Debug)]
pub struct EligibilityParams {
    pub time_to_eligibility_sec: i64,
    pub max_buy_price: f64,
    pub min_edge: f64,
}

pub fn eligible(params: &EligibilityParams, snapshot: &MarketSnapshot, now_ms: i64) -> bool {
    if !matches!(snapshot.phase, MarketPhase::Watching | MarketPhase::Eligible) {
        return false;
    }
    let remaining_ms = snapshot.end_ms - now_ms;
    // Expired markets never qualify; the window bound is strict.
    if remaining_ms <= 0 || remaining_ms >= params.time_to_eligibility_sec * 1000 {
        return false;
    }
    let Some(ask) = snapshot.best_ask else {
        return false;
    };
    if ask <= 0.0 || ask >= params.max_buy_price {
        return false;
    }
    1.0 - ask >= params.min_edge
}

/// Edge against unit parity, in cents, for a candidate ask.
pub fn edge_cents(ask: f64) -> f64 {
    (1.0 - ask) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EligibilityParams {
        EligibilityParams {
            time_to_eligibility_sec: 60,
            max_buy_price: 0.99,
            min_edge: 0.01,
        }
    }

    fn snap(phase: MarketPhase, end_ms: i64, ask: Option<f64>) -> MarketSnapshot {
        MarketSnapshot {
            token_id: "m".into(),
            phase,
            end_ms,
            best_bid: ask.map(|a| a - 0.01),
            best_ask: ask,
            last_tick_ms: Some(0),
            failure_count: 0,
            reserved_capital: 0.0,
            realized_pnl: 0.0,
            negative_risk: false,
            seq: 0,
        }
    }

    /// Scenario: Watching market 45s from expiry with ask 0.97.
    /// Expected: Eligible -- inside the window, under the cap, 3c of edge.
    #[test]
    fn test_eligible_happy_path() {
        let s = snap(MarketPhase::Watching, 100_000, Some(0.97));
        assert!(eligible(&params(), &s, 55_000));
    }

    /// Scenario: end_time - now exactly equals time_to_eligibility_sec.
    /// Expected: NOT eligible -- the window bound is strict.
    #[test]
    fn test_window_boundary_strict() {
        let s = snap(MarketPhase::Watching, 100_000, Some(0.97));
        assert!(!eligible(&params(), &s, 40_000), "exactly 60s out is excluded");
        assert!(eligible(&params(), &s, 40_001), "one ms inside the window qualifies");
    }

    /// Scenario: ask exactly equal to max_buy_price.
    /// Expected: NOT eligible -- the price bound is strict.
    #[test]
    fn test_price_boundary_strict() {
        let s = snap(MarketPhase::Watching, 100_000, Some(0.99));
        assert!(!eligible(&params(), &s, 55_000), "ask == cap is excluded");
        let s = snap(MarketPhase::Watching, 100_000, Some(0.9899));
        assert!(eligible(&params(), &s, 55_000));
    }

    /// Scenario: Edge exactly at min_edge (ask 0.99 with cap raised).
    /// Expected: Eligible -- the edge bound is inclusive (>=).
    #[test]
    fn test_min_edge_inclusive() {
        let p = EligibilityParams {
            time_to_eligibility_sec: 60,
            max_buy_price: 0.995,
            min_edge: 0.01,
        };
        let s = snap(MarketPhase::Watching, 100_000, Some(0.99));
        assert!(eligible(&p, &s, 55_000));
        let s = snap(MarketPhase::Watching, 100_000, Some(0.9901));
        assert!(!eligible(&p, &s, 55_000), "edge below the floor");
    }

    /// Scenario: Market already past its end time.
    /// Expected: NOT eligible regardless of price.
    #[test]
    fn test_expired_not_eligible() {
        let s = snap(MarketPhase::Watching, 100_000, Some(0.50));
        assert!(!eligible(&params(), &s, 100_000));
        assert!(!eligible(&params(), &s, 150_000));
    }

    /// Scenario: Snapshot with no ask yet (never ticked).
    /// Expected: NOT eligible.
    #[test]
    fn test_no_quote_not_eligible() {
        let s = snap(MarketPhase::Watching, 100_000, None);
        assert!(!eligible(&params(), &s, 55_000));
    }

    /// Scenario: Same numbers in every non-watchable phase.
    /// Expected: Only Watching and Eligible phases can qualify.
    #[test]
    fn test_phase_restriction() {
        for phase in [
            MarketPhase::Discovered,
            MarketPhase::Executing,
            MarketPhase::Reconciling,
            MarketPhase::Done,
            MarketPhase::OnHold,
        ] {
            let s = snap(phase, 100_000, Some(0.97));
            assert!(!eligible(&params(), &s, 55_000), "{:?} must not qualify", phase);
        }
        assert!(eligible(&params(), &snap(MarketPhase::Eligible, 100_000, Some(0.97)), 55_000));
    }

    /// Scenario: Asks of 0.97 and 0.995 converted to cents of edge.
    /// Expected: 3.0 and 0.5 respectively.
    #[test]
    fn test_edge_cents() {
        assert!((edge_cents(0.97) - 3.0).abs() < 1e-9);
        assert!((edge_cents(0.995) - 0.5).abs() < 1e-9);
    }
}

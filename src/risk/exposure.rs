//! Pre-trade exposure checks.
//!
//! The caps themselves live with the allocator ([`ExposureLimits`]); this
//! module is the admission-side evaluation over a consistent
//! [`ExposureView`] read.

use crate::capital::allocator::{ExposureLimits, ExposureView};
use crate::error::GateError;

const EPS: f64 = 1e-9;

/// `true` iff `amount` fits under the per-market cap, the total cap, and
/// available capital. First violated bound wins, in that order.
pub fn can_allocate(
    limits: &ExposureLimits,
    view: &ExposureView,
    amount: f64,
) -> Result<(), GateError> {
    let market_cap = limits.per_market_cap(view.bankroll);
    if view.market_exposure + amount > market_cap + EPS {
        return Err(GateError::ExposureCapMarket);
    }
    if view.total_exposure + amount > limits.total_cap(view.bankroll) + EPS {
        return Err(GateError::ExposureCapTotal);
    }
    if amount > view.available + EPS {
        return Err(GateError::InsufficientCapital);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ExposureLimits {
        ExposureLimits {
            max_per_market_percent: 0.05,
            max_per_market_absolute: 50.0,
            max_total_percent: 0.25,
        }
    }

    fn view(bankroll: f64, market: f64, total: f64) -> ExposureView {
        ExposureView {
            bankroll,
            market_exposure: market,
            total_exposure: total,
            available: bankroll - total,
        }
    }

    /// Scenario: $10 on a fresh market, $1000 bankroll, nothing allocated.
    /// Expected: Admitted -- all three bounds have headroom.
    #[test]
    fn test_fits_all_bounds() {
        assert!(can_allocate(&limits(), &view(1000.0, 0.0, 0.0), 10.0).is_ok());
    }

    /// Scenario: Amount exactly at the $50 per-market cap.
    /// Expected: Admitted -- caps are inclusive bounds.
    #[test]
    fn test_exactly_at_market_cap() {
        assert!(can_allocate(&limits(), &view(1000.0, 0.0, 0.0), 50.0).is_ok());
        assert!(matches!(
            can_allocate(&limits(), &view(1000.0, 0.0, 0.0), 50.01),
            Err(GateError::ExposureCapMarket)
        ));
    }

    /// Scenario: $100 bankroll so the 5% percent cap ($5) undercuts the $50 absolute cap.
    /// Expected: $6 denied by the per-market bound; $5 admitted.
    #[test]
    fn test_percent_cap_tighter_than_absolute() {
        assert!(matches!(
            can_allocate(&limits(), &view(100.0, 0.0, 0.0), 6.0),
            Err(GateError::ExposureCapMarket)
        ));
        assert!(can_allocate(&limits(), &view(100.0, 0.0, 0.0), 5.0).is_ok());
    }

    /// Scenario: Total exposure already at $245 of a $250 total cap; $10 requested on a fresh market.
    /// Expected: Denied ExposureCapTotal even though the market bound passes.
    #[test]
    fn test_total_cap_binds() {
        assert!(matches!(
            can_allocate(&limits(), &view(1000.0, 0.0, 245.0), 10.0),
            Err(GateError::ExposureCapTotal)
        ));
    }

    /// Scenario: Caps permit the amount but available capital does not
    /// (bankroll 40, nothing reserved elsewhere counted, available forced to 5).
    /// Expected: Denied InsufficientCapital.
    #[test]
    fn test_available_capital_binds() {
        let v = ExposureView {
            bankroll: 1000.0,
            market_exposure: 0.0,
            total_exposure: 0.0,
            available: 5.0,
        };
        assert!(matches!(
            can_allocate(&limits(), &v, 10.0),
            Err(GateError::InsufficientCapital)
        ));
    }

    /// Scenario: Market bound and total bound both violated at once.
    /// Expected: The per-market denial wins (first bound in evaluation order).
    #[test]
    fn test_market_bound_checked_first() {
        assert!(matches!(
            can_allocate(&limits(), &view(1000.0, 50.0, 250.0), 10.0),
            Err(GateError::ExposureCapMarket)
        ));
    }
}

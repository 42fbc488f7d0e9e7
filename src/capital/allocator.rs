//! Single source of truth for bankroll and reservations.
//!
//! Every mutation goes through one internal mutex; readers get consistent
//! snapshots via [`CapitalAllocator::exposure_view`]. Grants are the minimum
//! of the request, the per-market effective cap, total-exposure headroom, and
//! available capital. Callers must use the returned amount, which may be
//! smaller than requested.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Exposure caps shared by the allocator (grant clamping) and the risk gate
/// (pre-trade admission).
#[derive(Clone, Copy, Debug)]
pub struct ExposureLimits {
    pub max_per_market_percent: f64,
    pub max_per_market_absolute: f64,
    pub max_total_percent: f64,
}

impl ExposureLimits {
    /// Effective per-market cap: the tighter of the percent and absolute caps.
    pub fn per_market_cap(&self, bankroll: f64) -> f64 {
        (bankroll * self.max_per_market_percent).min(self.max_per_market_absolute)
    }

    pub fn total_cap(&self, bankroll: f64) -> f64 {
        bankroll * self.max_total_percent
    }
}

/// Consistent read of the numbers the exposure checks need, taken under one
/// lock acquisition.
#[derive(Clone, Copy, Debug)]
pub struct ExposureView {
    pub bankroll: f64,
    pub market_exposure: f64,
    pub total_exposure: f64,
    pub available: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationResult {
    Success,
    InsufficientCapital,
    MarketLimitExceeded,
    TotalLimitExceeded,
    AlreadyAllocated,
    InvalidAmount,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocError {
    #[error("no reservation for {0}")]
    NoReservation(String),
    #[error("{0} reservations pending")]
    ReservationsPending(usize),
    #[error("bankroll would go negative")]
    BankrollUnderflow,
}

#[derive(Clone, Debug)]
struct Reservation {
    amount: f64,
    strategy: &'static str,
}

struct Inner {
    bankroll: f64,
    reservations: HashMap<String, Reservation>,
}

impl Inner {
    fn total_allocated(&self) -> f64 {
        self.reservations.values().map(|r| r.amount).sum()
    }
}

pub struct CapitalAllocator {
    inner: Mutex<Inner>,
    limits: ExposureLimits,
    split_threshold: f64,
    split_count: u32,
}

const EPS: f64 = 1e-9;

/// Settlement payout for a fill-or-kill buy of a binary outcome token.
/// `size_usd / price` shares each pay 1 on a win; winnings are rounded down
/// to the cent at the settlement boundary only. Venue fees at this tier are
/// zero; a fee model would be a single multiplier here.
pub fn payout(size_usd: f64, price: f64, won: bool) -> f64 {
    if won {
        let gross = size_usd / price * (1.0 - price);
        (gross * 100.0).floor() / 100.0
    } else {
        -size_usd
    }
}

impl CapitalAllocator {
    pub fn new(
        bankroll: f64,
        limits: ExposureLimits,
        split_threshold: f64,
        split_count: u32,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bankroll,
                reservations: HashMap::new(),
            }),
            limits,
            split_threshold,
            split_count: split_count.max(1),
        }
    }

    pub fn limits(&self) -> ExposureLimits {
        self.limits
    }

    /// Reserve capital for one market. At most one reservation per token may
    /// exist at a time. The grant may be below the request; a `Success`
    /// result with a smaller grant is normal when a cap binds first.
    pub fn request_allocation(
        &self,
        token_id: &str,
        amount: f64,
        strategy: &'static str,
    ) -> (AllocationResult, f64) {
        if !amount.is_finite() || amount <= 0.0 {
            return (AllocationResult::InvalidAmount, 0.0);
        }
        let mut inner = self.inner.lock();
        if inner.reservations.contains_key(token_id) {
            return (AllocationResult::AlreadyAllocated, 0.0);
        }
        let total = inner.total_allocated();
        let market_cap = self.limits.per_market_cap(inner.bankroll);
        let total_headroom = self.limits.total_cap(inner.bankroll) - total;
        let available = inner.bankroll - total;

        if available <= EPS {
            return (AllocationResult::InsufficientCapital, 0.0);
        }
        if total_headroom <= EPS {
            return (AllocationResult::TotalLimitExceeded, 0.0);
        }
        if market_cap <= EPS {
            return (AllocationResult::MarketLimitExceeded, 0.0);
        }

        let granted = amount.min(market_cap).min(total_headroom).min(available);
        inner.reservations.insert(
            token_id.to_string(),
            Reservation {
                amount: granted,
                strategy,
            },
        );
        debug!(token_id, requested = amount, granted, strategy, "capital reserved");
        (AllocationResult::Success, granted)
    }

    /// The grant `request_allocation` would produce right now, without
    /// reserving anything. Zero when no positive grant is possible. The
    /// execution worker gates on this number, so a cap that merely clamps a
    /// request does not read as a denial.
    pub fn preview_grant(&self, token_id: &str, amount: f64) -> f64 {
        if !amount.is_finite() || amount <= 0.0 {
            return 0.0;
        }
        let inner = self.inner.lock();
        if inner.reservations.contains_key(token_id) {
            return 0.0;
        }
        let total = inner.total_allocated();
        let granted = amount
            .min(self.limits.per_market_cap(inner.bankroll))
            .min(self.limits.total_cap(inner.bankroll) - total)
            .min(inner.bankroll - total);
        if granted <= EPS {
            0.0
        } else {
            granted
        }
    }

    /// Release a reservation and apply realized pnl to the bankroll in the
    /// same critical section. Returns the amount that was reserved.
    pub fn release_allocation(&self, token_id: &str, pnl: f64) -> Result<f64, AllocError> {
        let mut inner = self.inner.lock();
        let res = inner
            .reservations
            .remove(token_id)
            .ok_or_else(|| AllocError::NoReservation(token_id.to_string()))?;
        inner.bankroll += pnl;
        debug!(token_id, reserved = res.amount, pnl, bankroll = inner.bankroll, "capital released");
        Ok(res.amount)
    }

    /// Shrink a live reservation to the portion actually filled, returning
    /// the excess to available capital. Used when a split order aborts its
    /// tail after a partial sequence of child fills.
    pub fn shrink_reservation(&self, token_id: &str, new_amount: f64) -> Result<f64, AllocError> {
        let mut inner = self.inner.lock();
        let res = inner
            .reservations
            .get_mut(token_id)
            .ok_or_else(|| AllocError::NoReservation(token_id.to_string()))?;
        let excess = (res.amount - new_amount).max(0.0);
        res.amount = res.amount.min(new_amount.max(0.0));
        Ok(excess)
    }

    /// Deposits/withdrawals outside trading pnl. Forbidden while any
    /// reservation is pending.
    pub fn update_bankroll(&self, delta: f64) -> Result<f64, AllocError> {
        let mut inner = self.inner.lock();
        if !inner.reservations.is_empty() {
            return Err(AllocError::ReservationsPending(inner.reservations.len()));
        }
        if inner.bankroll + delta < 0.0 {
            return Err(AllocError::BankrollUnderflow);
        }
        inner.bankroll += delta;
        Ok(inner.bankroll)
    }

    pub fn bankroll(&self) -> f64 {
        self.inner.lock().bankroll
    }

    pub fn total_allocated(&self) -> f64 {
        self.inner.lock().total_allocated()
    }

    pub fn market_exposure(&self, token_id: &str) -> f64 {
        self.inner
            .lock()
            .reservations
            .get(token_id)
            .map_or(0.0, |r| r.amount)
    }

    pub fn reservation_strategy(&self, token_id: &str) -> Option<&'static str> {
        self.inner.lock().reservations.get(token_id).map(|r| r.strategy)
    }

    pub fn exposure_view(&self, token_id: &str) -> ExposureView {
        let inner = self.inner.lock();
        let total = inner.total_allocated();
        ExposureView {
            bankroll: inner.bankroll,
            market_exposure: inner.reservations.get(token_id).map_or(0.0, |r| r.amount),
            total_exposure: total,
            available: inner.bankroll - total,
        }
    }

    /// Child sizes for orders above the split threshold: an even split into
    /// `split_count` children at cent granularity, remainder on the last.
    /// None when the amount is at or below the threshold.
    pub fn split_sizes(&self, amount: f64) -> Option<Vec<f64>> {
        if amount <= self.split_threshold {
            return None;
        }
        let n = self.split_count as usize;
        let base_cents = ((amount * 100.0) / n as f64).floor();
        let base = base_cents / 100.0;
        let mut sizes = vec![base; n];
        let tail = amount - base * (n as f64 - 1.0);
        sizes[n - 1] = (tail * 100.0).round() / 100.0;
        Some(sizes)
    }
}

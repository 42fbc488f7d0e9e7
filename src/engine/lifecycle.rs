//! Per-market lifecycle state machine.
//!
//! Owns every `Market` record exclusively; other components see snapshot
//! copies. All mutations are total functions of (current state, event):
//! unknown tokens and illegal transitions come back as typed errors, never
//! panics. The internal lock is held only for short critical sections and
//! transitions are returned as values; logging happens after the lock is
//! released.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::eligibility::{self, EligibilityParams};
use crate::types::MarketRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarketPhase {
    Discovered,
    Watching,
    Eligible,
    Executing,
    Reconciling,
    Done,
    OnHold,
}

impl MarketPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MarketPhase::Done)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("unknown token {0}")]
    UnknownToken(String),
    #[error("duplicate token {0}")]
    DuplicateToken(String),
    #[error("illegal transition {from:?} -> {to:?} for {token_id}")]
    IllegalTransition {
        token_id: String,
        from: MarketPhase,
        to: MarketPhase,
    },
    #[error("invalid quote bid={bid} ask={ask}")]
    InvalidQuote { bid: f64, ask: f64 },
    #[error("capital still reserved for {0}")]
    StillReserved(String),
}

/// Value copy handed to the scheduler, the eligibility evaluator, and the
/// execution worker. Never a reference into the state machine.
#[derive(Clone, Debug)]
pub struct MarketSnapshot {
    pub token_id: String,
    pub phase: MarketPhase,
    pub end_ms: i64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub last_tick_ms: Option<i64>,
    pub failure_count: u32,
    pub reserved_capital: f64,
    pub realized_pnl: f64,
    pub negative_risk: bool,
    pub seq: u64,
}

impl MarketSnapshot {
    pub fn feed_age_ms(&self, now_ms: i64) -> Option<i64> {
        self.last_tick_ms.map(|t| now_ms - t)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transition {
    pub from: MarketPhase,
    pub to: MarketPhase,
}

#[derive(Clone, Debug)]
struct Market {
    token_id: String,
    #[allow(dead_code)]
    condition_id: String,
    question: String,
    end_ms: i64,
    negative_risk: bool,
    phase: MarketPhase,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    last_tick_ms: Option<i64>,
    failure_count: u32,
    last_failure_ms: i64,
    hold_since_ms: i64,
    reserved_capital: f64,
    realized_pnl: f64,
    done_at_ms: i64,
    seq: u64,
}

impl Market {
    fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            token_id: self.token_id.clone(),
            phase: self.phase,
            end_ms: self.end_ms,
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            last_tick_ms: self.last_tick_ms,
            failure_count: self.failure_count,
            reserved_capital: self.reserved_capital,
            realized_pnl: self.realized_pnl,
            negative_risk: self.negative_risk,
            seq: self.seq,
        }
    }

    fn feed_fresh(&self, now_ms: i64, stale_threshold_ms: i64) -> bool {
        self.last_tick_ms
            .map_or(false, |t| now_ms - t <= stale_threshold_ms)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LifecycleParams {
    pub stale_feed_threshold_ms: i64,
    pub max_failures_before_hold: u32,
    pub failure_decay_ms: i64,
    pub eligibility: EligibilityParams,
}

struct Inner {
    markets: HashMap<String, Market>,
    next_seq: u64,
}

pub struct MarketStateMachine {
    inner: Mutex<Inner>,
    params: LifecycleParams,
}

impl MarketStateMachine {
    pub fn new(params: LifecycleParams) -> Self {
        Self {
            inner: Mutex::new(Inner {
                markets: HashMap::new(),
                next_seq: 0,
            }),
            params,
        }
    }

    pub fn add_market(&self, record: MarketRecord) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if inner.markets.contains_key(&record.token_id) {
            return Err(StateError::DuplicateToken(record.token_id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let market = Market {
            token_id: record.token_id.clone(),
            condition_id: record.condition_id,
            question: record.question,
            end_ms: record.end_ms,
            negative_risk: record.negative_risk,
            phase: MarketPhase::Discovered,
            best_bid: None,
            best_ask: None,
            last_tick_ms: None,
            failure_count: 0,
            last_failure_ms: 0,
            hold_since_ms: 0,
            reserved_capital: 0.0,
            realized_pnl: 0.0,
            done_at_ms: 0,
            seq,
        };
        let question = market.question.clone();
        inner.markets.insert(record.token_id.clone(), market);
        drop(inner);
        info!(token_id = %record.token_id, end_ms = record.end_ms, question = %question, "market discovered");
        Ok(())
    }

    /// Apply one price tick. The first tick moves Discovered to Watching.
    /// A run of clean ticks longer than the failure decay interval resets
    /// the failure counter.
    pub fn update_price(
        &self,
        token_id: &str,
        bid: f64,
        ask: f64,
        now_ms: i64,
    ) -> Result<(), StateError> {
        if !(0.0..=1.0).contains(&bid) || !(0.0..=1.0).contains(&ask) || bid > ask {
            return Err(StateError::InvalidQuote { bid, ask });
        }
        let mut inner = self.inner.lock();
        let market = inner
            .markets
            .get_mut(token_id)
            .ok_or_else(|| StateError::UnknownToken(token_id.to_string()))?;
        market.best_bid = Some(bid);
        market.best_ask = Some(ask);
        market.last_tick_ms = Some(now_ms);
        if market.failure_count > 0
            && market.last_failure_ms > 0
            && now_ms - market.last_failure_ms >= self.params.failure_decay_ms
        {
            debug!(token_id, "failure count decayed to zero");
            market.failure_count = 0;
        }
        if market.phase == MarketPhase::Discovered {
            market.phase = MarketPhase::Watching;
            drop(inner);
            debug!(token_id, "Discovered -> Watching (first tick)");
        }
        Ok(())
    }

    /// Periodic transition sweep. Idempotent at a fixed `now_ms`: each
    /// market's rules are applied to a fixpoint, so an immediate second call
    /// with the same clock yields nothing new.
    pub fn check_transitions(&self, now_ms: i64) -> Vec<(String, Transition)> {
        let mut out = Vec::new();
        {
            let mut inner = self.inner.lock();
            for market in inner.markets.values_mut() {
                for _ in 0..4 {
                    match Self::next_phase(&self.params, market, now_ms) {
                        Some(to) => {
                            let from = market.phase;
                            if to == MarketPhase::Watching && from == MarketPhase::OnHold {
                                // Recovery via cooldown clears the counter.
                                if now_ms - market.hold_since_ms >= self.params.failure_decay_ms {
                                    market.failure_count = 0;
                                }
                            }
                            if to == MarketPhase::OnHold {
                                market.hold_since_ms = now_ms;
                            }
                            market.phase = to;
                            out.push((market.token_id.clone(), Transition { from, to }));
                        }
                        None => break,
                    }
                }
            }
        }
        for (token_id, t) in &out {
            debug!(token_id = %token_id, from = ?t.from, to = ?t.to, "transition");
        }
        out
    }

    fn next_phase(params: &LifecycleParams, market: &Market, now_ms: i64) -> Option<MarketPhase> {
        match market.phase {
            MarketPhase::Watching | MarketPhase::Eligible => {
                if !market.feed_fresh(now_ms, params.stale_feed_threshold_ms)
                    || market.failure_count > params.max_failures_before_hold
                {
                    return Some(MarketPhase::OnHold);
                }
                let is_eligible = eligibility::eligible(&params.eligibility, &market.snapshot(), now_ms);
                match market.phase {
                    MarketPhase::Watching if is_eligible => Some(MarketPhase::Eligible),
                    // Eligibility is never sticky: re-checked every sweep.
                    MarketPhase::Eligible if !is_eligible => Some(MarketPhase::Watching),
                    _ => None,
                }
            }
            MarketPhase::OnHold => {
                let fresh = market.feed_fresh(now_ms, params.stale_feed_threshold_ms);
                let recovered = market.failure_count == 0
                    || now_ms - market.hold_since_ms >= params.failure_decay_ms;
                if fresh && recovered {
                    Some(MarketPhase::Watching)
                } else {
                    None
                }
            }
            MarketPhase::Executing => {
                if now_ms >= market.end_ms {
                    Some(MarketPhase::Reconciling)
                } else {
                    None
                }
            }
            MarketPhase::Discovered | MarketPhase::Reconciling | MarketPhase::Done => None,
        }
    }

    /// Eligible -> Executing, booking the reserved capital.
    pub fn mark_execution_started(
        &self,
        token_id: &str,
        reserved_capital: f64,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let market = inner
            .markets
            .get_mut(token_id)
            .ok_or_else(|| StateError::UnknownToken(token_id.to_string()))?;
        if market.phase != MarketPhase::Eligible {
            return Err(StateError::IllegalTransition {
                token_id: token_id.to_string(),
                from: market.phase,
                to: MarketPhase::Executing,
            });
        }
        market.phase = MarketPhase::Executing;
        market.reserved_capital = reserved_capital;
        drop(inner);
        debug!(token_id, reserved_capital, "Eligible -> Executing");
        Ok(())
    }

    /// Executing -> Watching after a dispatch that filled nothing. The
    /// caller has already released the reservation.
    pub fn mark_execution_failed(&self, token_id: &str) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let market = inner
            .markets
            .get_mut(token_id)
            .ok_or_else(|| StateError::UnknownToken(token_id.to_string()))?;
        if market.phase != MarketPhase::Executing {
            return Err(StateError::IllegalTransition {
                token_id: token_id.to_string(),
                from: market.phase,
                to: MarketPhase::Watching,
            });
        }
        market.phase = MarketPhase::Watching;
        market.reserved_capital = 0.0;
        drop(inner);
        debug!(token_id, "Executing -> Watching (nothing filled)");
        Ok(())
    }

    /// Trim the booked reservation after a split order filled only part of
    /// its children.
    pub fn adjust_reserved(&self, token_id: &str, reserved_capital: f64) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let market = inner
            .markets
            .get_mut(token_id)
            .ok_or_else(|| StateError::UnknownToken(token_id.to_string()))?;
        if !matches!(market.phase, MarketPhase::Executing | MarketPhase::Reconciling) {
            return Err(StateError::IllegalTransition {
                token_id: token_id.to_string(),
                from: market.phase,
                to: market.phase,
            });
        }
        market.reserved_capital = reserved_capital;
        Ok(())
    }

    /// Reconciling -> Done once capital has been released with realized pnl.
    pub fn mark_resolution(&self, token_id: &str, pnl: f64, now_ms: i64) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let market = inner
            .markets
            .get_mut(token_id)
            .ok_or_else(|| StateError::UnknownToken(token_id.to_string()))?;
        if market.phase != MarketPhase::Reconciling {
            return Err(StateError::IllegalTransition {
                token_id: token_id.to_string(),
                from: market.phase,
                to: MarketPhase::Done,
            });
        }
        market.phase = MarketPhase::Done;
        market.reserved_capital = 0.0;
        market.realized_pnl = pnl;
        market.done_at_ms = now_ms;
        drop(inner);
        info!(token_id, pnl, "Reconciling -> Done (resolved)");
        Ok(())
    }

    /// Atomically bump the failure counter; crossing the hold threshold
    /// parks a Watching/Eligible market OnHold.
    pub fn mark_failure(&self, token_id: &str, reason: &str, now_ms: i64) -> Result<u32, StateError> {
        let mut inner = self.inner.lock();
        let market = inner
            .markets
            .get_mut(token_id)
            .ok_or_else(|| StateError::UnknownToken(token_id.to_string()))?;
        market.failure_count += 1;
        market.last_failure_ms = now_ms;
        let count = market.failure_count;
        let held = if count > self.params.max_failures_before_hold
            && matches!(market.phase, MarketPhase::Watching | MarketPhase::Eligible)
        {
            market.phase = MarketPhase::OnHold;
            market.hold_since_ms = now_ms;
            true
        } else {
            false
        };
        drop(inner);
        debug!(token_id, reason, count, held, "failure recorded");
        Ok(count)
    }

    /// Operator reset of the failure counter.
    pub fn reset_failures(&self, token_id: &str) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let market = inner
            .markets
            .get_mut(token_id)
            .ok_or_else(|| StateError::UnknownToken(token_id.to_string()))?;
        market.failure_count = 0;
        market.last_failure_ms = 0;
        Ok(())
    }

    /// Source-side cleanup: any non-terminal market goes straight to Done.
    /// Refused while capital is still reserved.
    pub fn drop_market(&self, token_id: &str, now_ms: i64) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        let market = inner
            .markets
            .get_mut(token_id)
            .ok_or_else(|| StateError::UnknownToken(token_id.to_string()))?;
        if market.phase == MarketPhase::Done {
            return Ok(());
        }
        if market.reserved_capital > 0.0 {
            return Err(StateError::StillReserved(token_id.to_string()));
        }
        let from = market.phase;
        market.phase = MarketPhase::Done;
        market.done_at_ms = now_ms;
        drop(inner);
        info!(token_id, from = ?from, "market dropped by source");
        Ok(())
    }

    pub fn snapshot(&self, token_id: &str) -> Result<MarketSnapshot, StateError> {
        let inner = self.inner.lock();
        inner
            .markets
            .get(token_id)
            .map(|m| m.snapshot())
            .ok_or_else(|| StateError::UnknownToken(token_id.to_string()))
    }

    pub fn get_markets_by_state(&self, phase: MarketPhase) -> Vec<MarketSnapshot> {
        let inner = self.inner.lock();
        let mut out: Vec<MarketSnapshot> = inner
            .markets
            .values()
            .filter(|m| m.phase == phase)
            .map(|m| m.snapshot())
            .collect();
        out.sort_by_key(|s| s.seq);
        out
    }

    /// Age of the stalest feed across watched (Watching/Eligible) markets.
    /// None when nothing is being watched.
    pub fn watched_feed_age_ms(&self, now_ms: i64) -> Option<i64> {
        let inner = self.inner.lock();
        inner
            .markets
            .values()
            .filter(|m| matches!(m.phase, MarketPhase::Watching | MarketPhase::Eligible))
            .map(|m| m.last_tick_ms.map_or(i64::MAX, |t| now_ms - t))
            .max()
    }

    /// Drop Done markets past the retention horizon. Returns how many were
    /// purged.
    pub fn purge_done_older_than(&self, horizon_ms: i64, now_ms: i64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.markets.len();
        inner
            .markets
            .retain(|_, m| !(m.phase == MarketPhase::Done && now_ms - m.done_at_ms >= horizon_ms));
        before - inner.markets.len()
    }

    /// Sum of booked reservations; checked against the allocator's own total
    /// in invariants.
    pub fn total_reserved(&self) -> f64 {
        let inner = self.inner.lock();
        inner.markets.values().map(|m| m.reserved_capital).sum()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().markets.is_empty()
    }
}

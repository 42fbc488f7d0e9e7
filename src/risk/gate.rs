//! Combined pre-trade admissibility gate.
//!
//! Three sub-policies evaluated in order (kill switches, per-market circuit
//! breaker, exposure limits) with the first denial returned as a typed
//! reason. Allocator reads are gathered before any gate lock is taken
//! (lock order: Allocator < StateMachine < RiskGate < Executor).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::capital::allocator::CapitalAllocator;
use crate::clock::utc_midnight_after;
use crate::error::GateError;
use crate::risk::breaker::{BreakerMap, BreakerState};
use crate::risk::exposure;
use crate::risk::kill::{KillKind, KillObservations, KillSwitches, KillThresholds};

pub struct RiskGateConfig {
    pub stale_feed_threshold_ms: i64,
    pub rpc_lag_threshold_ms: f64,
    pub max_outstanding_orders: u32,
    pub daily_loss_limit_percent: f64,
    pub kill_debounce_ms: i64,
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: i64,
    pub half_open_max_requests: u32,
}

struct DailyPnl {
    pnl: f64,
    resets_at_ms: i64,
}

pub struct RiskGate {
    kill: Mutex<KillSwitches>,
    breakers: Mutex<BreakerMap>,
    daily: Mutex<DailyPnl>,
    outstanding: AtomicU32,
    allocator: Arc<CapitalAllocator>,
    stale_feed_threshold_ms: i64,
    opening_bankroll: f64,
}

impl RiskGate {
    pub fn new(config: &RiskGateConfig, allocator: Arc<CapitalAllocator>, now_ms: i64) -> Self {
        let thresholds = KillThresholds {
            stale_feed_threshold_ms: config.stale_feed_threshold_ms,
            rpc_lag_threshold_ms: config.rpc_lag_threshold_ms,
            max_outstanding_orders: config.max_outstanding_orders,
            daily_loss_limit_percent: config.daily_loss_limit_percent,
            debounce_ms: config.kill_debounce_ms,
        };
        let opening_bankroll = allocator.bankroll();
        Self {
            kill: Mutex::new(KillSwitches::new(thresholds, now_ms)),
            breakers: Mutex::new(BreakerMap::new(
                config.failure_threshold,
                config.recovery_timeout_seconds,
                config.half_open_max_requests,
            )),
            daily: Mutex::new(DailyPnl {
                pnl: 0.0,
                resets_at_ms: utc_midnight_after(now_ms),
            }),
            outstanding: AtomicU32::new(0),
            allocator,
            stale_feed_threshold_ms: config.stale_feed_threshold_ms,
            opening_bankroll,
        }
    }

    /// Full admissibility decision for one prospective fill attempt.
    /// `feed_age_ms` is the age of the market's own last tick.
    pub fn pre_execution_check(
        &self,
        token_id: &str,
        amount: f64,
        feed_age_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<(), GateError> {
        // Allocator reads first, before any gate lock.
        let view = self.allocator.exposure_view(token_id);

        // 1. Kill switches. The stale-feed policy has two inputs: the
        // monitor-driven global switch, and this request's own feed age
        // (the `feed_last_update` argument). Both deny as StaleFeedHalt.
        if let Some((kind, reason)) = self.kill.lock().active().map(|(k, r)| (k, r.to_string())) {
            warn!(token_id, kind = %kind, reason = %reason, "admission denied by kill switch");
            return Err(kind.gate_error());
        }
        if feed_age_ms.map_or(true, |age| age > self.stale_feed_threshold_ms) {
            warn!(token_id, ?feed_age_ms, "admission denied: market feed stale");
            return Err(GateError::StaleFeedHalt);
        }

        // 2. Per-market circuit breaker.
        self.breakers.lock().admit(token_id, now_ms)?;

        // 3. Exposure limits. A denial here must hand back any HalfOpen
        // probe slot the breaker just granted.
        if let Err(e) = exposure::can_allocate(&self.allocator.limits(), &view, amount) {
            self.breakers.lock().cancel_probe(token_id);
            warn!(token_id, amount, error = %e, "admission denied by exposure limits");
            return Err(e);
        }

        debug!(token_id, amount, "admission granted");
        Ok(())
    }

    /// Record an execution outcome: breaker transition, daily pnl, and the
    /// trailing-latency observation is left to the metrics collector.
    pub fn post_execution_record(
        &self,
        token_id: &str,
        success: bool,
        pnl: f64,
        latency_ms: f64,
        now_ms: i64,
    ) {
        self.breakers.lock().record(token_id, success, now_ms);
        let mut daily = self.daily.lock();
        if now_ms >= daily.resets_at_ms {
            daily.pnl = 0.0;
            daily.resets_at_ms = utc_midnight_after(now_ms);
        }
        daily.pnl += pnl;
        debug!(token_id, success, pnl, latency_ms, daily_pnl = daily.pnl, "execution recorded");
    }

    /// Fold settlement pnl into the daily total the DailyLoss switch
    /// watches. Dispatch-time records carry zero pnl for binary buys; the
    /// realized number exists only at resolution.
    pub fn record_settlement_pnl(&self, pnl: f64, now_ms: i64) {
        let mut daily = self.daily.lock();
        if now_ms >= daily.resets_at_ms {
            daily.pnl = 0.0;
            daily.resets_at_ms = utc_midnight_after(now_ms);
        }
        daily.pnl += pnl;
    }

    /// One observation round from the risk monitor task.
    pub fn observe_conditions(
        &self,
        max_feed_age_ms: Option<i64>,
        p95_decision_to_ack_ms: Option<f64>,
        now_ms: i64,
    ) {
        let daily_pnl = self.daily_pnl(now_ms);
        let obs = KillObservations {
            max_feed_age_ms,
            p95_decision_to_ack_ms,
            outstanding_orders: self.outstanding.load(Ordering::SeqCst),
            daily_pnl,
            opening_bankroll: self.opening_bankroll,
        };
        self.kill.lock().observe(&obs, now_ms);
    }

    pub fn order_started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub fn order_finished(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "outstanding order count underflow");
    }

    pub fn outstanding_orders(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn daily_pnl(&self, now_ms: i64) -> f64 {
        let mut daily = self.daily.lock();
        if now_ms >= daily.resets_at_ms {
            daily.pnl = 0.0;
            daily.resets_at_ms = utc_midnight_after(now_ms);
        }
        daily.pnl
    }

    pub fn set_manual_halt(&self, reason: &str, now_ms: i64) {
        self.kill.lock().set_manual(reason, now_ms);
    }

    pub fn clear_manual_halt(&self) {
        self.kill.lock().clear_manual();
    }

    pub fn active_kill(&self) -> Option<(KillKind, String)> {
        self.kill
            .lock()
            .active()
            .map(|(k, r)| (k, r.to_string()))
    }

    /// Earliest activation instant among active kill switches.
    pub fn halted_since_ms(&self) -> Option<i64> {
        self.kill.lock().active_since_ms()
    }

    pub fn breaker_state(&self, token_id: &str) -> BreakerState {
        self.breakers.lock().state(token_id)
    }
}

//! Global kill switches.
//!
//! A kill switch is a process-wide admission veto. Condition-driven switches
//! (StaleFeed, RpcLag, MaxOrders) clear only after their condition has been
//! clean for a debounce period; DailyLoss clears at UTC midnight; Manual
//! clears only by operator action. Activation emits one high-visibility
//! event, then a throttled reminder while active.

use std::collections::HashMap;

use tracing::{error, info, warn};

use crate::clock::utc_midnight_after;
use crate::error::GateError;

const ACTIVE_REMINDER_INTERVAL_MS: i64 = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KillKind {
    StaleFeed,
    RpcLag,
    MaxOrders,
    DailyLoss,
    Manual,
}

impl KillKind {
    pub fn gate_error(&self) -> GateError {
        match self {
            KillKind::StaleFeed => GateError::StaleFeedHalt,
            KillKind::RpcLag => GateError::RpcLagHalt,
            KillKind::MaxOrders => GateError::MaxOrdersHalt,
            KillKind::DailyLoss => GateError::DailyLossHalt,
            KillKind::Manual => GateError::ManualHalt,
        }
    }
}

impl std::fmt::Display for KillKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillKind::StaleFeed => write!(f, "stale_feed"),
            KillKind::RpcLag => write!(f, "rpc_lag"),
            KillKind::MaxOrders => write!(f, "max_orders"),
            KillKind::DailyLoss => write!(f, "daily_loss"),
            KillKind::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Clone, Debug)]
struct ActiveSwitch {
    reason: String,
    since_ms: i64,
    last_emit_ms: i64,
    /// First instant the underlying condition was observed clean, if any.
    clean_since_ms: Option<i64>,
}

/// Thresholds the monitor evaluates observations against.
#[derive(Clone, Copy, Debug)]
pub struct KillThresholds {
    pub stale_feed_threshold_ms: i64,
    pub rpc_lag_threshold_ms: f64,
    pub max_outstanding_orders: u32,
    pub daily_loss_limit_percent: f64,
    pub debounce_ms: i64,
}

/// One round of observations gathered by the risk monitor.
#[derive(Clone, Copy, Debug, Default)]
pub struct KillObservations {
    /// Age of the stalest watched market's tick; None when nothing is watched.
    pub max_feed_age_ms: Option<i64>,
    /// Trailing p95 decision-to-ack; None until samples exist.
    pub p95_decision_to_ack_ms: Option<f64>,
    pub outstanding_orders: u32,
    pub daily_pnl: f64,
    pub opening_bankroll: f64,
}

pub struct KillSwitches {
    thresholds: KillThresholds,
    active: HashMap<KillKind, ActiveSwitch>,
    daily_reset_at_ms: i64,
}

impl KillSwitches {
    pub fn new(thresholds: KillThresholds, now_ms: i64) -> Self {
        Self {
            thresholds,
            active: HashMap::new(),
            daily_reset_at_ms: utc_midnight_after(now_ms),
        }
    }

    /// Evaluate one observation round, activating and (after debounce)
    /// clearing condition-driven switches.
    pub fn observe(&mut self, obs: &KillObservations, now_ms: i64) {
        // DailyLoss resets at UTC midnight regardless of current pnl.
        if now_ms >= self.daily_reset_at_ms {
            if self.active.remove(&KillKind::DailyLoss).is_some() {
                info!("daily loss kill switch reset at UTC midnight");
            }
            self.daily_reset_at_ms = utc_midnight_after(now_ms);
        }

        let stale = obs
            .max_feed_age_ms
            .map_or(false, |age| age > self.thresholds.stale_feed_threshold_ms);
        self.apply(
            KillKind::StaleFeed,
            stale,
            || format!("max feed age {}ms", obs.max_feed_age_ms.unwrap_or(0)),
            now_ms,
        );

        let lagging = obs
            .p95_decision_to_ack_ms
            .map_or(false, |p95| p95 > self.thresholds.rpc_lag_threshold_ms);
        self.apply(
            KillKind::RpcLag,
            lagging,
            || format!("p95 ack {:.1}ms", obs.p95_decision_to_ack_ms.unwrap_or(0.0)),
            now_ms,
        );

        let too_many = obs.outstanding_orders >= self.thresholds.max_outstanding_orders;
        self.apply(
            KillKind::MaxOrders,
            too_many,
            || format!("{} outstanding orders", obs.outstanding_orders),
            now_ms,
        );

        // DailyLoss activates on threshold and stays active until midnight.
        let loss_limit = self.thresholds.daily_loss_limit_percent * obs.opening_bankroll;
        if obs.daily_pnl <= -loss_limit && loss_limit > 0.0 {
            self.activate(
                KillKind::DailyLoss,
                format!("daily pnl {:.2} <= -{:.2}", obs.daily_pnl, loss_limit),
                now_ms,
            );
        }

        self.emit_reminders(now_ms);
    }

    pub fn set_manual(&mut self, reason: impl Into<String>, now_ms: i64) {
        self.activate(KillKind::Manual, reason.into(), now_ms);
    }

    pub fn clear_manual(&mut self) {
        if self.active.remove(&KillKind::Manual).is_some() {
            info!("manual kill switch cleared");
        }
    }

    /// First active switch, StaleFeed through Manual. Any active switch
    /// halts all admissions.
    pub fn active(&self) -> Option<(KillKind, &str)> {
        const ORDER: [KillKind; 5] = [
            KillKind::StaleFeed,
            KillKind::RpcLag,
            KillKind::MaxOrders,
            KillKind::DailyLoss,
            KillKind::Manual,
        ];
        ORDER.iter().find_map(|kind| {
            self.active
                .get(kind)
                .map(|sw| (*kind, sw.reason.as_str()))
        })
    }

    pub fn is_active(&self, kind: KillKind) -> bool {
        self.active.contains_key(&kind)
    }

    /// Earliest activation time across active switches, for the exit-code-3
    /// halt-retention check at shutdown.
    pub fn active_since_ms(&self) -> Option<i64> {
        self.active.values().map(|sw| sw.since_ms).min()
    }

    fn apply(
        &mut self,
        kind: KillKind,
        condition: bool,
        reason: impl FnOnce() -> String,
        now_ms: i64,
    ) {
        if condition {
            self.activate(kind, reason(), now_ms);
        } else if let Some(sw) = self.active.get_mut(&kind) {
            // Condition clean: start (or continue) the debounce window.
            let clean_since = *sw.clean_since_ms.get_or_insert(now_ms);
            if now_ms - clean_since >= self.thresholds.debounce_ms {
                self.active.remove(&kind);
                info!(kind = ?kind, "kill switch cleared after debounce");
            }
        }
    }

    fn activate(&mut self, kind: KillKind, reason: String, now_ms: i64) {
        match self.active.get_mut(&kind) {
            Some(sw) => {
                // Condition re-asserted: cancel any pending debounce clear.
                sw.clean_since_ms = None;
                sw.reason = reason;
            }
            None => {
                error!(kind = ?kind, reason = %reason, "KILL SWITCH ACTIVE: all admissions halted");
                self.active.insert(
                    kind,
                    ActiveSwitch {
                        reason,
                        since_ms: now_ms,
                        last_emit_ms: now_ms,
                        clean_since_ms: None,
                    },
                );
            }
        }
    }

    fn emit_reminders(&mut self, now_ms: i64) {
        for (kind, sw) in self.active.iter_mut() {
            if now_ms - sw.last_emit_ms >= ACTIVE_REMINDER_INTERVAL_MS {
                warn!(kind = ?kind, reason = %sw.reason, active_for_ms = now_ms - sw.since_ms,
                    "kill switch still active");
                sw.last_emit_ms = now_ms;
            }
        }
    }
}

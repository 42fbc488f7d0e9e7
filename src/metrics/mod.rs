//! Rolling per-trade latency and outcome metrics.
//!
//! Samples older than the retention window are pruned on every snapshot.
//! Percentiles use linear interpolation over the sorted current window, and
//! every snapshot is computed under one lock so readers never see torn
//! percentile fields.
//!
//! Execution-rate and win-rate are distinct: execution-rate is fills over
//! attempts, win-rate is winning settlements over settled positions.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::TradeOutcome;

#[derive(Clone, Copy, Debug)]
struct Sample {
    at_ms: i64,
    value: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub n: usize,
}

/// Consistent point-in-time view of all metric fields.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub tick_to_decision: Percentiles,
    pub decision_to_ack: Percentiles,
    pub attempts: u64,
    pub filled: u64,
    pub gate_rejected: u64,
    pub venue_rejected: u64,
    pub timeouts: u64,
    pub settled: u64,
    pub wins: u64,
    pub avg_edge_cents: f64,
    pub execution_rate: f64,
    pub win_rate: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct AlertThresholds {
    pub max_p95_decision_to_ack_ms: f64,
    pub max_p99_tick_to_decision_ms: f64,
    pub min_execution_rate: f64,
    /// Rate alerts are suppressed below this many attempts.
    pub min_attempts: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Alert {
    DecisionToAckP95 { observed_ms: f64, limit_ms: f64 },
    TickToDecisionP99 { observed_ms: f64, limit_ms: f64 },
    LowExecutionRate { observed: f64, floor: f64 },
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Alert::DecisionToAckP95 { observed_ms, limit_ms } => {
                write!(f, "decision-to-ack p95 {:.1}ms > {:.1}ms", observed_ms, limit_ms)
            }
            Alert::TickToDecisionP99 { observed_ms, limit_ms } => {
                write!(f, "tick-to-decision p99 {:.1}ms > {:.1}ms", observed_ms, limit_ms)
            }
            Alert::LowExecutionRate { observed, floor } => {
                write!(f, "execution rate {:.1}% < {:.1}%", observed * 100.0, floor * 100.0)
            }
        }
    }
}

struct Inner {
    tick_to_decision: VecDeque<Sample>,
    decision_to_ack: VecDeque<Sample>,
    edge_cents: VecDeque<Sample>,
    attempts: u64,
    filled: u64,
    gate_rejected: u64,
    venue_rejected: u64,
    timeouts: u64,
    settled: u64,
    wins: u64,
}

pub struct MetricsCollector {
    inner: Mutex<Inner>,
    history_ms: i64,
}

/// Linear-interpolation percentile over an already-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = q * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let frac = rank - lo as f64;
            if lo + 1 >= n {
                sorted[n - 1]
            } else {
                sorted[lo] + frac * (sorted[lo + 1] - sorted[lo])
            }
        }
    }
}

fn percentiles_of(window: &VecDeque<Sample>) -> Percentiles {
    let mut values: Vec<f64> = window.iter().map(|s| s.value).collect();
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Percentiles {
        p50: percentile(&values, 0.50),
        p95: percentile(&values, 0.95),
        p99: percentile(&values, 0.99),
        n: values.len(),
    }
}

fn prune(window: &mut VecDeque<Sample>, cutoff_ms: i64) {
    while window.front().map_or(false, |s| s.at_ms < cutoff_ms) {
        window.pop_front();
    }
}

impl MetricsCollector {
    pub fn new(history_hours: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tick_to_decision: VecDeque::with_capacity(1024),
                decision_to_ack: VecDeque::with_capacity(1024),
                edge_cents: VecDeque::with_capacity(1024),
                attempts: 0,
                filled: 0,
                gate_rejected: 0,
                venue_rejected: 0,
                timeouts: 0,
                settled: 0,
                wins: 0,
            }),
            history_ms: history_hours * 3_600_000,
        }
    }

    pub fn record_attempt(
        &self,
        outcome: &TradeOutcome,
        tick_to_decision_ms: f64,
        decision_to_ack_ms: f64,
        edge_cents: f64,
        now_ms: i64,
    ) {
        let mut inner = self.inner.lock();
        inner.attempts += 1;
        match outcome {
            TradeOutcome::Filled => inner.filled += 1,
            TradeOutcome::RejectedByGate(_) => inner.gate_rejected += 1,
            TradeOutcome::RejectedByVenue(_) => inner.venue_rejected += 1,
            TradeOutcome::Timeout => inner.timeouts += 1,
        }
        inner.tick_to_decision.push_back(Sample { at_ms: now_ms, value: tick_to_decision_ms });
        inner.decision_to_ack.push_back(Sample { at_ms: now_ms, value: decision_to_ack_ms });
        inner.edge_cents.push_back(Sample { at_ms: now_ms, value: edge_cents });
    }

    pub fn record_settlement(&self, won: bool) {
        let mut inner = self.inner.lock();
        inner.settled += 1;
        if won {
            inner.wins += 1;
        }
    }

    pub fn snapshot(&self, now_ms: i64) -> MetricsSnapshot {
        let mut inner = self.inner.lock();
        let cutoff = now_ms - self.history_ms;
        prune(&mut inner.tick_to_decision, cutoff);
        prune(&mut inner.decision_to_ack, cutoff);
        prune(&mut inner.edge_cents, cutoff);

        let avg_edge_cents = if inner.edge_cents.is_empty() {
            0.0
        } else {
            inner.edge_cents.iter().map(|s| s.value).sum::<f64>() / inner.edge_cents.len() as f64
        };
        let execution_rate = if inner.attempts > 0 {
            inner.filled as f64 / inner.attempts as f64
        } else {
            0.0
        };
        let win_rate = if inner.settled > 0 {
            inner.wins as f64 / inner.settled as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            tick_to_decision: percentiles_of(&inner.tick_to_decision),
            decision_to_ack: percentiles_of(&inner.decision_to_ack),
            attempts: inner.attempts,
            filled: inner.filled,
            gate_rejected: inner.gate_rejected,
            venue_rejected: inner.venue_rejected,
            timeouts: inner.timeouts,
            settled: inner.settled,
            wins: inner.wins,
            avg_edge_cents,
            execution_rate,
            win_rate,
        }
    }

    /// p95 of decision-to-ack over the trailing window, for the RpcLag kill
    /// switch. None until any sample exists.
    pub fn p95_decision_to_ack(&self, now_ms: i64) -> Option<f64> {
        let snap = self.snapshot(now_ms);
        if snap.decision_to_ack.n == 0 {
            None
        } else {
            Some(snap.decision_to_ack.p95)
        }
    }

    pub fn alerts(&self, thresholds: &AlertThresholds, now_ms: i64) -> Vec<Alert> {
        let snap = self.snapshot(now_ms);
        let mut out = Vec::new();
        if snap.decision_to_ack.n > 0 && snap.decision_to_ack.p95 > thresholds.max_p95_decision_to_ack_ms {
            out.push(Alert::DecisionToAckP95 {
                observed_ms: snap.decision_to_ack.p95,
                limit_ms: thresholds.max_p95_decision_to_ack_ms,
            });
        }
        if snap.tick_to_decision.n > 0 && snap.tick_to_decision.p99 > thresholds.max_p99_tick_to_decision_ms {
            out.push(Alert::TickToDecisionP99 {
                observed_ms: snap.tick_to_decision.p99,
                limit_ms: thresholds.max_p99_tick_to_decision_ms,
            });
        }
        if snap.attempts >= thresholds.min_attempts && snap.execution_rate < thresholds.min_execution_rate {
            out.push(Alert::LowExecutionRate {
                observed: snap.execution_rate,
                floor: thresholds.min_execution_rate,
            });
        }
        out
    }
}

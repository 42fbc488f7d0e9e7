//! Engine orchestration.
//!
//! Wires the lifecycle machine, scheduler, risk gate, allocator, recycler,
//! executor, journal, and metrics into one [`Core`], and runs the
//! cooperative task set: market intake, tick dispatcher, transition sweeper,
//! risk monitor, recycler drain, and exactly one execution worker. The
//! worker serializes all dispatch, which keeps rate limiting and dedupe
//! local reasoning problems.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::capital::allocator::{payout, AllocationResult, CapitalAllocator, ExposureLimits};
use crate::capital::recycler::Recycler;
use crate::clock::{utc_date, Clock};
use crate::config::{Config, JournalBackendKind};
use crate::engine::eligibility::{self, EligibilityParams};
use crate::engine::lifecycle::{LifecycleParams, MarketPhase, MarketStateMachine};
use crate::engine::scheduler::PriorityScheduler;
use crate::error::{FatalError, GateError};
use crate::exec::executor::{Dispatch, Executor, ExecutorConfig};
use crate::exec::venue::VenueClient;
use crate::journal::TradeJournal;
use crate::metrics::MetricsCollector;
use crate::risk::gate::{RiskGate, RiskGateConfig};
use crate::types::{Action, MarketRecord, OrderRequest, PriceTick, Side, TradeOutcome, TradeRecord};

/// Resolution of a binary market, from the settlement feed (or synthesized
/// in dry-run).
#[derive(Clone, Debug)]
pub struct ResolutionEvent {
    pub token_id: String,
    pub won: bool,
}

#[derive(Clone, Debug)]
struct FillInfo {
    size_usd: f64,
    price: f64,
    correlation_id: String,
}

/// Minimum pause before re-attempting a market the gate just denied.
const GATE_DENIAL_DEFER_MS: i64 = 1000;

pub struct Core {
    pub clock: Clock,
    pub lifecycle: Arc<MarketStateMachine>,
    pub gate: Arc<RiskGate>,
    pub allocator: Arc<CapitalAllocator>,
    pub recycler: Arc<Recycler>,
    pub executor: Arc<Executor>,
    pub journal: Arc<TradeJournal>,
    pub metrics: Arc<MetricsCollector>,
    pub config: Config,
    scheduler: Mutex<PriorityScheduler>,
    fills: Mutex<HashMap<String, FillInfo>>,
    deferred: Mutex<HashMap<String, i64>>,
}

pub fn build_core(
    config: Config,
    clock: Clock,
    venue: Arc<dyn VenueClient>,
) -> Result<Arc<Core>, FatalError> {
    let journal = Arc::new(match config.journal_backend {
        JournalBackendKind::Jsonl => {
            TradeJournal::jsonl(&config.journal_dir, utc_date(clock.now_ms()))?
        }
        JournalBackendKind::Memory => TradeJournal::memory(),
    });
    let metrics = Arc::new(MetricsCollector::new(config.history_hours));
    let allocator = Arc::new(CapitalAllocator::new(
        config.bankroll,
        ExposureLimits {
            max_per_market_percent: config.max_exposure_per_market_percent,
            max_per_market_absolute: config.max_exposure_per_market_absolute,
            max_total_percent: config.max_total_exposure_percent,
        },
        config.order_split_threshold,
        config.order_split_count,
    ));
    let recycler = Arc::new(Recycler::new(
        allocator.clone(),
        config.recycle_delay_ms,
        config.recycler_capacity,
    ));
    let gate = Arc::new(RiskGate::new(
        &RiskGateConfig {
            stale_feed_threshold_ms: config.stale_feed_threshold_ms,
            rpc_lag_threshold_ms: config.rpc_lag_threshold_ms,
            max_outstanding_orders: config.max_outstanding_orders,
            daily_loss_limit_percent: config.daily_loss_limit_percent,
            kill_debounce_ms: config.kill_debounce_ms,
            failure_threshold: config.failure_threshold,
            recovery_timeout_seconds: config.recovery_timeout_seconds,
            half_open_max_requests: config.half_open_max_requests,
        },
        allocator.clone(),
        clock.now_ms(),
    ));
    let lifecycle = Arc::new(MarketStateMachine::new(LifecycleParams {
        stale_feed_threshold_ms: config.stale_feed_threshold_ms,
        max_failures_before_hold: config.max_failures_before_hold,
        failure_decay_ms: config.failure_decay_sec * 1000,
        eligibility: EligibilityParams {
            time_to_eligibility_sec: config.time_to_eligibility_sec,
            max_buy_price: config.max_buy_price,
            min_edge: config.min_edge,
        },
    }));
    let executor = Arc::new(Executor::new(
        venue,
        journal.clone(),
        metrics.clone(),
        clock.clone(),
        ExecutorConfig {
            order_timeout_ms: config.order_timeout_ms,
            max_retries: config.max_retries,
            dedupe_grid_cents: config.dedupe_grid_cents,
            dedupe_window_sec: config.dedupe_window_sec,
            max_orders_per_minute: config.max_orders_per_minute,
            dry_run: config.dry_run,
        },
    ));
    Ok(Arc::new(Core {
        clock,
        lifecycle,
        gate,
        allocator,
        recycler,
        executor,
        journal,
        metrics,
        config,
        scheduler: Mutex::new(PriorityScheduler::new()),
        fills: Mutex::new(HashMap::new()),
        deferred: Mutex::new(HashMap::new()),
    }))
}

impl Core {
    /// One transition sweep: apply lifecycle rules, queue eligible markets,
    /// synthesize dry-run resolutions for markets entering Reconciling,
    /// retire expired never-executed markets, purge old Done records.
    pub fn sweep(&self, now_ms: i64) -> Result<(), FatalError> {
        let transitions = self.lifecycle.check_transitions(now_ms);
        for (token_id, transition) in &transitions {
            if transition.to == MarketPhase::Reconciling && self.config.dry_run {
                // Paper venue: the snipe entered at near-certainty, so the
                // synthetic resolution is a win.
                self.resolve(token_id, true, now_ms)?;
            }
        }

        {
            let mut scheduler = self.scheduler.lock();
            for snap in self.lifecycle.get_markets_by_state(MarketPhase::Eligible) {
                if !scheduler.contains(&snap.token_id) {
                    scheduler.push(&snap);
                }
            }
        }

        // Expired markets that never reached execution have nothing to
        // reconcile; retire them directly.
        for phase in [MarketPhase::Discovered, MarketPhase::Watching, MarketPhase::OnHold] {
            for snap in self.lifecycle.get_markets_by_state(phase) {
                if now_ms >= snap.end_ms {
                    self.scheduler.lock().remove(&snap.token_id);
                    if let Err(e) = self.lifecycle.drop_market(&snap.token_id, now_ms) {
                        warn!(token_id = %snap.token_id, error = %e, "could not retire expired market");
                    }
                }
            }
        }

        let purged = self
            .lifecycle
            .purge_done_older_than(self.config.done_retention_sec * 1000, now_ms);
        if purged > 0 {
            debug!(purged, "purged retained Done markets");
        }
        Ok(())
    }

    /// Feed one observation round to the kill switches.
    pub fn observe_risk(&self, now_ms: i64) {
        self.gate.observe_conditions(
            self.lifecycle.watched_feed_age_ms(now_ms),
            self.metrics.p95_decision_to_ack(now_ms),
            now_ms,
        );
    }

    /// Route a market resolution into the delayed-release queue. Markets
    /// that never filled resolve immediately with zero pnl.
    pub fn resolve(&self, token_id: &str, won: bool, now_ms: i64) -> Result<(), FatalError> {
        let fill = self.fills.lock().get(token_id).cloned();
        let pnl = fill
            .as_ref()
            .map(|f| payout(f.size_usd, f.price, won))
            .unwrap_or(0.0);
        if self.allocator.market_exposure(token_id) <= 0.0 {
            if let Err(e) = self.lifecycle.mark_resolution(token_id, pnl, now_ms) {
                debug!(token_id, error = %e, "resolution for market with no reservation");
            }
            return Ok(());
        }
        if let Some(released) = self.recycler.schedule(token_id, pnl, now_ms) {
            // FIFO overflow released immediately.
            self.finish_settlement(&released.token_id, released.pnl, now_ms)?;
        }
        Ok(())
    }

    /// Drain due recycler entries: release capital, land markets in Done,
    /// and journal the settlement.
    pub fn drain_recycler(&self, now_ms: i64) -> Result<(), FatalError> {
        for released in self.recycler.tick(now_ms) {
            self.finish_settlement(&released.token_id, released.pnl, now_ms)?;
        }
        Ok(())
    }

    fn finish_settlement(&self, token_id: &str, pnl: f64, now_ms: i64) -> Result<(), FatalError> {
        if let Err(e) = self.lifecycle.mark_resolution(token_id, pnl, now_ms) {
            warn!(token_id, error = %e, "settlement could not finalize market");
        }
        let fill = self.fills.lock().remove(token_id);
        let Some(fill) = fill else {
            return Ok(());
        };
        self.gate.record_settlement_pnl(pnl, now_ms);
        self.metrics.record_settlement(pnl > 0.0);
        let record = TradeRecord {
            id: 0,
            wall_time_ms: now_ms,
            correlation_id: fill.correlation_id,
            token_id: token_id.to_string(),
            side: Side::Yes,
            action: Action::Buy,
            size_usd: fill.size_usd,
            price: fill.price,
            outcome: TradeOutcome::Filled,
            tick_to_decision_ms: 0.0,
            decision_to_ack_ms: 0.0,
            expected_edge_cents: eligibility::edge_cents(fill.price),
            realized_pnl: Some(pnl),
        };
        info!(token_id, pnl, "position settled");
        self.journal.append(record)?;
        Ok(())
    }

    /// Pop the next due market off the scheduler, honoring gate-denial
    /// deferrals. Returns None when nothing is actionable right now.
    pub fn next_market(&self, now_ms: i64) -> Option<String> {
        let mut scheduler = self.scheduler.lock();
        let mut skipped: Vec<String> = Vec::new();
        let picked = loop {
            let Some(token_id) = scheduler.pop() else {
                break None;
            };
            let defer_until = self.deferred.lock().get(&token_id).copied().unwrap_or(0);
            if now_ms < defer_until {
                skipped.push(token_id);
                continue;
            }
            break Some(token_id);
        };
        // Deferred markets stay queued for a later pass.
        for token_id in skipped {
            if let Ok(snap) = self.lifecycle.snapshot(&token_id) {
                scheduler.push(&snap);
            }
        }
        picked
    }

    /// The execution pipeline for one popped market: re-read authoritative
    /// state, re-check eligibility, gate, reserve, dispatch (split children
    /// handled by the executor), and reconcile the reservation with what
    /// actually filled.
    pub async fn execute_market(&self, token_id: &str) -> Result<(), FatalError> {
        let now_ms = self.clock.now_ms();
        let Ok(snapshot) = self.lifecycle.snapshot(token_id) else {
            return Ok(());
        };
        // Stale heap entries are expected; authoritative state wins.
        if snapshot.phase != MarketPhase::Eligible {
            return Ok(());
        }
        let params = EligibilityParams {
            time_to_eligibility_sec: self.config.time_to_eligibility_sec,
            max_buy_price: self.config.max_buy_price,
            min_edge: self.config.min_edge,
        };
        if !eligibility::eligible(&params, &snapshot, now_ms) {
            return Ok(());
        }
        let Some(ask) = snapshot.best_ask else {
            return Ok(());
        };
        let feed_age_ms = snapshot.feed_age_ms(now_ms);
        let tick_to_decision_ms = feed_age_ms.unwrap_or(0) as f64;
        let requested = self.config.order_size_usd;

        // Gate on the amount that will actually be spent: a cap that merely
        // clamps the request is a smaller grant, not a denial. When no
        // positive grant is possible the full request goes through the gate
        // so the denial carries the binding constraint.
        let planned = self.allocator.preview_grant(token_id, requested);
        let attempt_usd = if planned > 0.0 { planned } else { requested };

        if let Err(denial) = self
            .gate
            .pre_execution_check(token_id, attempt_usd, feed_age_ms, now_ms)
        {
            self.defer(token_id, now_ms);
            return self.journal_gate_denial(token_id, attempt_usd, ask, &denial, tick_to_decision_ms);
        }

        let (result, granted) = self
            .allocator
            .request_allocation(token_id, attempt_usd, "expiry_snipe");
        if result != AllocationResult::Success {
            self.defer(token_id, now_ms);
            let denial = match result {
                AllocationResult::InsufficientCapital => GateError::InsufficientCapital,
                AllocationResult::MarketLimitExceeded => GateError::ExposureCapMarket,
                AllocationResult::TotalLimitExceeded => GateError::ExposureCapTotal,
                AllocationResult::AlreadyAllocated => GateError::AlreadyAllocated,
                AllocationResult::InvalidAmount | AllocationResult::Success => {
                    error!(token_id, requested, "allocation rejected invalid amount");
                    return Ok(());
                }
            };
            return self.journal_gate_denial(token_id, requested, ask, &denial, tick_to_decision_ms);
        }
        if granted < requested {
            info!(token_id, requested, granted, "grant clamped by caps");
        }

        if let Err(e) = self.lifecycle.mark_execution_started(token_id, granted) {
            // State moved under us between pop and start; hand the capital back.
            warn!(token_id, error = %e, "market no longer executable");
            let _ = self.allocator.release_allocation(token_id, 0.0);
            return Ok(());
        }

        let request = match OrderRequest::new(
            token_id,
            Side::Yes,
            Action::Buy,
            granted,
            ask,
            "expiry_snipe",
            self.config.max_order_size_usd,
        ) {
            Ok(r) => r,
            Err(e) => {
                error!(token_id, error = %e, "order construction bug");
                let _ = self.allocator.release_allocation(token_id, 0.0);
                let _ = self.lifecycle.mark_execution_failed(token_id);
                return Ok(());
            }
        };
        let correlation_id = request.correlation_id.to_string();
        let children = self.allocator.split_sizes(granted).unwrap_or_default();

        self.gate.order_started();
        let dispatch = self
            .executor
            .execute(request, children, snapshot.negative_risk, tick_to_decision_ms)
            .await;
        self.gate.order_finished();

        let (records, filled_usd) = match dispatch? {
            Dispatch::Duplicate => {
                debug!(token_id, "request suppressed as in-flight duplicate");
                let _ = self.allocator.release_allocation(token_id, 0.0);
                let _ = self.lifecycle.mark_execution_failed(token_id);
                self.defer(token_id, self.clock.now_ms());
                return Ok(());
            }
            Dispatch::Completed { records, filled_usd } => (records, filled_usd),
        };

        for record in &records {
            let success = record.outcome.is_filled();
            self.gate.post_execution_record(
                token_id,
                success,
                0.0,
                record.decision_to_ack_ms,
                self.clock.now_ms(),
            );
            if !success {
                let _ = self.lifecycle.mark_failure(
                    token_id,
                    &format!("{:?}", record.outcome),
                    self.clock.now_ms(),
                );
            }
        }

        if filled_usd <= 0.0 {
            let _ = self.allocator.release_allocation(token_id, 0.0);
            if let Err(e) = self.lifecycle.mark_execution_failed(token_id) {
                warn!(token_id, error = %e, "post-dispatch state repair failed");
            }
            self.defer(token_id, self.clock.now_ms());
            return Ok(());
        }
        if filled_usd < granted {
            let _ = self.allocator.shrink_reservation(token_id, filled_usd);
            let _ = self.lifecycle.adjust_reserved(token_id, filled_usd);
        }
        self.fills.lock().insert(
            token_id.to_string(),
            FillInfo {
                size_usd: filled_usd,
                price: ask,
                correlation_id,
            },
        );
        info!(token_id, filled_usd, price = ask, "position opened");
        Ok(())
    }

    fn defer(&self, token_id: &str, now_ms: i64) {
        self.deferred
            .lock()
            .insert(token_id.to_string(), now_ms + GATE_DENIAL_DEFER_MS);
    }

    fn journal_gate_denial(
        &self,
        token_id: &str,
        size_usd: f64,
        price: f64,
        denial: &GateError,
        tick_to_decision_ms: f64,
    ) -> Result<(), FatalError> {
        warn!(token_id, denial = %denial, "admission denied");
        let now_ms = self.clock.now_ms();
        let outcome = TradeOutcome::RejectedByGate(denial.tag().to_string());
        let record = TradeRecord {
            id: 0,
            wall_time_ms: now_ms,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            token_id: token_id.to_string(),
            side: Side::Yes,
            action: Action::Buy,
            size_usd,
            price,
            outcome: outcome.clone(),
            tick_to_decision_ms,
            decision_to_ack_ms: 0.0,
            expected_edge_cents: eligibility::edge_cents(price),
            realized_pnl: None,
        };
        self.journal.append(record)?;
        self.metrics.record_attempt(
            &outcome,
            tick_to_decision_ms,
            0.0,
            eligibility::edge_cents(price),
            now_ms,
        );
        Ok(())
    }

    pub fn queued_markets(&self) -> usize {
        self.scheduler.lock().len()
    }
}

async fn shutdown_seen(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run the cooperative task set until shutdown or a fatal error. On
/// shutdown, new admissions stop immediately and in-flight work is awaited
/// up to the configured grace; reservations for still-Executing markets
/// stay booked.
pub async fn run_core(
    core: Arc<Core>,
    mut market_rx: mpsc::Receiver<MarketRecord>,
    mut tick_rx: mpsc::Receiver<PriceTick>,
    mut resolution_rx: mpsc::Receiver<ResolutionEvent>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), FatalError> {
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<FatalError>(4);
    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    // Market intake.
    {
        let core = core.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            tokio::pin! { let stop = shutdown_seen(shutdown); }
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    maybe = market_rx.recv() => match maybe {
                        Some(record) => {
                            if let Err(e) = core.lifecycle.add_market(record) {
                                debug!(error = %e, "market intake");
                            }
                        }
                        None => break,
                    },
                }
            }
        }));
    }

    // Price-tick dispatcher. Single consumer preserves per-token arrival order.
    {
        let core = core.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            tokio::pin! { let stop = shutdown_seen(shutdown); }
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    maybe = tick_rx.recv() => match maybe {
                        Some(tick) => {
                            let now_ms = core.clock.now_ms();
                            if let Err(e) =
                                core.lifecycle.update_price(&tick.token_id, tick.bid, tick.ask, now_ms)
                            {
                                debug!(token_id = %tick.token_id, error = %e, "tick dropped");
                            }
                        }
                        None => break,
                    },
                }
            }
        }));
    }

    // Resolution intake.
    {
        let core = core.clone();
        let shutdown = shutdown_rx.clone();
        let fatal_tx = fatal_tx.clone();
        tasks.push(tokio::spawn(async move {
            tokio::pin! { let stop = shutdown_seen(shutdown); }
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    maybe = resolution_rx.recv() => match maybe {
                        Some(event) => {
                            let now_ms = core.clock.now_ms();
                            if let Err(fatal) = core.resolve(&event.token_id, event.won, now_ms) {
                                let _ = fatal_tx.send(fatal).await;
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        }));
    }

    // Transition sweeper.
    {
        let core = core.clone();
        let shutdown = shutdown_rx.clone();
        let fatal_tx = fatal_tx.clone();
        let period = Duration::from_millis(core.config.transition_sweep_interval_ms.max(1) as u64);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            tokio::pin! { let stop = shutdown_seen(shutdown); }
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = interval.tick() => {
                        if let Err(fatal) = core.sweep(core.clock.now_ms()) {
                            let _ = fatal_tx.send(fatal).await;
                            break;
                        }
                    }
                }
            }
        }));
    }

    // Risk monitor.
    {
        let core = core.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(1000));
            tokio::pin! { let stop = shutdown_seen(shutdown); }
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = interval.tick() => core.observe_risk(core.clock.now_ms()),
                }
            }
        }));
    }

    // Recycler drain.
    {
        let core = core.clone();
        let shutdown = shutdown_rx.clone();
        let fatal_tx = fatal_tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            tokio::pin! { let stop = shutdown_seen(shutdown); }
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = interval.tick() => {
                        if let Err(fatal) = core.drain_recycler(core.clock.now_ms()) {
                            let _ = fatal_tx.send(fatal).await;
                            break;
                        }
                    }
                }
            }
        }));
    }

    // The execution worker. Exactly one.
    {
        let core = core.clone();
        let shutdown = shutdown_rx.clone();
        let fatal_tx = fatal_tx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let next = core.next_market(core.clock.now_ms());
                match next {
                    Some(token_id) => {
                        if let Err(fatal) = core.execute_market(&token_id).await {
                            let _ = fatal_tx.send(fatal).await;
                            break;
                        }
                    }
                    None => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
        }));
    }
    drop(fatal_tx);

    let result = tokio::select! {
        maybe_fatal = fatal_rx.recv() => match maybe_fatal {
            Some(fatal) => {
                error!(error = %fatal, "fatal engine error");
                Err(fatal)
            }
            None => Ok(()),
        },
        _ = shutdown_seen(shutdown_rx.clone()) => {
            info!("shutdown signal received, refusing new admissions");
            Ok(())
        }
    };

    let grace = Duration::from_millis(core.config.shutdown_grace_ms.max(1) as u64);
    let drained = tokio::time::timeout(grace, async {
        for task in &mut tasks {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("shutdown grace elapsed, aborting remaining tasks");
        for task in &tasks {
            task.abort();
        }
    }
    info!(reserved = core.allocator.total_allocated(), "engine stopped");
    result
}

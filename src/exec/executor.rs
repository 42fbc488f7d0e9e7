//! Order dispatch: dedupe, rate limiting, fill-or-kill execution.
//!
//! The venue client is synchronous; dispatch runs on the blocking worker
//! pool under an explicit timeout so cooperative tasks never stall. Every
//! terminal outcome is durably journaled and metered before `execute`
//! returns. Rate-limit bookkeeping and the dedupe maps share one critical
//! section.
//!
//! A request above the split threshold arrives with its child sizes and is
//! deduped once as a whole; children dispatch sequentially and the tail is
//! abandoned on the first rejection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::{Clock, Stopwatch};
use crate::error::{FatalError, VenueError};
use crate::exec::venue::{MarketOrderSpec, TimeInForce, VenueClient};
use crate::journal::TradeJournal;
use crate::metrics::MetricsCollector;
use crate::types::{OrderRequest, TradeOutcome, TradeRecord};

#[derive(Clone, Copy, Debug)]
pub struct ExecutorConfig {
    pub order_timeout_ms: i64,
    pub max_retries: u32,
    pub dedupe_grid_cents: f64,
    pub dedupe_window_sec: i64,
    pub max_orders_per_minute: u32,
    pub dry_run: bool,
}

/// Result of one logical execution: either every terminal child outcome was
/// journaled, or the whole request was suppressed as a duplicate with no
/// side effects.
#[derive(Debug)]
pub enum Dispatch {
    Completed {
        records: Vec<TradeRecord>,
        filled_usd: f64,
    },
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DedupeKey {
    token_id: String,
    side: crate::types::Side,
    action: crate::types::Action,
    quantized_size: i64,
}

impl DedupeKey {
    fn from_request(request: &OrderRequest, grid_cents: f64) -> Self {
        let cents = request.size_usd * 100.0;
        Self {
            token_id: request.token_id.clone(),
            side: request.side,
            action: request.action,
            quantized_size: (cents / grid_cents).round() as i64,
        }
    }
}

/// Token bucket over the per-minute order budget. Starts full (burst up to
/// the budget), refills continuously.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_per_minute: u32) -> Self {
        let capacity = max_per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.capacity / 60.0).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct ExecState {
    inflight: HashSet<DedupeKey>,
    /// Filled keys and when they filled; suppresses repeats inside the
    /// dedupe window.
    recent_fills: HashMap<DedupeKey, i64>,
    bucket: TokenBucket,
}

pub struct Executor {
    venue: Arc<dyn VenueClient>,
    journal: Arc<TradeJournal>,
    metrics: Arc<MetricsCollector>,
    clock: Clock,
    state: Mutex<ExecState>,
    config: ExecutorConfig,
}

/// Exponential backoff for rate-limit and retryable venue rejections:
/// 1s, 2s, 4s, ... capped at 5 minutes.
fn backoff_ms(attempt: u32) -> u64 {
    (1000u64 << attempt.min(8)).min(300_000)
}

impl Executor {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        journal: Arc<TradeJournal>,
        metrics: Arc<MetricsCollector>,
        clock: Clock,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            venue,
            journal,
            metrics,
            clock,
            state: Mutex::new(ExecState {
                inflight: HashSet::new(),
                recent_fills: HashMap::new(),
                bucket: TokenBucket::new(config.max_orders_per_minute),
            }),
            config,
        }
    }

    /// Dispatch one logical fill-or-kill request. `children` carries the
    /// split sizes for large orders (empty means a single dispatch of the
    /// full size). Returns after every terminal outcome has been journaled
    /// and metered, or immediately with `Duplicate`.
    pub async fn execute(
        &self,
        request: OrderRequest,
        children: Vec<f64>,
        negative_risk: bool,
        tick_to_decision_ms: f64,
    ) -> Result<Dispatch, FatalError> {
        let key = DedupeKey::from_request(&request, self.config.dedupe_grid_cents);

        // Dedupe admission and rate bookkeeping share this critical section.
        {
            let mut state = self.state.lock();
            let now_ms = self.clock.now_ms();
            let window_ms = self.config.dedupe_window_sec * 1000;
            state
                .recent_fills
                .retain(|_, filled_at| now_ms - *filled_at < window_ms);
            if state.inflight.contains(&key) || state.recent_fills.contains_key(&key) {
                debug!(token_id = %request.token_id, "duplicate request suppressed");
                return Ok(Dispatch::Duplicate);
            }
            state.inflight.insert(key.clone());
        }

        let result = self
            .run_children(&request, children, negative_risk, tick_to_decision_ms)
            .await;

        // Clear in-flight state even when the journal failed fatally.
        let filled = result
            .as_ref()
            .map(|(_, filled_usd)| *filled_usd > 0.0)
            .unwrap_or(false);
        {
            let mut state = self.state.lock();
            state.inflight.remove(&key);
            if filled {
                state.recent_fills.insert(key, self.clock.now_ms());
            }
        }

        let (records, filled_usd) = result?;
        Ok(Dispatch::Completed { records, filled_usd })
    }

    async fn run_children(
        &self,
        request: &OrderRequest,
        children: Vec<f64>,
        negative_risk: bool,
        tick_to_decision_ms: f64,
    ) -> Result<(Vec<TradeRecord>, f64), FatalError> {
        let sizes = if children.is_empty() {
            vec![request.size_usd]
        } else {
            children
        };
        let mut records = Vec::with_capacity(sizes.len());
        let mut filled_usd = 0.0;

        for child_usd in sizes {
            let (outcome, decision_to_ack_ms) = self
                .dispatch_with_retries(request, child_usd, negative_risk)
                .await;

            let now_ms = self.clock.now_ms();
            let mut record = TradeRecord {
                id: 0, // stamped by the journal
                wall_time_ms: now_ms,
                correlation_id: request.correlation_id.to_string(),
                token_id: request.token_id.clone(),
                side: request.side,
                action: request.action,
                size_usd: child_usd,
                price: request.price,
                outcome: outcome.clone(),
                tick_to_decision_ms,
                decision_to_ack_ms,
                expected_edge_cents: request.expected_edge_cents(),
                realized_pnl: None,
            };
            // Durable before control returns to the scheduler.
            record.id = self.journal.append(record.clone())?;
            self.metrics.record_attempt(
                &outcome,
                tick_to_decision_ms,
                decision_to_ack_ms,
                record.expected_edge_cents,
                now_ms,
            );

            let is_fill = outcome.is_filled();
            records.push(record);
            if is_fill {
                filled_usd += child_usd;
            } else {
                // Abort the tail on the first rejection.
                break;
            }
        }
        Ok((records, filled_usd))
    }

    /// Rate-limit admission, dispatch, and the retry loop for retryable
    /// venue rejections. Returns the terminal outcome and the ack latency.
    async fn dispatch_with_retries(
        &self,
        request: &OrderRequest,
        child_usd: f64,
        negative_risk: bool,
    ) -> (TradeOutcome, f64) {
        let mut attempt: u32 = 0;
        loop {
            let admitted = self.state.lock().bucket.try_take();
            if admitted {
                break;
            }
            if attempt >= self.config.max_retries {
                warn!(token_id = %request.token_id, attempts = attempt, "rate limit retries exhausted");
                return (
                    TradeOutcome::RejectedByVenue(VenueError::RateLimited.tag()),
                    0.0,
                );
            }
            let delay = backoff_ms(attempt);
            debug!(token_id = %request.token_id, delay_ms = delay, "rate limited, backing off");
            attempt += 1;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let stopwatch = Stopwatch::start();
        let mut venue_attempt: u32 = 0;
        loop {
            match self.dispatch_once(request, child_usd, negative_risk).await {
                Ok(()) => return (TradeOutcome::Filled, stopwatch.elapsed_ms()),
                Err(VenueError::Timeout) => {
                    return (TradeOutcome::Timeout, stopwatch.elapsed_ms());
                }
                Err(e) if e.is_retryable() && venue_attempt < self.config.max_retries => {
                    let delay = backoff_ms(venue_attempt);
                    debug!(token_id = %request.token_id, error = %e, delay_ms = delay, "retryable venue rejection");
                    venue_attempt += 1;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    return (TradeOutcome::RejectedByVenue(e.tag()), stopwatch.elapsed_ms());
                }
            }
        }
    }

    /// One venue round trip on the blocking pool, bounded by the order
    /// timeout. In dry-run the order is built but never posted; the fill is
    /// synthetic.
    async fn dispatch_once(
        &self,
        request: &OrderRequest,
        child_usd: f64,
        negative_risk: bool,
    ) -> Result<(), VenueError> {
        let venue = self.venue.clone();
        let dry_run = self.config.dry_run;
        let spec = MarketOrderSpec {
            token_id: request.token_id.clone(),
            amount_usd: child_usd,
            price: request.price,
            side: request.side,
            negative_risk,
        };
        let handle = tokio::task::spawn_blocking(move || -> Result<(), VenueError> {
            let signed = venue.create_market_order(&spec)?;
            if dry_run {
                return Ok(());
            }
            let ack = venue.post_order(&signed, TimeInForce::FillOrKill)?;
            if ack.accepted {
                Ok(())
            } else {
                Err(ack.reject.unwrap_or(VenueError::Unknown(0)))
            }
        });

        let timeout = Duration::from_millis(self.config.order_timeout_ms.max(1) as u64);
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "venue dispatch task failed");
                Err(VenueError::Unknown(-1))
            }
            Err(_elapsed) => Err(VenueError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::venue::SimVenue;
    use crate::types::{Action, Side};

    fn make_executor(
        venue: Arc<SimVenue>,
        config: ExecutorConfig,
    ) -> (Executor, Arc<TradeJournal>, Arc<MetricsCollector>) {
        let journal = Arc::new(TradeJournal::memory());
        let metrics = Arc::new(MetricsCollector::new(24));
        let executor = Executor::new(
            venue,
            journal.clone(),
            metrics.clone(),
            Clock::manual(1_000_000),
            config,
        );
        (executor, journal, metrics)
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            order_timeout_ms: 2000,
            max_retries: 3,
            dedupe_grid_cents: 1.0,
            dedupe_window_sec: 300,
            max_orders_per_minute: 30,
            dry_run: false,
        }
    }

    fn request(token: &str, size: f64, price: f64) -> OrderRequest {
        OrderRequest::new(token, Side::Yes, Action::Buy, size, price, "expiry_snipe", 250.0).unwrap()
    }

    fn single_outcome(dispatch: &Dispatch) -> &TradeOutcome {
        match dispatch {
            Dispatch::Completed { records, .. } => &records[0].outcome,
            Dispatch::Duplicate => panic!("unexpected duplicate"),
        }
    }

    /// Scenario: Clean FOK dispatch against an accepting sim venue.
    /// Expected: Filled outcome, one journal entry, metrics count the fill.
    #[tokio::test]
    async fn test_execute_fills_and_journals() {
        let venue = Arc::new(SimVenue::new(1000.0));
        let (executor, journal, metrics) = make_executor(venue.clone(), config());
        let dispatch = executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.5)
            .await
            .unwrap();
        match &dispatch {
            Dispatch::Completed { records, filled_usd } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].outcome, TradeOutcome::Filled);
                assert!((records[0].expected_edge_cents - 3.0).abs() < 1e-9);
                assert_eq!(records[0].id, 1);
                assert!((filled_usd - 10.0).abs() < 1e-9);
            }
            Dispatch::Duplicate => panic!("unexpected duplicate"),
        }
        assert_eq!(journal.iter_since(0).unwrap().len(), 1);
        assert_eq!(metrics.snapshot(1_000_000).filled, 1);
        assert_eq!(venue.posted_count(), 1);
    }

    /// Scenario: Two identical requests (same token, side, action, size) back to back.
    /// Expected: The second returns Duplicate with no journal entry and no venue post.
    #[tokio::test]
    async fn test_duplicate_suppressed_after_fill() {
        let venue = Arc::new(SimVenue::new(1000.0));
        let (executor, journal, _metrics) = make_executor(venue.clone(), config());
        executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        let second = executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert!(matches!(second, Dispatch::Duplicate));
        assert_eq!(journal.iter_since(0).unwrap().len(), 1);
        assert_eq!(venue.posted_count(), 1);
    }

    /// Scenario: Sizes $10.00 and $10.004 with a 1-cent dedupe grid.
    /// Expected: Near-duplicates fold to one key -- the second is suppressed.
    #[tokio::test]
    async fn test_dedupe_grid_folds_near_duplicates() {
        let venue = Arc::new(SimVenue::new(1000.0));
        let (executor, _journal, _metrics) = make_executor(venue.clone(), config());
        executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        let second = executor
            .execute(request("m1", 10.004, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert!(matches!(second, Dispatch::Duplicate));
    }

    /// Scenario: Same size on two different tokens.
    /// Expected: Different dedupe keys; both dispatch.
    #[tokio::test]
    async fn test_dedupe_scoped_per_token() {
        let venue = Arc::new(SimVenue::new(1000.0));
        let (executor, journal, _metrics) = make_executor(venue.clone(), config());
        executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        let second = executor
            .execute(request("m2", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert!(matches!(second, Dispatch::Completed { .. }));
        assert_eq!(journal.iter_since(0).unwrap().len(), 2);
    }

    /// Scenario: Dedupe window of 1s; same request repeated after the manual clock
    /// moves past the window.
    /// Expected: The repeat dispatches again once the window has expired.
    #[tokio::test]
    async fn test_dedupe_window_expires() {
        let venue = Arc::new(SimVenue::new(1000.0));
        let mut cfg = config();
        cfg.dedupe_window_sec = 1;
        let journal = Arc::new(TradeJournal::memory());
        let metrics = Arc::new(MetricsCollector::new(24));
        let clock = Clock::manual(1_000_000);
        let executor = Executor::new(venue, journal.clone(), metrics, clock.clone(), cfg);

        executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        clock.advance(1500);
        let repeat = executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert!(matches!(repeat, Dispatch::Completed { .. }));
        assert_eq!(journal.iter_since(0).unwrap().len(), 2);
    }

    /// Scenario: $120 request split into four $30 children, all accepted.
    /// Expected: One dedupe admission, four sequential venue posts, four
    /// journal records, 120 filled.
    #[tokio::test]
    async fn test_split_children_dispatch_sequentially() {
        let venue = Arc::new(SimVenue::new(1000.0));
        let (executor, journal, _metrics) = make_executor(venue.clone(), config());
        let dispatch = executor
            .execute(request("m1", 120.0, 0.97), vec![30.0, 30.0, 30.0, 30.0], false, 1.0)
            .await
            .unwrap();
        match dispatch {
            Dispatch::Completed { records, filled_usd } => {
                assert_eq!(records.len(), 4);
                assert!(records.iter().all(|r| r.outcome == TradeOutcome::Filled));
                assert!((filled_usd - 120.0).abs() < 1e-9);
            }
            Dispatch::Duplicate => panic!("unexpected duplicate"),
        }
        assert_eq!(venue.posted_count(), 4);
        assert_eq!(journal.iter_since(0).unwrap().len(), 4);
    }

    /// Scenario: Split request whose second child is rejected (retries off).
    /// Expected: Tail aborted -- two venue posts, two journal records, only
    /// the first child's size filled.
    #[tokio::test]
    async fn test_split_aborts_tail_on_rejection() {
        let venue = Arc::new(SimVenue::new(1000.0));
        venue.script_result(Ok(()));
        venue.script_result(Err(VenueError::InvalidSignature));
        let mut cfg = config();
        cfg.max_retries = 0;
        let (executor, journal, _metrics) = make_executor(venue.clone(), cfg);
        let dispatch = executor
            .execute(request("m1", 120.0, 0.97), vec![30.0, 30.0, 30.0, 30.0], false, 1.0)
            .await
            .unwrap();
        match dispatch {
            Dispatch::Completed { records, filled_usd } => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].outcome, TradeOutcome::Filled);
                assert_eq!(
                    records[1].outcome,
                    TradeOutcome::RejectedByVenue("invalid_signature".into())
                );
                assert!((filled_usd - 30.0).abs() < 1e-9);
            }
            Dispatch::Duplicate => panic!("unexpected duplicate"),
        }
        assert_eq!(venue.posted_count(), 2);
        assert_eq!(journal.iter_since(0).unwrap().len(), 2);
    }

    /// Scenario: Budget of 2 orders/minute, no retries; three distinct requests in a burst.
    /// Expected: Two fill, the third is rejected rate_limited without reaching the venue.
    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rejects_third_in_burst() {
        let venue = Arc::new(SimVenue::new(1000.0));
        let mut cfg = config();
        cfg.max_orders_per_minute = 2;
        cfg.max_retries = 0;
        let (executor, journal, _metrics) = make_executor(venue.clone(), cfg);

        for token in ["a", "b"] {
            let d = executor
                .execute(request(token, 10.0, 0.97), vec![], false, 1.0)
                .await
                .unwrap();
            assert_eq!(single_outcome(&d), &TradeOutcome::Filled);
        }
        let third = executor
            .execute(request("c", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert_eq!(
            single_outcome(&third),
            &TradeOutcome::RejectedByVenue("rate_limited".into())
        );
        assert_eq!(venue.posted_count(), 2, "rate-limited order must not reach the venue");
        assert_eq!(journal.iter_since(0).unwrap().len(), 3, "rejection still journaled");
    }

    /// Scenario: Budget of 2/minute exhausted; a third request with 6 retries and
    /// paused time (backoff sleeps auto-advance the clock).
    /// Expected: Backoff retries eventually cross the refill window and the order
    /// fills; no 60s window ever sees more than 2 venue posts.
    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff_succeeds_after_window_rolls() {
        let venue = Arc::new(SimVenue::new(1000.0));
        let mut cfg = config();
        cfg.max_orders_per_minute = 2;
        cfg.max_retries = 6;
        let (executor, _journal, _metrics) = make_executor(venue.clone(), cfg);

        executor.execute(request("a", 10.0, 0.97), vec![], false, 1.0).await.unwrap();
        executor.execute(request("b", 10.0, 0.97), vec![], false, 1.0).await.unwrap();
        let third = executor
            .execute(request("c", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert_eq!(single_outcome(&third), &TradeOutcome::Filled);
        assert_eq!(venue.posted_count(), 3);
    }

    /// Scenario: Venue scripted to reject NoLiquidity twice, then accept; 3 retries allowed.
    /// Expected: Retryable rejections back off and the third attempt fills.
    #[tokio::test(start_paused = true)]
    async fn test_retryable_venue_rejection_retries() {
        let venue = Arc::new(SimVenue::new(1000.0));
        venue.script_rejections(VenueError::NoLiquidity, 2);
        let (executor, _journal, _metrics) = make_executor(venue.clone(), config());
        let dispatch = executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert_eq!(single_outcome(&dispatch), &TradeOutcome::Filled);
        assert_eq!(venue.posted_count(), 3);
    }

    /// Scenario: Venue rejects InvalidSignature (not retryable).
    /// Expected: Fails fast with RejectedByVenue("invalid_signature"); exactly one post.
    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let venue = Arc::new(SimVenue::new(1000.0));
        venue.script_result(Err(VenueError::InvalidSignature));
        let (executor, _journal, _metrics) = make_executor(venue.clone(), config());
        let dispatch = executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert_eq!(
            single_outcome(&dispatch),
            &TradeOutcome::RejectedByVenue("invalid_signature".into())
        );
        assert_eq!(venue.posted_count(), 1);
    }

    /// Scenario: Venue blocks for 500ms against a 50ms order timeout.
    /// Expected: Timeout outcome recorded; the executor did not hang.
    #[tokio::test]
    async fn test_dispatch_timeout() {
        let venue = Arc::new(SimVenue::new(1000.0).with_latency(Duration::from_millis(500)));
        let mut cfg = config();
        cfg.order_timeout_ms = 50;
        let (executor, journal, _metrics) = make_executor(venue, cfg);
        let dispatch = executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert_eq!(single_outcome(&dispatch), &TradeOutcome::Timeout);
        assert_eq!(journal.iter_since(0).unwrap().len(), 1);
    }

    /// Scenario: dry_run executor against the sim venue.
    /// Expected: Synthetic Filled outcome, order built but never posted.
    #[tokio::test]
    async fn test_dry_run_skips_post() {
        let venue = Arc::new(SimVenue::new(1000.0));
        let mut cfg = config();
        cfg.dry_run = true;
        let (executor, journal, _metrics) = make_executor(venue.clone(), cfg);
        let dispatch = executor
            .execute(request("m1", 10.0, 0.97), vec![], false, 1.0)
            .await
            .unwrap();
        assert_eq!(single_outcome(&dispatch), &TradeOutcome::Filled);
        assert_eq!(venue.posted_count(), 0);
        assert_eq!(journal.iter_since(0).unwrap().len(), 1);
    }

    /// Scenario: Backoff schedule across attempts.
    /// Expected: Doubles from 1s and saturates at the 5-minute cap.
    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_ms(0), 1000);
        assert_eq!(backoff_ms(1), 2000);
        assert_eq!(backoff_ms(2), 4000);
        assert_eq!(backoff_ms(8), 256_000);
        assert_eq!(backoff_ms(9), 300_000);
        assert_eq!(backoff_ms(30), 300_000);
    }
}

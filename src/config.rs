use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("config error: {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

fn bad(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        field,
        reason: reason.into(),
    }
}

/// Journal backend, chosen once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalBackendKind {
    Jsonl,
    Memory,
}

impl JournalBackendKind {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => JournalBackendKind::Memory,
            _ => JournalBackendKind::Jsonl,
        }
    }
}

/// Configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    // Eligibility (expiration sniping)
    pub time_to_eligibility_sec: i64,
    pub max_buy_price: f64,
    pub min_edge: f64,
    pub order_size_usd: f64,
    pub max_order_size_usd: f64,

    // Bankroll & exposure caps
    pub bankroll: f64,
    pub max_exposure_per_market_percent: f64,
    pub max_exposure_per_market_absolute: f64,
    pub max_total_exposure_percent: f64,

    // Kill switches
    pub stale_feed_threshold_ms: i64,
    pub rpc_lag_threshold_ms: f64,
    pub max_outstanding_orders: u32,
    pub daily_loss_limit_percent: f64,
    pub kill_debounce_ms: i64,

    // Circuit breaker
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: i64,
    pub half_open_max_requests: u32,

    // Lifecycle
    pub max_failures_before_hold: u32,
    pub failure_decay_sec: i64,
    pub done_retention_sec: i64,
    pub transition_sweep_interval_ms: i64,

    // Executor
    pub max_orders_per_minute: u32,
    pub order_timeout_ms: i64,
    pub max_retries: u32,
    pub dedupe_grid_cents: f64,
    pub dedupe_window_sec: i64,
    pub order_split_threshold: f64,
    pub order_split_count: u32,

    // Capital recycling
    pub recycle_delay_ms: i64,
    pub recycler_capacity: usize,

    // Metrics
    pub history_hours: i64,

    // Process
    pub shutdown_grace_ms: i64,
    pub dry_run: bool,
    pub journal_dir: String,
    pub journal_backend: JournalBackendKind,
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            time_to_eligibility_sec: env_i64("TIME_TO_ELIGIBILITY_SEC", 60),
            max_buy_price: env_f64("MAX_BUY_PRICE", 0.99),
            min_edge: env_f64("MIN_EDGE", 0.01),
            order_size_usd: env_f64("ORDER_SIZE_USD", 10.0),
            max_order_size_usd: env_f64("MAX_ORDER_SIZE_USD", 250.0),

            bankroll: env_f64("BANKROLL", 1000.0),
            max_exposure_per_market_percent: env_f64("MAX_EXPOSURE_PER_MARKET_PERCENT", 0.05),
            max_exposure_per_market_absolute: env_f64("MAX_EXPOSURE_PER_MARKET_ABSOLUTE", 50.0),
            max_total_exposure_percent: env_f64("MAX_TOTAL_EXPOSURE_PERCENT", 0.25),

            stale_feed_threshold_ms: env_i64("STALE_FEED_THRESHOLD_MS", 3000),
            rpc_lag_threshold_ms: env_f64("RPC_LAG_THRESHOLD_MS", 800.0),
            max_outstanding_orders: env_u32("MAX_OUTSTANDING_ORDERS", 10),
            daily_loss_limit_percent: env_f64("DAILY_LOSS_LIMIT_PERCENT", 0.05),
            kill_debounce_ms: env_i64("KILL_DEBOUNCE_MS", 5000),

            failure_threshold: env_u32("FAILURE_THRESHOLD", 3),
            recovery_timeout_seconds: env_i64("RECOVERY_TIMEOUT_SECONDS", 60),
            half_open_max_requests: env_u32("HALF_OPEN_MAX_REQUESTS", 1),

            max_failures_before_hold: env_u32("MAX_FAILURES_BEFORE_HOLD", 5),
            failure_decay_sec: env_i64("FAILURE_DECAY_SEC", 120),
            done_retention_sec: env_i64("DONE_RETENTION_SEC", 600),
            transition_sweep_interval_ms: env_i64("TRANSITION_SWEEP_INTERVAL_MS", 250),

            max_orders_per_minute: env_u32("MAX_ORDERS_PER_MINUTE", 30),
            order_timeout_ms: env_i64("ORDER_TIMEOUT_MS", 2000),
            max_retries: env_u32("MAX_RETRIES", 3),
            dedupe_grid_cents: env_f64("DEDUPE_GRID_CENTS", 1.0),
            dedupe_window_sec: env_i64("DEDUPE_WINDOW_SEC", 300),
            order_split_threshold: env_f64("ORDER_SPLIT_THRESHOLD", 100.0),
            order_split_count: env_u32("ORDER_SPLIT_COUNT", 4),

            recycle_delay_ms: env_i64("RECYCLE_DELAY_MS", 5000),
            recycler_capacity: env_i64("RECYCLER_CAPACITY", 256).max(1) as usize,

            history_hours: env_i64("HISTORY_HOURS", 24),

            shutdown_grace_ms: env_i64("SHUTDOWN_GRACE_MS", 3000),
            dry_run: env_bool("DRY_RUN", true),
            journal_dir: std::env::var("JOURNAL_DIR").unwrap_or_else(|_| "journal".into()),
            journal_backend: JournalBackendKind::from_str(
                &std::env::var("JOURNAL_BACKEND").unwrap_or_else(|_| "jsonl".into()),
            ),
        }
    }

    /// Reject configurations the engine cannot run safely under.
    /// A failure here terminates the process with exit code 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bankroll <= 0.0 || !self.bankroll.is_finite() {
            return Err(bad("BANKROLL", format!("must be positive, got {}", self.bankroll)));
        }
        if !(0.0 < self.max_buy_price && self.max_buy_price < 1.0) {
            return Err(bad("MAX_BUY_PRICE", "must be strictly inside (0,1)"));
        }
        if !(0.0..1.0).contains(&self.min_edge) {
            return Err(bad("MIN_EDGE", "must be in [0,1)"));
        }
        if self.order_size_usd <= 0.0 || self.order_size_usd > self.max_order_size_usd {
            return Err(bad("ORDER_SIZE_USD", "must be in (0, MAX_ORDER_SIZE_USD]"));
        }
        if self.time_to_eligibility_sec <= 0 {
            return Err(bad("TIME_TO_ELIGIBILITY_SEC", "must be positive"));
        }
        for (field, v) in [
            ("MAX_EXPOSURE_PER_MARKET_PERCENT", self.max_exposure_per_market_percent),
            ("MAX_TOTAL_EXPOSURE_PERCENT", self.max_total_exposure_percent),
            ("DAILY_LOSS_LIMIT_PERCENT", self.daily_loss_limit_percent),
        ] {
            if !(0.0 < v && v <= 1.0) {
                return Err(bad(field, format!("must be in (0,1], got {}", v)));
            }
        }
        if self.max_exposure_per_market_absolute <= 0.0 {
            return Err(bad("MAX_EXPOSURE_PER_MARKET_ABSOLUTE", "must be positive"));
        }
        if self.stale_feed_threshold_ms <= 0 || self.transition_sweep_interval_ms <= 0 {
            return Err(bad("STALE_FEED_THRESHOLD_MS", "intervals must be positive"));
        }
        if self.failure_threshold == 0 || self.half_open_max_requests == 0 {
            return Err(bad("FAILURE_THRESHOLD", "breaker thresholds must be at least 1"));
        }
        if self.max_orders_per_minute == 0 {
            return Err(bad("MAX_ORDERS_PER_MINUTE", "must be at least 1"));
        }
        if self.order_timeout_ms <= 0 {
            return Err(bad("ORDER_TIMEOUT_MS", "must be positive"));
        }
        if self.dedupe_grid_cents <= 0.0 {
            return Err(bad("DEDUPE_GRID_CENTS", "must be positive"));
        }
        if self.order_split_count == 0 {
            return Err(bad("ORDER_SPLIT_COUNT", "must be at least 1"));
        }
        if self.history_hours <= 0 {
            return Err(bad("HISTORY_HOURS", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        time_to_eligibility_sec: 60,
        max_buy_price: 0.99,
        min_edge: 0.01,
        order_size_usd: 10.0,
        max_order_size_usd: 250.0,
        bankroll: 1000.0,
        max_exposure_per_market_percent: 0.05,
        max_exposure_per_market_absolute: 50.0,
        max_total_exposure_percent: 0.25,
        stale_feed_threshold_ms: 3000,
        rpc_lag_threshold_ms: 800.0,
        max_outstanding_orders: 10,
        daily_loss_limit_percent: 0.05,
        kill_debounce_ms: 5000,
        failure_threshold: 3,
        recovery_timeout_seconds: 60,
        half_open_max_requests: 1,
        max_failures_before_hold: 5,
        failure_decay_sec: 120,
        done_retention_sec: 600,
        transition_sweep_interval_ms: 250,
        max_orders_per_minute: 30,
        order_timeout_ms: 2000,
        max_retries: 3,
        dedupe_grid_cents: 1.0,
        dedupe_window_sec: 300,
        order_split_threshold: 100.0,
        order_split_count: 4,
        recycle_delay_ms: 5000,
        recycler_capacity: 256,
        history_hours: 24,
        shutdown_grace_ms: 3000,
        dry_run: true,
        journal_dir: "journal".into(),
        journal_backend: JournalBackendKind::Memory,
    }
}

use thiserror::Error;

/// Construction-time validation failures. These are programmer errors: a
/// request that fails construction never reaches the gate or the venue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("invalid size: {0}")]
    InvalidSize(f64),
    #[error("invalid price: {0}")]
    InvalidPrice(f64),
    #[error("invalid token id")]
    InvalidTokenId,
    #[error("invalid side/action combination")]
    InvalidSide,
}

/// Pre-trade admission denials. Expected control flow: logged at WARN,
/// journaled as `RejectedByGate`, never raised.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    #[error("stale feed halt")]
    StaleFeedHalt,
    #[error("rpc lag halt")]
    RpcLagHalt,
    #[error("max outstanding orders halt")]
    MaxOrdersHalt,
    #[error("daily loss halt")]
    DailyLossHalt,
    #[error("manual halt")]
    ManualHalt,
    #[error("circuit breaker open for {0}")]
    BreakerOpen(String),
    #[error("per-market exposure cap")]
    ExposureCapMarket,
    #[error("total exposure cap")]
    ExposureCapTotal,
    #[error("insufficient capital")]
    InsufficientCapital,
    #[error("capital already allocated")]
    AlreadyAllocated,
}

impl GateError {
    /// Stable machine tag carried into journal records.
    pub fn tag(&self) -> &'static str {
        match self {
            GateError::StaleFeedHalt => "stale_feed_halt",
            GateError::RpcLagHalt => "rpc_lag_halt",
            GateError::MaxOrdersHalt => "max_orders_halt",
            GateError::DailyLossHalt => "daily_loss_halt",
            GateError::ManualHalt => "manual_halt",
            GateError::BreakerOpen(_) => "breaker_open",
            GateError::ExposureCapMarket => "exposure_cap_market",
            GateError::ExposureCapTotal => "exposure_cap_total",
            GateError::InsufficientCapital => "insufficient_capital",
            GateError::AlreadyAllocated => "already_allocated",
        }
    }
}

/// Venue-side rejection kinds. Retryable kinds feed the backoff loop; the
/// rest fail fast. All of them increment the market's failure counter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VenueError {
    #[error("no liquidity at price")]
    NoLiquidity,
    #[error("invalid order signature")]
    InvalidSignature,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("rate limited by venue")]
    RateLimited,
    #[error("venue call timed out")]
    Timeout,
    #[error("unknown venue error code {0}")]
    Unknown(i32),
}

impl VenueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VenueError::NoLiquidity | VenueError::RateLimited)
    }

    pub fn tag(&self) -> String {
        match self {
            VenueError::NoLiquidity => "no_liquidity".into(),
            VenueError::InvalidSignature => "invalid_signature".into(),
            VenueError::InsufficientBalance => "insufficient_balance".into(),
            VenueError::RateLimited => "rate_limited".into(),
            VenueError::Timeout => "timeout".into(),
            VenueError::Unknown(code) => format!("unknown_{}", code),
        }
    }
}

/// Unrecoverable process errors. These propagate to the orchestrator and
/// terminate the process with exit code 2.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("journal write failed: {0}")]
    JournalWriteFailed(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: Each retryable classification queried.
    /// Expected: Only NoLiquidity and RateLimited retry; the rest fail fast.
    #[test]
    fn test_venue_retryable_partition() {
        assert!(VenueError::NoLiquidity.is_retryable());
        assert!(VenueError::RateLimited.is_retryable());
        assert!(!VenueError::InvalidSignature.is_retryable());
        assert!(!VenueError::InsufficientBalance.is_retryable());
        assert!(!VenueError::Timeout.is_retryable());
        assert!(!VenueError::Unknown(500).is_retryable());
    }

    /// Scenario: Gate errors rendered as journal tags.
    /// Expected: Tags are stable snake_case strings, breaker tag ignores the token.
    #[test]
    fn test_gate_error_tags() {
        assert_eq!(GateError::StaleFeedHalt.tag(), "stale_feed_halt");
        assert_eq!(GateError::BreakerOpen("tok".into()).tag(), "breaker_open");
        assert_eq!(GateError::ExposureCapTotal.tag(), "exposure_cap_total");
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InputError;

// ─── Market intake (produced by the market source) ───

/// One discovered market, as yielded by the upstream market source.
#[derive(Clone, Debug)]
pub struct MarketRecord {
    pub token_id: String,
    pub condition_id: String,
    pub question: String,
    pub end_ms: i64,
    pub negative_risk: bool,
}

// ─── Feed events (produced by the venue tick stream) ───

#[derive(Clone, Debug)]
pub struct PriceTick {
    pub token_id: String,
    pub bid: f64,
    pub ask: f64,
    pub server_ts_ms: i64,
}

// ─── Sides & actions ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Yes,
    No,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Yes => write!(f, "YES"),
            Side::No => write!(f, "NO"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
        }
    }
}

// ─── Orders ───

/// Ephemeral order value constructed at dispatch time.
///
/// Invariants (size > 0 and at most the configured cap, price strictly
/// inside (0,1), non-empty token) hold by construction; a rejection here is
/// a programmer error, not a runtime outcome.
#[derive(Clone, Debug)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: Side,
    pub action: Action,
    pub size_usd: f64,
    pub price: f64,
    pub strategy: &'static str,
    pub correlation_id: Uuid,
}

impl OrderRequest {
    pub fn new(
        token_id: impl Into<String>,
        side: Side,
        action: Action,
        size_usd: f64,
        price: f64,
        strategy: &'static str,
        max_size_usd: f64,
    ) -> Result<Self, InputError> {
        let token_id = token_id.into();
        if token_id.is_empty() {
            return Err(InputError::InvalidTokenId);
        }
        if !size_usd.is_finite() || size_usd <= 0.0 || size_usd > max_size_usd {
            return Err(InputError::InvalidSize(size_usd));
        }
        if !price.is_finite() || price <= 0.0 || price >= 1.0 {
            return Err(InputError::InvalidPrice(price));
        }
        Ok(Self {
            token_id,
            side,
            action,
            size_usd,
            price,
            strategy,
            correlation_id: Uuid::new_v4(),
        })
    }

    /// Edge against unit parity, in cents.
    pub fn expected_edge_cents(&self) -> f64 {
        (1.0 - self.price) * 100.0
    }
}

// ─── Trade outcomes & journal records ───

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason")]
pub enum TradeOutcome {
    Filled,
    RejectedByGate(String),
    RejectedByVenue(String),
    Timeout,
}

impl TradeOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, TradeOutcome::Filled)
    }
}

/// One journal line. Appended on every attempt, filled or not.
/// Readers must tolerate unknown fields (forward-compatible).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: u64,
    pub wall_time_ms: i64,
    pub correlation_id: String,
    pub token_id: String,
    pub side: Side,
    pub action: Action,
    pub size_usd: f64,
    pub price: f64,
    pub outcome: TradeOutcome,
    pub tick_to_decision_ms: f64,
    pub decision_to_ack_ms: f64,
    pub expected_edge_cents: f64,
    /// Populated at settlement, absent on the attempt line.
    #[serde(default)]
    pub realized_pnl: Option<f64>,
}

//! Venue client seam.
//!
//! The real venue (REST + order signing) lives outside this crate; the core
//! consumes the blocking [`VenueClient`] trait and wraps every call in a
//! timeout. [`SimVenue`] is the in-tree implementation: immediate simulated
//! fills for dry-run paper trading, with scriptable rejections and latency
//! for tests.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::VenueError;
use crate::types::Side;

/// The only time-in-force the engine uses: filled in full immediately or
/// cancelled in full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeInForce {
    FillOrKill,
}

#[derive(Clone, Debug)]
pub struct MarketOrderSpec {
    pub token_id: String,
    pub amount_usd: f64,
    pub price: f64,
    pub side: Side,
    pub negative_risk: bool,
}

#[derive(Clone, Debug)]
pub struct SignedOrder {
    pub token_id: String,
    pub amount_usd: f64,
    pub price: f64,
    pub payload: String,
}

#[derive(Clone, Debug)]
pub struct VenueAck {
    pub accepted: bool,
    pub venue_order_id: Option<String>,
    pub reject: Option<VenueError>,
}

/// Blocking venue operations. Called only from the executor's worker pool,
/// never from a cooperative task.
pub trait VenueClient: Send + Sync + 'static {
    fn create_market_order(&self, spec: &MarketOrderSpec) -> Result<SignedOrder, VenueError>;
    fn post_order(&self, order: &SignedOrder, tif: TimeInForce) -> Result<VenueAck, VenueError>;
    fn usdc_balance(&self) -> Result<f64, VenueError>;
}

struct SimState {
    balance: f64,
    /// Pre-programmed post_order results, consumed front-first. Empty means
    /// accept everything.
    script: VecDeque<Result<(), VenueError>>,
    posted: u64,
    next_order_id: u64,
}

/// Paper venue. Fills at the limit price with configurable latency.
pub struct SimVenue {
    state: Mutex<SimState>,
    latency: Duration,
}

impl SimVenue {
    pub fn new(balance: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                balance,
                script: VecDeque::new(),
                posted: 0,
                next_order_id: 1,
            }),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue one scripted post_order result ahead of the default-accept
    /// behavior.
    pub fn script_result(&self, result: Result<(), VenueError>) {
        self.state.lock().script.push_back(result);
    }

    pub fn script_rejections(&self, error: VenueError, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.script.push_back(Err(error.clone()));
        }
    }

    pub fn posted_count(&self) -> u64 {
        self.state.lock().posted
    }
}

impl VenueClient for SimVenue {
    fn create_market_order(&self, spec: &MarketOrderSpec) -> Result<SignedOrder, VenueError> {
        Ok(SignedOrder {
            token_id: spec.token_id.clone(),
            amount_usd: spec.amount_usd,
            price: spec.price,
            payload: format!(
                "sim:{}:{}:{:.4}x{:.2}",
                spec.token_id, spec.side, spec.price, spec.amount_usd
            ),
        })
    }

    fn post_order(&self, order: &SignedOrder, _tif: TimeInForce) -> Result<VenueAck, VenueError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let mut state = self.state.lock();
        state.posted += 1;
        match state.script.pop_front() {
            Some(Err(e)) => Ok(VenueAck {
                accepted: false,
                venue_order_id: None,
                reject: Some(e),
            }),
            Some(Ok(())) | None => {
                if order.amount_usd > state.balance {
                    return Ok(VenueAck {
                        accepted: false,
                        venue_order_id: None,
                        reject: Some(VenueError::InsufficientBalance),
                    });
                }
                let id = state.next_order_id;
                state.next_order_id += 1;
                Ok(VenueAck {
                    accepted: true,
                    venue_order_id: Some(format!("sim-{}", id)),
                    reject: None,
                })
            }
        }
    }

    fn usdc_balance(&self) -> Result<f64, VenueError> {
        Ok(self.state.lock().balance)
    }
}

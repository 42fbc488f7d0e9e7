//! Delayed capital release.
//!
//! Settlement on the venue lags resolution; freeing capital immediately at
//! `end_time` would double-count it against the next market. Releases are
//! queued with a ready-at time and drained by a cooperative tick.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::capital::allocator::CapitalAllocator;

#[derive(Clone, Debug)]
struct PendingRelease {
    token_id: String,
    pnl: f64,
    ready_at_ms: i64,
}

/// A completed release: the reservation amount handed back and the pnl
/// applied to the bankroll.
#[derive(Clone, Debug)]
pub struct Released {
    pub token_id: String,
    pub reserved: f64,
    pub pnl: f64,
}

pub struct Recycler {
    queue: Mutex<VecDeque<PendingRelease>>,
    capacity: usize,
    delay_ms: i64,
    allocator: Arc<CapitalAllocator>,
}

impl Recycler {
    pub fn new(allocator: Arc<CapitalAllocator>, delay_ms: i64, capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            delay_ms,
            allocator,
        }
    }

    /// Queue a release for `delay_ms` from now. When the FIFO is full the
    /// release happens immediately instead of queueing; reserved capital is
    /// never stranded behind backpressure.
    pub fn schedule(&self, token_id: &str, pnl: f64, now_ms: i64) -> Option<Released> {
        {
            let mut queue = self.queue.lock();
            if queue.len() < self.capacity {
                queue.push_back(PendingRelease {
                    token_id: token_id.to_string(),
                    pnl,
                    ready_at_ms: now_ms + self.delay_ms,
                });
                return None;
            }
        }
        warn!(token_id, "recycler queue full, releasing immediately");
        self.release(token_id, pnl)
    }

    /// Release every entry whose ready-at has passed, in FIFO order.
    pub fn tick(&self, now_ms: i64) -> Vec<Released> {
        let due: Vec<PendingRelease> = {
            let mut queue = self.queue.lock();
            let mut due = Vec::new();
            while queue.front().map_or(false, |p| p.ready_at_ms <= now_ms) {
                if let Some(p) = queue.pop_front() {
                    due.push(p);
                }
            }
            due
        };
        // Allocator lock is taken only after the queue lock is dropped.
        due.into_iter()
            .filter_map(|p| self.release(&p.token_id, p.pnl))
            .collect()
    }

    /// Bypass the delay for one token. Removes any queued entry for it.
    pub fn force_recycle(&self, token_id: &str) -> Option<Released> {
        let pending = {
            let mut queue = self.queue.lock();
            let pos = queue.iter().position(|p| p.token_id == token_id)?;
            queue.remove(pos)
        };
        pending.and_then(|p| self.release(&p.token_id, p.pnl))
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn release(&self, token_id: &str, pnl: f64) -> Option<Released> {
        match self.allocator.release_allocation(token_id, pnl) {
            Ok(reserved) => Some(Released {
                token_id: token_id.to_string(),
                reserved,
                pnl,
            }),
            Err(e) => {
                warn!(token_id, error = %e, "recycle release failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capital::allocator::ExposureLimits;

    fn make_parts(delay_ms: i64, capacity: usize) -> (Arc<CapitalAllocator>, Recycler) {
        let alloc = Arc::new(CapitalAllocator::new(
            1000.0,
            ExposureLimits {
                max_per_market_percent: 0.05,
                max_per_market_absolute: 50.0,
                max_total_percent: 0.25,
            },
            100.0,
            4,
        ));
        let recycler = Recycler::new(alloc.clone(), delay_ms, capacity);
        (alloc, recycler)
    }

    /// Scenario: Release scheduled with a 5s delay; tick at +4s and +5s.
    /// Expected: Nothing released early; at +5s the reservation is freed with pnl applied.
    #[test]
    fn test_delayed_release() {
        let (alloc, recycler) = make_parts(5000, 16);
        alloc.request_allocation("m1", 10.0, "expiry_snipe");
        assert!(recycler.schedule("m1", 0.30, 1000).is_none());

        assert!(recycler.tick(5000).is_empty(), "4s elapsed, not yet due");
        let released = recycler.tick(6000);
        assert_eq!(released.len(), 1);
        assert!((released[0].reserved - 10.0).abs() < 1e-9);
        assert!((alloc.bankroll() - 1000.30).abs() < 1e-9);
        assert_eq!(alloc.total_allocated(), 0.0);
    }

    /// Scenario: Two releases queued at different times, both due by the tick.
    /// Expected: Released in FIFO order.
    #[test]
    fn test_fifo_order() {
        let (alloc, recycler) = make_parts(1000, 16);
        alloc.request_allocation("m1", 10.0, "expiry_snipe");
        alloc.request_allocation("m2", 10.0, "expiry_snipe");
        recycler.schedule("m1", 0.0, 1000);
        recycler.schedule("m2", 0.0, 1500);
        let released = recycler.tick(10_000);
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].token_id, "m1");
        assert_eq!(released[1].token_id, "m2");
    }

    /// Scenario: force_recycle on a queued entry well before its ready-at time.
    /// Expected: Immediate release; the queue no longer holds the entry.
    #[test]
    fn test_force_recycle_bypasses_delay() {
        let (alloc, recycler) = make_parts(60_000, 16);
        alloc.request_allocation("m1", 10.0, "expiry_snipe");
        recycler.schedule("m1", 0.25, 1000);
        let released = recycler.force_recycle("m1").unwrap();
        assert!((released.reserved - 10.0).abs() < 1e-9);
        assert!(recycler.is_empty());
        assert!((alloc.bankroll() - 1000.25).abs() < 1e-9);
    }

    /// Scenario: force_recycle for a token that was never scheduled.
    /// Expected: None; nothing released.
    #[test]
    fn test_force_recycle_unknown() {
        let (_alloc, recycler) = make_parts(1000, 16);
        assert!(recycler.force_recycle("ghost").is_none());
    }

    /// Scenario: Queue capacity 1; a second schedule arrives while one is queued.
    /// Expected: The overflow release happens immediately instead of queueing.
    #[test]
    fn test_full_queue_releases_immediately() {
        let (alloc, recycler) = make_parts(60_000, 1);
        alloc.request_allocation("m1", 10.0, "expiry_snipe");
        alloc.request_allocation("m2", 10.0, "expiry_snipe");
        assert!(recycler.schedule("m1", 0.0, 1000).is_none());
        let overflow = recycler.schedule("m2", 0.10, 1000).unwrap();
        assert_eq!(overflow.token_id, "m2");
        assert!((alloc.market_exposure("m2") - 0.0).abs() < 1e-9);
        assert_eq!(recycler.len(), 1, "m1 still queued");
    }

    /// Scenario: Scheduled release for a token whose reservation was already freed.
    /// Expected: tick skips it without panicking and returns no release for it.
    #[test]
    fn test_tick_tolerates_missing_reservation() {
        let (alloc, recycler) = make_parts(1000, 16);
        alloc.request_allocation("m1", 10.0, "expiry_snipe");
        recycler.schedule("m1", 0.0, 1000);
        alloc.release_allocation("m1", 0.0).unwrap();
        assert!(recycler.tick(10_000).is_empty());
    }
}

//! Expiry-ordered execution queue.
//!
//! Min-heap keyed by `end_ms` with ties broken by discovery order, so two
//! markets expiring together are attempted oldest-discovery-first. The heap
//! holds only `(token_id, end_ms)`; authoritative state is always re-read
//! from the state machine after a pop, so stale heap entries are harmless;
//! superseded and removed entries are dropped lazily.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::engine::lifecycle::MarketSnapshot;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    end_ms: i64,
    discovery_seq: u64,
    generation: u64,
    token_id: String,
}

pub struct PriorityScheduler {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    /// token -> generation of its only live heap entry.
    live: HashMap<String, u64>,
    next_generation: u64,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Queue a market. Re-pushing a queued token supersedes its old entry.
    pub fn push(&mut self, snapshot: &MarketSnapshot) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.live.insert(snapshot.token_id.clone(), generation);
        self.heap.push(Reverse(HeapEntry {
            end_ms: snapshot.end_ms,
            discovery_seq: snapshot.seq,
            generation,
            token_id: snapshot.token_id.clone(),
        }));
    }

    /// Earliest-expiring queued token, dropping stale entries on the way.
    pub fn pop(&mut self) -> Option<String> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            if self.live.get(&entry.token_id) == Some(&entry.generation) {
                self.live.remove(&entry.token_id);
                return Some(entry.token_id);
            }
        }
        None
    }

    /// Next token and its expiry without dequeuing it.
    pub fn peek(&mut self) -> Option<(&str, i64)> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.live.get(&entry.token_id) == Some(&entry.generation) {
                break;
            }
            self.heap.pop();
        }
        self.heap
            .peek()
            .map(|Reverse(e)| (e.token_id.as_str(), e.end_ms))
    }

    /// Re-key a queued token from a fresh snapshot. Equivalent to push for a
    /// token not currently queued.
    pub fn update_priority(&mut self, snapshot: &MarketSnapshot) {
        self.push(snapshot);
    }

    pub fn remove(&mut self, token_id: &str) {
        self.live.remove(token_id);
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.live.contains_key(token_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lifecycle::MarketPhase;

    fn snap(token: &str, end_ms: i64, seq: u64) -> MarketSnapshot {
        MarketSnapshot {
            token_id: token.into(),
            phase: MarketPhase::Eligible,
            end_ms,
            best_bid: Some(0.95),
            best_ask: Some(0.97),
            last_tick_ms: Some(0),
            failure_count: 0,
            reserved_capital: 0.0,
            realized_pnl: 0.0,
            negative_risk: false,
            seq,
        }
    }

    /// Scenario: Three markets queued out of expiry order.
    /// Expected: Pops come back soonest-expiry first.
    #[test]
    fn test_pop_orders_by_expiry() {
        let mut sched = PriorityScheduler::new();
        sched.push(&snap("late", 300_000, 0));
        sched.push(&snap("soon", 100_000, 1));
        sched.push(&snap("mid", 200_000, 2));
        assert_eq!(sched.pop().as_deref(), Some("soon"));
        assert_eq!(sched.pop().as_deref(), Some("mid"));
        assert_eq!(sched.pop().as_deref(), Some("late"));
        assert_eq!(sched.pop(), None);
    }

    /// Scenario: Two markets with identical expiry, discovered in order a then b.
    /// Expected: Tie broken by discovery order -- a pops first (stable).
    #[test]
    fn test_tie_broken_by_discovery_order() {
        let mut sched = PriorityScheduler::new();
        sched.push(&snap("b", 100_000, 7));
        sched.push(&snap("a", 100_000, 3));
        assert_eq!(sched.pop().as_deref(), Some("a"));
        assert_eq!(sched.pop().as_deref(), Some("b"));
    }

    /// Scenario: Token removed after queueing, with another still live.
    /// Expected: The removed token is never popped; len reflects live entries only.
    #[test]
    fn test_remove_is_lazy_but_effective() {
        let mut sched = PriorityScheduler::new();
        sched.push(&snap("gone", 100_000, 0));
        sched.push(&snap("kept", 200_000, 1));
        sched.remove("gone");
        assert_eq!(sched.len(), 1);
        assert_eq!(sched.pop().as_deref(), Some("kept"));
        assert!(sched.pop().is_none());
    }

    /// Scenario: A token pushed twice (re-entered eligibility between sweeps).
    /// Expected: Exactly one pop for it -- the superseded entry is dropped.
    #[test]
    fn test_duplicate_push_supersedes() {
        let mut sched = PriorityScheduler::new();
        sched.push(&snap("m", 100_000, 0));
        sched.push(&snap("m", 100_000, 0));
        assert_eq!(sched.len(), 1);
        assert_eq!(sched.pop().as_deref(), Some("m"));
        assert_eq!(sched.pop(), None);
    }

    /// Scenario: peek on a queue whose top entry was removed.
    /// Expected: peek skips the dead entry and reports the live head without dequeuing it.
    #[test]
    fn test_peek_skips_dead_entries() {
        let mut sched = PriorityScheduler::new();
        sched.push(&snap("dead", 50_000, 0));
        sched.push(&snap("live", 100_000, 1));
        sched.remove("dead");
        assert_eq!(sched.peek(), Some(("live", 100_000)));
        assert_eq!(sched.len(), 1);
        assert_eq!(sched.pop().as_deref(), Some("live"));
    }

    /// Scenario: Pop from an empty scheduler and from one drained to empty.
    /// Expected: None both times; is_empty agrees.
    #[test]
    fn test_empty_behaviour() {
        let mut sched = PriorityScheduler::new();
        assert!(sched.is_empty());
        assert_eq!(sched.pop(), None);
        sched.push(&snap("m", 1, 0));
        sched.pop();
        assert!(sched.is_empty());
    }
}

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};

/// Cheap cloneable time handle. All core timestamps are UTC millis.
///
/// `system()` reads the wall clock; `manual()` is an advanceable clock for
/// deterministic tests. Monotonic latency spans use [`Stopwatch`], never
/// wall-time subtraction.
#[derive(Clone)]
pub struct Clock {
    kind: ClockKind,
}

#[derive(Clone)]
enum ClockKind {
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Self {
            kind: ClockKind::System,
        }
    }

    pub fn manual(start_ms: i64) -> Self {
        Self {
            kind: ClockKind::Manual(Arc::new(AtomicI64::new(start_ms))),
        }
    }

    pub fn now_ms(&self) -> i64 {
        match &self.kind {
            ClockKind::System => Utc::now().timestamp_millis(),
            ClockKind::Manual(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Advance a manual clock. No effect on the system clock.
    pub fn advance(&self, delta_ms: i64) {
        if let ClockKind::Manual(ms) = &self.kind {
            ms.fetch_add(delta_ms, Ordering::SeqCst);
        }
    }

    /// Set a manual clock to an absolute time. No effect on the system clock.
    pub fn set(&self, now_ms: i64) {
        if let ClockKind::Manual(ms) = &self.kind {
            ms.store(now_ms, Ordering::SeqCst);
        }
    }
}

/// Monotonic span timer for latency measurement.
pub struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.0.elapsed().as_secs_f64() * 1000.0
    }
}

/// UTC calendar date for a millisecond timestamp.
pub fn utc_date(ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// First instant (millis) of the UTC day strictly after `ms`.
pub fn utc_midnight_after(ms: i64) -> i64 {
    let next = utc_date(ms).succ_opt().unwrap_or_default();
    next.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(ms)
}

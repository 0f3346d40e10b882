//! Dispatch KPIs: lock-free counters updated by the service as rides move.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Fares are accumulated in thousandths of a currency unit.
const FARE_SCALE: f64 = 1_000.0;

#[derive(Debug, Default)]
pub struct DispatchStats {
    rides_requested: AtomicU64,
    accepts_won: AtomicU64,
    accepts_lost: AtomicU64,
    assignment_rollbacks: AtomicU64,
    rides_completed: AtomicU64,
    rides_cancelled: AtomicU64,
    locations_reported: AtomicU64,
    drivers_expired: AtomicU64,
    gross_fare_milli: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub rides_requested: u64,
    pub accepts_won: u64,
    pub accepts_lost: u64,
    pub assignment_rollbacks: u64,
    pub rides_completed: u64,
    pub rides_cancelled: u64,
    pub locations_reported: u64,
    pub drivers_expired: u64,
    pub gross_fare: f64,
}

impl StatsSnapshot {
    /// Share of accept attempts that won the ride.
    pub fn accept_win_rate(&self) -> f64 {
        let attempts = self.accepts_won + self.accepts_lost;
        if attempts == 0 {
            0.0
        } else {
            self.accepts_won as f64 / attempts as f64
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DispatchStats {
    pub fn record_request(&self) {
        bump(&self.rides_requested);
    }

    pub fn record_accept_won(&self) {
        bump(&self.accepts_won);
    }

    pub fn record_accept_lost(&self) {
        bump(&self.accepts_lost);
    }

    pub fn record_rollback(&self) {
        bump(&self.assignment_rollbacks);
    }

    pub fn record_completion(&self, fare: f64) {
        bump(&self.rides_completed);
        let milli = (fare * FARE_SCALE).round().max(0.0) as u64;
        self.gross_fare_milli.fetch_add(milli, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        bump(&self.rides_cancelled);
    }

    pub fn record_location(&self) {
        bump(&self.locations_reported);
    }

    pub fn record_expired(&self, count: u64) {
        self.drivers_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rides_requested: self.rides_requested.load(Ordering::Relaxed),
            accepts_won: self.accepts_won.load(Ordering::Relaxed),
            accepts_lost: self.accepts_lost.load(Ordering::Relaxed),
            assignment_rollbacks: self.assignment_rollbacks.load(Ordering::Relaxed),
            rides_completed: self.rides_completed.load(Ordering::Relaxed),
            rides_cancelled: self.rides_cancelled.load(Ordering::Relaxed),
            locations_reported: self.locations_reported.load(Ordering::Relaxed),
            drivers_expired: self.drivers_expired.load(Ordering::Relaxed),
            gross_fare: self.gross_fare_milli.load(Ordering::Relaxed) as f64 / FARE_SCALE,
        }
    }
}

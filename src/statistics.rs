//! Event bookkeeping for Monte Carlo runs.
//!
//! Every work item keeps its own counters and the totals are merged after the
//! parallel region. The counters are diagnostic only: they never feed back
//! into the estimates, but they tell the user how many events were thrown
//! away and why.

use std::{fmt, ops::*};

use serde::Serialize;

use crate::settings::MAX_SCATTER_ORDER;
use crate::track::EventFailure;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_every_counter() {
        let mut a = InteractionStatistics::new();
        a.events_attempted = 10;
        a.record_failure(EventFailure::NoStartPoint);
        a.record_success(1);
        let mut b = InteractionStatistics::new();
        b.events_attempted = 5;
        b.record_failure(EventFailure::InvalidDistance);
        b.record_success(1);
        b.record_success(3);
        a += b;
        assert_eq!(a.events_attempted, 15);
        assert_eq!(a.events_dropped, 2);
        assert_eq!(a.no_start_point, 1);
        assert_eq!(a.invalid_distances, 1);
        assert_eq!(a.successes[0], 2);
        assert_eq!(a.successes[2], 1);
    }

    #[test]
    fn drop_fraction_of_empty_run_is_zero() {
        assert_eq!(InteractionStatistics::new().drop_fraction(), 0.0);
    }
}

/// Counters describing what happened to the simulated events.
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct InteractionStatistics {
    pub events_attempted: u64,  // events started by the strategy
    pub events_dropped: u64,    // events excluded from the average
    pub start_attempts: u64,    // beam rays drawn while looking for a start point
    pub no_start_point: u64,    // events dropped for lack of a start point
    pub invalid_distances: u64, // events dropped for a NaN or negative distance
    pub escapes: u64,           // walks that left the scatter region, counted as zero
    pub successes: [u64; MAX_SCATTER_ORDER], // completed walks per scattering order
}

impl Default for InteractionStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Add for InteractionStatistics {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl AddAssign for InteractionStatistics {
    fn add_assign(&mut self, other: Self) {
        self.events_attempted += other.events_attempted;
        self.events_dropped += other.events_dropped;
        self.start_attempts += other.start_attempts;
        self.no_start_point += other.no_start_point;
        self.invalid_distances += other.invalid_distances;
        self.escapes += other.escapes;
        for (a, b) in self.successes.iter_mut().zip(other.successes.iter()) {
            *a += b;
        }
    }
}

impl InteractionStatistics {
    pub fn new() -> Self {
        Self {
            events_attempted: 0,
            events_dropped: 0,
            start_attempts: 0,
            no_start_point: 0,
            invalid_distances: 0,
            escapes: 0,
            successes: [0; MAX_SCATTER_ORDER],
        }
    }

    pub fn record_failure(&mut self, failure: EventFailure) {
        self.events_dropped += 1;
        match failure {
            EventFailure::NoStartPoint => self.no_start_point += 1,
            EventFailure::InvalidDistance => self.invalid_distances += 1,
        }
    }

    /// Counts a walk that reached the detector after `order` scatters.
    pub fn record_success(&mut self, order: usize) {
        if let Some(count) = self.successes.get_mut(order.saturating_sub(1)) {
            *count += 1;
        }
    }

    /// Fraction of attempted events that were dropped.
    pub fn drop_fraction(&self) -> f64 {
        if self.events_attempted == 0 {
            0.0
        } else {
            self.events_dropped as f64 / self.events_attempted as f64
        }
    }
}

impl fmt::Display for InteractionStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Statistics:")?;
        writeln!(f, "  Events attempted:   {}", self.events_attempted)?;
        writeln!(f, "  Events dropped:     {}", self.events_dropped)?;
        writeln!(f, "    No start point:   {}", self.no_start_point)?;
        writeln!(f, "    Invalid distance: {}", self.invalid_distances)?;
        writeln!(f, "  Start attempts:     {}", self.start_attempts)?;
        writeln!(f, "  Escapes:            {}", self.escapes)?;
        for (i, count) in self.successes.iter().enumerate().filter(|(_, c)| **c > 0) {
            writeln!(f, "  Order {:<2} detected:  {}", i + 1, count)?;
        }
        Ok(())
    }
}

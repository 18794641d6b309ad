//! Adaptive control of the number of events per point.
//!
//! Without a target the strategy runs exactly `events_per_point` events. With
//! a target relative error it keeps adding batches of that size until every
//! estimate it watches is precise enough or `max_events` is reached.

use crate::strategy::AttenuationEstimate;


/// Cap on events per point when a target is given without `max_events`, as
/// a multiple of `events_per_point`.
pub const DEFAULT_MAX_EVENT_FACTOR: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    pub batch: usize,
    pub target_relative_error: Option<f64>,
    pub max_events: usize,
}

impl Convergence {
    pub fn new(batch: usize, target_relative_error: Option<f64>, max_events: Option<usize>) -> Self {
        let max_events = match target_relative_error {
            Some(_) => max_events.unwrap_or(batch.saturating_mul(DEFAULT_MAX_EVENT_FACTOR)),
            None => batch,
        };
        Self {
            batch,
            target_relative_error,
            max_events: max_events.max(batch),
        }
    }

    /// Size of the next batch after `done` events, or `None` to stop.
    pub fn next_batch(&self, done: usize, estimates: &[AttenuationEstimate]) -> Option<usize> {
        if done == 0 {
            return Some(self.batch);
        }
        let target = self.target_relative_error?;
        if done >= self.max_events {
            return None;
        }
        let worst = estimates
            .iter()
            .map(AttenuationEstimate::relative_error)
            .fold(0.0, f64::max);
        if worst <= target {
            None
        } else {
            Some(self.batch.min(self.max_events - done))
        }
    }
}

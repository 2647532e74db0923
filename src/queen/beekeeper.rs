//! Beekeeper loop bookkeeping.
//!
//! The beekeeper runs Queen passes on a fixed tick until the pipeline is done,
//! blocked, or out of passes.

use std::time::Duration;

/// Configuration for the beekeeper loop
#[derive(Debug, Clone)]
pub struct BeekeeperConfig {
    /// Interval between passes
    pub tick_interval: Duration,
    /// Stop after this many passes, None = until done or blocked
    pub max_passes: Option<u64>,
}

impl Default for BeekeeperConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            max_passes: None,
        }
    }
}

impl BeekeeperConfig {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            max_passes: None,
        }
    }

    pub fn with_max_passes(mut self, max_passes: u64) -> Self {
        self.max_passes = Some(max_passes);
        self
    }
}

/// Counters kept across passes
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BeekeeperState {
    /// Passes attempted since start
    pub passes: u64,
    /// Passes aborted because the store was unavailable
    pub aborted_passes: u64,
    pub workers_submitted: u64,
    /// Workers found dead by the liveness sweep
    pub workers_buried: u64,
    pub jobs_reclaimed: u64,
}

impl BeekeeperState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) {
        self.passes += 1;
    }

    pub fn aborted(&mut self) {
        self.aborted_passes += 1;
    }

    pub fn submitted(&mut self, count: usize) {
        self.workers_submitted += count as u64;
    }

    pub fn buried(&mut self, workers: usize, jobs: usize) {
        self.workers_buried += workers as u64;
        self.jobs_reclaimed += jobs as u64;
    }

    /// Whether `max_passes` has been used up.
    pub fn out_of_passes(&self, max_passes: Option<u64>) -> bool {
        max_passes.is_some_and(|max| self.passes >= max)
    }
}

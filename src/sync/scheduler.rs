use std::time::Duration;

use crate::config::SyncConfig;

/// Empty polls tolerated before backing off.
const QUIET_POLLS: u64 = 3;

/// Adaptive delay between delta polls.
///
/// Any observed change snaps the delay back to `base`. Consecutive empty
/// polls grow it in steps, and once a step would exceed `max` the counter is
/// halved so long idle periods decay instead of growing without bound.
#[derive(Debug, Clone)]
pub struct Scheduler {
    base_ms: u64,
    max_ms: u64,
    consecutive_empty_polls: u64,
}

impl Scheduler {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            consecutive_empty_polls: 0,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn consecutive_empty_polls(&self) -> u64 {
        self.consecutive_empty_polls
    }

    pub fn reset(&mut self) {
        self.consecutive_empty_polls = 0;
    }

    /// Delay before the next poll, given how many changes the last one saw.
    pub fn next_delay(&mut self, changed_count: usize) -> Duration {
        if changed_count > 0 {
            self.consecutive_empty_polls = 0;
            return self.base_delay();
        }

        self.consecutive_empty_polls += 1;
        let n = self.consecutive_empty_polls;
        if n <= QUIET_POLLS {
            return self.base_delay();
        }

        let raw_ms = (5 * (n / 3) + (self.base_ms / 1000) * (n % 3)) * 1000;
        if raw_ms > self.max_ms {
            self.consecutive_empty_polls = n / 2;
            log::debug!(
                "Poll delay {raw_ms}ms above ceiling, decaying idle count {n} -> {}",
                self.consecutive_empty_polls
            );
            return Duration::from_millis((raw_ms + 1) / 2);
        }
        Duration::from_millis(raw_ms)
    }
}

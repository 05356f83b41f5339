//! Consensus configuration.

use std::time::Duration;

/// Tunables for the view timeout policy.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Timeout for the first attempt at a view.
    pub min_timeout: Duration,
    /// Upper bound the backoff saturates at.
    pub max_timeout: Duration,
    /// Growth factor applied per consecutive failed view.
    pub timeout_factor: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            min_timeout: Duration::from_secs(2),
            max_timeout: Duration::from_secs(30),
            timeout_factor: 2.0,
        }
    }
}

impl ConsensusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_timeout(mut self, timeout: Duration) -> Self {
        self.min_timeout = timeout;
        self
    }

    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = timeout;
        self
    }

    pub fn with_timeout_factor(mut self, factor: f64) -> Self {
        self.timeout_factor = factor;
        self
    }

    /// Timeout for a view after `consecutive_failures` failed views:
    /// `min(min_timeout · timeout_factor^consecutive_failures, max_timeout)`.
    pub fn view_timeout(&self, consecutive_failures: u32) -> Duration {
        let millis =
            self.min_timeout.as_millis() as f64 * self.timeout_factor.powi(consecutive_failures as i32);
        let capped = millis.min(self.max_timeout.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_grows_and_saturates() {
        let config = ConsensusConfig::default();
        assert_eq!(config.view_timeout(0), Duration::from_secs(2));
        assert_eq!(config.view_timeout(1), Duration::from_secs(4));
        assert_eq!(config.view_timeout(2), Duration::from_secs(8));
        assert_eq!(config.view_timeout(10), Duration::from_secs(30));
    }
}

//! Bounded retransmission for the acknowledged profile.

use std::time::Duration;

use loglink_core::config::SerialConfig;

/// How long to wait for an ACK and how many times to transmit a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub ack_timeout: Duration,
    /// Total transmissions, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(ack_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            ack_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            max_attempts: self.max_attempts,
            attempts: 0,
        }
    }

    /// Worst-case time to get one frame through.
    pub fn window(&self) -> Duration {
        self.ack_timeout * self.max_attempts
    }
}

impl From<&SerialConfig> for RetryPolicy {
    fn from(config: &SerialConfig) -> Self {
        Self::new(config.ack_timeout(), config.max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SerialConfig::default())
    }
}

/// Attempts spent on one frame.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_attempts: u32,
    attempts: u32,
}

impl RetryBudget {
    /// Claim the next attempt. False once the budget is spent.
    pub fn try_attempt(&mut self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Transmissions beyond the first.
    pub fn retransmissions(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_allows_exactly_max_attempts() {
        let policy = RetryPolicy::new(Duration::from_millis(500), 5);
        let mut budget = policy.budget();
        let mut granted = 0;
        while budget.try_attempt() {
            granted += 1;
        }
        assert_eq!(granted, 5);
        assert_eq!(budget.retransmissions(), 4);
        assert!(!budget.try_attempt());
    }

    #[test]
    fn zero_attempts_still_sends_once() {
        let mut budget = RetryPolicy::new(Duration::from_millis(1), 0).budget();
        assert!(budget.try_attempt());
        assert!(!budget.try_attempt());
    }

    #[test]
    fn default_policy_window() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.window(), Duration::from_millis(2500));
    }
}

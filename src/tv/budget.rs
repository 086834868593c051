//! Per-connection outbound message budget.
//!
//! Grounded on the spec's TVManager message-budget rule: once any
//! non-moderator message has gone out in the current window, the normal
//! limit governs everything else until the window clears from inactivity.

use std::time::{Duration, Instant};

pub struct MessageBudget {
    message_limit: u32,
    moderator_message_limit: u32,
    timeout: Duration,
    count: u32,
    sent_normal_message: bool,
    last_message: Option<Instant>,
}

impl MessageBudget {
    pub fn new(message_limit: u32, moderator_message_limit: u32, timeout: Duration) -> Self {
        MessageBudget {
            message_limit,
            moderator_message_limit,
            timeout,
            count: 0,
            sent_normal_message: false,
            last_message: None,
        }
    }

    /// Attempts to consume one unit of budget for an outbound action.
    /// Returns `false` (action must be suppressed) when the applicable
    /// limit has already been reached in the current window.
    pub fn consume(&mut self, moderator: bool) -> bool {
        self.maybe_reset();

        let limit = if self.sent_normal_message || !moderator {
            self.message_limit
        } else {
            self.moderator_message_limit
        };
        if self.count >= limit {
            return false;
        }

        self.count += 1;
        self.last_message = Some(Instant::now());
        if !moderator {
            self.sent_normal_message = true;
        }
        true
    }

    fn maybe_reset(&mut self) {
        if let Some(last) = self.last_message {
            if last.elapsed() > self.timeout {
                self.count = 0;
                self.sent_normal_message = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_limit_suppresses_after_exhaustion() {
        let mut budget = MessageBudget::new(2, 100, Duration::from_secs(30));
        assert!(budget.consume(false));
        assert!(budget.consume(false));
        assert!(!budget.consume(false));
    }

    #[test]
    fn moderator_limit_drops_once_a_normal_message_is_sent() {
        let mut budget = MessageBudget::new(3, 100, Duration::from_secs(30));
        assert!(budget.consume(true));
        assert!(budget.consume(true));
        // The first normal message still fits under the normal limit (3),
        // and from here on every message — moderator or not — is checked
        // against that same limit.
        assert!(budget.consume(false));
        assert!(!budget.consume(true));
    }

    #[test]
    fn window_resets_after_timeout_elapses() {
        let mut budget = MessageBudget::new(1, 100, Duration::from_millis(10));
        assert!(budget.consume(false));
        assert!(!budget.consume(false));
        std::thread::sleep(Duration::from_millis(20));
        assert!(budget.consume(false));
    }
}

// ABOUTME: Fixed-interval reconnect policy used by every backend serve loop
// ABOUTME: Waits 60s between attempts and retries forever unless a cap is configured

use std::time::Duration;

/// How a serve loop retries a dropped connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Pause before each reconnect attempt
    pub delay: Duration,
    /// Give up after this many consecutive failures (None = never)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

/// Attempt counter for one disconnect episode
#[derive(Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or None once the cap is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;
        Some(self.policy.delay)
    }

    /// Connection is back; the next episode starts from zero
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_sixty_seconds_forever() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        for _ in 0..500 {
            assert_eq!(state.next_delay(), Some(Duration::from_secs(60)));
        }
        assert_eq!(state.attempts(), 500);
    }

    #[test]
    fn test_cap_stops_retries() {
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(5),
            max_attempts: Some(2),
        };
        let mut state = ReconnectState::new(policy);
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert_eq!(state.next_delay(), None);
    }

    #[test]
    fn test_reset_starts_new_episode() {
        let mut state = ReconnectState::new(ReconnectPolicy {
            max_attempts: Some(1),
            ..ReconnectPolicy::fixed(Duration::from_secs(1))
        });
        assert!(state.next_delay().is_some());
        assert_eq!(state.next_delay(), None);
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
    }
}

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Doubles `current`, capped at `max`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.saturating_mul(2);
        if next > self.max {
            self.max
        } else {
            next
        }
    }
}

/// Reconnect delay bookkeeping across consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.initial.min(policy.max),
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait now and advances to the next one.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.policy.next_delay(self.current);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial.min(self.policy.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn next_delay_doubles_then_caps() {
        let policy = policy();
        assert_eq!(
            policy.next_delay(Duration::from_millis(100)),
            Duration::from_millis(200)
        );
        assert_eq!(
            policy.next_delay(Duration::from_millis(800)),
            Duration::from_millis(1_000)
        );
        assert_eq!(
            policy.next_delay(Duration::from_millis(1_000)),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn consecutive_failures_follow_doubling_schedule() {
        let policy = policy();
        let mut backoff = Backoff::new(policy);
        for n in 0..8u32 {
            let expected = (policy.initial * 2u32.pow(n)).min(policy.max);
            assert_eq!(backoff.on_failure(), expected, "failure {n}");
        }
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = Backoff::new(policy());
        backoff.on_failure();
        backoff.on_failure();
        assert_eq!(backoff.current(), Duration::from_millis(400));
        backoff.reset();
        assert_eq!(backoff.on_failure(), Duration::from_millis(100));
    }
}

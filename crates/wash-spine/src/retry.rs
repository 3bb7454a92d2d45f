use std::time::Duration;

/// How the orchestrator retries a failed step.
///
/// The pause is a plain sleep; cancellation happens through the stop flag the
/// caller checks between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub pause: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded(pause: Duration) -> Self {
        Self {
            pause,
            max_attempts: None,
        }
    }

    pub fn bounded(pause: Duration, max_attempts: u32) -> Self {
        Self {
            pause,
            max_attempts: Some(max_attempts),
        }
    }

    /// Pause to take after `failures` consecutive failed attempts, or `None`
    /// once the budget is spent.
    pub fn pause_after(&self, failures: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if failures >= max => None,
            _ => Some(self.pause),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_never_gives_up() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.pause_after(u32::MAX), Some(Duration::from_secs(1)));
    }

    #[test]
    fn bounded_stops_at_budget() {
        let policy = RetryPolicy::bounded(Duration::from_millis(5), 3);
        assert!(policy.pause_after(2).is_some());
        assert_eq!(policy.pause_after(3), None);
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic time and blocking sleeps for every control loop.
///
/// Loops never call `std::thread::sleep` directly so that the whole wash
/// program can run against a virtual clock.
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);

    fn elapsed_since(&self, earlier: Duration) -> Duration {
        self.now().saturating_sub(earlier)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Timestamps for records that leave the process.
///
/// The monotonic part reads the controller clock, so records stamped during a
/// simulated run line up with the loops that produced them.
#[derive(Clone)]
pub struct TimeBase {
    clock: Arc<dyn Clock>,
}

impl TimeBase {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Microseconds on the controller clock.
    pub fn now_us(&self) -> u64 {
        self.clock.now().as_micros() as u64
    }

    /// Wall-clock microseconds since Unix epoch (for cross-process logs only).
    pub fn unix_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

impl std::fmt::Debug for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBase")
            .field("now_us", &self.now_us())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal_sim::VirtualClock;

    #[test]
    fn stamps_follow_the_controller_clock() {
        let clock = Arc::new(VirtualClock::new());
        let timebase = TimeBase::new(clock.clone());
        assert_eq!(timebase.now_us(), 0);

        clock.sleep(Duration::from_millis(250));
        assert_eq!(timebase.now_us(), 250_000);
        assert!(timebase.unix_us() > 0);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now();
        clock.sleep(Duration::from_millis(2));
        assert!(clock.elapsed_since(first) >= Duration::from_millis(2));
    }
}

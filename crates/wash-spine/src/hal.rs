//! Line-level hardware seams. Board backends implement these; the control
//! loops only ever see the traits.

use crate::relay::RelayLines;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub trait InputLine: Send {
    fn is_high(&mut self) -> bool;

    fn is_low(&mut self) -> bool {
        !self.is_high()
    }
}

pub trait OutputLine: Send {
    fn set_high(&mut self);
    fn set_low(&mut self);

    fn set_state(&mut self, high: bool) {
        if high {
            self.set_high();
        } else {
            self.set_low();
        }
    }
}

/// Bounded pulse measurement.
pub trait PulseInput: Send {
    /// Waits for the line to reach `high`, then times how long it stays there.
    /// `None` when either wait exceeds `timeout`.
    fn pulse_width(&mut self, high: bool, timeout: Duration) -> Option<Duration>;
}

/// Blocks until the mains reference crosses zero.
pub trait ZeroCross: Send {
    /// `false` when no crossing arrived within `timeout`.
    fn wait_for_crossing(&mut self, timeout: Duration) -> bool;
}

/// Edge interrupt on one input line.
pub trait EdgeSource: Send {
    /// Blocks until the next configured edge. `Ok(false)` when none arrived
    /// within `timeout`.
    fn wait_edge(&mut self, timeout: Duration) -> std::io::Result<bool>;
}

/// Applies a full relay output image to the physical lines.
pub trait RelayBank: Send {
    fn apply(&mut self, lines: &RelayLines);
}

impl<T: InputLine + ?Sized> InputLine for Box<T> {
    fn is_high(&mut self) -> bool {
        (**self).is_high()
    }
}

impl<T: OutputLine + ?Sized> OutputLine for Box<T> {
    fn set_high(&mut self) {
        (**self).set_high()
    }

    fn set_low(&mut self) {
        (**self).set_low()
    }
}

impl<T: PulseInput + ?Sized> PulseInput for Box<T> {
    fn pulse_width(&mut self, high: bool, timeout: Duration) -> Option<Duration> {
        (**self).pulse_width(high, timeout)
    }
}

impl<T: ZeroCross + ?Sized> ZeroCross for Box<T> {
    fn wait_for_crossing(&mut self, timeout: Duration) -> bool {
        (**self).wait_for_crossing(timeout)
    }
}

impl<T: EdgeSource + ?Sized> EdgeSource for Box<T> {
    fn wait_edge(&mut self, timeout: Duration) -> std::io::Result<bool> {
        (**self).wait_edge(timeout)
    }
}

impl<T: RelayBank + ?Sized> RelayBank for Box<T> {
    fn apply(&mut self, lines: &RelayLines) {
        (**self).apply(lines)
    }
}

/// Busy-polling pulse measurement on top of a plain input line.
pub struct PolledPulse<L> {
    line: L,
}

impl<L: InputLine> PolledPulse<L> {
    pub fn new(line: L) -> Self {
        Self { line }
    }
}

impl<L: InputLine> PulseInput for PolledPulse<L> {
    fn pulse_width(&mut self, high: bool, timeout: Duration) -> Option<Duration> {
        let wait_start = Instant::now();
        while self.line.is_high() != high {
            if wait_start.elapsed() > timeout {
                return None;
            }
            std::hint::spin_loop();
        }

        let pulse_start = Instant::now();
        while self.line.is_high() == high {
            if pulse_start.elapsed() > timeout {
                return None;
            }
            std::hint::spin_loop();
        }
        Some(pulse_start.elapsed())
    }
}

/// Rising-edge detection on a polled reference line.
pub struct PolledZeroCross<L> {
    line: L,
    was_high: bool,
}

impl<L: InputLine> PolledZeroCross<L> {
    pub fn new(line: L) -> Self {
        Self {
            line,
            was_high: true,
        }
    }
}

impl<L: InputLine> ZeroCross for PolledZeroCross<L> {
    fn wait_for_crossing(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            let high = self.line.is_high();
            let rising = high && !self.was_high;
            self.was_high = high;
            if rising {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            std::hint::spin_loop();
        }
    }
}

/// Edge count shared between an edge callback and the sampling loop.
#[derive(Debug, Default)]
pub struct EdgeCounter {
    count: AtomicU64,
}

impl EdgeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the edge callback.
    pub fn record_edge(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_edges(&self, edges: u64) {
        self.count.fetch_add(edges, Ordering::Relaxed);
    }

    /// Returns the edges seen since the previous call and resets the count.
    pub fn take(&self) -> u64 {
        self.count.swap(0, Ordering::AcqRel)
    }
}

#[derive(Clone, Default, Debug)]
pub struct FiringStats {
    pub fired: u64,
    pub missed_crossings: u64,
    pub last_delay_us: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedLine(VecDeque<bool>);

    impl InputLine for ScriptedLine {
        fn is_high(&mut self) -> bool {
            self.0.pop_front().unwrap_or(false)
        }
    }

    #[test]
    fn zero_cross_waits_for_rising_edge() {
        let line = ScriptedLine(VecDeque::from(vec![true, true, false, false, true]));
        let mut zc = PolledZeroCross::new(line);
        assert!(zc.wait_for_crossing(Duration::from_millis(50)));
    }

    #[test]
    fn zero_cross_times_out_on_flat_line() {
        let mut zc = PolledZeroCross::new(ScriptedLine(VecDeque::new()));
        assert!(!zc.wait_for_crossing(Duration::from_millis(5)));
    }

    #[test]
    fn pulse_times_out_when_level_never_arrives() {
        let mut pulse = PolledPulse::new(ScriptedLine(VecDeque::new()));
        assert_eq!(pulse.pulse_width(true, Duration::from_millis(5)), None);
    }

    #[test]
    fn edge_counter_resets_on_take() {
        let counter = EdgeCounter::new();
        counter.record_edge();
        counter.record_edges(4);
        assert_eq!(counter.take(), 5);
        assert_eq!(counter.take(), 0);
    }
}

//! Phase-cut motor drive: the zero-cross synchronised firing loop and the
//! monitor that feeds it the current delay from the bus.

use crate::bus::Bus;
use crate::hal::{FiringStats, OutputLine, ZeroCross};
use crate::timebase::Clock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Safe phase delay window in microseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DelayLimits {
    pub min_us: f32,
    pub max_us: f32,
    pub fallback_us: f32,
}

impl Default for DelayLimits {
    fn default() -> Self {
        Self {
            min_us: 4000.0,
            max_us: 8000.0,
            fallback_us: 6500.0,
        }
    }
}

impl DelayLimits {
    /// Values outside the window (or not finite) snap to the fallback rather
    /// than to the nearest bound.
    pub fn sanitize(&self, delay_us: f32) -> f32 {
        if delay_us.is_finite() && (self.min_us..=self.max_us).contains(&delay_us) {
            delay_us
        } else {
            self.fallback_us
        }
    }

    pub fn contains(&self, delay_us: f32) -> bool {
        self.sanitize(delay_us) == delay_us
    }
}

/// Delay read by the firing path without touching the bus.
#[derive(Clone, Debug)]
pub struct SharedDelay(Arc<AtomicU32>);

impl SharedDelay {
    pub fn new(delay_us: u32) -> Self {
        Self(Arc::new(AtomicU32::new(delay_us)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, delay_us: u32) {
        self.0.store(delay_us, Ordering::Release);
    }
}

impl Default for SharedDelay {
    fn default() -> Self {
        Self::new(DelayLimits::default().max_us as u32)
    }
}

#[derive(Clone, Debug)]
pub struct DelayMonitorConfig {
    pub poll_interval: Duration,
    pub limits: DelayLimits,
}

impl Default for DelayMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            limits: DelayLimits::default(),
        }
    }
}

/// Mirrors `triac_delay` into a [`SharedDelay`].
pub struct DelayMonitor {
    bus: Bus,
    delay: SharedDelay,
    clock: Arc<dyn Clock>,
    config: DelayMonitorConfig,
}

impl DelayMonitor {
    pub fn new(bus: Bus, delay: SharedDelay, clock: Arc<dyn Clock>, config: DelayMonitorConfig) -> Self {
        Self {
            bus,
            delay,
            clock,
            config,
        }
    }

    /// Returns true when the local delay changed.
    pub fn poll_once(&self) -> bool {
        let raw = match self.bus.triac_delay() {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "Delay monitor bus read failed");
                return false;
            }
        };
        let safe = self.config.limits.sanitize(raw);
        if safe != raw {
            warn!(requested = raw, applied = safe, "Phase delay out of range");
        }

        let next = safe.round() as u32;
        if next == self.delay.get() {
            return false;
        }
        debug!(delay_us = next, "Phase delay updated");
        self.delay.set(next);
        true
    }

    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.poll_once();
            self.clock.sleep(self.config.poll_interval);
        }
    }
}

/// Zero-cross synchronised triac gate driver.
pub struct TriacFiring<Z: ZeroCross, G: OutputLine> {
    zero_cross: Z,
    gate: G,
    delay: SharedDelay,
    clock: Arc<dyn Clock>,
    crossing_timeout: Duration,
    stats: FiringStats,
}

impl<Z: ZeroCross, G: OutputLine> TriacFiring<Z, G> {
    pub fn new(zero_cross: Z, gate: G, delay: SharedDelay, clock: Arc<dyn Clock>) -> Self {
        Self {
            zero_cross,
            gate,
            delay,
            clock,
            crossing_timeout: Duration::from_millis(50),
            stats: FiringStats::default(),
        }
    }

    pub fn stats(&self) -> &FiringStats {
        &self.stats
    }

    /// One half-cycle. Returns false when no crossing arrived in time.
    pub fn fire_once(&mut self) -> bool {
        if !self.zero_cross.wait_for_crossing(self.crossing_timeout) {
            self.stats.missed_crossings += 1;
            return false;
        }
        let delay_us = self.delay.get();
        self.gate.set_low();
        self.clock.sleep(Duration::from_micros(delay_us as u64));
        self.gate.set_high();

        self.stats.fired += 1;
        self.stats.last_delay_us = delay_us;
        true
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        info!(delay_us = self.delay.get(), "Triac firing loop started");
        while !stop.load(Ordering::Relaxed) {
            self.fire_once();
        }
        self.gate.set_low();
        info!(
            fired = self.stats.fired,
            missed = self.stats.missed_crossings,
            "Triac firing loop stopped"
        );
    }
}

use crate::bus::{Bus, BusError};
use crate::hal::EdgeCounter;
use crate::timebase::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Clone, Debug)]
pub struct TachometerConfig {
    pub window: Duration,
}

impl Default for TachometerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
        }
    }
}

/// Turns edge counts into a drum frequency on `taccosensor`.
pub struct Tachometer {
    counter: Arc<EdgeCounter>,
    bus: Bus,
    clock: Arc<dyn Clock>,
    config: TachometerConfig,
    last_sample: Duration,
}

impl Tachometer {
    pub fn new(counter: Arc<EdgeCounter>, bus: Bus, clock: Arc<dyn Clock>, config: TachometerConfig) -> Self {
        let last_sample = clock.now();
        Self {
            counter,
            bus,
            clock,
            config,
            last_sample,
        }
    }

    /// Handle for the edge callback.
    pub fn counter(&self) -> Arc<EdgeCounter> {
        Arc::clone(&self.counter)
    }

    /// Publishes edges-per-second since the previous sample.
    pub fn sample(&mut self) -> Result<f32, BusError> {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(self.last_sample).as_secs_f64();
        self.last_sample = now;

        let edges = self.counter.take();
        let hz = if elapsed > 0.0 { (edges as f64 / elapsed) as f32 } else { 0.0 };
        self.bus.publish_drum_hz(hz)?;
        trace!(edges, hz, "Tachometer sample");
        Ok(hz)
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        self.counter.take();
        self.last_sample = self.clock.now();
        while !stop.load(Ordering::Relaxed) {
            self.clock.sleep(self.config.window);
            if let Err(err) = self.sample() {
                warn!(error = %err, "Tachometer publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal_sim::VirtualClock;

    #[test]
    fn frequency_is_edges_over_window() {
        let clock = Arc::new(VirtualClock::new());
        let bus = Bus::in_memory();
        let mut tacho = Tachometer::new(Arc::new(EdgeCounter::new()), bus.clone(), clock.clone(), TachometerConfig::default());

        tacho.counter().record_edges(50);
        clock.sleep(Duration::from_secs(2));
        assert_eq!(tacho.sample().unwrap(), 25.0);
        assert_eq!(bus.drum_hz().unwrap(), 25.0);
    }

    #[test]
    fn no_edges_reads_stopped() {
        let clock = Arc::new(VirtualClock::new());
        let bus = Bus::in_memory();
        bus.publish_drum_hz(40.0).unwrap();
        let mut tacho = Tachometer::new(Arc::new(EdgeCounter::new()), bus.clone(), clock.clone(), TachometerConfig::default());

        clock.sleep(Duration::from_secs(1));
        assert_eq!(tacho.sample().unwrap(), 0.0);
        assert_eq!(bus.drum_hz().unwrap(), 0.0);
    }
}

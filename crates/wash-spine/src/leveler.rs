//! Bang-bang speed leveler: nudges `triac_delay` by a fixed step until the
//! tachometer reading sits inside the dead band around the target.

use crate::bus::{Bus, BusError};
use crate::motor::DelayLimits;
use crate::timebase::Clock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct LevelerConfig {
    pub dead_band_hz: f32,
    pub step_us: f32,
    /// Wait between publishing a delay and re-measuring.
    pub settle: Duration,
    /// Wall-clock cap on one leveling run.
    pub max_duration: Duration,
    pub limits: DelayLimits,
}

impl Default for LevelerConfig {
    fn default() -> Self {
        Self {
            dead_band_hz: 10.0,
            step_us: 30.0,
            settle: Duration::from_secs(1),
            max_duration: Duration::from_secs(90),
            limits: DelayLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LevelerOutcome {
    Converged {
        iterations: u32,
        delay_us: f32,
        measured_hz: f32,
    },
    TimedOut {
        iterations: u32,
        delay_us: f32,
        measured_hz: f32,
    },
    Cancelled {
        iterations: u32,
    },
}

impl LevelerOutcome {
    pub fn iterations(&self) -> u32 {
        match *self {
            Self::Converged { iterations, .. }
            | Self::TimedOut { iterations, .. }
            | Self::Cancelled { iterations } => iterations,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }
}

pub struct RpmLeveler {
    bus: Bus,
    clock: Arc<dyn Clock>,
    config: LevelerConfig,
}

impl RpmLeveler {
    pub fn new(bus: Bus, clock: Arc<dyn Clock>, config: LevelerConfig) -> Self {
        Self { bus, clock, config }
    }

    /// Runs until converged, the wall-clock cap expires, or `stop` is set.
    pub fn level(&self, target_hz: f32, stop: &AtomicBool) -> Result<LevelerOutcome, BusError> {
        let LevelerConfig {
            dead_band_hz,
            step_us,
            settle,
            max_duration,
            limits,
        } = self.config.clone();

        let started = self.clock.now();
        let mut delay_us = limits.sanitize(self.bus.triac_delay()?);
        let mut iterations = 0u32;

        loop {
            if stop.load(Ordering::Relaxed) {
                debug!(target_hz, iterations, "Leveling cancelled");
                return Ok(LevelerOutcome::Cancelled { iterations });
            }

            let measured_hz = self.bus.drum_hz()?;
            let error = target_hz - measured_hz;
            if error > dead_band_hz {
                delay_us -= step_us;
            } else if -error > dead_band_hz {
                delay_us += step_us;
            } else {
                info!(target_hz, measured_hz, delay_us, iterations, "Drum speed levelled");
                return Ok(LevelerOutcome::Converged {
                    iterations,
                    delay_us,
                    measured_hz,
                });
            }

            if self.clock.elapsed_since(started) >= max_duration {
                warn!(target_hz, measured_hz, delay_us, iterations, "Drum speed not reached");
                return Ok(LevelerOutcome::TimedOut {
                    iterations,
                    delay_us,
                    measured_hz,
                });
            }

            delay_us = limits.sanitize(delay_us);
            self.bus.set_triac_delay(delay_us)?;
            iterations += 1;
            self.clock.sleep(settle);
        }
    }
}

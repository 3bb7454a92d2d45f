//! Water level (pressure frequency) and door sensors.

use crate::bus::{Bus, BusError};
use crate::hal::{InputLine, PulseInput};
use crate::timebase::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Clone, Debug)]
pub struct SensorConfig {
    pub interval: Duration,
    pub pulse_timeout: Duration,
    /// Linear frequency-to-level calibration.
    pub level_factor: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            pulse_timeout: Duration::from_secs(1),
            level_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelReading {
    pub frequency_hz: f32,
    pub level: f32,
}

/// Converts measured half periods into a reading. A missing or zero-length
/// half means the measurement failed and reads as 0/0.
pub fn convert_period(high: Option<Duration>, low: Option<Duration>, factor: f32) -> LevelReading {
    let (Some(high), Some(low)) = (high, low) else {
        return LevelReading::default();
    };
    if high.is_zero() || low.is_zero() {
        return LevelReading::default();
    }

    let period_us = (high + low).as_nanos() as f64 / 1000.0;
    let frequency_hz = (1_000_000.0 / period_us) as f32;
    LevelReading {
        frequency_hz,
        level: frequency_hz * factor,
    }
}

pub struct LevelSensor<P: PulseInput> {
    input: P,
    timeout: Duration,
    factor: f32,
}

impl<P: PulseInput> LevelSensor<P> {
    pub fn new(input: P, config: &SensorConfig) -> Self {
        Self {
            input,
            timeout: config.pulse_timeout,
            factor: config.level_factor,
        }
    }

    pub fn measure(&mut self) -> LevelReading {
        let high = self.input.pulse_width(true, self.timeout);
        let low = self.input.pulse_width(false, self.timeout);
        convert_period(high, low, self.factor)
    }
}

/// Raw, undebounced door contact.
pub struct DoorSensor<L: InputLine> {
    line: L,
}

impl<L: InputLine> DoorSensor<L> {
    pub fn new(line: L) -> Self {
        Self { line }
    }

    pub fn is_open(&mut self) -> bool {
        self.line.is_high()
    }
}

/// Publishes level and door readings at a fixed cadence.
pub struct SensorReader<P: PulseInput, L: InputLine> {
    level: LevelSensor<P>,
    door: DoorSensor<L>,
    bus: Bus,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl<P: PulseInput, L: InputLine> SensorReader<P, L> {
    pub fn new(level: P, door: L, bus: Bus, clock: Arc<dyn Clock>, config: SensorConfig) -> Self {
        Self {
            level: LevelSensor::new(level, &config),
            door: DoorSensor::new(door),
            bus,
            clock,
            interval: config.interval,
        }
    }

    pub fn publish_once(&mut self) -> Result<(LevelReading, bool), BusError> {
        let reading = self.level.measure();
        self.bus.publish_pressure(reading.frequency_hz)?;
        self.bus.publish_water_level(reading.level)?;

        let open = self.door.is_open();
        self.bus.publish_door(open)?;
        trace!(pressure = reading.frequency_hz, level = reading.level, door_open = open, "Sensors published");
        Ok((reading, open))
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            if let Err(err) = self.publish_once() {
                warn!(error = %err, "Sensor publish failed");
            }
            self.clock.sleep(self.interval);
        }
    }
}

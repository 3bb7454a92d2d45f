//! Simulated washer: a virtual clock, a physical plant model and adapters that
//! plug the plant into the real control loops.

use crate::bus::Bus;
use crate::hal::{EdgeCounter, InputLine, OutputLine, PulseInput, RelayBank, ZeroCross};
use crate::motor::{DelayLimits, SharedDelay};
use crate::relay::{RelayCommand, RelayLines};
use crate::timebase::Clock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type TickHook = Box<dyn FnMut(Duration, Duration) + Send>;

/// Clock whose time only moves when someone sleeps on it.
///
/// Sleeps advance time in `tick` sized slices and run every registered hook
/// after each slice. Hooks must not sleep on the same clock.
pub struct VirtualClock {
    now_us: AtomicU64,
    tick: Duration,
    hooks: Mutex<Vec<TickHook>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::with_tick(Duration::from_millis(100))
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            now_us: AtomicU64::new(0),
            tick,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a hook called with `(now, slice)` after every time slice.
    pub fn on_tick(&self, hook: impl FnMut(Duration, Duration) + Send + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.now_us.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() {
            let slice = remaining.min(self.tick);
            remaining -= slice;
            let now_us = self.now_us.fetch_add(slice.as_micros() as u64, Ordering::AcqRel) + slice.as_micros() as u64;
            let now = Duration::from_micros(now_us);

            let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
            for hook in hooks.iter_mut() {
                hook(now, slice);
            }
        }
    }
}

/// Physical model of the machine: tub water, door latch and drum speed.
#[derive(Debug, Clone)]
pub struct SimulatedWasher {
    water_fraction: f64,
    door_open: bool,
    drum_hz: f64,
    door_line: bool,
    edge_residual: f64,

    fill_rate: f64,
    drain_rate: f64,
    empty_pressure_hz: f64,
    full_pressure_hz: f64,
    hz_per_us: f64,
    drum_tau_s: f64,
    seized: bool,
}

impl SimulatedWasher {
    pub fn new() -> Self {
        Self {
            water_fraction: 0.0,
            door_open: true,
            drum_hz: 0.0,
            door_line: false,
            edge_residual: 0.0,
            // Per open inlet, fraction of a full tub per second.
            fill_rate: 1.0 / 60.0,
            drain_rate: 1.0 / 20.0,
            empty_pressure_hz: 25.0,
            full_pressure_hz: 10.0,
            hz_per_us: 0.5,
            drum_tau_s: 0.2,
            seized: false,
        }
    }

    pub fn with_door_open(mut self, open: bool) -> Self {
        self.door_open = open;
        self
    }

    pub fn with_water(mut self, fraction: f64) -> Self {
        self.water_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Drum that never turns, whatever the drive.
    pub fn seized(mut self) -> Self {
        self.seized = true;
        self
    }

    /// Advances the model and returns the tachometer edges produced.
    pub fn step(&mut self, lines: &RelayLines, delay_us: f32, dt_s: f64) -> u64 {
        let inlets = lines.inlet_1 as u8 + lines.inlet_2 as u8;
        let inflow = inlets as f64 * self.fill_rate;
        let outflow = if lines.drain { self.drain_rate } else { 0.0 };
        self.water_fraction = (self.water_fraction + (inflow - outflow) * dt_s).clamp(0.0, 1.0);

        if lines.door && !self.door_line {
            self.door_open = !self.door_open;
        }
        self.door_line = lines.door;

        let target = if lines.motor && !self.seized {
            (self.hz_per_us * (8000.0 - delay_us as f64)).max(0.0)
        } else {
            0.0
        };
        self.drum_hz += (target - self.drum_hz) * (1.0 - (-dt_s / self.drum_tau_s).exp());

        self.edge_residual += self.drum_hz * dt_s;
        let edges = self.edge_residual.floor();
        self.edge_residual -= edges;
        edges as u64
    }

    /// Level sensor frequency: falls linearly as the tub fills.
    pub fn pressure_hz(&self) -> f64 {
        self.empty_pressure_hz - (self.empty_pressure_hz - self.full_pressure_hz) * self.water_fraction
    }

    pub fn door_open(&self) -> bool {
        self.door_open
    }

    pub fn drum_hz(&self) -> f64 {
        self.drum_hz
    }

    pub fn water_fraction(&self) -> f64 {
        self.water_fraction
    }
}

impl Default for SimulatedWasher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantSnapshot {
    pub water_fraction: f64,
    pub pressure_hz: f64,
    pub door_open: bool,
    pub drum_hz: f64,
    pub lines: RelayLines,
    pub gate_firings: u64,
}

#[derive(Debug)]
struct PlantState {
    plant: SimulatedWasher,
    lines: RelayLines,
    gate_firings: u64,
}

/// Shared handle onto a plant. Adapters created from one handle all act on
/// the same machine.
#[derive(Clone, Debug)]
pub struct SimHandle {
    state: Arc<Mutex<PlantState>>,
}

impl SimHandle {
    pub fn new(plant: SimulatedWasher) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlantState {
                plant,
                lines: RelayLines::default(),
                gate_firings: 0,
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut PlantState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn step(&self, delay_us: f32, dt: Duration) -> u64 {
        self.with(|state| {
            let lines = state.lines;
            state.plant.step(&lines, delay_us, dt.as_secs_f64())
        })
    }

    pub fn snapshot(&self) -> PlantSnapshot {
        self.with(|state| PlantSnapshot {
            water_fraction: state.plant.water_fraction(),
            pressure_hz: state.plant.pressure_hz(),
            door_open: state.plant.door_open(),
            drum_hz: state.plant.drum_hz(),
            lines: state.lines,
            gate_firings: state.gate_firings,
        })
    }

    pub fn relay_bank(&self) -> SimRelayBank {
        SimRelayBank(self.clone())
    }

    pub fn level_input(&self) -> SimLevelInput {
        SimLevelInput(self.clone())
    }

    pub fn door_line(&self) -> SimDoorLine {
        SimDoorLine(self.clone())
    }

    pub fn gate(&self) -> SimGate {
        SimGate(self.clone())
    }
}

pub struct SimRelayBank(SimHandle);

impl RelayBank for SimRelayBank {
    fn apply(&mut self, lines: &RelayLines) {
        self.0.with(|state| {
            // The latch reacts to the rising edge, so a pulse shorter than a
            // plant step still toggles it.
            if lines.door && !state.lines.door {
                let pulse = RelayLines { door: true, ..state.lines };
                state.plant.step(&pulse, 8000.0, 0.0);
            }
            state.lines = *lines;
        });
    }
}

/// Square wave at the plant's pressure frequency, 50 % duty.
pub struct SimLevelInput(SimHandle);

impl PulseInput for SimLevelInput {
    fn pulse_width(&mut self, _high: bool, timeout: Duration) -> Option<Duration> {
        let hz = self.0.snapshot().pressure_hz;
        if hz <= 0.0 {
            return None;
        }
        let half = Duration::from_secs_f64(0.5 / hz);
        (half <= timeout).then_some(half)
    }
}

pub struct SimDoorLine(SimHandle);

impl InputLine for SimDoorLine {
    fn is_high(&mut self) -> bool {
        self.0.snapshot().door_open
    }
}

pub struct SimGate(SimHandle);

impl OutputLine for SimGate {
    fn set_high(&mut self) {
        self.0.with(|state| state.gate_firings += 1);
    }

    fn set_low(&mut self) {}
}

/// Mains reference at 50 Hz: one crossing every 10 ms.
pub struct SimZeroCross {
    clock: Arc<dyn Clock>,
    half_cycle: Duration,
}

impl SimZeroCross {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            half_cycle: Duration::from_millis(10),
        }
    }
}

impl ZeroCross for SimZeroCross {
    fn wait_for_crossing(&mut self, timeout: Duration) -> bool {
        if self.half_cycle > timeout {
            self.clock.sleep(timeout);
            return false;
        }
        self.clock.sleep(self.half_cycle);
        true
    }
}

/// Steps the plant in real time, driven by the firing delay the motor loop
/// uses, and feeds drum edges to the tachometer counter.
pub struct PlantRunner {
    handle: SimHandle,
    delay: SharedDelay,
    counter: Arc<EdgeCounter>,
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl PlantRunner {
    pub fn new(handle: SimHandle, delay: SharedDelay, counter: Arc<EdgeCounter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            handle,
            delay,
            counter,
            clock,
            period: Duration::from_millis(10),
        }
    }

    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.clock.sleep(self.period);
            let edges = self.handle.step(self.delay.get() as f32, self.period);
            self.counter.record_edges(edges);
        }
    }
}

/// Couples a plant straight to a bus on every tick of a [`VirtualClock`].
///
/// Stands in for the relay driver, sensor reader, tachometer and delay
/// monitor so a whole program can run on one thread in virtual time.
pub struct BusRig {
    handle: SimHandle,
    bus: Bus,
    limits: DelayLimits,
    last_code: Option<u32>,
}

impl BusRig {
    pub fn attach(bus: Bus, clock: &VirtualClock, plant: SimulatedWasher) -> SimHandle {
        let handle = SimHandle::new(plant);
        let mut rig = Self {
            handle: handle.clone(),
            bus,
            limits: DelayLimits::default(),
            last_code: None,
        };
        rig.publish();
        clock.on_tick(move |_now, slice| rig.step(slice));
        handle
    }

    fn follow_relay(&mut self) {
        let Ok(code) = self.bus.relay_code() else {
            return;
        };
        if self.last_code == Some(code.to_bits()) {
            return;
        }
        self.last_code = Some(code.to_bits());
        let Ok(command) = RelayCommand::try_from(code) else {
            return;
        };

        let mut bank = self.handle.relay_bank();
        let mut lines = self.handle.snapshot().lines;
        command.apply(&mut lines);
        bank.apply(&lines);
        if command == RelayCommand::DoorPulse {
            RelayCommand::DoorRelease.apply(&mut lines);
            bank.apply(&lines);
        }
        if let Some(next) = command.follow_up() {
            let _ = self.bus.send_relay(next);
        }
    }

    fn publish(&self) {
        let snapshot = self.handle.snapshot();
        let pressure = snapshot.pressure_hz as f32;
        let _ = self.bus.publish_pressure(pressure);
        let _ = self.bus.publish_water_level(pressure * 0.1);
        let _ = self.bus.publish_door(snapshot.door_open);
        let _ = self.bus.publish_drum_hz(snapshot.drum_hz as f32);
    }

    fn step(&mut self, slice: Duration) {
        self.follow_relay();
        let delay = self
            .bus
            .triac_delay()
            .map(|raw| self.limits.sanitize(raw))
            .unwrap_or(self.limits.max_us);
        self.handle.step(delay, slice);
        self.publish();
    }
}

//! Table-driven wash cycle engine.
//!
//! All cycle state lives on the bus: the selected program in
//! `command_mode_from_server` and the position in `command_from_server`. The
//! orchestrator only keeps counters, so a restarted process resumes at the
//! persisted cursor.

use crate::bus::{Bus, BusError};
use crate::cells::{FaultCode, IDLE_CURSOR};
use crate::leveler::{LevelerConfig, LevelerOutcome, RpmLeveler};
use crate::program::{Action, Chore, Program, Report, RotationPattern, Step};
use crate::relay::RelayCommand;
use crate::retry::RetryPolicy;
use crate::timebase::Clock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Pause between ticks.
    pub poll_interval: Duration,
    pub fill_poll: Duration,
    pub fill_timeout: Duration,
    /// Settle time after each relay command.
    pub command_gap: Duration,
    pub door_settle: Duration,
    pub door_release: Duration,
    pub leveler: LevelerConfig,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            fill_poll: Duration::from_millis(200),
            fill_timeout: Duration::from_secs(15 * 60),
            command_gap: Duration::from_secs(1),
            door_settle: Duration::from_secs(10),
            door_release: Duration::from_secs(4),
            leveler: LevelerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Remote side of the cycle. Implementations must not block for long.
pub trait ProgressReporter: Send + Sync {
    fn report_progress(&self, progress: u8);
    fn report_ready(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report_progress(&self, _progress: u8) {}
    fn report_ready(&self) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CycleEvent {
    StepStarted {
        program: Program,
        cursor: f32,
        threshold: f32,
    },
    StepCompleted {
        program: Program,
        threshold: f32,
        next: f32,
    },
    StepFailed {
        program: Program,
        threshold: f32,
        fault: FaultCode,
        attempt: u32,
        error: String,
    },
    StepAborted {
        program: Program,
        threshold: f32,
        reason: String,
    },
    Levelled {
        target_hz: f32,
        outcome: LevelerOutcome,
    },
    CycleFinished {
        program: Program,
    },
}

pub trait CycleObserver: Send + Sync {
    fn on_event(&self, event: &CycleEvent);
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("bus access failed: {0}")]
    Bus(#[from] BusError),
    #[error("drum did not reach {target_hz} Hz (measured {measured_hz} Hz)")]
    SpeedNotReached { target_hz: f32, measured_hz: f32 },
    #[error("pressure did not reach {target} within {timeout:?}")]
    FillTimeout { target: f32, timeout: Duration },
    #[error("door still open after {pulses} pulses")]
    DoorStuck { pulses: u32 },
    #[error("stop requested")]
    Cancelled,
    #[error("cursor changed to {cursor} while the step was running")]
    Superseded { cursor: f32 },
    #[error("step {threshold} failed {attempts} times, last error: {last}")]
    RetriesExhausted {
        threshold: f32,
        attempts: u32,
        last: String,
    },
}

impl CycleError {
    pub fn fault_code(&self) -> FaultCode {
        match self {
            Self::Bus(_) => FaultCode::BusFailure,
            Self::SpeedNotReached { .. } => FaultCode::SpeedNotReached,
            Self::FillTimeout { .. } => FaultCode::FillTimeout,
            Self::DoorStuck { .. } => FaultCode::DoorStuck,
            Self::RetriesExhausted { .. } => FaultCode::RetriesExhausted,
            Self::Cancelled | Self::Superseded { .. } => FaultCode::None,
        }
    }

    /// Interruptions end the step without counting as a failure.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Superseded { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tick {
    Idle,
    Advanced { program: Program, threshold: f32, next: f32 },
    Aborted { program: Program, threshold: f32 },
}

#[derive(Clone, Default, Debug)]
pub struct CycleStats {
    pub steps_completed: u64,
    pub step_failures: u64,
    pub cycles_finished: u64,
    pub leveler_iterations: u64,
}

pub struct CycleOrchestrator {
    bus: Bus,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    leveler: RpmLeveler,
    reporter: Arc<dyn ProgressReporter>,
    observers: Vec<Arc<dyn CycleObserver>>,
    current: Option<(Program, f32)>,
    idle_logged: bool,
    stats: CycleStats,
}

impl CycleOrchestrator {
    pub fn new(bus: Bus, clock: Arc<dyn Clock>, config: OrchestratorConfig) -> Self {
        let leveler = RpmLeveler::new(bus.clone(), Arc::clone(&clock), config.leveler.clone());
        Self {
            bus,
            clock,
            config,
            leveler,
            reporter: Arc::new(NullReporter),
            observers: Vec::new(),
            current: None,
            idle_logged: false,
            stats: CycleStats::default(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    fn emit(&self, event: CycleEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    /// Runs at most one step.
    pub fn tick(&mut self, stop: &AtomicBool) -> Result<Tick, CycleError> {
        self.current = None;
        let cursor = self.bus.cursor()?;
        let selector = self.bus.program_code()?;

        let step = match Program::from_code(selector) {
            Some(program) => program.step_for(cursor).map(|step| (program, step)),
            None => {
                if cursor < IDLE_CURSOR && !self.idle_logged {
                    warn!(selector, cursor, "Unknown program selector, holding");
                }
                None
            }
        };
        let Some((program, step)) = step else {
            if !self.idle_logged {
                debug!(cursor, "No active job");
                self.idle_logged = true;
            }
            self.current = None;
            return Ok(Tick::Idle);
        };
        self.idle_logged = false;
        self.current = Some((program, step.threshold));

        info!(program = program.name(), cursor, threshold = step.threshold, "Step started");
        self.emit(CycleEvent::StepStarted {
            program,
            cursor,
            threshold: step.threshold,
        });

        if let Err(err) = self.run_step(step, cursor, stop) {
            if let Err(bus_err) = self.bus.send_relay(RelayCommand::AllOff) {
                warn!(error = %bus_err, "Failed to release relays");
            }
            if err.is_interruption() {
                info!(program = program.name(), threshold = step.threshold, reason = %err, "Step aborted");
                self.emit(CycleEvent::StepAborted {
                    program,
                    threshold: step.threshold,
                    reason: err.to_string(),
                });
                return Ok(Tick::Aborted {
                    program,
                    threshold: step.threshold,
                });
            }
            return Err(err);
        }

        match step.report {
            Report::Progress(progress) => self.reporter.report_progress(progress),
            Report::Ready => self.reporter.report_ready(),
        }

        let now = self.bus.cursor()?;
        if now.to_bits() == cursor.to_bits() {
            self.bus.set_cursor(step.next)?;
        } else {
            warn!(cursor = now, "Cursor moved during step, not advancing");
        }
        self.bus.clear_fault()?;
        self.stats.steps_completed += 1;

        info!(program = program.name(), threshold = step.threshold, next = step.next, "Step complete");
        self.emit(CycleEvent::StepCompleted {
            program,
            threshold: step.threshold,
            next: step.next,
        });

        if step.is_terminal() {
            self.bus.send_relay(RelayCommand::AllOff)?;
            self.stats.cycles_finished += 1;
            info!(program = program.name(), "Cycle finished");
            self.emit(CycleEvent::CycleFinished { program });
        }

        Ok(Tick::Advanced {
            program,
            threshold: step.threshold,
            next: step.next,
        })
    }

    /// Ticks until `stop` is set. Returns an error only when a bounded retry
    /// policy runs out.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), CycleError> {
        let mut failures = 0u32;
        info!("Cycle orchestrator started");

        while !stop.load(Ordering::Relaxed) {
            match self.tick(stop) {
                Ok(_) => failures = 0,
                Err(err) => {
                    failures += 1;
                    self.stats.step_failures += 1;
                    let fault = err.fault_code();
                    let program = self.current.map(|(program, _)| program);
                    let threshold = self.current.map_or(f32::NAN, |(_, threshold)| threshold);
                    error!(
                        program = program.map(Program::name),
                        threshold,
                        attempt = failures,
                        error = %err,
                        "Step failed"
                    );
                    self.record_fault(fault);
                    if let Some(program) = program {
                        self.emit(CycleEvent::StepFailed {
                            program,
                            threshold,
                            fault,
                            attempt: failures,
                            error: err.to_string(),
                        });
                    }

                    match self.config.retry.pause_after(failures) {
                        Some(pause) => self.clock.sleep(pause),
                        None => {
                            self.record_fault(FaultCode::RetriesExhausted);
                            return Err(CycleError::RetriesExhausted {
                                threshold,
                                attempts: failures,
                                last: err.to_string(),
                            });
                        }
                    }
                    continue;
                }
            }
            self.clock.sleep(self.config.poll_interval);
        }

        info!(
            steps = self.stats.steps_completed,
            cycles = self.stats.cycles_finished,
            "Cycle orchestrator stopped"
        );
        Ok(())
    }

    fn record_fault(&self, fault: FaultCode) {
        if let Err(err) = self.bus.raise_fault(fault) {
            warn!(error = %err, "Failed to record fault");
        }
    }

    fn run_step(&mut self, step: &Step, cursor: f32, stop: &AtomicBool) -> Result<(), CycleError> {
        for action in step.actions {
            self.checkpoint(cursor, stop)?;
            self.run_action(action, cursor, stop)?;
        }
        self.checkpoint(cursor, stop)
    }

    fn checkpoint(&self, cursor: f32, stop: &AtomicBool) -> Result<(), CycleError> {
        if stop.load(Ordering::Relaxed) {
            return Err(CycleError::Cancelled);
        }
        let now = self.bus.cursor()?;
        if now.to_bits() != cursor.to_bits() {
            return Err(CycleError::Superseded { cursor: now });
        }
        Ok(())
    }

    fn run_action(&mut self, action: &Action, cursor: f32, stop: &AtomicBool) -> Result<(), CycleError> {
        match *action {
            Action::Wait(duration) => {
                self.clock.sleep(duration);
                Ok(())
            }
            Action::CloseDoor => self.close_door(),
            Action::OpenDoor => self.open_door(),
            Action::Drain(duration) => self.drain(duration),
            Action::FillToLevel(target) => self.fill_to(target, cursor, stop),
            Action::SetDelay(delay_us) => {
                self.bus.set_triac_delay(delay_us)?;
                Ok(())
            }
            Action::Rotate(pattern) => self.rotate(&pattern, cursor, stop),
        }
    }

    fn command(&self, command: RelayCommand) -> Result<(), CycleError> {
        debug!(command = command.name(), "Relay command");
        self.bus.send_relay(command)?;
        Ok(())
    }

    fn close_door(&self) -> Result<(), CycleError> {
        let mut pulses = 0;
        while self.bus.door_open()? {
            if pulses == 2 {
                return Err(CycleError::DoorStuck { pulses });
            }
            self.command(RelayCommand::DoorPulse)?;
            pulses += 1;
            self.clock.sleep(self.config.door_settle);
        }
        if pulses > 0 {
            self.clock.sleep(self.config.door_release);
        }
        Ok(())
    }

    fn open_door(&self) -> Result<(), CycleError> {
        if self.bus.door_open()? {
            debug!("Door already open");
            return Ok(());
        }
        self.command(RelayCommand::DoorPulse)?;
        self.clock.sleep(self.config.door_release);
        if !self.bus.door_open()? {
            warn!("Door did not report open after release pulse");
        }
        Ok(())
    }

    fn drain(&self, duration: Duration) -> Result<(), CycleError> {
        self.command(RelayCommand::DrainOpen)?;
        self.clock.sleep(duration);
        self.command(RelayCommand::DrainClose)?;
        self.clock.sleep(self.config.command_gap);
        Ok(())
    }

    /// The pressure frequency falls as the tub fills; zero means no signal.
    fn level_reached(&self, target: f32) -> Result<bool, BusError> {
        let pressure = self.bus.pressure()?;
        Ok(pressure > 0.0 && pressure <= target)
    }

    fn fill_to(&self, target: f32, cursor: f32, stop: &AtomicBool) -> Result<(), CycleError> {
        if self.level_reached(target)? {
            debug!(target, "Level already reached");
            return Ok(());
        }

        self.command(RelayCommand::Inlet2Open)?;
        self.clock.sleep(self.config.command_gap);
        self.command(RelayCommand::Inlet1Open)?;

        let started = self.clock.now();
        while !self.level_reached(target)? {
            self.checkpoint(cursor, stop)?;
            if self.clock.elapsed_since(started) >= self.config.fill_timeout {
                self.command(RelayCommand::Inlet2Close)?;
                self.clock.sleep(self.config.command_gap);
                self.command(RelayCommand::Inlet1Close)?;
                return Err(CycleError::FillTimeout {
                    target,
                    timeout: self.config.fill_timeout,
                });
            }
            self.clock.sleep(self.config.fill_poll);
        }

        self.command(RelayCommand::Inlet2Close)?;
        self.clock.sleep(self.config.command_gap);
        self.command(RelayCommand::Inlet1Close)?;
        self.clock.sleep(self.config.command_gap);
        Ok(())
    }

    fn rotate(&mut self, pattern: &RotationPattern, cursor: f32, stop: &AtomicBool) -> Result<(), CycleError> {
        let started = self.clock.now();
        while self.clock.elapsed_since(started) < pattern.window {
            self.checkpoint(cursor, stop)?;
            self.spin_half(RelayCommand::ForwardHigh, pattern, pattern.after_forward, cursor, stop)?;
            self.checkpoint(cursor, stop)?;
            self.spin_half(RelayCommand::ReverseHigh, pattern, pattern.after_reverse, cursor, stop)?;
        }
        Ok(())
    }

    fn spin_half(
        &mut self,
        direction: RelayCommand,
        pattern: &RotationPattern,
        chore: Option<Chore>,
        cursor: f32,
        stop: &AtomicBool,
    ) -> Result<(), CycleError> {
        self.command(direction)?;
        self.clock.sleep(self.config.command_gap);

        let outcome = self.leveler.level(pattern.target_hz, stop)?;
        self.stats.leveler_iterations += outcome.iterations() as u64;
        self.emit(CycleEvent::Levelled {
            target_hz: pattern.target_hz,
            outcome,
        });
        match outcome {
            LevelerOutcome::Converged { .. } => {}
            LevelerOutcome::Cancelled { .. } => return Err(CycleError::Cancelled),
            LevelerOutcome::TimedOut { measured_hz, .. } => {
                return Err(CycleError::SpeedNotReached {
                    target_hz: pattern.target_hz,
                    measured_hz,
                })
            }
        }

        self.clock.sleep(pattern.run);
        self.command(RelayCommand::StopSpin)?;
        self.clock.sleep(pattern.brake);
        self.bus.set_triac_delay(pattern.rest_delay_us)?;

        match chore {
            Some(Chore::Refill(level)) => self.fill_to(level, cursor, stop),
            Some(Chore::Drain(duration)) => self.drain(duration),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal_sim::VirtualClock;

    fn orchestrator(bus: &Bus, clock: Arc<VirtualClock>) -> CycleOrchestrator {
        let config = OrchestratorConfig {
            retry: RetryPolicy::bounded(Duration::from_secs(1), 2),
            ..OrchestratorConfig::default()
        };
        CycleOrchestrator::new(bus.clone(), clock, config)
    }

    #[test]
    fn idle_cursor_runs_nothing() {
        let bus = Bus::in_memory();
        bus.set_program_code(0.0).unwrap();
        bus.set_cursor(IDLE_CURSOR).unwrap();
        bus.write(crate::cells::RELAY_COMMAND, 0.0).unwrap();
        let clock = Arc::new(VirtualClock::new());
        let mut orch = orchestrator(&bus, clock.clone());

        assert_eq!(orch.tick(&AtomicBool::new(false)).unwrap(), Tick::Idle);
        assert_eq!(bus.relay_code().unwrap(), 0.0);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn unknown_selector_holds() {
        let bus = Bus::in_memory();
        bus.set_cursor(0.0).unwrap();
        let mut orch = orchestrator(&bus, Arc::new(VirtualClock::new()));
        assert_eq!(orch.tick(&AtomicBool::new(false)).unwrap(), Tick::Idle);
        assert_eq!(bus.cursor().unwrap(), 0.0);
    }

    #[test]
    fn drain_step_advances_cursor() {
        let bus = Bus::in_memory();
        bus.set_program_code(0.0).unwrap();
        bus.set_cursor(5.0).unwrap();
        let clock = Arc::new(VirtualClock::new());
        let mut orch = orchestrator(&bus, clock.clone());

        let tick = orch.tick(&AtomicBool::new(false)).unwrap();
        assert_eq!(
            tick,
            Tick::Advanced {
                program: Program::Quick,
                threshold: 5.0,
                next: 10.0
            }
        );
        assert_eq!(bus.cursor().unwrap(), 10.0);
        assert_eq!(bus.relay_code().unwrap(), RelayCommand::DrainClose.code());
        assert_eq!(clock.now(), Duration::from_secs(11));
    }

    #[test]
    fn fill_without_signal_times_out_and_exhausts_retries() {
        let bus = Bus::in_memory();
        bus.set_program_code(0.0).unwrap();
        bus.set_cursor(10.0).unwrap();
        let clock = Arc::new(VirtualClock::with_tick(Duration::from_secs(1)));
        let mut orch = orchestrator(&bus, clock);

        let err = orch.run(&AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, CycleError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(bus.fault().unwrap(), FaultCode::RetriesExhausted);
        assert_eq!(bus.relay_code().unwrap(), RelayCommand::AllOff.code());
        assert_eq!(bus.cursor().unwrap(), 10.0);
        assert_eq!(orch.stats().step_failures, 2);
    }

    #[test]
    fn stop_flag_aborts_without_advancing() {
        let bus = Bus::in_memory();
        bus.set_program_code(1.0).unwrap();
        bus.set_cursor(20.0).unwrap();
        let mut orch = orchestrator(&bus, Arc::new(VirtualClock::new()));

        let tick = orch.tick(&AtomicBool::new(true)).unwrap();
        assert!(matches!(tick, Tick::Aborted { threshold, .. } if threshold == 20.0));
        assert_eq!(bus.cursor().unwrap(), 20.0);
        assert_eq!(bus.relay_code().unwrap(), RelayCommand::AllOff.code());
    }

    #[test]
    fn withdrawn_job_aborts_step() {
        let bus = Bus::in_memory();
        bus.set_program_code(0.0).unwrap();
        bus.set_cursor(90.0).unwrap();
        let clock = Arc::new(VirtualClock::new());
        let server = bus.clone();
        clock.on_tick(move |now, _dt| {
            if now >= Duration::from_secs(5) {
                let _ = server.set_cursor(IDLE_CURSOR);
            }
        });
        let mut orch = orchestrator(&bus, clock);

        let tick = orch.tick(&AtomicBool::new(false)).unwrap();
        assert!(matches!(tick, Tick::Aborted { .. }));
        assert_eq!(bus.cursor().unwrap(), IDLE_CURSOR);
    }
}

//! Relay command vocabulary and the driver that turns the `relay_command`
//! cell into output line states.

use crate::bus::{Bus, BusError};
use crate::hal::RelayBank;
use crate::timebase::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayCommand {
    Idle,
    ForwardHigh,
    ForwardLow,
    ReverseHigh,
    ReverseLow,
    StopSpin,
    Inlet2Open,
    Inlet2Close,
    Inlet1Open,
    Inlet1Close,
    DrainOpen,
    DrainClose,
    DoorPulse,
    DoorRelease,
    AllOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("unmapped relay code {0}")]
pub struct UnknownRelayCode(pub f32);

impl RelayCommand {
    pub const ALL: [RelayCommand; 15] = [
        Self::Idle,
        Self::ForwardHigh,
        Self::ForwardLow,
        Self::ReverseHigh,
        Self::ReverseLow,
        Self::StopSpin,
        Self::Inlet2Open,
        Self::Inlet2Close,
        Self::Inlet1Open,
        Self::Inlet1Close,
        Self::DrainOpen,
        Self::DrainClose,
        Self::DoorPulse,
        Self::DoorRelease,
        Self::AllOff,
    ];

    pub fn code(self) -> f32 {
        match self {
            Self::Idle => 0.0,
            Self::ForwardHigh => 1.0,
            Self::ForwardLow => 2.0,
            Self::ReverseHigh => 3.0,
            Self::ReverseLow => 4.0,
            Self::StopSpin => 5.0,
            Self::Inlet2Open => 6.0,
            Self::Inlet2Close => 7.0,
            Self::Inlet1Open => 8.0,
            Self::Inlet1Close => 9.0,
            Self::DrainOpen => 10.0,
            Self::DrainClose => 11.0,
            Self::DoorPulse => 12.0,
            Self::DoorRelease => 13.0,
            Self::AllOff => 14.0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ForwardHigh => "forward_high",
            Self::ForwardLow => "forward_low",
            Self::ReverseHigh => "reverse_high",
            Self::ReverseLow => "reverse_low",
            Self::StopSpin => "stop_spin",
            Self::Inlet2Open => "inlet2_open",
            Self::Inlet2Close => "inlet2_close",
            Self::Inlet1Open => "inlet1_open",
            Self::Inlet1Close => "inlet1_close",
            Self::DrainOpen => "drain_open",
            Self::DrainClose => "drain_close",
            Self::DoorPulse => "door_pulse",
            Self::DoorRelease => "door_release",
            Self::AllOff => "all_off",
        }
    }

    /// Writes this command's effect into the output image. Lines a command
    /// does not mention keep their state.
    pub fn apply(self, lines: &mut RelayLines) {
        match self {
            Self::Idle => {}
            Self::ForwardHigh => lines.drive(false, false),
            Self::ForwardLow => lines.drive(true, false),
            Self::ReverseHigh => lines.drive(false, true),
            Self::ReverseLow => lines.drive(true, true),
            Self::StopSpin => lines.motor = false,
            Self::Inlet2Open => lines.inlet_2 = true,
            Self::Inlet2Close => lines.inlet_2 = false,
            Self::Inlet1Open => lines.inlet_1 = true,
            Self::Inlet1Close => lines.inlet_1 = false,
            Self::DrainOpen => lines.drain = true,
            Self::DrainClose => lines.drain = false,
            Self::DoorPulse => lines.door = true,
            Self::DoorRelease => lines.door = false,
            Self::AllOff => *lines = RelayLines::default(),
        }
    }

    /// Code the driver writes back to the bus once this command has executed.
    pub fn follow_up(self) -> Option<RelayCommand> {
        match self {
            Self::DoorPulse => Some(Self::DoorRelease),
            Self::AllOff => Some(Self::Idle),
            _ => None,
        }
    }
}

impl TryFrom<f32> for RelayCommand {
    type Error = UnknownRelayCode;

    fn try_from(code: f32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|command| command.code() == code)
            .ok_or(UnknownRelayCode(code))
    }
}

impl std::fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Output image of the relay board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayLines {
    /// Main motor contactor.
    pub motor: bool,
    /// Winding select: low-speed tap when set.
    pub low_speed: bool,
    pub reverse_a: bool,
    pub reverse_b: bool,
    pub inlet_1: bool,
    pub inlet_2: bool,
    pub drain: bool,
    pub door: bool,
}

impl RelayLines {
    fn drive(&mut self, low_speed: bool, reverse: bool) {
        self.low_speed = low_speed;
        self.reverse_a = reverse;
        self.reverse_b = reverse;
        self.motor = true;
    }

    pub fn any_active(&self) -> bool {
        *self != Self::default()
    }
}

#[derive(Clone, Debug)]
pub struct RelayDriverConfig {
    pub poll_interval: Duration,
    pub door_pulse: Duration,
}

impl Default for RelayDriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            door_pulse: Duration::from_millis(120),
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct RelayStats {
    pub executed: u64,
    pub unknown_codes: u64,
    pub bus_errors: u64,
}

/// Polls `relay_command` and mirrors it onto the relay bank.
///
/// Execution is level-triggered: the current code is re-applied every poll,
/// which is harmless because every command sets absolute line states.
pub struct RelayDriver<B: RelayBank> {
    bank: B,
    bus: Bus,
    clock: Arc<dyn Clock>,
    config: RelayDriverConfig,
    lines: RelayLines,
    last_code: Option<f32>,
    stats: RelayStats,
}

impl<B: RelayBank> RelayDriver<B> {
    pub fn new(bank: B, bus: Bus, clock: Arc<dyn Clock>, config: RelayDriverConfig) -> Self {
        Self {
            bank,
            bus,
            clock,
            config,
            lines: RelayLines::default(),
            last_code: None,
            stats: RelayStats::default(),
        }
    }

    pub fn lines(&self) -> RelayLines {
        self.lines
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Reads the cell once and executes whatever it holds.
    pub fn poll_once(&mut self) -> Result<Option<RelayCommand>, BusError> {
        let code = self.bus.relay_code()?;
        let changed = self.last_code.map_or(true, |last| last.to_bits() != code.to_bits());
        self.last_code = Some(code);

        match RelayCommand::try_from(code) {
            Ok(command) => {
                if changed {
                    info!(code, command = command.name(), "Executing relay command");
                }
                self.execute(command)?;
                Ok(Some(command))
            }
            Err(err) => {
                self.stats.unknown_codes += 1;
                if changed {
                    warn!(code, error = %err, "Ignoring relay command");
                }
                Ok(None)
            }
        }
    }

    pub fn execute(&mut self, command: RelayCommand) -> Result<(), BusError> {
        command.apply(&mut self.lines);
        self.bank.apply(&self.lines);

        if command == RelayCommand::DoorPulse {
            self.clock.sleep(self.config.door_pulse);
            RelayCommand::DoorRelease.apply(&mut self.lines);
            self.bank.apply(&self.lines);
        }
        self.stats.executed += 1;

        if let Some(next) = command.follow_up() {
            // Only acknowledge if nobody has written a newer command meanwhile.
            if self.bus.relay_code()? == command.code() {
                debug!(command = command.name(), next = next.name(), "Relay follow-up");
                self.bus.send_relay(next)?;
            }
        }
        Ok(())
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            if let Err(err) = self.poll_once() {
                self.stats.bus_errors += 1;
                warn!(error = %err, "Relay driver bus read failed");
            }
            self.clock.sleep(self.config.poll_interval);
        }
        self.shutdown();
    }

    /// De-energises every line.
    pub fn shutdown(&mut self) {
        self.lines = RelayLines::default();
        self.bank.apply(&self.lines);
        info!("Relay outputs released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timebase::SystemClock;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingBank(Arc<Mutex<Vec<RelayLines>>>);

    impl RelayBank for RecordingBank {
        fn apply(&mut self, lines: &RelayLines) {
            self.0.lock().unwrap().push(*lines);
        }
    }

    fn driver(bus: &Bus) -> (RelayDriver<RecordingBank>, RecordingBank) {
        let bank = RecordingBank::default();
        let config = RelayDriverConfig {
            poll_interval: Duration::from_millis(1),
            door_pulse: Duration::from_millis(1),
        };
        let driver = RelayDriver::new(bank.clone(), bus.clone(), Arc::new(SystemClock::new()), config);
        (driver, bank)
    }

    #[test]
    fn every_code_decodes_to_its_command() {
        for command in RelayCommand::ALL {
            assert_eq!(RelayCommand::try_from(command.code()), Ok(command));
        }
    }

    #[test]
    fn out_of_vocabulary_codes_are_rejected() {
        for code in [-1.0, 1.5, 15.0, 1000.0, f32::NAN] {
            assert!(RelayCommand::try_from(code).is_err());
        }
    }

    #[test]
    fn reverse_low_energises_all_drive_lines() {
        let mut lines = RelayLines::default();
        RelayCommand::ReverseLow.apply(&mut lines);
        assert!(lines.motor && lines.low_speed && lines.reverse_a && lines.reverse_b);

        RelayCommand::StopSpin.apply(&mut lines);
        assert!(!lines.motor);
        assert!(lines.reverse_a);
    }

    #[test]
    fn valve_commands_leave_drive_untouched() {
        let mut lines = RelayLines::default();
        RelayCommand::ForwardHigh.apply(&mut lines);
        RelayCommand::DrainOpen.apply(&mut lines);
        assert!(lines.motor && lines.drain);
        RelayCommand::AllOff.apply(&mut lines);
        assert!(!lines.any_active());
    }

    #[test]
    fn door_pulse_releases_and_acknowledges() {
        let bus = Bus::in_memory();
        bus.send_relay(RelayCommand::DoorPulse).unwrap();
        let (mut driver, bank) = driver(&bus);

        assert_eq!(driver.poll_once().unwrap(), Some(RelayCommand::DoorPulse));
        let history = bank.0.lock().unwrap().clone();
        assert!(history[0].door);
        assert!(!history[1].door);
        assert_eq!(bus.relay_code().unwrap(), 13.0);
    }

    #[test]
    fn all_off_is_acknowledged_with_idle() {
        let bus = Bus::in_memory();
        let (mut driver, _bank) = driver(&bus);
        assert_eq!(driver.poll_once().unwrap(), Some(RelayCommand::AllOff));
        assert_eq!(bus.relay_code().unwrap(), 0.0);
        assert_eq!(driver.poll_once().unwrap(), Some(RelayCommand::Idle));
    }

    #[test]
    fn unknown_code_is_a_no_op() {
        let bus = Bus::in_memory();
        bus.write(crate::cells::RELAY_COMMAND, 42.0).unwrap();
        let (mut driver, bank) = driver(&bus);
        assert_eq!(driver.poll_once().unwrap(), None);
        assert!(bank.0.lock().unwrap().is_empty());
        assert_eq!(driver.stats().unknown_codes, 1);
        assert_eq!(bus.relay_code().unwrap(), 42.0);
    }
}

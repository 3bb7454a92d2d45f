//! GPIO backend on the Linux sysfs interface.
//!
//! Lines are exported under `/sys/class/gpio` and driven through their
//! `value` files. Relays are active high; the door sensor reads high while
//! the door is open. The tachometer line is armed for rising-edge interrupts
//! and waited on through the kernel's `POLLPRI` notification.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};
use wash_spine::hal::{PolledPulse, PolledZeroCross};
use wash_spine::{EdgeCounter, EdgeSource, InputLine, OutputLine, RelayBank, RelayLines};

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Error)]
pub enum SysfsError {
    #[error("failed to export GPIO {pin}: {source}")]
    Export {
        pin: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to set direction of GPIO {pin}: {source}")]
    Direction {
        pin: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to open value of GPIO {pin}: {source}")]
    Value {
        pin: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to arm edge interrupt on GPIO {pin}: {source}")]
    Edge {
        pin: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

/// One exported GPIO line.
#[derive(Debug)]
pub struct SysfsLine {
    pin: u32,
    dir: PathBuf,
    value: File,
    failed: bool,
}

impl SysfsLine {
    pub fn open(root: &Path, pin: u32, direction: Direction) -> Result<Self, SysfsError> {
        let line_dir = root.join(format!("gpio{pin}"));
        if !line_dir.exists() {
            write_attr(&root.join("export"), &pin.to_string())
                .map_err(|source| SysfsError::Export { pin, source })?;
        }
        write_attr(&line_dir.join("direction"), direction.as_str())
            .map_err(|source| SysfsError::Direction { pin, source })?;

        let value = OpenOptions::new()
            .read(true)
            .write(direction == Direction::Out)
            .open(line_dir.join("value"))
            .map_err(|source| SysfsError::Value { pin, source })?;
        debug!(pin, direction = direction.as_str(), "GPIO line ready");
        Ok(Self {
            pin,
            dir: line_dir,
            value,
            failed: false,
        })
    }

    /// Arms the rising-edge interrupt and hands the line to an edge waiter.
    pub fn listen_rising(self) -> Result<SysfsEdgeSource, SysfsError> {
        self.arm_edge("rising")?;
        SysfsEdgeSource::new(self.pin, self.value)
    }

    fn arm_edge(&self, edge: &str) -> Result<(), SysfsError> {
        write_attr(&self.dir.join("edge"), edge).map_err(|source| SysfsError::Edge {
            pin: self.pin,
            source,
        })
    }

    fn read_value(&mut self) -> io::Result<bool> {
        read_level(&self.value)
    }

    fn write_value(&mut self, high: bool) -> io::Result<()> {
        self.value.seek(SeekFrom::Start(0))?;
        self.value.write_all(if high { b"1" } else { b"0" })?;
        self.value.flush()
    }

    fn note(&mut self, result: io::Result<()>) {
        match result {
            Ok(()) => self.failed = false,
            Err(err) if !self.failed => {
                self.failed = true;
                warn!(pin = self.pin, error = %err, "GPIO access failed");
            }
            Err(_) => {}
        }
    }
}

fn read_level(mut value: &File) -> io::Result<bool> {
    let mut byte = [0u8; 1];
    value.seek(SeekFrom::Start(0))?;
    value.read_exact(&mut byte)?;
    Ok(byte[0] == b'1')
}

fn write_attr(path: &Path, value: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(value.as_bytes())
}

impl InputLine for SysfsLine {
    fn is_high(&mut self) -> bool {
        match self.read_value() {
            Ok(high) => {
                self.failed = false;
                high
            }
            Err(err) => {
                self.note(Err(err));
                false
            }
        }
    }
}

impl OutputLine for SysfsLine {
    fn set_high(&mut self) {
        let result = self.write_value(true);
        self.note(result);
    }

    fn set_low(&mut self) {
        let result = self.write_value(false);
        self.note(result);
    }
}

/// BCM pin numbers of the controller board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardPins {
    pub motor: u32,
    pub low_speed: u32,
    pub reverse_a: u32,
    pub reverse_b: u32,
    pub inlet_1: u32,
    pub inlet_2: u32,
    pub drain: u32,
    pub door: u32,
    pub tachometer: u32,
    pub triac_gate: u32,
    pub zero_cross: u32,
    pub level: u32,
    pub door_sensor: u32,
    /// Added to every pin; kernels that number GPIO chips from 512 need it.
    pub offset: u32,
}

impl Default for BoardPins {
    fn default() -> Self {
        Self {
            motor: 17,
            low_speed: 27,
            reverse_a: 22,
            reverse_b: 23,
            inlet_1: 13,
            inlet_2: 6,
            drain: 19,
            door: 5,
            tachometer: 16,
            triac_gate: 24,
            zero_cross: 25,
            level: 18,
            door_sensor: 12,
            offset: 0,
        }
    }
}

pub struct SysfsRelayBank {
    motor: SysfsLine,
    low_speed: SysfsLine,
    reverse_a: SysfsLine,
    reverse_b: SysfsLine,
    inlet_1: SysfsLine,
    inlet_2: SysfsLine,
    drain: SysfsLine,
    door: SysfsLine,
}

impl RelayBank for SysfsRelayBank {
    fn apply(&mut self, lines: &RelayLines) {
        // Direction and winding settle before the motor relay closes.
        if !lines.motor {
            self.motor.set_low();
        }
        self.low_speed.set_state(lines.low_speed);
        self.reverse_a.set_state(lines.reverse_a);
        self.reverse_b.set_state(lines.reverse_b);
        if lines.motor {
            self.motor.set_high();
        }
        self.inlet_1.set_state(lines.inlet_1);
        self.inlet_2.set_state(lines.inlet_2);
        self.drain.set_state(lines.drain);
        self.door.set_state(lines.door);
    }
}

/// All lines of the board, opened and exported.
pub struct SysfsBoard {
    pub relays: SysfsRelayBank,
    pub level: PolledPulse<SysfsLine>,
    pub door_sensor: SysfsLine,
    pub zero_cross: PolledZeroCross<SysfsLine>,
    pub gate: SysfsLine,
    pub tachometer: SysfsLine,
}

impl SysfsBoard {
    pub fn open_at(root: &Path, pins: BoardPins) -> Result<Self, SysfsError> {
        let output = |pin: u32| SysfsLine::open(root, pin + pins.offset, Direction::Out);
        let input = |pin: u32| SysfsLine::open(root, pin + pins.offset, Direction::In);

        let mut relays = SysfsRelayBank {
            motor: output(pins.motor)?,
            low_speed: output(pins.low_speed)?,
            reverse_a: output(pins.reverse_a)?,
            reverse_b: output(pins.reverse_b)?,
            inlet_1: output(pins.inlet_1)?,
            inlet_2: output(pins.inlet_2)?,
            drain: output(pins.drain)?,
            door: output(pins.door)?,
        };
        relays.apply(&RelayLines::default());

        let mut gate = output(pins.triac_gate)?;
        gate.set_low();

        info!(root = %root.display(), offset = pins.offset, "GPIO board opened");
        Ok(Self {
            relays,
            level: PolledPulse::new(input(pins.level)?),
            door_sensor: input(pins.door_sensor)?,
            zero_cross: PolledZeroCross::new(input(pins.zero_cross)?),
            gate,
            tachometer: input(pins.tachometer)?,
        })
    }
}

/// Blocks on the edge interrupt of an exported line.
///
/// The sysfs `value` file raises `POLLPRI` for every configured edge; reading
/// it acknowledges the event. The waits run on a private current-thread
/// runtime so the caller stays an ordinary blocking loop.
pub struct SysfsEdgeSource {
    pin: u32,
    value: AsyncFd<File>,
    runtime: Runtime,
}

impl SysfsEdgeSource {
    fn new(pin: u32, value: File) -> Result<Self, SysfsError> {
        let edge_err = |source: io::Error| SysfsError::Edge { pin, source };
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(edge_err)?;

        // A stale event from before arming would otherwise count as an edge.
        read_level(&value).map_err(edge_err)?;
        let value = {
            let _guard = runtime.enter();
            AsyncFd::with_interest(value, Interest::PRIORITY).map_err(edge_err)?
        };
        debug!(pin, "Rising-edge interrupt armed");
        Ok(Self {
            pin,
            value,
            runtime,
        })
    }
}

impl EdgeSource for SysfsEdgeSource {
    fn wait_edge(&mut self, timeout: Duration) -> io::Result<bool> {
        self.runtime.block_on(next_edge(&self.value, timeout))
    }
}

async fn next_edge(value: &AsyncFd<File>, timeout: Duration) -> io::Result<bool> {
    let Ok(ready) = tokio::time::timeout(timeout, value.ready(Interest::PRIORITY)).await else {
        return Ok(false);
    };
    let mut guard = ready?;
    guard.clear_ready();
    read_level(value.get_ref())?;
    Ok(true)
}

impl std::fmt::Debug for SysfsEdgeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysfsEdgeSource").field("pin", &self.pin).finish()
    }
}

/// Feeds edges from an interrupt source into the tachometer counter.
pub struct EdgeListener<E> {
    source: E,
    counter: Arc<EdgeCounter>,
    timeout: Duration,
    failed: bool,
}

impl<E: EdgeSource> EdgeListener<E> {
    pub fn new(source: E, counter: Arc<EdgeCounter>) -> Self {
        Self {
            source,
            counter,
            timeout: Duration::from_millis(100),
            failed: false,
        }
    }

    /// Waits once; returns whether an edge was counted.
    pub fn listen_once(&mut self) -> bool {
        match self.source.wait_edge(self.timeout) {
            Ok(edge) => {
                self.failed = false;
                if edge {
                    self.counter.record_edge();
                }
                edge
            }
            Err(err) => {
                if !self.failed {
                    self.failed = true;
                    warn!(error = %err, "Edge wait failed");
                }
                thread::sleep(self.timeout);
                false
            }
        }
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.listen_once();
        }
    }
}

/// Root of a sysfs tree, overridable for bench rigs.
pub fn gpio_root() -> PathBuf {
    std::env::var_os("WASH_GPIO_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SYSFS_GPIO_ROOT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::fs;

    fn fake_tree(pins: &[u32]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        for pin in pins {
            let line = dir.path().join(format!("gpio{pin}"));
            fs::create_dir(&line).unwrap();
            fs::write(line.join("direction"), "in").unwrap();
            fs::write(line.join("edge"), "none").unwrap();
            fs::write(line.join("value"), "0").unwrap();
        }
        dir
    }

    fn all_pins(pins: &BoardPins) -> Vec<u32> {
        vec![
            pins.motor,
            pins.low_speed,
            pins.reverse_a,
            pins.reverse_b,
            pins.inlet_1,
            pins.inlet_2,
            pins.drain,
            pins.door,
            pins.tachometer,
            pins.triac_gate,
            pins.zero_cross,
            pins.level,
            pins.door_sensor,
        ]
    }

    fn value(dir: &Path, pin: u32) -> String {
        fs::read_to_string(dir.join(format!("gpio{pin}/value"))).unwrap()
    }

    #[test]
    fn output_line_writes_value_file() {
        let dir = fake_tree(&[17]);
        let mut line = SysfsLine::open(dir.path(), 17, Direction::Out).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("gpio17/direction")).unwrap(), "out");

        line.set_high();
        assert_eq!(value(dir.path(), 17), "1");
        line.set_low();
        assert_eq!(value(dir.path(), 17), "0");
    }

    #[test]
    fn input_line_reads_value_file() {
        let dir = fake_tree(&[12]);
        let mut line = SysfsLine::open(dir.path(), 12, Direction::In).unwrap();
        assert!(line.is_low());
        fs::write(dir.path().join("gpio12/value"), "1\n").unwrap();
        assert!(line.is_high());
    }

    #[test]
    fn missing_line_fails_to_export() {
        let dir = tempfile::tempdir().unwrap();
        let err = SysfsLine::open(dir.path(), 4, Direction::In).unwrap_err();
        assert!(matches!(err, SysfsError::Export { pin: 4, .. }));
    }

    #[test]
    fn board_maps_relay_lines_to_pins() {
        let pins = BoardPins::default();
        let dir = fake_tree(&all_pins(&pins));
        let mut board = SysfsBoard::open_at(dir.path(), pins).unwrap();

        let lines = RelayLines {
            motor: true,
            reverse_a: true,
            reverse_b: true,
            drain: true,
            ..RelayLines::default()
        };
        board.relays.apply(&lines);

        assert_eq!(value(dir.path(), 17), "1");
        assert_eq!(value(dir.path(), 27), "0");
        assert_eq!(value(dir.path(), 22), "1");
        assert_eq!(value(dir.path(), 23), "1");
        assert_eq!(value(dir.path(), 19), "1");
        assert_eq!(value(dir.path(), 5), "0");
        assert_eq!(value(dir.path(), 24), "0");
    }

    #[test]
    fn tachometer_line_is_armed_for_rising_edges() {
        let dir = fake_tree(&[16]);
        let line = SysfsLine::open(dir.path(), 16, Direction::In).unwrap();
        line.arm_edge("rising").unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("gpio16/edge")).unwrap(), "rising");
    }

    #[test]
    fn missing_edge_attribute_is_reported() {
        let dir = fake_tree(&[16]);
        fs::remove_file(dir.path().join("gpio16/edge")).unwrap();
        let line = SysfsLine::open(dir.path(), 16, Direction::In).unwrap();
        let err = line.listen_rising().unwrap_err();
        assert!(matches!(err, SysfsError::Edge { pin: 16, .. }));
    }

    /// Interrupt source replaying a fixed sequence of waits.
    struct ScriptedEdges(VecDeque<io::Result<bool>>);

    impl EdgeSource for ScriptedEdges {
        fn wait_edge(&mut self, _timeout: Duration) -> io::Result<bool> {
            self.0.pop_front().unwrap_or(Ok(false))
        }
    }

    #[test]
    fn listener_counts_each_interrupt() {
        let mut script: VecDeque<io::Result<bool>> = VecDeque::new();
        for _ in 0..25 {
            script.push_back(Ok(true));
            script.push_back(Ok(false));
        }
        let counter = Arc::new(EdgeCounter::new());
        let mut listener = EdgeListener::new(ScriptedEdges(script), counter.clone());

        for _ in 0..50 {
            listener.listen_once();
        }
        assert_eq!(counter.take(), 25);
    }

    #[test]
    fn listener_survives_failed_waits() {
        let script = VecDeque::from(vec![
            Ok(true),
            Err(io::Error::new(io::ErrorKind::Other, "interrupted")),
            Ok(true),
        ]);
        let counter = Arc::new(EdgeCounter::new());
        let mut listener = EdgeListener::new(ScriptedEdges(script), counter.clone());
        listener.timeout = Duration::from_millis(1);

        assert!(listener.listen_once());
        assert!(!listener.listen_once());
        assert!(listener.listen_once());
        assert_eq!(counter.take(), 2);
    }

    #[test]
    fn listener_stops_on_flag() {
        let counter = Arc::new(EdgeCounter::new());
        let mut listener = EdgeListener::new(ScriptedEdges(VecDeque::new()), counter.clone());
        let stop = AtomicBool::new(true);
        listener.run(&stop);
        assert_eq!(counter.take(), 0);
    }
}

//! The physical side of the controller: either the GPIO board or the
//! simulated washer, presented as the same set of line seams.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use wash_io::{BoardPins, EdgeListener, SysfsBoard, SysfsError};
use wash_spine::hal_sim::{PlantRunner, SimZeroCross};
use wash_spine::{
    Clock, EdgeCounter, InputLine, OutputLine, PulseInput, RelayBank, SharedDelay, SimHandle,
    SimulatedWasher, ZeroCross,
};

/// Work that has to run beside the control loops to keep the rig alive.
pub type Feeder = Box<dyn FnOnce(&AtomicBool) + Send>;

pub struct Rig {
    pub relays: Box<dyn RelayBank>,
    pub level: Box<dyn PulseInput>,
    pub door: Box<dyn InputLine>,
    pub zero_cross: Box<dyn ZeroCross>,
    pub gate: Box<dyn OutputLine>,
    pub feeders: Vec<(&'static str, Feeder)>,
}

impl Rig {
    /// Plant model stepped in real time from the firing delay.
    pub fn simulated(clock: Arc<dyn Clock>, counter: Arc<EdgeCounter>, delay: SharedDelay) -> Self {
        let handle = SimHandle::new(SimulatedWasher::new());
        let runner = PlantRunner::new(handle.clone(), delay, counter, Arc::clone(&clock));
        let plant: Feeder = Box::new(move |stop: &AtomicBool| runner.run(stop));
        info!("Driving simulated washer");

        Self {
            relays: Box::new(handle.relay_bank()),
            level: Box::new(handle.level_input()),
            door: Box::new(handle.door_line()),
            zero_cross: Box::new(SimZeroCross::new(clock)),
            gate: Box::new(handle.gate()),
            feeders: vec![("plant", plant)],
        }
    }

    pub fn board(root: &Path, pins: BoardPins, counter: Arc<EdgeCounter>) -> Result<Self, SysfsError> {
        let board = SysfsBoard::open_at(root, pins)?;
        let mut listener = EdgeListener::new(board.tachometer.listen_rising()?, counter);
        let edges: Feeder = Box::new(move |stop: &AtomicBool| listener.run(stop));

        Ok(Self {
            relays: Box::new(board.relays),
            level: Box::new(board.level),
            door: Box::new(board.door_sensor),
            zero_cross: Box::new(board.zero_cross),
            gate: Box::new(board.gate),
            feeders: vec![("tacho-edges", edges)],
        })
    }
}

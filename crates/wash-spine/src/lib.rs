pub mod bus;
pub mod cells;
pub mod hal;
#[cfg(any(test, feature = "simulation"))]
pub mod hal_sim;
pub mod leveler;
pub mod motor;
pub mod orchestrator;
pub mod program;
pub mod relay;
pub mod retry;
pub mod sensors;
pub mod tachometer;
pub mod timebase;

pub use bus::{Bus, BusError, CellSlot, CellStore, MemoryStore};
pub use cells::{Cell, FaultCode, IDLE_CURSOR};
pub use hal::{EdgeCounter, EdgeSource, InputLine, OutputLine, PulseInput, RelayBank, ZeroCross};
#[cfg(any(test, feature = "simulation"))]
pub use hal_sim::{SimHandle, SimulatedWasher, VirtualClock};
pub use leveler::{LevelerConfig, LevelerOutcome, RpmLeveler};
pub use motor::{DelayLimits, DelayMonitor, SharedDelay, TriacFiring};
pub use orchestrator::{
    CycleError, CycleEvent, CycleObserver, CycleOrchestrator, NullReporter, OrchestratorConfig,
    ProgressReporter, Tick,
};
pub use program::Program;
pub use relay::{RelayCommand, RelayDriver, RelayDriverConfig, RelayLines};
pub use retry::RetryPolicy;
pub use sensors::{SensorConfig, SensorReader};
pub use tachometer::{Tachometer, TachometerConfig};
pub use timebase::{Clock, SystemClock, TimeBase};

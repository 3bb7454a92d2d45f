//! The value bus: named `f32` cells shared between independently scheduled
//! execution units.
//!
//! Contract, in full:
//! - every cell is a fixed-size atomic slot, so a write replaces the whole
//!   value and a read never observes a torn float;
//! - latest value wins: there is no history, no ordering between cells and no
//!   guarantee that a reader sees every intermediate write;
//! - reading or writing a cell that does not exist yet creates it with the
//!   catalogue default first.
//!
//! Consumers that wait on a condition must poll, never trust a single read.

use crate::cells::{self, Cell, FaultCode};
use crate::relay::RelayCommand;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to open cell `{name}`: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to map cell `{name}`: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to unlink cell `{name}`: {source}")]
    Unlink {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// One 32-bit slot. Implementations must replace the value atomically.
pub trait CellSlot: Send + Sync {
    fn load(&self) -> f32;
    fn store(&self, value: f32);
}

/// Backing storage for cells. `open` creates the cell holding `default` when
/// it does not exist and otherwise leaves the persisted value untouched.
pub trait CellStore: Send + Sync {
    fn open(&self, key: &str, default: f32) -> Result<Arc<dyn CellSlot>, BusError>;
    fn unlink(&self, key: &str) -> Result<(), BusError>;
}

#[derive(Debug)]
pub struct AtomicSlot(AtomicU32);

impl AtomicSlot {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }
}

impl CellSlot for AtomicSlot {
    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// In-process store. Every `Bus` built on the same `Arc<MemoryStore>` sees the
/// same cells, which is how tests and the simulator stand in for separate
/// processes.
#[derive(Default)]
pub struct MemoryStore {
    cells: Mutex<HashMap<String, Arc<AtomicSlot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CellStore for MemoryStore {
    fn open(&self, key: &str, default: f32) -> Result<Arc<dyn CellSlot>, BusError> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let slot: Arc<dyn CellSlot> = cells
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicSlot::new(default)))
            .clone();
        Ok(slot)
    }

    fn unlink(&self, key: &str) -> Result<(), BusError> {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Handle onto the bus. Cheap to clone; clones share the slot cache.
#[derive(Clone)]
pub struct Bus {
    store: Arc<dyn CellStore>,
    slots: Arc<Mutex<HashMap<&'static str, Arc<dyn CellSlot>>>>,
}

impl Bus {
    pub fn new(store: Arc<dyn CellStore>) -> Self {
        Self {
            store,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn slot(&self, cell: Cell) -> Result<Arc<dyn CellSlot>, BusError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(cell.key) {
            return Ok(Arc::clone(slot));
        }
        let slot = self.store.open(cell.key, cell.default)?;
        slots.insert(cell.key, Arc::clone(&slot));
        Ok(slot)
    }

    /// Creates the cell with its default if absent.
    pub fn ensure(&self, cell: Cell) -> Result<(), BusError> {
        self.slot(cell).map(|_| ())
    }

    /// Ensures every catalogue cell. Persisted values are kept so that a
    /// restarted controller resumes where it stopped.
    pub fn bootstrap(&self) -> Result<(), BusError> {
        cells::CATALOGUE.iter().try_for_each(|cell| self.ensure(*cell))
    }

    pub fn read(&self, cell: Cell) -> Result<f32, BusError> {
        Ok(self.slot(cell)?.load())
    }

    pub fn write(&self, cell: Cell, value: f32) -> Result<(), BusError> {
        self.slot(cell)?.store(value);
        Ok(())
    }

    pub fn unlink(&self, cell: Cell) -> Result<(), BusError> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cell.key);
        self.store.unlink(cell.key)
    }

    /// Point-in-time read of the whole catalogue. Values are read one by one,
    /// so the result is not a consistent cut across cells.
    pub fn dump(&self) -> Result<Vec<(Cell, f32)>, BusError> {
        cells::CATALOGUE
            .iter()
            .map(|cell| self.read(*cell).map(|value| (*cell, value)))
            .collect()
    }

    pub fn relay_code(&self) -> Result<f32, BusError> {
        self.read(cells::RELAY_COMMAND)
    }

    pub fn send_relay(&self, command: RelayCommand) -> Result<(), BusError> {
        self.write(cells::RELAY_COMMAND, command.code())
    }

    pub fn cursor(&self) -> Result<f32, BusError> {
        self.read(cells::COMMAND_FROM_SERVER)
    }

    pub fn set_cursor(&self, cursor: f32) -> Result<(), BusError> {
        self.write(cells::COMMAND_FROM_SERVER, cursor)
    }

    pub fn program_code(&self) -> Result<f32, BusError> {
        self.read(cells::COMMAND_MODE_FROM_SERVER)
    }

    pub fn set_program_code(&self, code: f32) -> Result<(), BusError> {
        self.write(cells::COMMAND_MODE_FROM_SERVER, code)
    }

    pub fn triac_delay(&self) -> Result<f32, BusError> {
        self.read(cells::TRIAC_DELAY)
    }

    pub fn set_triac_delay(&self, delay_us: f32) -> Result<(), BusError> {
        self.write(cells::TRIAC_DELAY, delay_us)
    }

    pub fn drum_hz(&self) -> Result<f32, BusError> {
        self.read(cells::TACCOSENSOR)
    }

    pub fn publish_drum_hz(&self, hz: f32) -> Result<(), BusError> {
        self.write(cells::TACCOSENSOR, hz)
    }

    pub fn pressure(&self) -> Result<f32, BusError> {
        self.read(cells::PRESSURE)
    }

    pub fn publish_pressure(&self, hz: f32) -> Result<(), BusError> {
        self.write(cells::PRESSURE, hz)
    }

    pub fn water_level(&self) -> Result<f32, BusError> {
        self.read(cells::WATER_LEVEL)
    }

    pub fn publish_water_level(&self, level: f32) -> Result<(), BusError> {
        self.write(cells::WATER_LEVEL, level)
    }

    pub fn door_open(&self) -> Result<bool, BusError> {
        Ok(self.read(cells::DOOR_STATUS)? >= 0.5)
    }

    pub fn publish_door(&self, open: bool) -> Result<(), BusError> {
        self.write(cells::DOOR_STATUS, if open { 1.0 } else { 0.0 })
    }

    pub fn fault(&self) -> Result<FaultCode, BusError> {
        Ok(FaultCode::from_code(self.read(cells::FAULT_CODE)?))
    }

    pub fn raise_fault(&self, fault: FaultCode) -> Result<(), BusError> {
        self.write(cells::FAULT_CODE, fault.code())
    }

    pub fn clear_fault(&self) -> Result<(), BusError> {
        self.raise_fault(FaultCode::None)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self
            .slots
            .lock()
            .map(|slots| slots.len())
            .unwrap_or_default();
        f.debug_struct("Bus").field("cached_cells", &cached).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::{PRESSURE, RELAY_COMMAND, TRIAC_DELAY};

    #[test]
    fn never_written_cell_reads_default() {
        let bus = Bus::in_memory();
        assert_eq!(bus.read(TRIAC_DELAY).unwrap(), 8000.0);
        assert_eq!(bus.read(RELAY_COMMAND).unwrap(), 14.0);
    }

    #[test]
    fn handles_on_one_store_share_cells() {
        let store: Arc<dyn CellStore> = Arc::new(MemoryStore::new());
        let writer = Bus::new(Arc::clone(&store));
        let reader = Bus::new(store);

        writer.publish_pressure(12.5).unwrap();
        assert_eq!(reader.pressure().unwrap(), 12.5);
    }

    #[test]
    fn bootstrap_keeps_persisted_values() {
        let store: Arc<dyn CellStore> = Arc::new(MemoryStore::new());
        Bus::new(Arc::clone(&store)).set_cursor(39.0).unwrap();

        let restarted = Bus::new(store);
        restarted.bootstrap().unwrap();
        assert_eq!(restarted.cursor().unwrap(), 39.0);
    }

    #[test]
    fn unlink_restores_default_on_next_touch() {
        let bus = Bus::in_memory();
        bus.write(PRESSURE, 3.0).unwrap();
        bus.unlink(PRESSURE).unwrap();
        assert_eq!(bus.read(PRESSURE).unwrap(), PRESSURE.default);
    }

    #[test]
    fn door_flag_round_trips() {
        let bus = Bus::in_memory();
        bus.publish_door(true).unwrap();
        assert!(bus.door_open().unwrap());
        bus.publish_door(false).unwrap();
        assert!(!bus.door_open().unwrap());
    }
}

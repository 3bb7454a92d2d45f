use serde::Serialize;

/// A named slot on the value bus.
///
/// Meaning is by naming convention only; the bus enforces nothing about who
/// writes a cell or what its value represents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub key: &'static str,
    pub default: f32,
    pub metric: &'static str,
}

/// Cursor value meaning "no job active".
pub const IDLE_CURSOR: f32 = 1000.0;

pub const RELAY_COMMAND: Cell = Cell {
    key: "relay_command",
    default: 14.0,
    metric: "washer_relay_command",
};

pub const COMMAND_FROM_SERVER: Cell = Cell {
    key: "command_from_server",
    default: IDLE_CURSOR,
    metric: "washer_progress_cursor",
};

pub const COMMAND_MODE_FROM_SERVER: Cell = Cell {
    key: "command_mode_from_server",
    default: IDLE_CURSOR,
    metric: "washer_program_selector",
};

pub const TRIAC_DELAY: Cell = Cell {
    key: "triac_delay",
    default: 8000.0,
    metric: "washer_triac_delay_microseconds",
};

pub const TACCOSENSOR: Cell = Cell {
    key: "taccosensor",
    default: 0.0,
    metric: "washer_drum_frequency_hz",
};

pub const PRESSURE: Cell = Cell {
    key: "Pressure",
    default: 0.0,
    metric: "washer_pressure_frequency_hz",
};

pub const WATER_LEVEL: Cell = Cell {
    key: "Water_Level",
    default: 0.0,
    metric: "washer_water_level",
};

pub const DOOR_STATUS: Cell = Cell {
    key: "Door_Status",
    default: 0.0,
    metric: "washer_door_open",
};

pub const FAULT_CODE: Cell = Cell {
    key: "fault_code",
    default: 0.0,
    metric: "washer_fault_code",
};

/// Every cell the controller knows about, in catalogue order.
pub const CATALOGUE: &[Cell] = &[
    RELAY_COMMAND,
    COMMAND_FROM_SERVER,
    COMMAND_MODE_FROM_SERVER,
    TRIAC_DELAY,
    TACCOSENSOR,
    PRESSURE,
    WATER_LEVEL,
    DOOR_STATUS,
    FAULT_CODE,
];

/// Vocabulary of the `fault_code` cell. Zero means no fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    #[default]
    None,
    SpeedNotReached,
    FillTimeout,
    DoorStuck,
    BusFailure,
    RetriesExhausted,
}

impl FaultCode {
    pub fn code(self) -> f32 {
        match self {
            Self::None => 0.0,
            Self::SpeedNotReached => 1.0,
            Self::FillTimeout => 2.0,
            Self::DoorStuck => 3.0,
            Self::BusFailure => 4.0,
            Self::RetriesExhausted => 5.0,
        }
    }

    /// Unknown codes read back as `None`; the cell is diagnostic only.
    pub fn from_code(code: f32) -> Self {
        [
            Self::SpeedNotReached,
            Self::FillTimeout,
            Self::DoorStuck,
            Self::BusFailure,
            Self::RetriesExhausted,
        ]
        .into_iter()
        .find(|fault| fault.code() == code)
        .unwrap_or(Self::None)
    }
}

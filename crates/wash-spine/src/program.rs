//! Wash program step tables.
//!
//! A program is an ordered list of steps keyed by a cursor threshold. The
//! orchestrator runs the first step whose threshold is at or above the
//! persisted cursor, then writes that step's `next` value, so a restarted
//! controller picks up at the step it was in.

use crate::cells::IDLE_CURSOR;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Program {
    Quick,
    Heavy,
    HeavyExtendedDrain,
}

impl Program {
    pub const ALL: [Program; 3] = [Self::Quick, Self::Heavy, Self::HeavyExtendedDrain];

    pub fn from_code(code: f32) -> Option<Self> {
        Self::ALL.into_iter().find(|program| program.code() == code)
    }

    pub fn code(self) -> f32 {
        match self {
            Self::Quick => 0.0,
            Self::Heavy => 1.0,
            Self::HeavyExtendedDrain => 2.0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Heavy => "heavy",
            Self::HeavyExtendedDrain => "heavy_extended_drain",
        }
    }

    pub fn steps(self) -> &'static [Step] {
        match self {
            Self::Quick => QUICK,
            Self::Heavy => HEAVY,
            Self::HeavyExtendedDrain => HEAVY_EXTENDED_DRAIN,
        }
    }

    /// Step to run for `cursor`, or `None` when no job is active.
    pub fn step_for(self, cursor: f32) -> Option<&'static Step> {
        if cursor.is_nan() || cursor >= IDLE_CURSOR {
            return None;
        }
        self.steps().iter().find(|step| step.threshold >= cursor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub threshold: f32,
    pub actions: &'static [Action],
    pub report: Report,
    pub next: f32,
}

impl Step {
    pub fn is_terminal(&self) -> bool {
        self.next >= IDLE_CURSOR
    }
}

/// What the step tells the remote collaborator once its actions are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Progress(u8),
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Wait(Duration),
    /// Pulse the latch until `Door_Status` reads closed.
    CloseDoor,
    /// Pulse the latch unless `Door_Status` already reads open.
    OpenDoor,
    Drain(Duration),
    /// Fill until the pressure frequency falls to the given value.
    FillToLevel(f32),
    SetDelay(f32),
    Rotate(RotationPattern),
}

/// Alternating forward/reverse drum motion for a fixed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationPattern {
    pub window: Duration,
    pub target_hz: f32,
    pub run: Duration,
    pub brake: Duration,
    /// Delay written once the drum is braked.
    pub rest_delay_us: f32,
    pub after_forward: Option<Chore>,
    pub after_reverse: Option<Chore>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Chore {
    Refill(f32),
    Drain(Duration),
}

const fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

const fn tumble(target_hz: f32, rest_delay_us: f32, refill: Option<f32>) -> RotationPattern {
    RotationPattern {
        window: secs(300),
        target_hz,
        run: secs(15),
        brake: secs(5),
        rest_delay_us,
        after_forward: match refill {
            Some(level) => Some(Chore::Refill(level)),
            None => None,
        },
        after_reverse: None,
    }
}

const SPIN_DRAIN: RotationPattern = RotationPattern {
    window: secs(300),
    target_hz: 800.0,
    run: secs(30),
    brake: secs(14),
    rest_delay_us: 7000.0,
    after_forward: Some(Chore::Drain(secs(10))),
    after_reverse: Some(Chore::Drain(secs(10))),
};

const QUICK_LEVEL: f32 = 13.0;
const HEAVY_LEVEL: f32 = 11.0;

const QUICK_TUMBLE_SOAK: RotationPattern = tumble(30.0, 8000.0, None);
const QUICK_TUMBLE_WASH: RotationPattern = tumble(40.0, 8000.0, None);
const HEAVY_TUMBLE_SOAK: RotationPattern = tumble(30.0, 7000.0, None);
const HEAVY_TUMBLE_WASH: RotationPattern = tumble(40.0, 7000.0, Some(HEAVY_LEVEL));

const fn step(threshold: f32, actions: &'static [Action], report: Report, next: f32) -> Step {
    Step {
        threshold,
        actions,
        report,
        next,
    }
}

const fn progress(next: u8) -> Report {
    Report::Progress(next)
}

pub const QUICK: &[Step] = &[
    step(0.0, &[Action::Wait(secs(10)), Action::CloseDoor], progress(5), 5.0),
    step(5.0, &[Action::Drain(secs(10))], progress(10), 10.0),
    step(10.0, &[Action::FillToLevel(QUICK_LEVEL)], progress(15), 15.0),
    step(
        15.0,
        &[Action::SetDelay(8000.0), Action::Rotate(QUICK_TUMBLE_SOAK)],
        progress(20),
        20.0,
    ),
    step(
        20.0,
        &[Action::FillToLevel(QUICK_LEVEL), Action::Drain(secs(45))],
        progress(39),
        39.0,
    ),
    step(39.0, &[Action::FillToLevel(QUICK_LEVEL)], progress(68), 68.0),
    step(
        68.0,
        &[Action::SetDelay(8000.0), Action::Rotate(QUICK_TUMBLE_WASH)],
        progress(80),
        80.0,
    ),
    step(80.0, &[Action::FillToLevel(QUICK_LEVEL)], progress(90), 90.0),
    step(90.0, &[Action::Drain(secs(45))], progress(99), 99.0),
    step(99.0, &[Action::OpenDoor], Report::Ready, IDLE_CURSOR),
];

pub const HEAVY: &[Step] = &[
    step(0.0, &[Action::Wait(secs(10)), Action::CloseDoor], progress(5), 5.0),
    step(5.0, &[Action::Drain(secs(5))], progress(10), 10.0),
    step(10.0, &[Action::FillToLevel(HEAVY_LEVEL)], progress(15), 15.0),
    step(
        15.0,
        &[Action::SetDelay(7000.0), Action::Rotate(HEAVY_TUMBLE_SOAK)],
        progress(20),
        20.0,
    ),
    step(20.0, &[Action::Drain(secs(25))], progress(39), 39.0),
    step(39.0, &[Action::FillToLevel(HEAVY_LEVEL)], progress(48), 48.0),
    step(
        48.0,
        &[Action::SetDelay(7000.0), Action::Rotate(HEAVY_TUMBLE_WASH)],
        progress(60),
        60.0,
    ),
    step(60.0, &[Action::FillToLevel(HEAVY_LEVEL)], progress(80), 80.0),
    step(80.0, &[Action::Drain(secs(50))], progress(85), 85.0),
    step(
        85.0,
        &[
            Action::SetDelay(6500.0),
            Action::Rotate(SPIN_DRAIN),
            Action::Drain(secs(10)),
            Action::SetDelay(6500.0),
            Action::Rotate(SPIN_DRAIN),
            Action::Drain(secs(10)),
            Action::SetDelay(6500.0),
            Action::Rotate(SPIN_DRAIN),
            Action::Drain(secs(10)),
        ],
        progress(97),
        97.0,
    ),
    step(97.0, &[Action::OpenDoor], Report::Ready, IDLE_CURSOR),
];

pub const HEAVY_EXTENDED_DRAIN: &[Step] = &[
    step(0.0, &[Action::Wait(secs(10)), Action::CloseDoor], progress(5), 5.0),
    step(5.0, &[Action::Drain(secs(5))], progress(10), 10.0),
    step(10.0, &[Action::FillToLevel(HEAVY_LEVEL)], progress(15), 15.0),
    step(
        15.0,
        &[
            Action::SetDelay(7000.0),
            Action::Rotate(HEAVY_TUMBLE_SOAK),
            Action::SetDelay(7000.0),
            Action::Rotate(HEAVY_TUMBLE_SOAK),
        ],
        progress(20),
        20.0,
    ),
    step(
        20.0,
        &[Action::FillToLevel(HEAVY_LEVEL), Action::Drain(secs(25))],
        progress(39),
        39.0,
    ),
    step(39.0, &[Action::FillToLevel(HEAVY_LEVEL)], progress(48), 48.0),
    step(
        48.0,
        &[
            Action::SetDelay(7000.0),
            Action::Rotate(HEAVY_TUMBLE_WASH),
            Action::SetDelay(7000.0),
            Action::Rotate(HEAVY_TUMBLE_WASH),
        ],
        progress(60),
        60.0,
    ),
    step(
        60.0,
        &[
            Action::FillToLevel(HEAVY_LEVEL),
            Action::SetDelay(7000.0),
            Action::Rotate(HEAVY_TUMBLE_WASH),
        ],
        progress(80),
        80.0,
    ),
    step(80.0, &[Action::Drain(secs(35))], progress(90), 90.0),
    step(
        90.0,
        &[
            Action::SetDelay(6500.0),
            Action::Rotate(SPIN_DRAIN),
            Action::Drain(secs(10)),
            Action::SetDelay(6500.0),
            Action::Rotate(SPIN_DRAIN),
            Action::Drain(secs(10)),
            Action::SetDelay(6500.0),
            Action::Rotate(SPIN_DRAIN),
            Action::Drain(secs(10)),
            Action::SetDelay(6500.0),
            Action::Rotate(SPIN_DRAIN),
            Action::Drain(secs(10)),
            Action::SetDelay(6500.0),
            Action::Rotate(SPIN_DRAIN),
            Action::Drain(secs(10)),
        ],
        progress(97),
        97.0,
    ),
    step(97.0, &[Action::OpenDoor], Report::Ready, IDLE_CURSOR),
];

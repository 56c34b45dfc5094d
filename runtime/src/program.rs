//! Compiled program representation.

use crate::schedule::UnitSchedule;

/// Precompiled binary that schedules itself on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WholeProgram {
    pub binary: Vec<u8>,
    pub entry_point: String,
}

impl WholeProgram {
    pub fn new(binary: impl Into<Vec<u8>>, entry_point: impl Into<String>) -> Self {
        Self { binary: binary.into(), entry_point: entry_point.into() }
    }
}

/// What an executable runs: exactly one of a unit schedule or a whole program.
#[derive(Debug, Clone)]
pub enum Program {
    Units(UnitSchedule),
    WholeProgram(WholeProgram),
}

impl From<UnitSchedule> for Program {
    fn from(schedule: UnitSchedule) -> Self {
        Self::Units(schedule)
    }
}

impl From<WholeProgram> for Program {
    fn from(program: WholeProgram) -> Self {
        Self::WholeProgram(program)
    }
}

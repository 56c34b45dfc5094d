//! Allocation table.
//!
//! An allocation is a region of device memory the compiled program refers to by
//! index. The table is produced by buffer assignment and never changes afterwards;
//! it says how big each region is and where its memory comes from, but owns none.

use std::fmt;
use std::ops::Index;

use derive_more::Display;
use enumset::{EnumSet, EnumSetType};

use crate::error::{InvalidProgramSnafu, Result};
use crate::shape::ShapeIndex;

/// Stable index of an allocation inside its table.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{_0}")]
pub struct AllocationIndex(pub usize);

#[derive(Debug, EnumSetType)]
pub enum AllocationFlag {
    /// Backed by a caller-supplied argument.
    EntryParameter,
    /// May be part of the program's result.
    MaybeLiveOut,
    /// Backed by a module global holding compile-time data.
    Constant,
    /// Scratch memory local to one execution.
    Temporary,
    /// Lives in per-thread storage on the device; never bound to memory.
    ThreadLocal,
}

/// Where an entry-parameter allocation lives inside the caller's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSlot {
    pub number: usize,
    pub index: ShapeIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    index: AllocationIndex,
    size: usize,
    flags: EnumSet<AllocationFlag>,
    color: u32,
    parameter: Option<ParameterSlot>,
}

impl Allocation {
    /// Allocation backed by `parameter` of the entry computation.
    pub fn parameter(index: usize, size: usize, parameter: usize) -> Self {
        Self::parameter_at(index, size, parameter, ShapeIndex::root())
    }

    /// Allocation backed by the buffer at `at` inside tuple-shaped `parameter`.
    pub fn parameter_at(index: usize, size: usize, parameter: usize, at: ShapeIndex) -> Self {
        Self {
            index: AllocationIndex(index),
            size,
            flags: AllocationFlag::EntryParameter.into(),
            color: 0,
            parameter: Some(ParameterSlot { number: parameter, index: at }),
        }
    }

    pub fn constant(index: usize, size: usize) -> Self {
        Self::with_flags(index, size, AllocationFlag::Constant.into())
    }

    pub fn temporary(index: usize, size: usize) -> Self {
        Self::with_flags(index, size, AllocationFlag::Temporary.into())
    }

    /// Result buffer computed by the program.
    pub fn output(index: usize, size: usize) -> Self {
        Self::with_flags(index, size, AllocationFlag::MaybeLiveOut.into())
    }

    pub fn thread_local(index: usize, size: usize) -> Self {
        Self::with_flags(index, size, AllocationFlag::ThreadLocal.into())
    }

    fn with_flags(index: usize, size: usize, flags: EnumSet<AllocationFlag>) -> Self {
        Self { index: AllocationIndex(index), size, flags, color: 0, parameter: None }
    }

    /// Mark the allocation as possibly live out of the program.
    pub fn live_out(mut self) -> Self {
        self.flags |= AllocationFlag::MaybeLiveOut;
        self
    }

    pub fn with_color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    pub fn index(&self) -> AllocationIndex {
        self.index
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> EnumSet<AllocationFlag> {
        self.flags
    }

    pub fn color(&self) -> u32 {
        self.color
    }

    pub fn parameter_slot(&self) -> Option<&ParameterSlot> {
        self.parameter.as_ref()
    }

    pub fn is_entry_parameter(&self) -> bool {
        self.flags.contains(AllocationFlag::EntryParameter)
    }

    pub fn is_constant(&self) -> bool {
        self.flags.contains(AllocationFlag::Constant)
    }

    pub fn is_thread_local(&self) -> bool {
        self.flags.contains(AllocationFlag::ThreadLocal)
    }

    pub fn maybe_live_out(&self) -> bool {
        self.flags.contains(AllocationFlag::MaybeLiveOut)
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation {} ({} bytes, {:?}", self.index, self.size, self.flags)?;
        if let Some(slot) = &self.parameter {
            write!(f, ", parameter {}{}", slot.number, slot.index)?;
        }
        write!(f, ")")
    }
}

/// Immutable, index-ordered list of allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationTable {
    allocations: Vec<Allocation>,
}

impl AllocationTable {
    /// Build a table; allocation `i` must carry index `i`.
    pub fn new(allocations: Vec<Allocation>) -> Result<Self> {
        for (position, allocation) in allocations.iter().enumerate() {
            if allocation.index.0 != position {
                return InvalidProgramSnafu {
                    reason: format!("allocation at position {position} declares index {}", allocation.index),
                }
                .fail();
            }
            if allocation.is_entry_parameter() && allocation.is_constant() {
                return InvalidProgramSnafu { reason: format!("{allocation} is both a parameter and a constant") }
                    .fail();
            }
        }
        Ok(Self { allocations })
    }

    pub fn count(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn get(&self, index: AllocationIndex) -> Option<&Allocation> {
        self.allocations.get(index.0)
    }

    pub fn contains(&self, index: AllocationIndex) -> bool {
        index.0 < self.allocations.len()
    }

    /// Size in bytes of allocation `index`. Panics on an unknown index.
    pub fn size(&self, index: AllocationIndex) -> usize {
        self[index].size
    }

    /// Flags of allocation `index`. Panics on an unknown index.
    pub fn flags(&self, index: AllocationIndex) -> EnumSet<AllocationFlag> {
        self[index].flags
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Allocation> {
        self.allocations.iter()
    }

    pub fn as_slice(&self) -> &[Allocation] {
        &self.allocations
    }

    /// Number of entry parameters the program expects (highest parameter number + 1).
    pub fn parameter_count(&self) -> usize {
        self.allocations.iter().filter_map(|a| a.parameter.as_ref()).map(|slot| slot.number + 1).max().unwrap_or(0)
    }

    /// Allocation backed by `parameter` at shape index `at`, if any.
    pub fn find_parameter(&self, parameter: usize, at: &ShapeIndex) -> Option<&Allocation> {
        self.allocations
            .iter()
            .find(|a| a.parameter.as_ref().is_some_and(|slot| slot.number == parameter && &slot.index == at))
    }

    /// Total bytes of constant allocations.
    pub fn constant_bytes(&self) -> usize {
        self.allocations.iter().filter(|a| a.is_constant()).map(Allocation::size).sum()
    }
}

impl Index<AllocationIndex> for AllocationTable {
    type Output = Allocation;

    fn index(&self, index: AllocationIndex) -> &Self::Output {
        &self.allocations[index.0]
    }
}

impl<'a> IntoIterator for &'a AllocationTable {
    type Item = &'a Allocation;
    type IntoIter = std::slice::Iter<'a, Allocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.allocations.iter()
    }
}

//! Per-execution buffer binding.
//!
//! Binding turns the static allocation table into device memory: every allocation
//! index gets a concrete region, either supplied by the caller, taken from a module
//! global, or allocated for this execution. The binder works in three phases so a
//! failure never leaves a partial binding behind:
//!
//! 1. plan: decide where each allocation comes from, with no side effects;
//! 2. allocate: obtain fresh memory, releasing all of it if any request fails;
//! 3. commit: enqueue copy-protection copies and move donated inputs in.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use kiln_device::{Allocator, BufferOptions, DeviceMemory, OwnedMemory, Stream};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, trace, warn};

use crate::allocation::{Allocation, AllocationIndex, AllocationTable};
use crate::error::{
    AliasingContractSnafu, AllocationSnafu, DeviceSnafu, InvalidArgumentSnafu, MissingConstantSnafu, Result,
};
use crate::input::{ExecutionInput, InputBuffer};
use crate::output::{AliasKind, OutputBuffer, OutputInfo};
use crate::shape::ShapeIndex;
use crate::unit::BufferSlice;

/// Memory bound to one allocation for the duration of an execution.
#[derive(Debug)]
pub enum BoundBuffer {
    /// Caller-owned input or module global.
    Borrowed(DeviceMemory),
    /// Allocated by this execution.
    Owned(OwnedMemory),
    /// Entry parameter whose buffer the caller donated.
    Donated { memory: DeviceMemory, parameter: usize, index: ShapeIndex },
    /// Output computed in place of a donated parameter buffer.
    Aliased { memory: DeviceMemory, parameter: usize, index: ShapeIndex },
    /// Thread-local or zero-sized allocation.
    Null,
}

impl BoundBuffer {
    pub fn memory(&self) -> DeviceMemory {
        match self {
            Self::Borrowed(memory) => *memory,
            Self::Owned(owned) => owned.memory(),
            Self::Donated { memory, .. } | Self::Aliased { memory, .. } => *memory,
            Self::Null => DeviceMemory::null(),
        }
    }
}

/// Complete allocation-to-memory mapping for one execution.
///
/// Dropping the binding frees every buffer it still owns: temporaries, outputs
/// not handed to the caller, and donated inputs that were not reused.
pub struct BufferBinding {
    slots: Vec<BoundBuffer>,
    donated: BTreeMap<(usize, ShapeIndex), OwnedMemory>,
}

impl BufferBinding {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn buffer(&self, index: AllocationIndex) -> Option<&BoundBuffer> {
        self.slots.get(index.0)
    }

    /// Memory bound to allocation `index`; null for unknown indices.
    pub fn address(&self, index: AllocationIndex) -> DeviceMemory {
        self.slots.get(index.0).map_or(DeviceMemory::null(), BoundBuffer::memory)
    }

    /// Every bound region in allocation order.
    pub fn addresses(&self) -> Vec<DeviceMemory> {
        self.slots.iter().map(BoundBuffer::memory).collect()
    }

    /// Region addressed by `slice`.
    pub fn resolve(&self, slice: &BufferSlice) -> kiln_device::Result<DeviceMemory> {
        let base = self.slots.get(slice.allocation.0).map(BoundBuffer::memory).ok_or_else(|| {
            kiln_device::error::InvalidAllocationSnafu {
                size: slice.size,
                reason: format!("allocation {} is not bound", slice.allocation),
            }
            .build()
        })?;
        // Null regions stay null; their slices are never dereferenced.
        if base.is_null() {
            return Ok(DeviceMemory::null());
        }
        base.slice(slice.offset, slice.size)
    }

    /// Hand the buffer of allocation `index` to the caller.
    ///
    /// Returns the output buffer and whether it was taken over from a donated
    /// input, or `None` if the allocation is unknown or its donated buffer has
    /// already been handed out.
    pub fn take_output(&mut self, index: AllocationIndex) -> Option<(OutputBuffer, bool)> {
        let slot = self.slots.get_mut(index.0)?;
        match std::mem::replace(slot, BoundBuffer::Null) {
            BoundBuffer::Owned(owned) => {
                *slot = BoundBuffer::Borrowed(owned.memory());
                Some((OutputBuffer::Owned(owned), false))
            }
            other => {
                let taken = match &other {
                    BoundBuffer::Borrowed(memory) => Some((OutputBuffer::Borrowed(*memory), false)),
                    BoundBuffer::Null | BoundBuffer::Owned(_) => {
                        Some((OutputBuffer::Borrowed(DeviceMemory::null()), false))
                    }
                    BoundBuffer::Donated { parameter, index, .. } | BoundBuffer::Aliased { parameter, index, .. } => self
                        .donated
                        .remove(&(*parameter, index.clone()))
                        .map(|owned| (OutputBuffer::Donated(owned), true)),
                };
                *slot = other;
                taken
            }
        }
    }

    /// Number of donated inputs still owned by the binding.
    pub fn donated_count(&self) -> usize {
        self.donated.len()
    }
}

impl fmt::Debug for BufferBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferBinding").field("slots", &self.slots).field("donated", &self.donated.len()).finish()
    }
}

#[derive(Debug)]
enum Plan {
    Null,
    Borrowed(DeviceMemory),
    Donated { memory: DeviceMemory, parameter: usize, index: ShapeIndex },
    Aliased { memory: DeviceMemory, parameter: usize, index: ShapeIndex },
    Allocate { size: usize, color: u32 },
    CopyProtect { source: DeviceMemory, size: usize, color: u32 },
}

/// Plan with its memory obtained, waiting to be committed.
enum Staged {
    Bound(BoundBuffer),
    CopyProtect { owned: OwnedMemory, source: DeviceMemory, size: usize },
}

/// Binds an allocation table to memory for one execution.
#[derive(Debug, Clone, Copy)]
pub struct BufferBinder<'a> {
    allocations: &'a AllocationTable,
    outputs: &'a BTreeMap<ShapeIndex, OutputInfo>,
    globals: &'a HashMap<AllocationIndex, DeviceMemory>,
}

impl<'a> BufferBinder<'a> {
    pub fn new(
        allocations: &'a AllocationTable,
        outputs: &'a BTreeMap<ShapeIndex, OutputInfo>,
        globals: &'a HashMap<AllocationIndex, DeviceMemory>,
    ) -> Self {
        Self { allocations, outputs, globals }
    }

    /// Produce a binding for every allocation, or an error with nothing allocated
    /// and the caller's inputs untouched.
    pub fn bind(
        &self,
        inputs: &mut [ExecutionInput],
        allocator: &Arc<dyn Allocator>,
        device_ordinal: usize,
        stream: &dyn Stream,
    ) -> Result<BufferBinding> {
        let plans = self.plan(inputs)?;
        let staged = self.allocate(plans, allocator, device_ordinal)?;
        self.commit(staged, inputs, stream)
    }

    fn plan(&self, inputs: &[ExecutionInput]) -> Result<Vec<Plan>> {
        let parameter_count = self.allocations.parameter_count();
        ensure!(
            inputs.len() >= parameter_count,
            InvalidArgumentSnafu {
                reason: format!("program expects {parameter_count} parameters, got {}", inputs.len())
            }
        );

        let aliases: HashMap<AllocationIndex, &OutputInfo> =
            self.outputs.values().filter(|info| info.alias.is_some()).map(|info| (info.allocation_index, info)).collect();

        self.allocations
            .iter()
            .map(|allocation| match aliases.get(&allocation.index()) {
                Some(info) => self.plan_alias(allocation, info, inputs),
                None => self.plan_allocation(allocation, inputs),
            })
            .collect()
    }

    fn plan_allocation(&self, allocation: &Allocation, inputs: &[ExecutionInput]) -> Result<Plan> {
        let index = allocation.index();
        if allocation.is_thread_local() {
            return Ok(Plan::Null);
        }
        if allocation.is_constant() {
            let global = self.globals.get(&index).copied().context(MissingConstantSnafu { allocation: index })?;
            return Ok(Plan::Borrowed(global));
        }
        if let Some(slot) = allocation.parameter_slot() {
            let buffer = input_buffer(inputs, slot.number, &slot.index)?;
            let memory = buffer.memory();
            ensure!(
                memory.size() == allocation.size(),
                InvalidArgumentSnafu {
                    reason: format!(
                        "parameter {}{} has {} bytes, {allocation} expects {}",
                        slot.number,
                        slot.index,
                        memory.size(),
                        allocation.size()
                    )
                }
            );
            return Ok(match buffer {
                InputBuffer::Borrowed(memory) => Plan::Borrowed(*memory),
                InputBuffer::Donated(_) => Plan::Donated { memory, parameter: slot.number, index: slot.index.clone() },
            });
        }
        if allocation.size() == 0 {
            return Ok(Plan::Null);
        }
        Ok(Plan::Allocate { size: allocation.size(), color: allocation.color() })
    }

    fn plan_alias(&self, allocation: &Allocation, info: &OutputInfo, inputs: &[ExecutionInput]) -> Result<Plan> {
        let Some(alias) = &info.alias else {
            return self.plan_allocation(allocation, inputs);
        };
        let buffer = input_buffer(inputs, alias.parameter, &alias.parameter_index)?;
        let memory = buffer.memory();
        ensure!(
            memory.size() >= allocation.size(),
            InvalidArgumentSnafu {
                reason: format!(
                    "parameter {}{} has {} bytes, aliased {allocation} needs {}",
                    alias.parameter,
                    alias.parameter_index,
                    memory.size(),
                    allocation.size()
                )
            }
        );

        let is_own_parameter = allocation
            .parameter_slot()
            .is_some_and(|slot| slot.number == alias.parameter && slot.index == alias.parameter_index);

        if buffer.is_donated() {
            let (parameter, index) = (alias.parameter, alias.parameter_index.clone());
            return Ok(if is_own_parameter {
                Plan::Donated { memory, parameter, index }
            } else {
                Plan::Aliased { memory, parameter, index }
            });
        }

        ensure!(
            alias.kind != AliasKind::MustAlias,
            AliasingContractSnafu { allocation: allocation.index(), parameter: alias.parameter }
        );
        if info.passthrough {
            return Ok(Plan::Borrowed(memory));
        }
        Ok(Plan::CopyProtect { source: memory, size: allocation.size(), color: allocation.color() })
    }

    fn allocate(
        &self,
        plans: Vec<Plan>,
        allocator: &Arc<dyn Allocator>,
        device_ordinal: usize,
    ) -> Result<Vec<Staged>> {
        // Regions collected so far are returned to the allocator if a later one fails.
        let mut staged = Vec::with_capacity(plans.len());
        for (position, plan) in plans.into_iter().enumerate() {
            let allocate = |size: usize, color: u32| {
                let owned = OwnedMemory::allocate(allocator, device_ordinal, size, &BufferOptions::with_color(color))
                    .context(AllocationSnafu { allocation: AllocationIndex(position), size })?;
                trace!(buffer.index = position, buffer.size = size, buffer.color = color, "Allocated buffer");
                Ok::<_, crate::error::Error>(owned)
            };
            staged.push(match plan {
                Plan::Null => Staged::Bound(BoundBuffer::Null),
                Plan::Borrowed(memory) => Staged::Bound(BoundBuffer::Borrowed(memory)),
                Plan::Donated { memory, parameter, index } => {
                    Staged::Bound(BoundBuffer::Donated { memory, parameter, index })
                }
                Plan::Aliased { memory, parameter, index } => {
                    Staged::Bound(BoundBuffer::Aliased { memory, parameter, index })
                }
                Plan::Allocate { size, color } => Staged::Bound(BoundBuffer::Owned(allocate(size, color)?)),
                Plan::CopyProtect { source, size, color } => {
                    Staged::CopyProtect { owned: allocate(size, color)?, source, size }
                }
            });
        }
        Ok(staged)
    }

    fn commit(&self, staged: Vec<Staged>, inputs: &mut [ExecutionInput], stream: &dyn Stream) -> Result<BufferBinding> {
        let mut slots = Vec::with_capacity(staged.len());
        let mut to_take = BTreeSet::new();
        let mut copies = 0;

        for entry in staged {
            let slot = match entry {
                Staged::Bound(slot) => slot,
                Staged::CopyProtect { owned, source, size } => {
                    if let Err(error) = stream.memcpy_device_to_device(owned.memory(), source, size) {
                        // Copies already enqueued still target memory that is about to be freed.
                        if let Err(drain) = stream.block_until_done() {
                            warn!(stream = %stream.id(), error = %drain, "Stream failed while draining copies");
                        }
                        return Err(error).context(DeviceSnafu);
                    }
                    copies += 1;
                    BoundBuffer::Owned(owned)
                }
            };
            if let BoundBuffer::Donated { parameter, index, .. } | BoundBuffer::Aliased { parameter, index, .. } = &slot
            {
                to_take.insert((*parameter, index.clone()));
            }
            slots.push(slot);
        }

        let mut donated = BTreeMap::new();
        for (parameter, index) in to_take {
            if let Some(InputBuffer::Donated(owned)) = inputs[parameter].take(&index) {
                donated.insert((parameter, index), owned);
            }
        }

        let allocated_bytes: usize = slots
            .iter()
            .filter_map(|slot| match slot {
                BoundBuffer::Owned(owned) => Some(owned.memory().size()),
                _ => None,
            })
            .sum();
        debug!(
            buffers = slots.len(),
            buffers.allocated_bytes = allocated_bytes,
            buffers.donated = donated.len(),
            buffers.copy_protected = copies,
            "Bound buffers"
        );
        Ok(BufferBinding { slots, donated })
    }
}

fn input_buffer<'i>(inputs: &'i [ExecutionInput], parameter: usize, index: &ShapeIndex) -> Result<&'i InputBuffer> {
    inputs.get(parameter).and_then(|input| input.buffer(index)).context(InvalidArgumentSnafu {
        reason: format!("missing buffer for parameter {parameter} at {index}"),
    })
}

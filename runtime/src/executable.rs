//! Compiled executable and its entry point.
//!
//! [`Executable::execute`] runs one invocation end to end:
//!
//! 1. check the device runs code compiled for this executable's [`GpuVersion`];
//! 2. resolve constants on the device (once per device);
//! 3. bind every allocation to memory;
//! 4. issue the program, blocking when asked to or when the allocator cannot
//!    defer frees past queued work;
//! 5. hand the output buffers to the caller.
//!
//! Whatever the binding still owns afterwards (temporaries, unused donated inputs)
//! is freed when it goes out of scope, on success and on failure alike.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bon::bon;
use kiln_device::{Allocator, GpuVersion};
use parking_lot::Mutex;
use snafu::{OptionExt, ensure};
use tracing::debug;

use crate::allocation::AllocationTable;
use crate::binding::{BufferBinder, BufferBinding};
use crate::constants::{ConstantInfo, ConstantResolver, ModuleImage};
use crate::context::RunContext;
use crate::error::{DeviceCompatibilitySnafu, InvalidProgramSnafu, Result};
use crate::input::ExecutionInput;
use crate::output::{ExecutionOutput, OutputInfo, OutputTree};
use crate::profile::ExecutionProfile;
use crate::program::Program;
use crate::runner::ProgramRunner;
use crate::shape::{Shape, ShapeIndex};

/// Records kept only for debugging.
#[derive(Debug, Clone, Default)]
pub struct DebugRecords {
    pub buffer_assignment: Option<String>,
    pub buffer_assignment_verbose: Option<String>,
    pub program: Option<String>,
}

/// A compiled program ready to run on devices of one [`GpuVersion`].
pub struct Executable {
    gpu_version: GpuVersion,
    program: Program,
    outputs: BTreeMap<ShapeIndex, OutputInfo>,
    output_shape: Shape,
    allocations: AllocationTable,
    resolver: ConstantResolver,
    debug: DebugRecords,
    ir_module_string: Mutex<Option<String>>,
}

#[bon]
impl Executable {
    /// Build an executable, validating every cross reference.
    #[builder]
    pub fn builder(
        #[builder(default, into)] text: String,
        #[builder(default, into)] binary: Vec<u8>,
        gpu_version: GpuVersion,
        #[builder(into)] program: Program,
        #[builder(default)] constants: Vec<ConstantInfo>,
        outputs: BTreeMap<ShapeIndex, OutputInfo>,
        #[builder(default, into)] module_name: String,
        output_shape: Shape,
        allocations: AllocationTable,
        #[builder(default)] debug: DebugRecords,
    ) -> Result<Self> {
        validate_outputs(&outputs, &output_shape, &allocations)?;
        validate_constants(&constants, &allocations)?;
        validate_program(&program, &allocations)?;

        let image = ModuleImage { name: module_name, text, binary, constants };
        Ok(Self {
            gpu_version,
            program,
            outputs,
            output_shape,
            allocations,
            resolver: ConstantResolver::new(image),
            debug,
            ir_module_string: Mutex::new(None),
        })
    }

    /// Run one invocation.
    ///
    /// `inputs` holds one entry per parameter. Donated buffers are consumed:
    /// they come back as outputs or are freed once the execution is done. On
    /// error no output is produced and the state of device memory written by the
    /// program is unspecified.
    pub fn execute(
        &self,
        context: &RunContext,
        mut inputs: Vec<ExecutionInput>,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<ExecutionOutput> {
        let started = Instant::now();
        let actual = context.device.version();
        ensure!(actual == self.gpu_version, DeviceCompatibilitySnafu { expected: self.gpu_version, actual });

        debug!(
            module = %self.module_name(),
            run.id = context.run_id,
            device = %context.device.id(),
            stream = %context.stream.id(),
            "Executing"
        );

        let resolved = self.resolver.resolve(&context.device, &*context.stream)?;
        let mut binding = BufferBinder::new(&self.allocations, &self.outputs, resolved.globals()).bind(
            &mut inputs,
            allocator,
            context.device.ordinal(),
            &*context.stream,
        )?;

        let block = context.options.block_host_until_done || !allocator.allows_asynchronous_deallocation();
        let summary = ProgramRunner::new(context, resolved.handle(), &binding).run(&self.program, block)?;
        let output = self.assemble(&mut binding)?;

        if let Some(profiler) = &context.profiler {
            profiler.on_execution_finished(&ExecutionProfile {
                module_name: self.module_name().to_string(),
                run_id: context.run_id,
                wall_time: started.elapsed(),
                units_launched: summary.units_launched,
                streams_used: summary.streams_used,
                blocked: block,
            });
        }
        debug!(
            module = %self.module_name(),
            run.id = context.run_id,
            outputs = output.result().len(),
            outputs.aliased = output.aliased_indices().len(),
            binding.donated_released = binding.donated_count(),
            "Execution issued"
        );
        Ok(output)
    }

    fn assemble(&self, binding: &mut BufferBinding) -> Result<ExecutionOutput> {
        let mut result = OutputTree::new(self.output_shape.clone());
        let mut aliased = Vec::new();
        for (index, info) in &self.outputs {
            let (buffer, was_donated) = binding.take_output(info.allocation_index).context(InvalidProgramSnafu {
                reason: format!("output {index} reuses a donated buffer that was already returned"),
            })?;
            if was_donated {
                aliased.push(index.clone());
            }
            result.insert(index.clone(), buffer);
        }
        Ok(ExecutionOutput::new(result, aliased))
    }

    /// Bytes of device code plus constant data, or `None` when the executable only
    /// carries text that is compiled at load time.
    pub fn size_of_generated_code(&self) -> Option<usize> {
        let image = self.resolver.image();
        if image.binary.is_empty() && !image.text.is_empty() {
            return None;
        }
        Some(image.binary.len() + self.allocations.constant_bytes())
    }

    pub fn text(&self) -> &str {
        &self.resolver.image().text
    }

    pub fn binary(&self) -> &[u8] {
        &self.resolver.image().binary
    }

    pub fn gpu_version(&self) -> GpuVersion {
        self.gpu_version
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn allocations(&self) -> &AllocationTable {
        &self.allocations
    }

    pub fn constants(&self) -> &[ConstantInfo] {
        &self.resolver.image().constants
    }

    pub fn outputs(&self) -> &BTreeMap<ShapeIndex, OutputInfo> {
        &self.outputs
    }

    pub fn module_name(&self) -> &str {
        &self.resolver.image().name
    }

    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    pub fn debug_records(&self) -> &DebugRecords {
        &self.debug
    }

    pub fn ir_module_string(&self) -> Option<String> {
        self.ir_module_string.lock().clone()
    }

    pub fn set_ir_module_string(&self, ir: impl Into<String>) {
        *self.ir_module_string.lock() = Some(ir.into());
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executable")
            .field("module_name", &self.module_name())
            .field("gpu_version", &self.gpu_version)
            .field("program", &self.program)
            .field("allocations", &self.allocations.count())
            .field("outputs", &self.outputs)
            .field("resolver", &self.resolver)
            .finish()
    }
}

fn validate_outputs(
    outputs: &BTreeMap<ShapeIndex, OutputInfo>,
    shape: &Shape,
    allocations: &AllocationTable,
) -> Result<()> {
    let leaves: HashSet<ShapeIndex> = shape.leaf_indices().into_iter().collect();
    for leaf in &leaves {
        ensure!(outputs.contains_key(leaf), InvalidProgramSnafu { reason: format!("output {leaf} has no descriptor") });
    }

    let mut seen_allocations = HashSet::new();
    let mut claimed_parameters = HashSet::new();
    for (index, info) in outputs {
        ensure!(
            leaves.contains(index),
            InvalidProgramSnafu { reason: format!("output descriptor {index} is not a leaf of {shape}") }
        );
        ensure!(
            allocations.contains(info.allocation_index),
            InvalidProgramSnafu {
                reason: format!("output {index} refers to unknown allocation {}", info.allocation_index)
            }
        );
        ensure!(
            seen_allocations.insert(info.allocation_index),
            InvalidProgramSnafu {
                reason: format!("allocation {} is returned by more than one output", info.allocation_index)
            }
        );

        // A parameter buffer is claimed by an output that returns its allocation
        // directly or aliases it. A donated buffer can be handed out only once.
        let own = allocations
            .get(info.allocation_index)
            .and_then(|allocation| allocation.parameter_slot())
            .map(|slot| (slot.number, slot.index.clone()));
        let aliased = info.alias.as_ref().map(|alias| (alias.parameter, alias.parameter_index.clone()));
        let mut claims: Vec<_> = own.into_iter().chain(aliased).collect();
        claims.dedup();
        for (parameter, at) in claims {
            ensure!(
                claimed_parameters.insert((parameter, at.clone())),
                InvalidProgramSnafu { reason: format!("parameter {parameter}{at} is returned by more than one output") }
            );
        }
    }
    Ok(())
}

fn validate_constants(constants: &[ConstantInfo], allocations: &AllocationTable) -> Result<()> {
    let mut bound = HashSet::new();
    for constant in constants {
        let Some(index) = constant.allocation_index else { continue };
        let allocation = allocations.get(index).context(InvalidProgramSnafu {
            reason: format!("constant '{}' refers to unknown allocation {index}", constant.symbol_name),
        })?;
        ensure!(
            allocation.is_constant(),
            InvalidProgramSnafu {
                reason: format!("constant '{}' is bound to non-constant {allocation}", constant.symbol_name)
            }
        );
        ensure!(
            bound.insert(index),
            InvalidProgramSnafu { reason: format!("allocation {index} is bound to more than one constant") }
        );
    }

    for allocation in allocations.iter().filter(|a| a.is_constant()) {
        ensure!(
            bound.contains(&allocation.index()),
            InvalidProgramSnafu { reason: format!("{allocation} has no constant entry") }
        );
    }
    Ok(())
}

fn validate_program(program: &Program, allocations: &AllocationTable) -> Result<()> {
    match program {
        Program::Units(schedule) => {
            for scheduled in schedule.units() {
                for slice in scheduled.unit.buffers() {
                    let allocation = allocations.get(slice.allocation).context(InvalidProgramSnafu {
                        reason: format!(
                            "unit '{}' uses unknown allocation {}",
                            scheduled.unit.name(),
                            slice.allocation
                        ),
                    })?;
                    ensure!(
                        slice.offset.checked_add(slice.size).is_some_and(|end| end <= allocation.size()),
                        InvalidProgramSnafu {
                            reason: format!("unit '{}' slice {slice} exceeds {allocation}", scheduled.unit.name())
                        }
                    );
                }
            }
        }
        Program::WholeProgram(whole) => {
            ensure!(
                !whole.binary.is_empty() && !whole.entry_point.is_empty(),
                InvalidProgramSnafu { reason: "whole program needs a binary and an entry point" }
            );
        }
    }
    Ok(())
}

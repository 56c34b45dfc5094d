//! Error types for program execution.

use kiln_device::{DeviceId, GpuVersion};
use snafu::Snafu;

use crate::allocation::AllocationIndex;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while building or executing an [`Executable`](crate::Executable).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The program was compiled for a different device capability.
    #[snafu(display("device capability mismatch: program compiled for {expected}, stream device is {actual}"))]
    DeviceCompatibility { expected: GpuVersion, actual: GpuVersion },

    /// Loading the module or resolving a constant global failed.
    #[snafu(display("failed to resolve constant '{symbol}' on {device}: {source}"))]
    ConstantResolution { device: DeviceId, symbol: String, source: kiln_device::Error },

    /// Loading the module failed before any symbol could be resolved.
    #[snafu(display("failed to load module '{module}' on {device}: {source}"))]
    ModuleLoad { device: DeviceId, module: String, source: kiln_device::Error },

    /// A constant allocation has no resolved address.
    #[snafu(display("constant allocation {allocation} has no resolved global"))]
    MissingConstant { allocation: AllocationIndex },

    /// The allocator could not provide memory for an allocation.
    #[snafu(display("failed to allocate {size} bytes for allocation {allocation}: {source}"))]
    Allocation { allocation: AllocationIndex, size: usize, source: kiln_device::Error },

    /// An input configured as must-alias was not donated.
    #[snafu(display(
        "allocation {allocation} must alias parameter {parameter}, but the parameter buffer was not donated"
    ))]
    AliasingContract { allocation: AllocationIndex, parameter: usize },

    /// A unit or whole-program launch was rejected by the device.
    #[snafu(display("launch of '{unit}' on stream {stream} failed: {source}"))]
    Launch { unit: String, stream: usize, source: kiln_device::Error },

    /// Caller-supplied inputs do not match the program's parameters.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// The compiled program references something that does not exist.
    #[snafu(display("invalid program: {reason}"))]
    InvalidProgram { reason: String },

    /// Device error outside a launch (stream creation, synchronization).
    #[snafu(display("device error: {source}"))]
    Device { source: kiln_device::Error },
}

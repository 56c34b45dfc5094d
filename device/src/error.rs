use snafu::Snafu;

use crate::device::DeviceId;
use crate::stream::StreamId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The allocator could not satisfy a request.
    #[snafu(display("out of memory on device {ordinal}: requested {requested} bytes, {available} available"))]
    OutOfMemory { ordinal: usize, requested: usize, available: usize },

    #[snafu(display("invalid allocation request of {size} bytes: {reason}"))]
    InvalidAllocation { size: usize, reason: String },

    /// Address does not belong to any live allocation.
    #[snafu(display("unknown device address {address:#x} (+{size} bytes)"))]
    UnknownAddress { address: u64, size: usize },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Invalid device specification.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    #[snafu(display("failed to load module on {device}: {reason}"))]
    ModuleLoad { device: DeviceId, reason: String },

    #[snafu(display("module {module} is not loaded on {device}"))]
    ModuleNotLoaded { device: DeviceId, module: u64 },

    /// A kernel was requested from an executable that loaded no module.
    #[snafu(display("kernel '{kernel}' requested on {device}, but no module is loaded"))]
    NoModule { device: DeviceId, kernel: String },

    #[snafu(display("symbol '{name}' not found in module {module}"))]
    SymbolNotFound { name: String, module: u64 },

    #[snafu(display("kernel '{name}' not found in module {module}"))]
    KernelNotFound { name: String, module: u64 },

    /// The stream refused to enqueue a launch.
    #[snafu(display("launch of '{kernel}' rejected: {reason}"))]
    LaunchRejected { kernel: String, reason: String },

    /// Device work failed after it was enqueued.
    #[snafu(display("stream {stream} faulted: {reason}"))]
    StreamFault { stream: StreamId, reason: String },

    #[snafu(display("stream {stream} is shut down"))]
    StreamClosed { stream: StreamId },

    #[snafu(display("runtime error: {message}"))]
    Runtime { message: String },
}

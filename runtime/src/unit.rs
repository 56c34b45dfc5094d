//! Execution units: the steps of a scheduled program.
//!
//! A unit enqueues device work on the stream it is given and returns without
//! waiting for it. The compiler decides which units exist; the runtime ships the
//! three every program needs.

use std::fmt;

use kiln_device::{Device, DeviceMemory, LaunchDimensions, ModuleHandle, Stream};
use snafu::{OptionExt, ensure};
use tracing::trace;

use crate::allocation::AllocationIndex;
use crate::binding::BufferBinding;

/// Byte range `[offset, offset + size)` of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    pub allocation: AllocationIndex,
    pub offset: usize,
    pub size: usize,
}

impl BufferSlice {
    pub fn new(allocation: usize, offset: usize, size: usize) -> Self {
        Self { allocation: AllocationIndex(allocation), offset, size }
    }

    /// The first `size` bytes of `allocation`.
    pub fn whole(allocation: usize, size: usize) -> Self {
        Self::new(allocation, 0, size)
    }
}

impl fmt::Display for BufferSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{}]", self.allocation, self.offset, self.offset + self.size)
    }
}

/// Everything a unit needs to enqueue its work.
#[derive(Clone, Copy)]
pub struct UnitParams<'a> {
    pub device: &'a dyn Device,
    /// Module loaded for the executable on `device`.
    pub module: Option<ModuleHandle>,
    pub binding: &'a BufferBinding,
    pub stream: &'a dyn Stream,
}

impl UnitParams<'_> {
    pub fn resolve(&self, slice: &BufferSlice) -> kiln_device::Result<DeviceMemory> {
        self.binding.resolve(slice)
    }
}

pub trait ExecutionUnit: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Slices the unit reads or writes. Used to validate the program.
    fn buffers(&self) -> Vec<BufferSlice>;

    /// Enqueue the unit's work on `params.stream`.
    fn execute(&self, params: &UnitParams<'_>) -> kiln_device::Result<()>;
}

/// Launch of a kernel exported by the executable's module.
#[derive(Debug, Clone)]
pub struct KernelUnit {
    name: String,
    kernel: String,
    args: Vec<BufferSlice>,
    dims: LaunchDimensions,
}

impl KernelUnit {
    pub fn new(
        name: impl Into<String>,
        kernel: impl Into<String>,
        args: Vec<BufferSlice>,
        dims: LaunchDimensions,
    ) -> Self {
        Self { name: name.into(), kernel: kernel.into(), args, dims }
    }

    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    pub fn dims(&self) -> LaunchDimensions {
        self.dims
    }
}

impl ExecutionUnit for KernelUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffers(&self) -> Vec<BufferSlice> {
        self.args.clone()
    }

    fn execute(&self, params: &UnitParams<'_>) -> kiln_device::Result<()> {
        let module = params
            .module
            .context(kiln_device::error::NoModuleSnafu { device: params.device.id(), kernel: &self.kernel })?;
        let kernel = params.device.get_kernel(module, &self.kernel)?;
        let args = self.args.iter().map(|slice| params.resolve(slice)).collect::<kiln_device::Result<Vec<_>>>()?;

        trace!(unit = %self.name, kernel = %kernel, dims = %self.dims, args = args.len(), "Launching kernel");
        params.stream.launch(&kernel, &args, self.dims)
    }
}

/// Device-to-device copy between two slices of equal size.
#[derive(Debug, Clone)]
pub struct MemcpyUnit {
    name: String,
    source: BufferSlice,
    destination: BufferSlice,
}

impl MemcpyUnit {
    pub fn new(name: impl Into<String>, source: BufferSlice, destination: BufferSlice) -> Self {
        Self { name: name.into(), source, destination }
    }
}

impl ExecutionUnit for MemcpyUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffers(&self) -> Vec<BufferSlice> {
        vec![self.source, self.destination]
    }

    fn execute(&self, params: &UnitParams<'_>) -> kiln_device::Result<()> {
        ensure!(
            self.source.size == self.destination.size,
            kiln_device::error::SizeMismatchSnafu { expected: self.destination.size, actual: self.source.size }
        );
        let source = params.resolve(&self.source)?;
        let destination = params.resolve(&self.destination)?;
        if self.source.size == 0 {
            return Ok(());
        }
        params.stream.memcpy_device_to_device(destination, source, self.source.size)
    }
}

/// Zero-fill of a slice.
#[derive(Debug, Clone)]
pub struct MemsetUnit {
    name: String,
    destination: BufferSlice,
}

impl MemsetUnit {
    pub fn new(name: impl Into<String>, destination: BufferSlice) -> Self {
        Self { name: name.into(), destination }
    }
}

impl ExecutionUnit for MemsetUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn buffers(&self) -> Vec<BufferSlice> {
        vec![self.destination]
    }

    fn execute(&self, params: &UnitParams<'_>) -> kiln_device::Result<()> {
        let destination = params.resolve(&self.destination)?;
        if self.destination.size == 0 {
            return Ok(());
        }
        params.stream.memzero(destination, self.destination.size)
    }
}

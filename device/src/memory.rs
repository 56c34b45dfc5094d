//! Device memory handles.
//!
//! [`DeviceMemory`] is a plain `(address, size)` pair with no ownership: copying it
//! never frees or duplicates anything. [`OwnedMemory`] ties a region to the allocator
//! that produced it and returns the region on drop.

use std::fmt;
use std::sync::Arc;

use snafu::ensure;

use crate::allocator::{Allocator, BufferOptions};
use crate::error::{InvalidAllocationSnafu, Result};

/// Untyped view of a region of device memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceMemory {
    address: u64,
    size: usize,
}

impl DeviceMemory {
    pub const fn new(address: u64, size: usize) -> Self {
        Self { address, size }
    }

    /// The empty region used for zero-sized and thread-local allocations.
    pub const fn null() -> Self {
        Self { address: 0, size: 0 }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// Sub-region `[offset, offset + size)` of this region.
    pub fn slice(&self, offset: usize, size: usize) -> Result<Self> {
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= self.size),
            InvalidAllocationSnafu {
                size,
                reason: format!("slice at offset {offset} exceeds region of {} bytes", self.size)
            }
        );
        Ok(Self { address: self.address + offset as u64, size })
    }

    /// Whether the two regions share at least one byte.
    pub fn overlaps(&self, other: &DeviceMemory) -> bool {
        let end = self.address + self.size as u64;
        let other_end = other.address + other.size as u64;
        self.size > 0 && other.size > 0 && self.address < other_end && other.address < end
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceMemory({:#x}, {} bytes)", self.address, self.size)
    }
}

/// Device memory owned through the allocator that produced it.
///
/// Dropping the handle returns the region to its allocator. [`OwnedMemory::release`]
/// gives up ownership without freeing.
pub struct OwnedMemory {
    memory: DeviceMemory,
    ordinal: usize,
    allocator: Option<Arc<dyn Allocator>>,
}

impl OwnedMemory {
    /// Allocate `size` bytes on device `ordinal`.
    pub fn allocate(
        allocator: &Arc<dyn Allocator>,
        ordinal: usize,
        size: usize,
        options: &BufferOptions,
    ) -> Result<Self> {
        let memory = allocator.allocate(ordinal, size, options)?;
        Ok(Self { memory, ordinal, allocator: Some(Arc::clone(allocator)) })
    }

    /// Take ownership of a region previously produced by `allocator`.
    pub fn from_raw(memory: DeviceMemory, ordinal: usize, allocator: Arc<dyn Allocator>) -> Self {
        Self { memory, ordinal, allocator: Some(allocator) }
    }

    pub fn memory(&self) -> DeviceMemory {
        self.memory
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn allocator(&self) -> Option<&Arc<dyn Allocator>> {
        self.allocator.as_ref()
    }

    /// Give up ownership; the caller becomes responsible for freeing the region.
    pub fn release(mut self) -> DeviceMemory {
        self.allocator = None;
        self.memory
    }
}

impl Drop for OwnedMemory {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take()
            && !self.memory.is_null()
            && let Err(error) = allocator.deallocate(self.ordinal, self.memory)
        {
            tracing::warn!(
                memory.address = self.memory.address(),
                memory.size = self.memory.size(),
                allocator = allocator.name(),
                %error,
                "Failed to return device memory"
            );
        }
    }
}

impl fmt::Debug for OwnedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedMemory")
            .field("memory", &self.memory)
            .field("ordinal", &self.ordinal)
            .field("allocator", &self.allocator.as_ref().map(|a| a.name().to_string()))
            .finish()
    }
}

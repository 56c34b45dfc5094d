use crate::error::Result;
use crate::memory::DeviceMemory;

/// Options for a single allocation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferOptions {
    /// Memory space the region must come from (0 = default device memory).
    pub color: u32,
}

impl BufferOptions {
    pub fn with_color(color: u32) -> Self {
        Self { color }
    }
}

/// Device memory allocator shared by concurrent executions.
pub trait Allocator: Send + Sync + std::fmt::Debug {
    /// Allocate `size` bytes on device `ordinal`. Zero-sized requests return
    /// [`DeviceMemory::null`].
    fn allocate(&self, ordinal: usize, size: usize, options: &BufferOptions) -> Result<DeviceMemory>;

    fn deallocate(&self, ordinal: usize, memory: DeviceMemory) -> Result<()>;

    /// Whether a region may be freed while device work using it is still queued.
    ///
    /// Stream-ordered allocators return `true`; executors must otherwise block
    /// until the device is done before dropping temporaries.
    fn allows_asynchronous_deallocation(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

//! Device command streams.
//!
//! Every method except [`Stream::block_until_done`] only enqueues work: it returns
//! once the operation is accepted, not once it has run. Operations on one stream
//! execute in enqueue order; operations on different streams are ordered only by
//! events.

use std::fmt;

use derive_more::Display;

use crate::device::KernelHandle;
use crate::error::Result;
use crate::memory::DeviceMemory;
use crate::sync::Event;

/// Process-unique stream identifier.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{_0}")]
pub struct StreamId(pub u64);

/// Grid and block sizes for a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDimensions {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

impl LaunchDimensions {
    pub fn new_1d(blocks: u32, threads_per_block: u32) -> Self {
        Self { grid: [blocks, 1, 1], block: [threads_per_block, 1, 1] }
    }

    pub fn new_3d(grid: [u32; 3], block: [u32; 3]) -> Self {
        Self { grid, block }
    }

    pub fn thread_count(&self) -> u64 {
        self.grid.iter().chain(&self.block).map(|&d| d as u64).product()
    }
}

impl Default for LaunchDimensions {
    fn default() -> Self {
        Self::new_1d(1, 1)
    }
}

impl fmt::Display for LaunchDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [gx, gy, gz] = self.grid;
        let [bx, by, bz] = self.block;
        write!(f, "grid=({gx},{gy},{gz}) block=({bx},{by},{bz})")
    }
}

/// An in-order queue of device work.
pub trait Stream: Send + Sync + fmt::Debug {
    fn id(&self) -> StreamId;

    fn device_ordinal(&self) -> usize;

    /// Enqueue a kernel launch. Errors mean the launch was rejected and nothing
    /// was enqueued.
    fn launch(&self, kernel: &KernelHandle, args: &[DeviceMemory], dims: LaunchDimensions) -> Result<()>;

    /// Enqueue a precompiled whole program that schedules itself internally.
    fn execute_program(&self, binary: &[u8], entry_point: &str, args: &[DeviceMemory]) -> Result<()>;

    fn memcpy_host_to_device(&self, dst: DeviceMemory, src: &[u8]) -> Result<()>;

    fn memcpy_device_to_device(&self, dst: DeviceMemory, src: DeviceMemory, size: usize) -> Result<()>;

    fn memzero(&self, dst: DeviceMemory, size: usize) -> Result<()>;

    /// Enqueue an event that completes after all previously enqueued work.
    fn record_event(&self) -> Result<Event>;

    /// Make subsequently enqueued work wait for `event`.
    fn wait_event(&self, event: &Event) -> Result<()>;

    /// Make subsequently enqueued work wait for everything currently queued on `other`.
    fn wait_stream(&self, other: &dyn Stream) -> Result<()> {
        let event = other.record_event()?;
        self.wait_event(&event)
    }

    /// Block the host until all enqueued work has finished, reporting any fault
    /// that occurred while running it.
    fn block_until_done(&self) -> Result<()>;
}

//! Device-facing abstractions for the kiln executor.
//!
//! The runtime never talks to a driver directly. It programs against the traits in
//! this crate:
//!
//! - [`Device`]: module loading, symbol and kernel lookup, stream creation
//! - [`Stream`]: asynchronous launches, copies and cross-stream events
//! - [`Allocator`]: device memory allocation shared by concurrent executions
//!
//! Memory is described by [`DeviceMemory`] (a borrowed `(address, size)` pair) and
//! [`OwnedMemory`] (a region that returns itself to its allocator on drop).

pub mod allocator;
pub mod device;
pub mod error;
pub mod memory;
pub mod pool;
pub mod stream;
pub mod sync;


pub use allocator::{Allocator, BufferOptions};
pub use device::{Device, DeviceId, GpuVersion, KernelHandle, ModuleHandle, ModuleSpec, Platform};
pub use error::{Error, Result};
pub use memory::{DeviceMemory, OwnedMemory};
pub use pool::{PooledStream, StreamPool};
pub use stream::{LaunchDimensions, Stream, StreamId};
pub use sync::{CpuTimelineSignal, Event, TimelineSignal};

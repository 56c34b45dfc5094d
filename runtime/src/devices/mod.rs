//! Device implementations shipped with the runtime.

pub mod host;
pub mod host_stream;

pub use host::{HostAllocator, HostDevice, HostKernel, HostMemory, HostPlatform, KernelContext};
pub use host_stream::HostStream;

//! Device abstraction.
//!
//! A [`Device`] is one physical (or emulated) accelerator. It loads compiled modules,
//! resolves the globals and kernels they export, and creates command streams.

use std::fmt;
use std::sync::Arc;

use derive_more::Display;

use crate::error::Result;
use crate::memory::DeviceMemory;
use crate::stream::Stream;

/// Driver family of a device.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    #[display("HOST")]
    Host,
    #[display("CUDA")]
    Cuda,
    #[display("ROCM")]
    Rocm,
}

/// Identity of a device within the process.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{platform}:{ordinal}")]
pub struct DeviceId {
    pub platform: Platform,
    pub ordinal: usize,
}

impl DeviceId {
    pub const fn new(platform: Platform, ordinal: usize) -> Self {
        Self { platform, ordinal }
    }
}

/// Capability a program was compiled for.
///
/// Compiled code only runs on a device reporting exactly the same version.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVersion {
    /// CUDA compute capability.
    #[display("sm_{major}{minor}")]
    Cuda { major: u32, minor: u32 },
    /// AMDGPU ISA version, e.g. `gfx908` is 908.
    #[display("gfx{isa_version}")]
    Rocm { isa_version: u32 },
    /// Host emulation with a revision number.
    #[display("host-v{revision}")]
    Host { revision: u32 },
}

/// Code to load onto a device.
///
/// Drivers prefer `binary` and fall back to compiling `text` when it is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleSpec<'a> {
    pub text: &'a str,
    pub binary: &'a [u8],
}

impl<'a> ModuleSpec<'a> {
    pub fn new(text: &'a str, binary: &'a [u8]) -> Self {
        Self { text, binary }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.binary.is_empty()
    }
}

/// Loaded module handle, valid on the device that returned it.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("module#{_0}")]
pub struct ModuleHandle(pub u64);

/// Kernel entry point inside a loaded module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelHandle {
    pub module: ModuleHandle,
    pub name: Arc<str>,
}

impl KernelHandle {
    pub fn new(module: ModuleHandle, name: impl Into<Arc<str>>) -> Self {
        Self { module, name: name.into() }
    }
}

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

pub trait Device: Send + Sync + fmt::Debug {
    fn id(&self) -> DeviceId;

    fn version(&self) -> GpuVersion;

    fn ordinal(&self) -> usize {
        self.id().ordinal
    }

    fn load_module(&self, spec: &ModuleSpec<'_>) -> Result<ModuleHandle>;

    /// Unload a module. Globals resolved from it become invalid.
    fn unload_module(&self, module: ModuleHandle) -> Result<()>;

    /// Address of the global `name` exported by `module`.
    fn get_symbol(&self, module: ModuleHandle, name: &str) -> Result<DeviceMemory>;

    fn get_kernel(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle>;

    fn create_stream(&self) -> Result<Arc<dyn Stream>>;
}

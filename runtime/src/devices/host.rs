//! Host platform: an in-process device backed by ordinary memory.
//!
//! Device addresses are synthetic. Memory lives in a shared arena keyed by base
//! address, so a [`DeviceMemory`] handed out here is only meaningful to the
//! platform that produced it. Kernels are Rust closures registered by name; a
//! module declares which of them it exports and which globals it defines.
//!
//! # Module format
//!
//! Module text (or a UTF-8 binary, which takes precedence) holds one directive
//! per line; `#` starts a comment:
//!
//! ```text
//! .global <symbol> <bytes>   # zero-initialized global of <bytes> bytes
//! .entry <kernel>            # kernel exported by the module
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bon::bon;
use kiln_device::error::{
    KernelNotFoundSnafu, ModuleLoadSnafu, ModuleNotLoadedSnafu, OutOfMemorySnafu, SymbolNotFoundSnafu,
    UnknownAddressSnafu,
};
use kiln_device::{
    Allocator, BufferOptions, Device, DeviceId, DeviceMemory, GpuVersion, KernelHandle, LaunchDimensions,
    ModuleHandle, ModuleSpec, Platform, Stream,
};
use parking_lot::Mutex;
use snafu::{OptionExt, ensure};
use tracing::{debug, trace};

use super::host_stream::HostStream;

const BASE_ADDRESS: u64 = 0x1000_0000;
const ALIGNMENT: u64 = 256;

/// Device code run by the host platform: a kernel or a whole program.
pub type HostKernel = Arc<dyn Fn(&KernelContext<'_>) -> kiln_device::Result<()> + Send + Sync>;

#[derive(Debug, Default)]
struct Arena {
    regions: BTreeMap<u64, Vec<u8>>,
    next: u64,
    used: usize,
}

impl Arena {
    /// Base address and backing bytes of the region containing `memory`.
    fn region_mut(&mut self, memory: DeviceMemory) -> kiln_device::Result<(u64, &mut Vec<u8>)> {
        let address = memory.address();
        let (&base, bytes) = self
            .regions
            .range_mut(..=address)
            .next_back()
            .context(UnknownAddressSnafu { address, size: memory.size() })?;
        ensure!(
            address - base + memory.size() as u64 <= bytes.len() as u64,
            UnknownAddressSnafu { address, size: memory.size() }
        );
        Ok((base, bytes))
    }
}

/// Synthetic device address space shared by every device of a platform.
#[derive(Debug)]
pub struct HostMemory {
    arena: Mutex<Arena>,
    capacity: Option<usize>,
}

impl HostMemory {
    pub fn new(capacity: Option<usize>) -> Self {
        Self { arena: Mutex::new(Arena { next: BASE_ADDRESS, ..Arena::default() }), capacity }
    }

    /// Allocate `size` zeroed bytes. Zero-sized requests return the null region.
    pub fn allocate(&self, ordinal: usize, size: usize) -> kiln_device::Result<DeviceMemory> {
        if size == 0 {
            return Ok(DeviceMemory::null());
        }
        let mut arena = self.arena.lock();
        if let Some(capacity) = self.capacity {
            let available = capacity.saturating_sub(arena.used);
            ensure!(size <= available, OutOfMemorySnafu { ordinal, requested: size, available });
        }

        let address = arena.next;
        arena.next += (size as u64).div_ceil(ALIGNMENT) * ALIGNMENT;
        arena.used += size;
        arena.regions.insert(address, vec![0; size]);
        Ok(DeviceMemory::new(address, size))
    }

    pub fn free(&self, memory: DeviceMemory) -> kiln_device::Result<()> {
        let mut arena = self.arena.lock();
        let bytes = arena
            .regions
            .remove(&memory.address())
            .context(UnknownAddressSnafu { address: memory.address(), size: memory.size() })?;
        arena.used -= bytes.len();
        Ok(())
    }

    pub fn read(&self, memory: DeviceMemory) -> kiln_device::Result<Vec<u8>> {
        let mut arena = self.arena.lock();
        let (base, bytes) = arena.region_mut(memory)?;
        let start = (memory.address() - base) as usize;
        Ok(bytes[start..start + memory.size()].to_vec())
    }

    /// Write `data` at the start of `memory`.
    pub fn write(&self, memory: DeviceMemory, data: &[u8]) -> kiln_device::Result<()> {
        ensure!(
            data.len() <= memory.size(),
            kiln_device::error::SizeMismatchSnafu { expected: memory.size(), actual: data.len() }
        );
        let mut arena = self.arena.lock();
        let (base, bytes) = arena.region_mut(memory)?;
        let start = (memory.address() - base) as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn copy(&self, destination: DeviceMemory, source: DeviceMemory, size: usize) -> kiln_device::Result<()> {
        let data = self.read(DeviceMemory::new(source.address(), size))?;
        self.write(DeviceMemory::new(destination.address(), size), &data)
    }

    pub fn zero(&self, memory: DeviceMemory, size: usize) -> kiln_device::Result<()> {
        self.write(DeviceMemory::new(memory.address(), size), &vec![0; size])
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.arena.lock().used
    }

    pub fn live_regions(&self) -> usize {
        self.arena.lock().regions.len()
    }
}

/// Arguments of a running host kernel.
pub struct KernelContext<'a> {
    memory: &'a HostMemory,
    args: &'a [DeviceMemory],
    dims: LaunchDimensions,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(memory: &'a HostMemory, args: &'a [DeviceMemory], dims: LaunchDimensions) -> Self {
        Self { memory, args, dims }
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> kiln_device::Result<DeviceMemory> {
        self.args.get(index).copied().context(kiln_device::error::RuntimeSnafu {
            message: format!("kernel argument {index} out of range ({} arguments)", self.args.len()),
        })
    }

    pub fn dims(&self) -> LaunchDimensions {
        self.dims
    }

    pub fn read(&self, index: usize) -> kiln_device::Result<Vec<u8>> {
        self.memory.read(self.arg(index)?)
    }

    pub fn write(&self, index: usize, data: &[u8]) -> kiln_device::Result<()> {
        self.memory.write(self.arg(index)?, data)
    }
}

impl fmt::Debug for KernelContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelContext").field("args", &self.args).field("dims", &self.dims).finish()
    }
}

/// State shared by a platform, its devices and their streams.
pub(crate) struct Shared {
    pub(crate) memory: Arc<HostMemory>,
    kernels: Mutex<HashMap<String, HostKernel>>,
    programs: Mutex<HashMap<String, HostKernel>>,
    revision: u32,
}

impl Shared {
    pub(crate) fn kernel(&self, name: &str) -> Option<HostKernel> {
        self.kernels.lock().get(name).cloned()
    }

    pub(crate) fn program(&self, entry_point: &str) -> Option<HostKernel> {
        self.programs.lock().get(entry_point).cloned()
    }
}

/// Factory for host devices sharing one address space and kernel registry.
///
/// Each ordinal maps to a single [`HostDevice`], so module handles cached per
/// [`DeviceId`] stay valid on every handle the platform gives out.
#[derive(Clone)]
pub struct HostPlatform {
    shared: Arc<Shared>,
    devices: Arc<Mutex<HashMap<usize, Arc<HostDevice>>>>,
}

#[bon]
impl HostPlatform {
    #[builder]
    pub fn builder(memory_limit: Option<usize>, #[builder(default = 1)] revision: u32) -> Self {
        let shared = Shared {
            memory: Arc::new(HostMemory::new(memory_limit)),
            kernels: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            revision,
        };
        Self { shared: Arc::new(shared), devices: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Platform configured from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `KILN_HOST_MEMORY_LIMIT` - Capacity of the address space in bytes (default: unlimited)
    pub fn from_env() -> Self {
        let memory_limit = std::env::var("KILN_HOST_MEMORY_LIMIT").ok().and_then(|s| s.parse().ok());
        Self::builder().maybe_memory_limit(memory_limit).build()
    }

    pub fn version(&self) -> GpuVersion {
        GpuVersion::Host { revision: self.shared.revision }
    }

    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.shared.memory
    }

    /// Register a kernel that modules can export with `.entry <name>`.
    pub fn register_kernel<F>(&self, name: impl Into<String>, kernel: F)
    where
        F: Fn(&KernelContext<'_>) -> kiln_device::Result<()> + Send + Sync + 'static,
    {
        self.shared.kernels.lock().insert(name.into(), Arc::new(kernel));
    }

    /// Register a whole program runnable through [`Stream::execute_program`].
    pub fn register_program<F>(&self, entry_point: impl Into<String>, program: F)
    where
        F: Fn(&KernelContext<'_>) -> kiln_device::Result<()> + Send + Sync + 'static,
    {
        self.shared.programs.lock().insert(entry_point.into(), Arc::new(program));
    }

    pub fn device(&self, ordinal: usize) -> Arc<HostDevice> {
        let mut devices = self.devices.lock();
        let device = devices.entry(ordinal).or_insert_with(|| {
            Arc::new(HostDevice {
                id: DeviceId::new(Platform::Host, ordinal),
                shared: Arc::clone(&self.shared),
                modules: Mutex::new(HashMap::new()),
                next_module: AtomicU64::new(1),
                loads: AtomicU64::new(0),
            })
        });
        Arc::clone(device)
    }

    pub fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::new(HostAllocator { memory: Arc::clone(&self.shared.memory) })
    }
}

impl fmt::Debug for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPlatform")
            .field("revision", &self.shared.revision)
            .field("memory_used", &self.shared.memory.used())
            .field("kernels", &self.shared.kernels.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Allocator over a platform's [`HostMemory`].
#[derive(Debug)]
pub struct HostAllocator {
    memory: Arc<HostMemory>,
}

impl Allocator for HostAllocator {
    fn allocate(&self, ordinal: usize, size: usize, _options: &BufferOptions) -> kiln_device::Result<DeviceMemory> {
        // One memory space, always zeroed; colors are not distinguished.
        self.memory.allocate(ordinal, size)
    }

    fn deallocate(&self, _ordinal: usize, memory: DeviceMemory) -> kiln_device::Result<()> {
        self.memory.free(memory)
    }

    fn name(&self) -> &str {
        "host"
    }
}

#[derive(Debug, Default)]
struct LoadedModule {
    globals: HashMap<String, DeviceMemory>,
    entries: HashSet<String>,
}

/// One host device.
pub struct HostDevice {
    id: DeviceId,
    shared: Arc<Shared>,
    modules: Mutex<HashMap<ModuleHandle, LoadedModule>>,
    next_module: AtomicU64,
    loads: AtomicU64,
}

impl HostDevice {
    /// Number of successful module loads so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn loaded_modules(&self) -> usize {
        self.modules.lock().len()
    }

    fn parse_module(&self, source: &str) -> kiln_device::Result<LoadedModule> {
        let mut module = LoadedModule::default();
        let result = self.parse_into(source, &mut module);
        if result.is_err() {
            self.free_globals(&module);
        }
        result.map(|()| module)
    }

    fn parse_into(&self, source: &str, module: &mut LoadedModule) -> kiln_device::Result<()> {
        let fail = |line: usize, reason: String| {
            ModuleLoadSnafu { device: self.id, reason: format!("line {line}: {reason}") }.fail()
        };

        for (number, raw) in source.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                [".global", symbol, bytes] => {
                    let Ok(size) = bytes.parse::<usize>() else {
                        return fail(number + 1, format!("invalid size '{bytes}' for global '{symbol}'"));
                    };
                    if module.globals.contains_key(*symbol) {
                        return fail(number + 1, format!("duplicate global '{symbol}'"));
                    }
                    let memory = self.shared.memory.allocate(self.id.ordinal, size)?;
                    module.globals.insert(symbol.to_string(), memory);
                }
                [".entry", kernel] => {
                    if self.shared.kernel(kernel).is_none() {
                        return fail(number + 1, format!("kernel '{kernel}' is not registered"));
                    }
                    module.entries.insert(kernel.to_string());
                }
                _ => return fail(number + 1, format!("unrecognized directive '{line}'")),
            }
        }
        Ok(())
    }

    fn free_globals(&self, module: &LoadedModule) {
        for memory in module.globals.values().filter(|memory| !memory.is_null()) {
            if let Err(error) = self.shared.memory.free(*memory) {
                tracing::warn!(device = %self.id, %error, "Failed to free module global");
            }
        }
    }
}

impl Device for HostDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn version(&self) -> GpuVersion {
        GpuVersion::Host { revision: self.shared.revision }
    }

    fn load_module(&self, spec: &ModuleSpec<'_>) -> kiln_device::Result<ModuleHandle> {
        let source = if spec.binary.is_empty() {
            spec.text
        } else {
            std::str::from_utf8(spec.binary).map_err(|error| {
                ModuleLoadSnafu { device: self.id, reason: format!("binary is not UTF-8: {error}") }.build()
            })?
        };
        ensure!(!source.trim().is_empty(), ModuleLoadSnafu { device: self.id, reason: "empty module" });

        let module = self.parse_module(source)?;
        let handle = ModuleHandle(self.next_module.fetch_add(1, Ordering::Relaxed));
        debug!(
            device = %self.id,
            module = %handle,
            module.globals = module.globals.len(),
            module.entries = module.entries.len(),
            "Loaded module"
        );
        self.modules.lock().insert(handle, module);
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn unload_module(&self, module: ModuleHandle) -> kiln_device::Result<()> {
        let loaded =
            self.modules.lock().remove(&module).context(ModuleNotLoadedSnafu { device: self.id, module: module.0 })?;
        self.free_globals(&loaded);
        trace!(device = %self.id, module = %module, "Unloaded module");
        Ok(())
    }

    fn get_symbol(&self, module: ModuleHandle, name: &str) -> kiln_device::Result<DeviceMemory> {
        let modules = self.modules.lock();
        let loaded = modules.get(&module).context(ModuleNotLoadedSnafu { device: self.id, module: module.0 })?;
        loaded.globals.get(name).copied().context(SymbolNotFoundSnafu { name, module: module.0 })
    }

    fn get_kernel(&self, module: ModuleHandle, name: &str) -> kiln_device::Result<KernelHandle> {
        let modules = self.modules.lock();
        let loaded = modules.get(&module).context(ModuleNotLoadedSnafu { device: self.id, module: module.0 })?;
        ensure!(loaded.entries.contains(name), KernelNotFoundSnafu { name, module: module.0 });
        Ok(KernelHandle::new(module, name))
    }

    fn create_stream(&self) -> kiln_device::Result<Arc<dyn Stream>> {
        Ok(Arc::new(HostStream::spawn(Arc::clone(&self.shared), self.id.ordinal)?))
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let modules = std::mem::take(self.modules.get_mut());
        for module in modules.values() {
            self.free_globals(module);
        }
    }
}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDevice")
            .field("id", &self.id)
            .field("modules", &self.modules.lock().len())
            .field("loads", &self.load_count())
            .finish()
    }
}

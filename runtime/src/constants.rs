//! Per-device constant resolution.
//!
//! Compiled programs keep their compile-time data in module globals. Before the
//! first execution on a device the module is loaded there, every global is looked
//! up and initialized, and the resulting addresses are cached for the lifetime of
//! the executable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kiln_device::{Device, DeviceId, DeviceMemory, ModuleHandle, ModuleSpec, Stream};
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::allocation::AllocationIndex;
use crate::error::{ConstantResolutionSnafu, ModuleLoadSnafu, Result};

/// A module global that must hold `content` before the program runs.
#[derive(Clone, PartialEq, Eq)]
pub struct ConstantInfo {
    pub symbol_name: String,
    /// Initial bytes; empty means the global is resolved but left as loaded.
    pub content: Vec<u8>,
    /// Allocation that reads the global, if any. Globals only device code refers
    /// to have none.
    pub allocation_index: Option<AllocationIndex>,
}

impl ConstantInfo {
    pub fn new(symbol_name: impl Into<String>, content: impl Into<Vec<u8>>, allocation_index: Option<usize>) -> Self {
        Self {
            symbol_name: symbol_name.into(),
            content: content.into(),
            allocation_index: allocation_index.map(AllocationIndex),
        }
    }
}

impl fmt::Debug for ConstantInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantInfo")
            .field("symbol_name", &self.symbol_name)
            .field("content_len", &self.content.len())
            .field("allocation_index", &self.allocation_index)
            .finish()
    }
}

/// Code and constant data loaded onto each device.
#[derive(Debug, Clone, Default)]
pub struct ModuleImage {
    pub name: String,
    pub text: String,
    pub binary: Vec<u8>,
    pub constants: Vec<ConstantInfo>,
}

impl ModuleImage {
    fn spec(&self) -> ModuleSpec<'_> {
        ModuleSpec::new(&self.text, &self.binary)
    }
}

/// Module loaded on one device together with its constant addresses.
///
/// Unloads the module when dropped.
pub struct ResolvedModule {
    device: Arc<dyn Device>,
    handle: Option<ModuleHandle>,
    globals: HashMap<AllocationIndex, DeviceMemory>,
}

impl ResolvedModule {
    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    /// Loaded module, `None` when the executable carries no code.
    pub fn handle(&self) -> Option<ModuleHandle> {
        self.handle
    }

    /// Device address backing constant allocation `index`.
    pub fn global(&self, index: AllocationIndex) -> Option<DeviceMemory> {
        self.globals.get(&index).copied()
    }

    pub fn globals(&self) -> &HashMap<AllocationIndex, DeviceMemory> {
        &self.globals
    }
}

impl Drop for ResolvedModule {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(error) = self.device.unload_module(handle)
        {
            warn!(device = %self.device.id(), module = %handle, %error, "Failed to unload module");
        }
    }
}

impl fmt::Debug for ResolvedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedModule")
            .field("device", &self.device.id())
            .field("handle", &self.handle)
            .field("globals", &self.globals)
            .finish()
    }
}

type Slot = Arc<Mutex<Option<Arc<ResolvedModule>>>>;

/// Lazily loads a [`ModuleImage`] once per device.
///
/// The device map lock is only held to find the device's slot; loading happens
/// under the slot lock, so different devices resolve concurrently while callers
/// for the same device wait for the first one.
pub struct ConstantResolver {
    image: ModuleImage,
    slots: Mutex<HashMap<DeviceId, Slot>>,
}

impl ConstantResolver {
    pub fn new(image: ModuleImage) -> Self {
        Self { image, slots: Mutex::new(HashMap::new()) }
    }

    pub fn image(&self) -> &ModuleImage {
        &self.image
    }

    /// Load the module on `device` if needed and return its constant addresses.
    ///
    /// Initial contents are copied through `stream`, which is blocked on before
    /// the result is published. A failure leaves nothing cached.
    pub fn resolve(&self, device: &Arc<dyn Device>, stream: &dyn Stream) -> Result<Arc<ResolvedModule>> {
        let id = device.id();
        let slot = Arc::clone(self.slots.lock().entry(id).or_default());

        let mut guard = slot.lock();
        if let Some(resolved) = guard.as_ref() {
            return Ok(Arc::clone(resolved));
        }

        let resolved = Arc::new(self.load(device, stream)?);
        *guard = Some(Arc::clone(&resolved));
        Ok(resolved)
    }

    fn load(&self, device: &Arc<dyn Device>, stream: &dyn Stream) -> Result<ResolvedModule> {
        let id = device.id();
        let spec = self.image.spec();

        if spec.is_empty() {
            if let Some(constant) = self.image.constants.first() {
                let source = kiln_device::error::ModuleLoadSnafu {
                    device: id,
                    reason: "executable has constants but neither text nor binary",
                }
                .build();
                return Err(source).context(ConstantResolutionSnafu { device: id, symbol: &constant.symbol_name });
            }
            return Ok(ResolvedModule { device: Arc::clone(device), handle: None, globals: HashMap::new() });
        }

        let handle = device.load_module(&spec).context(ModuleLoadSnafu { device: id, module: &self.image.name })?;
        // Owning the handle from here on unloads it if any constant fails.
        let mut resolved = ResolvedModule { device: Arc::clone(device), handle: Some(handle), globals: HashMap::new() };

        for constant in &self.image.constants {
            let symbol = &constant.symbol_name;
            let global =
                device.get_symbol(handle, symbol).context(ConstantResolutionSnafu { device: id, symbol })?;
            if !constant.content.is_empty() {
                stream
                    .memcpy_host_to_device(global, &constant.content)
                    .context(ConstantResolutionSnafu { device: id, symbol })?;
            }
            if let Some(index) = constant.allocation_index {
                resolved.globals.insert(index, global);
            }
        }

        if let Some(last) = self.image.constants.last() {
            stream.block_until_done().context(ConstantResolutionSnafu { device: id, symbol: &last.symbol_name })?;
        }

        debug!(
            device = %id,
            module = %self.image.name,
            module.handle = %handle,
            constants = self.image.constants.len(),
            "Resolved module constants"
        );
        Ok(resolved)
    }

    /// Whether the module is currently resolved on `device`.
    pub fn is_resolved(&self, device: DeviceId) -> bool {
        let slot = self.slots.lock().get(&device).cloned();
        slot.is_some_and(|slot| slot.lock().is_some())
    }
}

impl fmt::Debug for ConstantResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantResolver")
            .field("module", &self.image.name)
            .field("devices", &self.slots.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

//! Explicit runtime context.
//!
//! Bundles the read-only [`Capabilities`] table with one backend per device
//! kind. Every allocation and import receives the context it runs under;
//! nothing in this crate reads process-global state.

use std::collections::HashMap;
use std::sync::Arc;

use bon::bon;
use enumset::EnumSet;
use jetstream_dtype::Device;
use snafu::OptionExt;
use tracing::debug;

use crate::backend::{Backend, BackendStats};
use crate::capability::Capabilities;
use crate::emulated::{EmulatedBackend, HandleTable};
use crate::error::{DeviceUnavailableSnafu, Result};
use crate::host::{HostBackend, PageLockTable};

#[derive(Debug)]
struct Inner {
    capabilities: Capabilities,
    backends: HashMap<Device, Arc<dyn Backend>>,
    page_locks: Arc<PageLockTable>,
    handles: Arc<HandleTable>,
}

/// Capabilities plus backends, shared by every storage created under it.
///
/// Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

#[bon]
impl Context {
    /// Assemble a context.
    ///
    /// Devices without an entry in `backends` get the host backend (CPU) or an
    /// emulated accelerator. Backends for devices the capability table marks
    /// unavailable are kept but never handed out.
    #[builder]
    pub fn new(
        #[builder(default)] capabilities: Capabilities,
        #[builder(default)] backends: Vec<Arc<dyn Backend>>,
        #[builder(default)] page_locks: Arc<PageLockTable>,
    ) -> Self {
        let handles = Arc::new(HandleTable::new());

        let mut table: HashMap<Device, Arc<dyn Backend>> =
            backends.into_iter().map(|backend| (backend.device(), backend)).collect();

        for device in EnumSet::<Device>::all() {
            table.entry(device).or_insert_with(|| {
                let page_size = capabilities.page_size(device);
                debug!(%device, page_size, "installing default backend");
                let backend: Arc<dyn Backend> = match device {
                    Device::Cpu => Arc::new(HostBackend::new(page_size, page_locks.clone())),
                    _ => Arc::new(EmulatedBackend::new(device, page_size, page_locks.clone(), handles.clone())),
                };
                backend
            });
        }

        Self { inner: Arc::new(Inner { capabilities, backends: table, page_locks, handles }) }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Context {
    /// Default backends under the given capability table.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self::builder().capabilities(capabilities).build()
    }

    /// Default backends under [`Capabilities::from_env`].
    pub fn from_env() -> Result<Self> {
        Ok(Self::with_capabilities(Capabilities::from_env()?))
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    /// Backend of an available device.
    pub fn backend(&self, device: Device) -> Result<&Arc<dyn Backend>> {
        if !self.inner.capabilities.is_available(device) {
            return DeviceUnavailableSnafu { device }.fail();
        }
        self.inner.backends.get(&device).context(DeviceUnavailableSnafu { device })
    }

    /// Counters of a device's backend, available or not.
    pub fn stats(&self, device: Device) -> Option<BackendStats> {
        self.inner.backends.get(&device).map(|backend| backend.stats())
    }

    /// Block until `device` finished all submitted work.
    pub fn synchronize(&self, device: Device) -> Result<()> {
        self.backend(device)?.synchronize()
    }

    /// Page-lock registry shared by the host and accelerator backends.
    pub fn page_locks(&self) -> &Arc<PageLockTable> {
        &self.inner.page_locks
    }

    /// Export descriptors of the emulated backends that are still open.
    pub fn open_descriptors(&self) -> usize {
        self.inner.handles.open_descriptors()
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

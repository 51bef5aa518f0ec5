//! Device capability registry.
//!
//! Describes what each device backend supports: unified memory, memory
//! export/import and page-locked host allocations. The table is built once at
//! startup, wrapped into a [`crate::Context`] and never mutated afterwards.
//!
//! # Environment Variables
//!
//! [`Capabilities::from_env`] applies these overrides on top of the defaults:
//!
//! * `JETSTREAM_DEVICES=cpu,vulkan` - Devices that are available (CPU is always kept)
//! * `JETSTREAM_UNIFIED_MEMORY=metal` - Devices whose allocations are host-visible
//! * `JETSTREAM_NO_EXPORT=vulkan` - Devices that cannot export memory handles
//! * `JETSTREAM_NO_IMPORT=cuda` - Devices that cannot import foreign memory
//! * `JETSTREAM_PINNED_HOST=1` - Allocate CPU buffers as page-locked memory
//! * `JETSTREAM_PAGE_SIZE=N` - Allocation granularity in bytes for every device

use bon::bon;
use enumset::EnumSet;
use jetstream_dtype::Device;

use crate::error::{InvalidDeviceSnafu, Result};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// What a single device backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceCapabilities {
    /// The backend was initialized and can allocate.
    pub available: bool,
    /// Allocations are visible to both host and device without copies.
    pub unified_memory: bool,
    /// Allocations can be exported as platform handles.
    pub export_memory: bool,
    /// Foreign memory (handles or host pointers) can be mapped in.
    pub import_memory: bool,
    /// Host allocations are page-locked. Only meaningful for the CPU.
    pub pinned_host: bool,
    /// Allocation granularity in bytes.
    pub page_size: usize,
}

#[bon]
impl DeviceCapabilities {
    #[builder]
    pub fn new(
        #[builder(default = true)] available: bool,
        #[builder(default = false)] unified_memory: bool,
        #[builder(default = false)] export_memory: bool,
        #[builder(default = false)] import_memory: bool,
        #[builder(default = false)] pinned_host: bool,
        #[builder(default = DEFAULT_PAGE_SIZE)] page_size: usize,
    ) -> Self {
        Self { available, unified_memory, export_memory, import_memory, pinned_host, page_size }
    }
}

impl DeviceCapabilities {
    /// Typical capabilities of each backend family.
    pub fn defaults_for(device: Device) -> Self {
        match device {
            // Host pointers can always be handed to an importer.
            Device::Cpu => Self::builder().unified_memory(true).export_memory(true).build(),
            Device::Cuda => Self::builder().import_memory(true).build(),
            // Apple silicon shares one memory pool and wraps host pages without copies.
            Device::Metal => Self::builder().unified_memory(true).import_memory(true).build(),
            // Opaque FD export plus host-pointer import.
            Device::Vulkan => Self::builder().export_memory(true).import_memory(true).build(),
        }
    }

    /// Capabilities of a device that was not initialized.
    pub fn unavailable() -> Self {
        Self::builder().available(false).build()
    }
}

/// Process-wide capability table, one entry per device kind.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities {
    cpu: DeviceCapabilities,
    cuda: DeviceCapabilities,
    metal: DeviceCapabilities,
    vulkan: DeviceCapabilities,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            cpu: DeviceCapabilities::defaults_for(Device::Cpu),
            cuda: DeviceCapabilities::defaults_for(Device::Cuda),
            metal: DeviceCapabilities::defaults_for(Device::Metal),
            vulkan: DeviceCapabilities::defaults_for(Device::Vulkan),
        }
    }
}

impl Capabilities {
    /// Only the host is available.
    pub fn host_only() -> Self {
        Self::default()
            .with(Device::Cuda, DeviceCapabilities::unavailable())
            .with(Device::Metal, DeviceCapabilities::unavailable())
            .with(Device::Vulkan, DeviceCapabilities::unavailable())
    }

    pub fn get(&self, device: Device) -> &DeviceCapabilities {
        match device {
            Device::Cpu => &self.cpu,
            Device::Cuda => &self.cuda,
            Device::Metal => &self.metal,
            Device::Vulkan => &self.vulkan,
        }
    }

    /// Replace the entry for `device`.
    pub fn with(mut self, device: Device, capabilities: DeviceCapabilities) -> Self {
        *self.get_mut(device) = capabilities;
        self
    }

    /// Adjust the entry for `device` in place.
    pub fn modify(mut self, device: Device, f: impl FnOnce(&mut DeviceCapabilities)) -> Self {
        f(self.get_mut(device));
        self
    }

    fn get_mut(&mut self, device: Device) -> &mut DeviceCapabilities {
        match device {
            Device::Cpu => &mut self.cpu,
            Device::Cuda => &mut self.cuda,
            Device::Metal => &mut self.metal,
            Device::Vulkan => &mut self.vulkan,
        }
    }

    pub fn is_available(&self, device: Device) -> bool {
        self.get(device).available
    }

    pub fn has_unified_memory(&self, device: Device) -> bool {
        self.get(device).unified_memory
    }

    pub fn can_export_memory(&self, device: Device) -> bool {
        self.get(device).export_memory
    }

    pub fn can_import_memory(&self, device: Device) -> bool {
        self.get(device).import_memory
    }

    pub fn page_size(&self, device: Device) -> usize {
        self.get(device).page_size
    }

    /// Devices whose backend is available.
    pub fn available_devices(&self) -> EnumSet<Device> {
        EnumSet::all().iter().filter(|d| self.is_available(*d)).collect()
    }

    /// Build the table from defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok();
        Self::default().with_overrides(&EnvOverrides {
            devices: var("JETSTREAM_DEVICES"),
            unified_memory: var("JETSTREAM_UNIFIED_MEMORY"),
            no_export: var("JETSTREAM_NO_EXPORT"),
            no_import: var("JETSTREAM_NO_IMPORT"),
            pinned_host: var("JETSTREAM_PINNED_HOST"),
            page_size: var("JETSTREAM_PAGE_SIZE"),
        })
    }

    /// Apply raw override strings. Split from [`Self::from_env`] so it can be tested without touching the environment.
    pub fn with_overrides(mut self, overrides: &EnvOverrides) -> Result<Self> {
        if let Some(devices) = &overrides.devices {
            let enabled = parse_device_list(devices)? | Device::Cpu;
            for device in EnumSet::<Device>::all() {
                self.get_mut(device).available = enabled.contains(device);
            }
        }

        if let Some(unified) = &overrides.unified_memory {
            let unified = parse_device_list(unified)?;
            for device in EnumSet::<Device>::all() {
                self.get_mut(device).unified_memory = unified.contains(device) || device == Device::Cpu;
            }
        }

        if let Some(no_export) = &overrides.no_export {
            for device in parse_device_list(no_export)? {
                self.get_mut(device).export_memory = false;
            }
        }

        if let Some(no_import) = &overrides.no_import {
            for device in parse_device_list(no_import)? {
                self.get_mut(device).import_memory = false;
            }
        }

        if let Some(pinned) = &overrides.pinned_host {
            self.cpu.pinned_host = parse_flag(pinned);
        }

        if let Some(page_size) = &overrides.page_size
            && let Ok(page_size) = page_size.trim().parse::<usize>()
            && page_size.is_power_of_two()
        {
            for device in EnumSet::<Device>::all() {
                self.get_mut(device).page_size = page_size;
            }
        }

        Ok(self)
    }
}

/// Raw values of the `JETSTREAM_*` variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub devices: Option<String>,
    pub unified_memory: Option<String>,
    pub no_export: Option<String>,
    pub no_import: Option<String>,
    pub pinned_host: Option<String>,
    pub page_size: Option<String>,
}

/// Parse a comma separated device list such as `"cpu, cuda"`.
pub fn parse_device_list(s: &str) -> Result<EnumSet<Device>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| Device::parse(part).map_err(|_| InvalidDeviceSnafu { device: part.to_string() }.build()))
        .collect()
}

fn parse_flag(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Round `size` up to a whole number of pages.
pub const fn page_aligned_size(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size) * page_size
}

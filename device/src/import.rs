//! Cross-device import algebra.
//!
//! Decides, for a (source buffer, target device) pair, which native sharing
//! mechanism can give the target a view of the source's memory without a copy.
//! Pairs with no mechanism resolve to `None`; callers fall back to copying.

use jetstream_dtype::Device;

use crate::buffer::{Buffer, Residency};
use crate::capability::Capabilities;
use crate::error::Error;

/// Native mechanism that lets one device alias another device's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ImportPath {
    /// Vulkan memory exported as an opaque file descriptor and mapped by CUDA.
    ExternalHandle,
    /// Page-locked host memory mapped into the CUDA address space.
    PinnedHost,
    /// Host pages wrapped by a unified-memory device (Metal no-copy buffers, Vulkan host pointers).
    HostPointer,
    /// Host-visible memory of any device read directly by the CPU.
    HostMapping,
}

impl ImportPath {
    /// Sharing mechanism from `source` to `target`, if one exists under `caps`.
    ///
    /// Only the owner of an allocation can export it; aliases are never
    /// re-exported to a third device.
    pub fn resolve(caps: &Capabilities, source: &Buffer, target: Device) -> Option<Self> {
        let from = source.device();
        if from == target || source.is_empty() {
            return None;
        }

        let exportable = source.owns_data() && caps.can_export_memory(from) && caps.can_import_memory(target);

        match (from, target) {
            (_, Device::Cpu) if source.residency().host_accessible => Some(ImportPath::HostMapping),
            (Device::Vulkan, Device::Cuda) if exportable => Some(ImportPath::ExternalHandle),
            (Device::Cpu, Device::Cuda) if exportable => Some(ImportPath::PinnedHost),
            (Device::Cpu, Device::Metal | Device::Vulkan) if exportable && caps.has_unified_memory(target) => {
                Some(ImportPath::HostPointer)
            }
            _ => None,
        }
    }

    /// Why no path exists from `source` to `target`.
    pub(crate) fn rejection(caps: &Capabilities, source: &Buffer, target: Device) -> Error {
        let source_device = source.device();
        if target != Device::Cpu && !(source.owns_data() && caps.can_export_memory(source_device)) {
            Error::ExportUnsupported { source_device, target }
        } else if target != Device::Cpu && !caps.can_import_memory(target) {
            Error::ImportUnsupported { source_device, target }
        } else {
            Error::IncompatibleDevices { source_device, target }
        }
    }

    /// Residency of a buffer created through this path.
    pub fn residency(&self, source: &Residency) -> Residency {
        match self {
            ImportPath::ExternalHandle => Residency::DEVICE_PRIVATE,
            ImportPath::PinnedHost => Residency { device_native: false, host_native: true, host_accessible: true },
            ImportPath::HostPointer => Residency::UNIFIED,
            ImportPath::HostMapping => {
                Residency { device_native: true, host_native: source.host_native, host_accessible: true }
            }
        }
    }

    /// Whether the path maps a native handle that must be released on drop.
    pub const fn maps_handle(&self) -> bool {
        !matches!(self, ImportPath::HostMapping)
    }
}

//! Device kinds a buffer can be resident on.
//!
//! A `Device` names a backend family, not a physical adapter. Every tensor
//! storage tracks the set of devices it currently has a valid buffer on as an
//! `EnumSet<Device>`.

use std::fmt;
use std::str::FromStr;

use snafu::Snafu;

/// Compute or render device family.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::VariantArray)]
#[derive(enumset::EnumSetType)]
#[cfg_attr(any(test, feature = "proptest"), derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Device {
    /// Host memory, always present.
    Cpu,
    Cuda,
    Metal,
    Vulkan,
}

/// Error returned when a device string cannot be parsed.
#[derive(Debug, Snafu)]
#[snafu(display("unknown device: {input}"))]
pub struct ParseDeviceError {
    input: String,
}

impl Device {
    /// Parse a device string.
    ///
    /// Examples:
    /// - "CPU" -> Device::Cpu
    /// - "cuda" -> Device::Cuda
    /// - "VK" -> Device::Vulkan
    pub fn parse(s: &str) -> Result<Self, ParseDeviceError> {
        match s.trim().to_uppercase().as_str() {
            "CPU" | "HOST" => Ok(Device::Cpu),
            "CUDA" | "GPU" => Ok(Device::Cuda),
            "METAL" | "MTL" => Ok(Device::Metal),
            "VULKAN" | "VK" => Ok(Device::Vulkan),
            _ => ParseDeviceSnafu { input: s }.fail(),
        }
    }

    /// Canonical name used in logs and configuration.
    pub const fn canonicalize(&self) -> &'static str {
        match self {
            Device::Cpu => "CPU",
            Device::Cuda => "CUDA",
            Device::Metal => "Metal",
            Device::Vulkan => "Vulkan",
        }
    }

    /// Whether memory on this device is ordinary host memory.
    pub const fn is_host(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonicalize())
    }
}

impl FromStr for Device {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

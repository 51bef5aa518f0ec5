use enumset::EnumSet;
use test_case::test_case;

use crate::capability::{EnvOverrides, page_aligned_size, parse_device_list};
use crate::{Capabilities, Context, Device, DeviceCapabilities, Error, Severity};

#[test]
fn test_default_capabilities() {
    let caps = Capabilities::default();

    assert!(caps.has_unified_memory(Device::Cpu));
    assert!(caps.can_export_memory(Device::Cpu));
    assert!(!caps.can_import_memory(Device::Cpu));

    assert!(!caps.has_unified_memory(Device::Cuda));
    assert!(!caps.can_export_memory(Device::Cuda));
    assert!(caps.can_import_memory(Device::Cuda));

    assert!(caps.has_unified_memory(Device::Metal));
    assert!(caps.can_import_memory(Device::Metal));

    assert!(caps.can_export_memory(Device::Vulkan));
    assert!(caps.can_import_memory(Device::Vulkan));
    assert!(!caps.has_unified_memory(Device::Vulkan));

    assert_eq!(caps.available_devices(), EnumSet::all());
    assert_eq!(caps.page_size(Device::Cuda), 4096);
}

#[test]
fn test_host_only() {
    let caps = Capabilities::host_only();
    assert_eq!(caps.available_devices(), EnumSet::only(Device::Cpu));
}

#[test]
fn test_builder_defaults() {
    let caps = DeviceCapabilities::builder().import_memory(true).page_size(16384).build();
    assert!(caps.available);
    assert!(caps.import_memory);
    assert!(!caps.export_memory);
    assert!(!caps.pinned_host);
    assert_eq!(caps.page_size, 16384);
}

#[test]
fn test_modify_is_per_device() {
    let caps = Capabilities::default().modify(Device::Metal, |metal| metal.unified_memory = false);
    assert!(!caps.has_unified_memory(Device::Metal));
    assert!(caps.has_unified_memory(Device::Cpu));
}

#[test]
fn test_overrides_devices_keep_cpu() {
    let overrides = EnvOverrides { devices: Some("vulkan".into()), ..Default::default() };
    let caps = Capabilities::default().with_overrides(&overrides).unwrap();
    assert_eq!(caps.available_devices(), Device::Cpu | Device::Vulkan);
}

#[test]
fn test_overrides_unified_memory() {
    let overrides = EnvOverrides { unified_memory: Some("cuda".into()), ..Default::default() };
    let caps = Capabilities::default().with_overrides(&overrides).unwrap();
    assert!(caps.has_unified_memory(Device::Cuda));
    assert!(caps.has_unified_memory(Device::Cpu));
    assert!(!caps.has_unified_memory(Device::Metal));
}

#[test]
fn test_overrides_export_import_pinned() {
    let overrides = EnvOverrides {
        no_export: Some("vulkan, cpu".into()),
        no_import: Some("cuda".into()),
        pinned_host: Some("yes".into()),
        ..Default::default()
    };
    let caps = Capabilities::default().with_overrides(&overrides).unwrap();
    assert!(!caps.can_export_memory(Device::Vulkan));
    assert!(!caps.can_export_memory(Device::Cpu));
    assert!(!caps.can_import_memory(Device::Cuda));
    assert!(caps.can_import_memory(Device::Vulkan));
    assert!(caps.get(Device::Cpu).pinned_host);
}

#[test_case("65536", 65536 ; "power of two")]
#[test_case("1000", 4096 ; "not a power of two")]
#[test_case("pages", 4096 ; "not a number")]
fn test_overrides_page_size(value: &str, expected: usize) {
    let overrides = EnvOverrides { page_size: Some(value.into()), ..Default::default() };
    let caps = Capabilities::default().with_overrides(&overrides).unwrap();
    assert_eq!(caps.page_size(Device::Cpu), expected);
    assert_eq!(caps.page_size(Device::Vulkan), expected);
}

#[test]
fn test_overrides_reject_unknown_device() {
    let overrides = EnvOverrides { devices: Some("cpu,opengl".into()), ..Default::default() };
    let err = Capabilities::default().with_overrides(&overrides).unwrap_err();
    assert!(matches!(err, Error::InvalidDevice { ref device } if device == "opengl"));
}

#[test]
fn test_parse_device_list() {
    assert_eq!(parse_device_list(" CUDA, vk ,").unwrap(), Device::Cuda | Device::Vulkan);
    assert!(parse_device_list("").unwrap().is_empty());
}

#[test_case(1, 4096, 4096)]
#[test_case(4096, 4096, 4096)]
#[test_case(4097, 4096, 8192)]
#[test_case(0, 4096, 0)]
#[test_case(100, 64, 128)]
fn test_page_aligned_size(size: usize, page: usize, expected: usize) {
    assert_eq!(page_aligned_size(size, page), expected);
}

#[test]
fn test_context_rejects_unavailable_device() {
    let ctx = Context::with_capabilities(Capabilities::host_only());
    let err = ctx.backend(Device::Cuda).unwrap_err();
    assert!(matches!(err, Error::DeviceUnavailable { device: Device::Cuda }));
    assert_eq!(err.severity(), Severity::Fatal);
    assert!(ctx.backend(Device::Cpu).is_ok());
}

#[test]
fn test_context_backends_match_devices() {
    let ctx = Context::default();
    for device in EnumSet::<Device>::all() {
        assert_eq!(ctx.backend(device).unwrap().device(), device);
    }
    assert_eq!(ctx.backend(Device::Cpu).unwrap().name(), "CPU");
    assert!(ctx.ptr_eq(&ctx.clone()));
}

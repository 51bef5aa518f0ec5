use enumset::EnumSet;
use jetstream_device::{BufferOptions, Capabilities, Context, Device, ImportPath, Origin, Severity};
use test_case::test_case;

use crate::test::helpers::{discrete_gpu, half_ramp, unified_gpu};
use crate::*;

#[test]
fn test_map_on_same_device_is_identity() {
    let ctx = Context::default();
    let t = Tensor::<f32>::new(&ctx, Device::Cpu, &[8]).unwrap();
    let mapped = map_on(Device::Cpu, &t).unwrap();

    assert!(mapped.same_storage(&t));
    assert_eq!(mapped.data_ptr(), t.data_ptr());
}

#[test]
fn test_unified_gpu_aliases_host_memory() {
    let ctx = unified_gpu();
    let t = Tensor::from_slice(&ctx, Device::Cpu, &[1024], &half_ramp(1024)).unwrap();

    let gpu = t.map_on(Device::Metal).unwrap();
    assert_eq!(gpu.device(), Device::Metal);
    assert!(gpu.device_native());
    assert!(!gpu.owns_data());
    assert_eq!(gpu.external_memory_device(), Some(Device::Cpu));
    assert_eq!(gpu.data_ptr(), t.data_ptr());
    assert_eq!(gpu.to_vec().unwrap(), half_ramp(1024));
    assert_eq!(ctx.stats(Device::Metal).unwrap().allocations, 0);
}

#[test]
fn test_discrete_gpu_copies() {
    let ctx = discrete_gpu();
    let t = Tensor::from_slice(&ctx, Device::Cpu, &[1024], &half_ramp(1024)).unwrap();

    let gpu = t.map_on(Device::Metal).unwrap();
    assert!(gpu.device_native());
    assert!(gpu.owns_data());
    assert_eq!(gpu.external_memory_device(), None);
    assert_ne!(gpu.data_ptr(), t.data_ptr());
    assert_eq!(t.storage().origin(Device::Metal), Some(Origin::Copied { from: Device::Cpu }));
    assert_eq!(gpu.to_vec().unwrap(), half_ramp(1024));
}

#[test_case(Device::Cuda, Device::Cpu)]
#[test_case(Device::Cpu, Device::Metal)]
#[test_case(Device::Cpu, Device::Vulkan)]
#[test_case(Device::Vulkan, Device::Cuda)]
#[test_case(Device::Vulkan, Device::Cpu)]
#[test_case(Device::Cuda, Device::Metal)]
#[test_case(Device::Metal, Device::Vulkan)]
fn test_map_on_is_idempotent(root: Device, target: Device) {
    let ctx = Context::default();
    let t = Tensor::from_slice(&ctx, root, &[100], &half_ramp(100)).unwrap();

    let first = map_on(target, &t).unwrap();
    let stats = ctx.stats(target).unwrap();
    let second = map_on(target, &t).unwrap();
    let third = first.map_on(target).unwrap();

    assert_eq!(first.data_ptr(), second.data_ptr());
    assert_eq!(first.data_ptr(), third.data_ptr());
    assert_eq!(ctx.stats(target).unwrap(), stats);
    assert_eq!(second.to_vec().unwrap(), half_ramp(100));
}

#[test]
fn test_vulkan_to_cuda_zero_copy() {
    let ctx = Context::default();
    let t = Tensor::from_slice(&ctx, Device::Vulkan, &[256], &half_ramp(256)).unwrap();

    let cuda = map_on(Device::Cuda, &t).unwrap();
    assert!(!cuda.owns_data());
    assert_eq!(cuda.external_memory_device(), Some(Device::Vulkan));
    assert_eq!(t.storage().origin(Device::Cuda), Some(Origin::Imported(ImportPath::ExternalHandle)));
    assert_eq!(cuda.to_vec().unwrap(), half_ramp(256));
    assert_eq!(ctx.stats(Device::Cuda).unwrap().allocations, 0);
}

#[test]
fn test_unpinned_host_to_cuda_is_refused() {
    let ctx = Context::default();
    let t = Tensor::from_slice(&ctx, Device::Cpu, &[64], &half_ramp(64)).unwrap();

    let err = try_map_on(Device::Cuda, &t).unwrap_err();
    assert!(matches!(err, Error::Device { source: jetstream_device::Error::NotPinned { .. } }));
    assert_eq!(err.severity(), Severity::Precondition);

    let err = map_on(Device::Cuda, &t).unwrap_err();
    assert!(matches!(err, Error::Device { source: jetstream_device::Error::NotPinned { .. } }));
    assert!(!t.compatible_devices().contains(Device::Cuda));
    assert_eq!(ctx.stats(Device::Cuda).unwrap().allocations, 0);

    let cuda = copy_on(Device::Cuda, &t).unwrap();
    assert!(cuda.owns_data());
    assert_eq!(cuda.to_vec().unwrap(), half_ramp(64));
    assert_eq!(map_on(Device::Cuda, &t).unwrap().data_ptr(), cuda.data_ptr());
}

#[test]
fn test_pinned_host_to_cuda_aliases() {
    let ctx = Context::default();
    let options = BufferOptions { pinned: true, ..Default::default() };
    let mut t = Tensor::<f32>::with_options(&ctx, Device::Cpu, &[64], &options).unwrap();
    t.copy_from_slice(&half_ramp(64)).unwrap();

    let cuda = try_map_on(Device::Cuda, &t).unwrap().unwrap();
    assert!(!cuda.owns_data());
    assert!(!cuda.device_native());
    assert!(cuda.host_accessible());

    t.set(&[0], 42.0).unwrap();
    assert_eq!(cuda.get(&[0]).unwrap(), 42.0);
}

#[test_case(Device::Cpu)]
#[test_case(Device::Cuda)]
#[test_case(Device::Metal)]
#[test_case(Device::Vulkan)]
fn test_zero_sized_maps_everywhere(root: Device) {
    let ctx = Context::default();
    let t = Tensor::<f32>::new(&ctx, root, &[0]).unwrap();

    for device in EnumSet::<Device>::all() {
        let mapped = map_on(device, &t).unwrap();
        assert_eq!(mapped.size(), 0);
        assert!(mapped.data_ptr().is_null());
        assert!(mapped.to_vec().unwrap().is_empty());
    }
    assert_eq!(t.compatible_devices(), EnumSet::all());
}

#[test]
fn test_map_on_unavailable_device() {
    let ctx = Context::with_capabilities(Capabilities::host_only());
    let t = Tensor::<f32>::new(&ctx, Device::Cpu, &[4]).unwrap();
    let err = map_on(Device::Metal, &t).unwrap_err();
    assert!(matches!(err, Error::Device { source: jetstream_device::Error::DeviceUnavailable { .. } }));
}

#[test]
fn test_compatible_set_grows() {
    let ctx = Context::default();
    let t = Tensor::<f32>::new(&ctx, Device::Vulkan, &[16]).unwrap();
    assert_eq!(t.compatible_devices(), EnumSet::only(Device::Vulkan));

    map_on(Device::Cuda, &t).unwrap();
    map_on(Device::Cpu, &t).unwrap();
    assert_eq!(t.compatible_devices(), Device::Vulkan | Device::Cuda | Device::Cpu);
}

#[test]
fn test_stale_copy_needs_refresh() {
    let ctx = Context::default();
    let mut t = Tensor::from_slice(&ctx, Device::Cpu, &[4], &[1.0f32; 4]).unwrap();
    let gpu = map_on(Device::Vulkan, &t).unwrap();

    t.copy_from_slice(&[2.0; 4]).unwrap();
    assert_eq!(gpu.to_vec().unwrap(), vec![1.0; 4]);

    assert!(gpu.refresh().unwrap());
    assert_eq!(gpu.to_vec().unwrap(), vec![2.0; 4]);
    assert!(!t.refresh().unwrap());
}

#[test]
fn test_refresh_copy_on_unified_device() {
    let ctx = Context::default();
    let mut t = Tensor::from_slice(&ctx, Device::Cuda, &[4], &[1.0f32; 4]).unwrap();
    let metal = map_on(Device::Metal, &t).unwrap();
    assert_eq!(t.storage().origin(Device::Metal), Some(Origin::Copied { from: Device::Cuda }));
    assert_eq!(t.storage().origin(Device::Cpu), Some(Origin::Imported(ImportPath::HostMapping)));

    t.copy_from_slice(&[2.0; 4]).unwrap();
    assert!(metal.refresh().unwrap());
    assert_eq!(metal.to_vec().unwrap(), vec![2.0; 4]);
    assert_eq!(map_on(Device::Cpu, &t).unwrap().to_vec().unwrap(), vec![2.0; 4]);
}

#[test]
fn test_third_device_sees_root_updates() {
    let ctx = Context::default();
    let mut t = Tensor::from_slice(&ctx, Device::Cuda, &[4], &[1.0f32; 4]).unwrap();
    map_on(Device::Metal, &t).unwrap();

    t.copy_from_slice(&[2.0; 4]).unwrap();
    let vulkan = map_on(Device::Vulkan, &t).unwrap();
    assert_eq!(t.storage().origin(Device::Vulkan), Some(Origin::Copied { from: Device::Cuda }));
    assert_eq!(vulkan.to_vec().unwrap(), vec![2.0; 4]);
}

#[test]
fn test_storage_teardown_after_mapping() {
    let ctx = Context::default();
    {
        let t = Tensor::<f32>::new(&ctx, Device::Vulkan, &[1024]).unwrap();
        let cuda = map_on(Device::Cuda, &t).unwrap();
        let cpu = map_on(Device::Cpu, &cuda).unwrap();
        drop(t);
        assert_eq!(cpu.size(), 1024);
    }

    for device in EnumSet::<Device>::all() {
        let stats = ctx.stats(device).unwrap();
        assert_eq!(stats.live_allocations(), 0);
        assert_eq!(stats.live_imports(), 0);
        assert_eq!(stats.premature_frees, 0);
    }
    assert_eq!(ctx.open_descriptors(), 0);
}

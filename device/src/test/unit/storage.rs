use enumset::EnumSet;
use test_case::test_case;

use crate::test::helpers::{context_with, non_unified, pattern, pinned_context};
use crate::{BufferOptions, Capabilities, Context, Device, Error, ImportPath, Origin, Severity, Storage};

fn storage(ctx: &Context, device: Device, size: usize) -> Storage {
    Storage::new(ctx, device, size, &BufferOptions::default()).unwrap()
}

fn fill(storage: &Storage, bytes: &[u8]) {
    storage.with_buffer_mut(storage.root_device(), |root| root.copyin(0, bytes)).unwrap().unwrap();
}

fn read(storage: &Storage, device: Device) -> Vec<u8> {
    let mut bytes = vec![0u8; storage.size_bytes()];
    storage.with_buffer(device, |buffer| buffer.copyout(0, &mut bytes)).unwrap().unwrap();
    bytes
}

#[test]
fn test_root_is_compatible() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Vulkan, 64);

    assert_eq!(s.root_device(), Device::Vulkan);
    assert_eq!(s.compatible_devices(), EnumSet::only(Device::Vulkan));
    assert_eq!(s.origin(Device::Vulkan), Some(Origin::Root));
    assert!(s.buffer_info(Device::Vulkan).unwrap().owns_data);
}

#[test]
fn test_unified_root_registers_cpu() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Metal, 64);

    assert_eq!(s.compatible_devices(), Device::Metal | Device::Cpu);
    assert_eq!(s.origin(Device::Cpu), Some(Origin::Imported(ImportPath::HostMapping)));
    assert_eq!(s.buffer_info(Device::Cpu).unwrap().ptr, s.buffer_info(Device::Metal).unwrap().ptr);
}

#[test]
fn test_host_accessible_option_registers_cpu() {
    let ctx = Context::default();
    let options = BufferOptions { host_accessible: true, ..Default::default() };
    let s = Storage::new(&ctx, Device::Cuda, 64, &options).unwrap();
    assert!(s.is_compatible(Device::Cpu));
}

#[test]
fn test_ensure_on_is_idempotent() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cpu, 256);

    s.ensure_on(Device::Vulkan).unwrap();
    let first = s.buffer_info(Device::Vulkan).unwrap();
    let allocations = ctx.stats(Device::Vulkan).unwrap().allocations;

    s.ensure_on(Device::Vulkan).unwrap();
    s.ensure_on(Device::Vulkan).unwrap();
    assert_eq!(s.buffer_info(Device::Vulkan).unwrap().ptr, first.ptr);
    assert_eq!(ctx.stats(Device::Vulkan).unwrap().allocations, allocations);
    assert_eq!(s.residencies().len(), 2);
}

#[test]
fn test_copy_fallback_owns_data() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cpu, 300);
    fill(&s, &pattern(300));

    s.ensure_on(Device::Vulkan).unwrap();

    let info = s.buffer_info(Device::Vulkan).unwrap();
    assert!(info.owns_data);
    assert_eq!(info.external_memory_device, None);
    assert_eq!(s.origin(Device::Vulkan), Some(Origin::Copied { from: Device::Cpu }));
    assert_eq!(read(&s, Device::Vulkan), pattern(300));
}

#[test]
fn test_device_private_root_copies_to_host() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cuda, 128);
    fill(&s, &pattern(128));

    assert!(!s.try_import_on(Device::Cpu).unwrap());
    s.ensure_on(Device::Cpu).unwrap();
    assert_eq!(s.origin(Device::Cpu), Some(Origin::Copied { from: Device::Cuda }));
    assert_eq!(read(&s, Device::Cpu), pattern(128));
}

#[test]
fn test_try_import_never_allocates() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cpu, 64);

    assert!(!s.try_import_on(Device::Vulkan).unwrap());
    assert!(!s.is_compatible(Device::Vulkan));
    assert_eq!(ctx.stats(Device::Vulkan).unwrap().allocations, 0);
}

#[test]
fn test_vulkan_root_imports_into_cuda() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Vulkan, 64);
    fill(&s, &pattern(64));

    assert!(s.try_import_on(Device::Cuda).unwrap());
    let info = s.buffer_info(Device::Cuda).unwrap();
    assert!(!info.owns_data);
    assert_eq!(info.external_memory_device, Some(Device::Vulkan));
    assert_eq!(read(&s, Device::Cuda), pattern(64));
    assert_eq!(ctx.stats(Device::Cuda).unwrap().allocations, 0);
}

#[test]
fn test_unpinned_host_import_is_refused() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cpu, 64);
    fill(&s, &pattern(64));

    let err = s.try_import_on(Device::Cuda).unwrap_err();
    assert!(matches!(err, Error::NotPinned { source_device: Device::Cpu, target: Device::Cuda, .. }));
    assert_eq!(err.severity(), Severity::Precondition);
    assert!(matches!(s.ensure_on(Device::Cuda), Err(Error::NotPinned { .. })));
    assert!(!s.is_compatible(Device::Cuda));
    assert_eq!(ctx.stats(Device::Cuda).unwrap().allocations, 0);

    s.copy_on(Device::Cuda).unwrap();
    assert_eq!(s.origin(Device::Cuda), Some(Origin::Copied { from: Device::Cpu }));
    assert!(s.buffer_info(Device::Cuda).unwrap().owns_data);
    assert_eq!(read(&s, Device::Cuda), pattern(64));
}

#[test]
fn test_copy_on_skips_import() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Vulkan, 64);
    fill(&s, &pattern(64));

    s.copy_on(Device::Cuda).unwrap();
    assert_eq!(s.origin(Device::Cuda), Some(Origin::Copied { from: Device::Vulkan }));
    assert_eq!(ctx.stats(Device::Cuda).unwrap().imports, 0);

    // Already compatible, nothing new is allocated.
    s.copy_on(Device::Cuda).unwrap();
    assert_eq!(ctx.stats(Device::Cuda).unwrap().allocations, 1);
}

#[test]
fn test_pinned_host_imports_into_cuda() {
    let ctx = pinned_context();
    let s = storage(&ctx, Device::Cpu, 64);

    s.ensure_on(Device::Cuda).unwrap();
    assert_eq!(s.origin(Device::Cuda), Some(Origin::Imported(ImportPath::PinnedHost)));
}

#[test]
fn test_destruction_order() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Vulkan, 4096);
    s.ensure_on(Device::Cuda).unwrap();
    assert_eq!(ctx.open_descriptors(), 1);

    drop(s);

    let cuda = ctx.stats(Device::Cuda).unwrap();
    let vulkan = ctx.stats(Device::Vulkan).unwrap();
    assert_eq!(cuda.releases, 1);
    assert_eq!(cuda.frees, 0);
    assert_eq!(vulkan.frees, 1);
    assert_eq!(vulkan.live_allocations(), 0);
    assert_eq!(vulkan.premature_frees, 0);
    assert_eq!(ctx.open_descriptors(), 0);
}

#[test]
fn test_copied_residency_is_freed() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cpu, 64);
    s.ensure_on(Device::Vulkan).unwrap();
    drop(s);
    assert_eq!(ctx.stats(Device::Vulkan).unwrap().live_allocations(), 0);
    assert_eq!(ctx.stats(Device::Cpu).unwrap().live_allocations(), 0);
}

#[test_case(Device::Cpu)]
#[test_case(Device::Cuda)]
#[test_case(Device::Metal)]
#[test_case(Device::Vulkan)]
fn test_zero_size_maps_everywhere(root: Device) {
    let ctx = Context::default();
    let s = storage(&ctx, root, 0);

    for device in EnumSet::<Device>::all() {
        s.ensure_on(device).unwrap();
        let info = s.buffer_info(device).unwrap();
        assert_eq!(info.size, 0);
        assert!(info.ptr.is_null());
    }
    assert_eq!(s.compatible_devices(), EnumSet::all());
    for device in EnumSet::<Device>::all() {
        assert_eq!(ctx.stats(device).unwrap().allocations, 0);
    }
}

#[test]
fn test_refresh_copy() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cpu, 32);
    fill(&s, &[1; 32]);
    s.ensure_on(Device::Vulkan).unwrap();

    fill(&s, &[2; 32]);
    assert_eq!(read(&s, Device::Vulkan), vec![1; 32]);

    assert!(s.refresh(Device::Vulkan).unwrap());
    assert_eq!(read(&s, Device::Vulkan), vec![2; 32]);
}

#[test]
fn test_refresh_copy_with_host_alias() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cuda, 32);
    fill(&s, &[1; 32]);
    s.ensure_on(Device::Metal).unwrap();
    assert_eq!(s.origin(Device::Metal), Some(Origin::Copied { from: Device::Cuda }));
    assert_eq!(s.origin(Device::Cpu), Some(Origin::Imported(ImportPath::HostMapping)));

    fill(&s, &[2; 32]);
    assert_eq!(read(&s, Device::Cpu), vec![1; 32]);

    assert!(s.refresh(Device::Metal).unwrap());
    assert_eq!(read(&s, Device::Metal), vec![2; 32]);
    assert_eq!(read(&s, Device::Cpu), vec![2; 32]);
    assert_eq!(s.origin(Device::Metal), Some(Origin::Copied { from: Device::Cuda }));
}

#[test]
fn test_refresh_alias_of_copy() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cuda, 32);
    fill(&s, &[1; 32]);
    s.ensure_on(Device::Metal).unwrap();

    fill(&s, &[3; 32]);
    assert!(s.refresh(Device::Cpu).unwrap());
    assert_eq!(read(&s, Device::Metal), vec![3; 32]);
}

#[test]
fn test_copies_read_root_not_stale_alias() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cuda, 32);
    fill(&s, &[1; 32]);
    s.ensure_on(Device::Metal).unwrap();

    fill(&s, &[2; 32]);
    s.ensure_on(Device::Vulkan).unwrap();
    assert_eq!(s.origin(Device::Vulkan), Some(Origin::Copied { from: Device::Cuda }));
    assert_eq!(read(&s, Device::Vulkan), vec![2; 32]);
}

#[test]
fn test_refresh_skips_aliases() {
    let ctx = Context::default();
    let s = storage(&ctx, Device::Cpu, 32);
    s.ensure_on(Device::Metal).unwrap();

    assert!(!s.refresh(Device::Cpu).unwrap());
    assert!(!s.refresh(Device::Metal).unwrap());
    assert!(!s.refresh(Device::Vulkan).unwrap());
}

#[test]
fn test_non_unified_target_copies() {
    let ctx = non_unified(Device::Metal);
    let s = storage(&ctx, Device::Cpu, 32);
    s.ensure_on(Device::Metal).unwrap();
    assert_eq!(s.origin(Device::Metal), Some(Origin::Copied { from: Device::Cpu }));
}

#[test]
fn test_unavailable_target() {
    let ctx = Context::with_capabilities(Capabilities::host_only());
    let s = storage(&ctx, Device::Cpu, 32);
    assert!(matches!(s.ensure_on(Device::Cuda), Err(Error::DeviceUnavailable { device: Device::Cuda })));
    assert!(!s.is_compatible(Device::Cuda));
}

#[test]
fn test_export_disabled_copies() {
    let ctx = context_with(|caps| caps.modify(Device::Vulkan, |vk| vk.export_memory = false));
    let s = storage(&ctx, Device::Vulkan, 64);
    fill(&s, &pattern(64));

    s.ensure_on(Device::Cuda).unwrap();
    assert_eq!(s.origin(Device::Cuda), Some(Origin::Copied { from: Device::Vulkan }));
    assert_eq!(ctx.stats(Device::Cuda).unwrap().imports, 0);
    assert_eq!(read(&s, Device::Cuda), pattern(64));
}

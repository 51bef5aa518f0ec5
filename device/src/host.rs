//! Host memory backend.

use std::alloc::{Layout, alloc, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::sync::Arc;

use jetstream_dtype::Device;
use parking_lot::Mutex;
use snafu::ensure;

use crate::backend::{Allocation, Backend, BackendStats, BufferOptions, DevicePtr, ExportHandle, MemoryKind, StatCounters};
use crate::error::{AllocationFailedSnafu, Result};

/// Registry of page-locked host ranges.
///
/// Plays the role of the driver's pointer attribute table: the CPU backend
/// records what it pinned, accelerators ask whether a host pointer is pinned
/// before aliasing it.
#[derive(Debug, Default)]
pub struct PageLockTable {
    ranges: Mutex<BTreeMap<usize, usize>>,
}

impl PageLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, ptr: DevicePtr, size: usize) {
        self.ranges.lock().insert(ptr.addr(), size);
    }

    pub fn unlock(&self, ptr: DevicePtr) {
        self.ranges.lock().remove(&ptr.addr());
    }

    /// Whether `ptr` falls inside a pinned range.
    pub fn is_locked(&self, ptr: DevicePtr) -> bool {
        let ranges = self.ranges.lock();
        ranges.range(..=ptr.addr()).next_back().is_some_and(|(start, len)| ptr.addr() < start + len)
    }
}

/// Allocate `size` bytes of host memory aligned to `align`.
pub(crate) fn alloc_host(device: Device, size: usize, align: usize, zero_init: bool) -> Result<DevicePtr> {
    ensure!(size > 0, AllocationFailedSnafu { device, size, reason: "zero-sized allocation" });

    let layout = Layout::from_size_align(size, align)
        .map_err(|e| AllocationFailedSnafu { device, size, reason: e.to_string() }.build())?;

    // SAFETY: layout has a non-zero size.
    let ptr = unsafe { if zero_init { alloc_zeroed(layout) } else { alloc(layout) } };
    ensure!(!ptr.is_null(), AllocationFailedSnafu { device, size, reason: "out of host memory" });

    Ok(DevicePtr::from_host(ptr))
}

/// Free memory obtained from [`alloc_host`].
///
/// # Safety
///
/// `ptr`, `size` and `align` must match a live [`alloc_host`] call.
pub(crate) unsafe fn free_host(ptr: DevicePtr, size: usize, align: usize) {
    // SAFETY: guaranteed by caller.
    unsafe { dealloc(ptr.as_mut_ptr(), Layout::from_size_align_unchecked(size, align)) }
}

/// CPU backend using page-aligned system memory.
#[derive(Debug)]
pub struct HostBackend {
    page_size: usize,
    page_locks: Arc<PageLockTable>,
    stats: StatCounters,
}

impl HostBackend {
    pub fn new(page_size: usize, page_locks: Arc<PageLockTable>) -> Self {
        Self { page_size, page_locks, stats: StatCounters::default() }
    }
}

impl Backend for HostBackend {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn name(&self) -> &str {
        "CPU"
    }

    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<Allocation> {
        let ptr = alloc_host(Device::Cpu, size, self.page_size, options.zero_init)?;

        let kind = if options.pinned {
            self.page_locks.lock(ptr, size);
            MemoryKind::Pinned
        } else {
            MemoryKind::Pageable
        };

        self.stats.allocated();
        Ok(Allocation { ptr, size, kind })
    }

    fn free(&self, allocation: Allocation) {
        if allocation.kind == MemoryKind::Pinned {
            self.page_locks.unlock(allocation.ptr);
        }

        // SAFETY: every allocation of this backend comes from alloc_host with this page size.
        unsafe { free_host(allocation.ptr, allocation.size, self.page_size) };
        self.stats.freed();
    }

    fn export(&self, allocation: &Allocation) -> Result<ExportHandle> {
        self.stats.exported();
        Ok(ExportHandle::HostPointer { ptr: allocation.ptr, size: allocation.size })
    }

    fn host_memory_kind(&self, ptr: DevicePtr) -> Result<MemoryKind> {
        Ok(if self.page_locks.is_locked(ptr) { MemoryKind::Pinned } else { MemoryKind::Pageable })
    }

    unsafe fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        // SAFETY: caller guarantees dst is valid for src.len() bytes.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr::<u8>(), src.len()) };
        Ok(())
    }

    unsafe fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        // SAFETY: caller guarantees src is valid for dst.len() bytes.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}

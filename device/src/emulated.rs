//! Host-RAM backed accelerator.
//!
//! Stands in for CUDA, Metal or Vulkan when no native driver is compiled in.
//! Memory lives in page-aligned host allocations, but buffers flagged device
//! private are only reached through the backend copy entry points, and
//! exports go through a process-wide [`HandleTable`] of file-descriptor style
//! handles. This keeps the allocation, import and teardown protocol identical
//! to the native backends while staying testable on any machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use jetstream_dtype::Device;
use parking_lot::Mutex;
use snafu::ensure;
use tracing::{error, trace};

use crate::backend::{
    Allocation, Backend, BackendStats, BufferOptions, DevicePtr, ExportHandle, ExternalMemory, MemoryKind, StatCounters,
};
use crate::error::{HandleAcquisitionSnafu, Result};
use crate::host::{PageLockTable, alloc_host, free_host};

/// First descriptor handed out, after stdin/stdout/stderr.
const FIRST_FD: i32 = 3;

#[derive(Debug, Clone)]
struct ExportRecord {
    ptr: DevicePtr,
    size: usize,
    exporter: Device,
    mapped: bool,
}

/// Open export descriptors shared by every emulated backend of a context.
#[derive(Debug)]
pub struct HandleTable {
    next_fd: AtomicI32,
    records: Mutex<HashMap<i32, ExportRecord>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self { next_fd: AtomicI32::new(FIRST_FD), records: Mutex::new(HashMap::new()) }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, ptr: DevicePtr, size: usize, exporter: Device) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.records.lock().insert(fd, ExportRecord { ptr, size, exporter, mapped: false });
        fd
    }

    fn get(&self, fd: i32) -> Option<ExportRecord> {
        self.records.lock().get(&fd).cloned()
    }

    fn map(&self, fd: i32) {
        if let Some(record) = self.records.lock().get_mut(&fd) {
            record.mapped = true;
        }
    }

    fn close(&self, fd: i32) {
        self.records.lock().remove(&fd);
    }

    /// Number of live import mappings of the allocation at `ptr`.
    fn mapped_imports(&self, ptr: DevicePtr) -> usize {
        self.records.lock().values().filter(|r| r.ptr == ptr && r.mapped).count()
    }

    /// Close descriptors of `ptr` that were exported but never mapped.
    fn close_unmapped(&self, ptr: DevicePtr) {
        self.records.lock().retain(|_, r| r.ptr != ptr || r.mapped);
    }

    /// Number of descriptors still open.
    pub fn open_descriptors(&self) -> usize {
        self.records.lock().len()
    }
}

#[derive(Debug)]
pub struct EmulatedBackend {
    device: Device,
    page_size: usize,
    page_locks: Arc<PageLockTable>,
    handles: Arc<HandleTable>,
    stats: StatCounters,
}

impl EmulatedBackend {
    pub fn new(device: Device, page_size: usize, page_locks: Arc<PageLockTable>, handles: Arc<HandleTable>) -> Self {
        Self { device, page_size, page_locks, handles, stats: StatCounters::default() }
    }
}

impl EmulatedBackend {
    fn accept(&self, fd: i32, record: &ExportRecord, size: usize) -> Result<()> {
        ensure!(
            record.exporter != self.device,
            HandleAcquisitionSnafu {
                device: self.device,
                reason: format!("descriptor {fd} was exported by {} itself", self.device),
            }
        );
        ensure!(
            record.size >= size,
            HandleAcquisitionSnafu {
                device: self.device,
                reason: format!("descriptor {fd} covers {} bytes, {size} requested", record.size),
            }
        );
        Ok(())
    }
}

impl Backend for EmulatedBackend {
    fn device(&self) -> Device {
        self.device
    }

    fn name(&self) -> &str {
        self.device.canonicalize()
    }

    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<Allocation> {
        let ptr = alloc_host(self.device, size, self.page_size, options.zero_init)?;
        let kind = if options.host_accessible { MemoryKind::Managed } else { MemoryKind::DevicePrivate };

        self.stats.allocated();
        Ok(Allocation { ptr, size, kind })
    }

    fn free(&self, allocation: Allocation) {
        let live = self.handles.mapped_imports(allocation.ptr);
        if live > 0 {
            error!(device = %self.device, ptr = %allocation.ptr, live, "freeing memory that is still imported elsewhere");
            self.stats.freed_prematurely();
        }
        self.handles.close_unmapped(allocation.ptr);

        // SAFETY: every allocation of this backend comes from alloc_host with this page size.
        unsafe { free_host(allocation.ptr, allocation.size, self.page_size) };
        self.stats.freed();
    }

    fn export(&self, allocation: &Allocation) -> Result<ExportHandle> {
        let fd = self.handles.open(allocation.ptr, allocation.size, self.device);
        trace!(device = %self.device, fd, size = allocation.size, "exported memory handle");

        self.stats.exported();
        Ok(ExportHandle::OpaqueFd { fd, size: allocation.size })
    }

    fn import(&self, handle: ExportHandle) -> Result<ExternalMemory> {
        let ptr = match &handle {
            ExportHandle::OpaqueFd { fd, size } => {
                let Some(record) = self.handles.get(*fd) else {
                    return HandleAcquisitionSnafu { device: self.device, reason: format!("unknown descriptor {fd}") }
                        .fail();
                };
                // A refused descriptor is closed, nobody else will release it.
                if let Err(e) = self.accept(*fd, &record, *size) {
                    self.handles.close(*fd);
                    return Err(e);
                }
                self.handles.map(*fd);
                record.ptr
            }
            ExportHandle::HostPointer { ptr, .. } => *ptr,
        };

        self.stats.imported();
        Ok(ExternalMemory { ptr, size: handle.size(), handle, native: 0 })
    }

    fn release(&self, memory: ExternalMemory) {
        if let ExportHandle::OpaqueFd { fd, .. } = memory.handle {
            self.handles.close(fd);
        }
        self.stats.released();
    }

    fn host_memory_kind(&self, ptr: DevicePtr) -> Result<MemoryKind> {
        Ok(if self.page_locks.is_locked(ptr) { MemoryKind::Pinned } else { MemoryKind::Pageable })
    }

    unsafe fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        // SAFETY: emulated device memory is host memory; caller guarantees the range.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr::<u8>(), src.len()) };
        Ok(())
    }

    unsafe fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        // SAFETY: emulated device memory is host memory; caller guarantees the range.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}

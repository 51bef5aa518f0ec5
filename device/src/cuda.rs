//! CUDA driver backend.
//!
//! Device-private memory comes from `cuMemAlloc`, host-visible memory from
//! `cuMemAllocManaged`. Vulkan exports are mapped with
//! `cuImportExternalMemory`, pinned host pages are wrapped with
//! `cuMemHostGetDevicePointer`.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::result::{self, external_memory};
use cudarc::driver::sys::{self, CUdeviceptr, CUmemAttach_flags, CUmemorytype, CUpointer_attribute};
use cudarc::driver::CudaContext;
use jetstream_dtype::Device;
use snafu::ResultExt;
use tracing::{error, trace};

use crate::backend::{
    Allocation, Backend, BackendStats, BufferOptions, DevicePtr, ExportHandle, ExternalMemory, MemoryKind, StatCounters,
};
use crate::error::{CudaSnafu, Result};
use crate::host::PageLockTable;

/// `native` tag for host pages this backend registered itself.
const REGISTERED_HOST: u64 = u64::MAX;

#[derive(Debug)]
pub struct CudaBackend {
    context: Arc<CudaContext>,
    page_locks: Arc<PageLockTable>,
    stats: StatCounters,
}

impl CudaBackend {
    pub fn new(ordinal: usize, page_locks: Arc<PageLockTable>) -> Result<Self> {
        let context = CudaContext::new(ordinal).context(CudaSnafu)?;
        Ok(Self { context, page_locks, stats: StatCounters::default() })
    }

    fn bind(&self) -> Result<()> {
        self.context.bind_to_thread().context(CudaSnafu)
    }

    fn driver_knows_pinned(&self, ptr: DevicePtr) -> bool {
        let mut kind = 0u32;
        // SAFETY: MEMORY_TYPE writes a single CUmemorytype into `kind`.
        let status = unsafe {
            sys::cuPointerGetAttribute(
                (&mut kind as *mut u32).cast::<c_void>(),
                CUpointer_attribute::CU_POINTER_ATTRIBUTE_MEMORY_TYPE,
                ptr.addr() as CUdeviceptr,
            )
        };
        status.result().is_ok() && kind == CUmemorytype::CU_MEMORYTYPE_HOST as u32
    }

    fn map_host(&self, ptr: DevicePtr, size: usize) -> Result<(DevicePtr, u64)> {
        let registered = if self.driver_knows_pinned(ptr) {
            0
        } else {
            // SAFETY: ptr addresses `size` bytes of live page-aligned host memory.
            unsafe { sys::cuMemHostRegister_v2(ptr.as_mut_ptr(), size, sys::CU_MEMHOSTREGISTER_DEVICEMAP) }
                .result()
                .context(CudaSnafu)?;
            REGISTERED_HOST
        };

        let mut device_ptr: CUdeviceptr = 0;
        // SAFETY: ptr is pinned and known to the driver at this point.
        unsafe { sys::cuMemHostGetDevicePointer_v2(&mut device_ptr, ptr.as_mut_ptr(), 0) }
            .result()
            .context(CudaSnafu)?;

        Ok((DevicePtr::new(device_ptr as usize), registered))
    }
}

impl Backend for CudaBackend {
    fn device(&self) -> Device {
        Device::Cuda
    }

    fn name(&self) -> &str {
        "CUDA"
    }

    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<Allocation> {
        self.bind()?;

        // SAFETY: the context is bound to this thread.
        let (ptr, kind) = unsafe {
            if options.host_accessible {
                let ptr = result::malloc_managed(size, CUmemAttach_flags::CU_MEM_ATTACH_GLOBAL).context(CudaSnafu)?;
                (ptr, MemoryKind::Managed)
            } else {
                (result::malloc_sync(size).context(CudaSnafu)?, MemoryKind::DevicePrivate)
            }
        };

        if options.zero_init {
            // SAFETY: ptr was just allocated with `size` bytes.
            unsafe { result::memset_d8_sync(ptr, 0, size) }.context(CudaSnafu)?;
        }

        self.stats.allocated();
        Ok(Allocation { ptr: DevicePtr::new(ptr as usize), size, kind })
    }

    fn free(&self, allocation: Allocation) {
        let freed = self.bind().and_then(|()| {
            // SAFETY: the allocation came from alloc and is freed exactly once.
            unsafe { result::free_sync(allocation.ptr.addr() as CUdeviceptr) }.context(CudaSnafu)
        });
        if let Err(e) = freed {
            error!(ptr = %allocation.ptr, error = %e, "cuMemFree failed");
        }
        self.stats.freed();
    }

    fn import(&self, handle: ExportHandle) -> Result<ExternalMemory> {
        self.bind()?;

        let memory = match handle {
            ExportHandle::OpaqueFd { fd, size } => {
                // SAFETY: the exporter keeps the allocation behind `fd` alive until release.
                let external = unsafe { external_memory::import_external_memory_opaque_fd(fd, size as u64) }
                    .context(CudaSnafu)?;
                // SAFETY: `external` is a live import covering `size` bytes.
                let mapped = unsafe { external_memory::get_mapped_buffer(external, 0, size as u64) };
                let ptr = match mapped {
                    Ok(ptr) => ptr,
                    Err(source) => {
                        // SAFETY: no mapping was created from `external`.
                        let _ = unsafe { external_memory::destroy_external_memory(external) };
                        return Err(source).context(CudaSnafu);
                    }
                };
                trace!(fd, size, "[CUDA:BUFFER] imported external memory");
                ExternalMemory { ptr: DevicePtr::new(ptr as usize), size, handle, native: external as usize as u64 }
            }
            ExportHandle::HostPointer { ptr, size } => {
                let (device_ptr, native) = self.map_host(ptr, size)?;
                trace!(host = %ptr, device = %device_ptr, size, "[CUDA:BUFFER] mapped pinned host memory");
                ExternalMemory { ptr: device_ptr, size, handle, native }
            }
        };

        self.stats.imported();
        Ok(memory)
    }

    fn release(&self, memory: ExternalMemory) {
        let status = match memory.handle {
            // SAFETY: native holds the CUexternalMemory created by import.
            ExportHandle::OpaqueFd { .. } => unsafe {
                external_memory::destroy_external_memory(memory.native as usize as sys::CUexternalMemory)
            },
            ExportHandle::HostPointer { ptr, .. } if memory.native == REGISTERED_HOST => {
                // SAFETY: ptr was registered by map_host.
                unsafe { sys::cuMemHostUnregister(ptr.as_mut_ptr()) }.result()
            }
            ExportHandle::HostPointer { .. } => Ok(()),
        };
        if let Err(e) = status {
            error!(ptr = %memory.ptr, error = %e, "failed to release CUDA import");
        }
        self.stats.released();
    }

    fn host_memory_kind(&self, ptr: DevicePtr) -> Result<MemoryKind> {
        self.bind()?;
        let pinned = self.page_locks.is_locked(ptr) || self.driver_knows_pinned(ptr);
        Ok(if pinned { MemoryKind::Pinned } else { MemoryKind::Pageable })
    }

    unsafe fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.bind()?;
        // SAFETY: caller guarantees dst addresses src.len() bytes.
        unsafe { result::memcpy_htod_sync(dst.addr() as CUdeviceptr, src) }.context(CudaSnafu)
    }

    unsafe fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        self.bind()?;
        // SAFETY: caller guarantees src addresses dst.len() bytes.
        unsafe { result::memcpy_dtoh_sync(dst, src.addr() as CUdeviceptr) }.context(CudaSnafu)
    }

    fn synchronize(&self) -> Result<()> {
        self.context.synchronize().context(CudaSnafu)
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}

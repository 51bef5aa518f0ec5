//! Physical allocation on one device.
//!
//! A [`Buffer`] is either empty (zero-sized), owns a native allocation, or
//! aliases memory owned by a buffer on another device. Ownership is carried by
//! the [`Memory`] variant, so an imported buffer can never free foreign memory.

use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use jetstream_dtype::Device;
use snafu::ensure;
use tracing::{error, trace};

use crate::backend::{Allocation, Backend, BufferOptions, DevicePtr, ExportHandle, ExternalMemory, MemoryKind};
use crate::capability::page_aligned_size;
use crate::context::Context;
use crate::error::{
    ExportUnsupportedSnafu, InvalidViewSnafu, NotPinnedSnafu, OverlappingCopySnafu, Result, SizeMismatchSnafu,
};
use crate::import::ImportPath;

/// Who can touch a buffer's memory directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Residency {
    /// The buffer's device can operate on the memory directly.
    pub device_native: bool,
    /// The memory physically lives in host RAM.
    pub host_native: bool,
    /// The host can read and write the memory through a pointer.
    pub host_accessible: bool,
}

impl Residency {
    pub const NONE: Self = Self { device_native: false, host_native: false, host_accessible: false };
    pub const DEVICE_PRIVATE: Self = Self { device_native: true, host_native: false, host_accessible: false };
    pub const UNIFIED: Self = Self { device_native: true, host_native: true, host_accessible: true };
}

#[derive(Debug)]
enum Memory {
    Empty,
    Owned(Allocation),
    Imported { from: Device, path: ImportPath, external: Option<ExternalMemory> },
}

/// One allocation, or alias, on one device.
///
/// Not `Send`: buffers belong to the thread that drives their storage.
#[derive(Debug)]
pub struct Buffer {
    device: Device,
    /// Address in the device's address space.
    ptr: DevicePtr,
    /// Host address of the same memory, when the host can reach it.
    host_ptr: Option<DevicePtr>,
    size: usize,
    residency: Residency,
    memory: Memory,
    backend: Option<Arc<dyn Backend>>,
    _marker: PhantomData<Rc<()>>,
}

/// Copyable snapshot of a buffer's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub device: Device,
    pub ptr: DevicePtr,
    pub host_ptr: Option<DevicePtr>,
    pub size: usize,
    pub residency: Residency,
    pub owns_data: bool,
    pub external_memory_device: Option<Device>,
    pub import_path: Option<ImportPath>,
}

impl Buffer {
    /// Zero-sized buffer. Holds no memory.
    pub fn empty(device: Device) -> Self {
        Self {
            device,
            ptr: DevicePtr::NULL,
            host_ptr: None,
            size: 0,
            residency: Residency::NONE,
            memory: Memory::Empty,
            backend: None,
            _marker: PhantomData,
        }
    }

    /// Allocate `size` bytes on `device`.
    ///
    /// Unified devices, the CPU and requests with `host_accessible` get
    /// host-visible memory. Everything else is device private. The native
    /// allocation is rounded up to the device's page size.
    pub fn allocate(ctx: &Context, device: Device, size: usize, options: &BufferOptions) -> Result<Self> {
        if size == 0 {
            return Ok(Self::empty(device));
        }

        let backend = ctx.backend(device)?.clone();
        let caps = ctx.capabilities();

        let host = options.host_accessible || caps.has_unified_memory(device) || device.is_host();
        let pinned = device.is_host() && (options.pinned || caps.get(Device::Cpu).pinned_host);
        let aligned = page_aligned_size(size, caps.page_size(device));
        let native = BufferOptions { zero_init: options.zero_init, host_accessible: host, pinned };

        let allocation = backend.alloc(aligned, &native).inspect_err(|e| {
            error!(%device, size = aligned, error = %e, "allocation failed");
        })?;
        trace!(%device, ptr = %allocation.ptr, size = aligned, kind = ?allocation.kind, "allocated buffer");

        let host_visible = allocation.kind.is_host_visible();
        Ok(Self {
            device,
            ptr: allocation.ptr,
            host_ptr: host_visible.then_some(allocation.ptr),
            size,
            residency: if host_visible { Residency::UNIFIED } else { Residency::DEVICE_PRIVATE },
            memory: Memory::Owned(allocation),
            backend: Some(backend),
            _marker: PhantomData,
        })
    }

    /// Alias `source`'s memory on `target` without copying.
    ///
    /// Fails with a distinct error when the target is unavailable, the source
    /// cannot export, no sharing path exists, or host memory is not pinned.
    /// The caller must keep `source` alive for as long as the result lives.
    pub(crate) fn import(ctx: &Context, target: Device, source: &Buffer) -> Result<Self> {
        let backend = ctx.backend(target)?.clone();
        let caps = ctx.capabilities();
        let from = source.device;

        if source.is_empty() {
            return Ok(Self::empty(target));
        }

        let Some(path) = ImportPath::resolve(caps, source, target) else {
            let e = ImportPath::rejection(caps, source, target);
            trace!(source = %from, %target, error = %e, "no import path");
            return Err(e);
        };

        let (ptr, host_ptr, external) = match path {
            ImportPath::HostMapping => (source.host_ptr.unwrap_or(source.ptr), source.host_ptr, None),
            ImportPath::ExternalHandle => {
                let external = backend.import(source.export(target)?)?;
                (external.ptr, None, Some(external))
            }
            ImportPath::PinnedHost => {
                let kind = backend.host_memory_kind(source.ptr)?;
                ensure!(
                    kind == MemoryKind::Pinned,
                    NotPinnedSnafu { source_device: from, target, ptr: source.ptr.addr() }
                );
                let external = backend.import(source.export(target)?)?;
                (external.ptr, Some(source.ptr), Some(external))
            }
            ImportPath::HostPointer => {
                let external = backend.import(source.export(target)?)?;
                (external.ptr, Some(source.ptr), Some(external))
            }
        };

        trace!(source = %from, %target, ?path, %ptr, size = source.size, "imported buffer");
        Ok(Self {
            device: target,
            ptr,
            host_ptr,
            size: source.size,
            residency: path.residency(&source.residency),
            memory: Memory::Imported { from, path, external },
            backend: Some(backend),
            _marker: PhantomData,
        })
    }

    fn export(&self, target: Device) -> Result<ExportHandle> {
        match (&self.memory, &self.backend) {
            (Memory::Owned(allocation), Some(backend)) => backend.export(allocation),
            _ => ExportUnsupportedSnafu { source_device: self.device, target }.fail(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Device address of the data.
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Host address of the data, for host-accessible buffers.
    pub fn host_ptr(&self) -> Option<DevicePtr> {
        self.host_ptr
    }

    /// Logical size in bytes. The native allocation may be larger.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.memory, Memory::Empty)
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Whether dropping this buffer frees its memory.
    pub fn owns_data(&self) -> bool {
        matches!(self.memory, Memory::Owned(_))
    }

    /// Device whose memory this buffer aliases.
    pub fn external_memory_device(&self) -> Option<Device> {
        match self.memory {
            Memory::Imported { from, .. } => Some(from),
            _ => None,
        }
    }

    pub fn import_path(&self) -> Option<ImportPath> {
        match self.memory {
            Memory::Imported { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            device: self.device,
            ptr: self.ptr,
            host_ptr: self.host_ptr,
            size: self.size,
            residency: self.residency,
            owns_data: self.owns_data(),
            external_memory_device: self.external_memory_device(),
            import_path: self.import_path(),
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        ensure!(
            offset.checked_add(len).is_some_and(|end| end <= self.size),
            InvalidViewSnafu { offset, size: len, buffer_size: self.size }
        );
        Ok(())
    }

    /// Copy host bytes into the buffer at byte `offset`.
    pub fn copyin(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        if src.is_empty() {
            return Ok(());
        }

        match (self.host_ptr, &self.backend) {
            (Some(host), _) => {
                // SAFETY: range checked above, host pointers stay valid while self lives.
                unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), host.offset(offset).as_mut_ptr::<u8>(), src.len()) };
                Ok(())
            }
            // SAFETY: range checked above, ptr belongs to this backend.
            (None, Some(backend)) => unsafe { backend.copy_to_device(self.ptr.offset(offset), src) },
            (None, None) => Ok(()),
        }
    }

    /// Copy bytes at `offset` out of the buffer.
    pub fn copyout(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }

        match (self.host_ptr, &self.backend) {
            (Some(host), _) => {
                // SAFETY: range checked above, host pointers stay valid while self lives.
                unsafe { std::ptr::copy_nonoverlapping(host.offset(offset).as_ptr::<u8>(), dst.as_mut_ptr(), dst.len()) };
                Ok(())
            }
            // SAFETY: range checked above, ptr belongs to this backend.
            (None, Some(backend)) => unsafe { backend.copy_to_host(self.ptr.offset(offset), dst) },
            (None, None) => Ok(()),
        }
    }

    /// Whether both buffers view the same memory.
    pub fn aliases(&self, other: &Buffer) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let host = matches!((self.host_ptr, other.host_ptr), (Some(a), Some(b)) if a == b);
        host || (self.device == other.device && self.ptr == other.ptr)
    }

    /// Copy the whole contents of `src` into this buffer, staging through the host.
    pub fn copy_from(&mut self, src: &Buffer) -> Result<()> {
        let expected = self.size;
        let actual = src.size;
        ensure!(expected == actual, SizeMismatchSnafu { expected, actual });
        ensure!(!self.aliases(src), OverlappingCopySnafu { source_device: src.device, target: self.device });

        if let Some(host) = src.host_ptr {
            // SAFETY: src is alive and host-visible for `size` bytes.
            let bytes = unsafe { std::slice::from_raw_parts(host.as_ptr::<u8>(), src.size) };
            return self.copyin(0, bytes);
        }

        let mut staging = vec![0u8; src.size];
        src.copyout(0, &mut staging)?;
        self.copyin(0, &staging)
    }

    /// Block until the buffer's device finished all submitted work.
    pub fn synchronize(&self) -> Result<()> {
        match &self.backend {
            Some(backend) => backend.synchronize(),
            None => Ok(()),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else { return };

        match std::mem::replace(&mut self.memory, Memory::Empty) {
            Memory::Owned(allocation) => {
                trace!(device = %self.device, ptr = %allocation.ptr, size = allocation.size, "freeing buffer");
                backend.free(allocation);
            }
            Memory::Imported { from, path, external: Some(external) } => {
                trace!(device = %self.device, source = %from, ?path, ptr = %external.ptr, "releasing import");
                backend.release(external);
            }
            Memory::Imported { .. } | Memory::Empty => {}
        }
    }
}

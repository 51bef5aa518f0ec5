//! Native backend seam.
//!
//! A [`Backend`] is the device layer this crate talks to: it allocates and
//! frees native memory, exports allocations as shareable handles, maps foreign
//! handles in and moves bytes across the host boundary. Everything above it
//! (buffers, storages, tensors) is device-agnostic.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use jetstream_dtype::Device;

use crate::error::{HandleAcquisitionSnafu, Result};

/// Address in the owning device's address space.
///
/// For host-visible memory this is a dereferenceable host pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(usize);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_host<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn addr(&self) -> usize {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Options for buffer allocation.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Whether to zero-initialize the buffer.
    pub zero_init: bool,
    /// Allocate memory the host can read and write directly (managed/shared memory).
    pub host_accessible: bool,
    /// Page-lock host memory so accelerators can DMA from it. CPU only.
    pub pinned: bool,
}

/// Physical kind of a native allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Only the owning accelerator can touch it.
    DevicePrivate,
    /// Host and device visible (CUDA managed, Metal shared storage).
    Managed,
    /// Ordinary pageable host memory.
    Pageable,
    /// Page-locked host memory.
    Pinned,
}

impl MemoryKind {
    pub const fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryKind::DevicePrivate)
    }
}

/// A native allocation owned by whoever holds this value.
///
/// Must be handed back to the backend that produced it through [`Backend::free`].
#[derive(Debug)]
pub struct Allocation {
    pub ptr: DevicePtr,
    /// Allocated size in bytes, page aligned.
    pub size: usize,
    pub kind: MemoryKind,
}

/// A shareable handle to an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportHandle {
    /// POSIX file-descriptor style handle (Vulkan `VK_EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD_BIT`).
    OpaqueFd { fd: i32, size: usize },
    /// Page-aligned host memory that an importer may wrap without copying.
    HostPointer { ptr: DevicePtr, size: usize },
}

impl ExportHandle {
    pub fn size(&self) -> usize {
        match self {
            ExportHandle::OpaqueFd { size, .. } | ExportHandle::HostPointer { size, .. } => *size,
        }
    }
}

/// Foreign memory mapped into a backend's address space.
///
/// Does not own the memory it points to. Release it with [`Backend::release`]
/// before the exporting allocation is freed.
#[derive(Debug)]
pub struct ExternalMemory {
    pub ptr: DevicePtr,
    pub size: usize,
    /// The handle the mapping was created from, kept for teardown.
    pub handle: ExportHandle,
    /// Backend specific import object (e.g. a `CUexternalMemory`).
    pub native: u64,
}

/// Snapshot of a backend's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub allocations: usize,
    pub frees: usize,
    pub exports: usize,
    pub imports: usize,
    pub releases: usize,
    /// Allocations freed while an importer still mapped them.
    pub premature_frees: usize,
}

impl BackendStats {
    pub fn live_allocations(&self) -> usize {
        self.allocations - self.frees
    }

    pub fn live_imports(&self) -> usize {
        self.imports - self.releases
    }
}

/// Lock-free counters backing [`BackendStats`].
#[derive(Debug, Default)]
pub struct StatCounters {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    exports: AtomicUsize,
    imports: AtomicUsize,
    releases: AtomicUsize,
    premature_frees: AtomicUsize,
}

impl StatCounters {
    pub fn allocated(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn freed(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exported(&self) {
        self.exports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn imported(&self) {
        self.imports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn released(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn freed_prematurely(&self) {
        self.premature_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BackendStats {
        BackendStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            exports: self.exports.load(Ordering::Relaxed),
            imports: self.imports.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            premature_frees: self.premature_frees.load(Ordering::Relaxed),
        }
    }
}

pub trait Backend: Send + Sync + fmt::Debug {
    fn device(&self) -> Device;

    fn name(&self) -> &str;

    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<Allocation>;

    fn free(&self, allocation: Allocation);

    /// Produce a handle another backend can import.
    fn export(&self, _allocation: &Allocation) -> Result<ExportHandle> {
        HandleAcquisitionSnafu { device: self.device(), reason: format!("{} cannot export memory", self.name()) }.fail()
    }

    /// Map a foreign handle into this backend's address space.
    fn import(&self, handle: ExportHandle) -> Result<ExternalMemory> {
        HandleAcquisitionSnafu { device: self.device(), reason: format!("cannot import {handle:?}") }.fail()
    }

    /// Tear down an import mapping. Never frees the underlying memory.
    fn release(&self, _memory: ExternalMemory) {}

    /// How this backend sees a host pointer (pinned or pageable).
    fn host_memory_kind(&self, _ptr: DevicePtr) -> Result<MemoryKind> {
        Ok(MemoryKind::Pageable)
    }

    /// Copy host bytes into device memory at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must address at least `src.len()` bytes of memory owned or mapped by this backend.
    unsafe fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Copy device memory at `src` into host bytes.
    ///
    /// # Safety
    ///
    /// `src` must address at least `dst.len()` bytes of memory owned or mapped by this backend.
    unsafe fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()>;

    /// Block until all submitted work completed.
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> BackendStats;
}

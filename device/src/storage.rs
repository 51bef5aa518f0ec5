//! Per-tensor residency set.
//!
//! A [`Storage`] owns the root buffer allocated on the device the data was
//! created on, plus every buffer later created for other devices. Buffers are
//! added on demand and live until the storage is dropped; there is no eviction.

use std::cell::{Cell, RefCell};

use enumset::EnumSet;
use jetstream_dtype::Device;
use tracing::{debug, trace};

use crate::backend::BufferOptions;
use crate::buffer::{Buffer, BufferInfo};
use crate::context::Context;
use crate::error::{Result, Severity};
use crate::import::ImportPath;

#[derive(Debug)]
struct Entry {
    buffer: Buffer,
    /// Device the contents were copied from, for copy-backed residencies.
    copied_from: Option<Device>,
    /// Entry this one aliases, for imported residencies.
    imported_from: Option<usize>,
}

/// Copy-backed entry whose memory `index` shares, if any.
///
/// Aliases of a copy are as stale as the copy itself.
fn copy_backing(entries: &[Entry], mut index: usize) -> Option<usize> {
    loop {
        let entry = &entries[index];
        if entry.copied_from.is_some() {
            return Some(index);
        }
        index = entry.imported_from?;
    }
}

/// How a residency came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Root,
    Imported(ImportPath),
    Copied { from: Device },
}

#[derive(Debug)]
pub struct Storage {
    ctx: Context,
    root_device: Device,
    size_bytes: usize,
    compatible: Cell<EnumSet<Device>>,
    /// Root first. Dropped in reverse so aliases go before what they alias.
    entries: RefCell<Vec<Entry>>,
}

impl Storage {
    /// Allocate the root buffer on `device`.
    pub fn new(ctx: &Context, device: Device, size_bytes: usize, options: &BufferOptions) -> Result<Self> {
        let root = Buffer::allocate(ctx, device, size_bytes, options)?;
        let storage = Self {
            ctx: ctx.clone(),
            root_device: device,
            size_bytes,
            compatible: Cell::new(EnumSet::only(device)),
            entries: RefCell::new(vec![Entry { buffer: root, copied_from: None, imported_from: None }]),
        };

        // Host-visible accelerator memory is usable from the CPU right away.
        if device != Device::Cpu && storage.with_root(|root| root.residency().host_accessible) {
            storage.try_import_on(Device::Cpu)?;
        }

        Ok(storage)
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn root_device(&self) -> Device {
        self.root_device
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Devices with a valid buffer, root included.
    pub fn compatible_devices(&self) -> EnumSet<Device> {
        self.compatible.get()
    }

    pub fn is_compatible(&self, device: Device) -> bool {
        self.compatible.get().contains(device)
    }

    fn register(&self, buffer: Buffer, copied_from: Option<Device>, imported_from: Option<usize>) {
        let device = buffer.device();
        self.entries.borrow_mut().push(Entry { buffer, copied_from, imported_from });
        self.compatible.set(self.compatible.get() | device);
    }

    fn position(&self, device: Device) -> Option<usize> {
        self.entries.borrow().iter().position(|entry| entry.buffer.device() == device)
    }

    fn with_root<R>(&self, f: impl FnOnce(&Buffer) -> R) -> R {
        f(&self.entries.borrow()[0].buffer)
    }

    /// Make `device` compatible without allocating on it.
    ///
    /// Returns `false` when no buffer of this storage can be aliased on
    /// `device`. A refused import, such as unpinned host memory offered to
    /// CUDA, is returned as `Err` and never turned into a copy; retry with
    /// [`Storage::copy_on`] to copy instead.
    pub fn try_import_on(&self, device: Device) -> Result<bool> {
        if self.is_compatible(device) {
            return Ok(true);
        }
        self.ctx.backend(device)?;

        if self.size_bytes == 0 {
            self.register(Buffer::empty(device), None, None);
            return Ok(true);
        }

        let caps = self.ctx.capabilities();
        let imported = {
            let entries = self.entries.borrow();
            let mut imported = None;
            let candidates = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| ImportPath::resolve(caps, &e.buffer, device).is_some());
            for (index, entry) in candidates {
                match Buffer::import(&self.ctx, device, &entry.buffer) {
                    Ok(buffer) => {
                        imported = Some((buffer, index));
                        break;
                    }
                    Err(e) if e.severity() == Severity::Recoverable => {
                        debug!(source = %entry.buffer.device(), target = %device, error = %e, "import rejected")
                    }
                    Err(e) => return Err(e),
                }
            }
            imported
        };

        match imported {
            Some((buffer, index)) => {
                self.register(buffer, None, Some(index));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Make `device` compatible, copying when no import path exists.
    ///
    /// Idempotent: once a device is compatible its buffer is reused. A
    /// refused import is an error, not a reason to copy.
    pub fn ensure_on(&self, device: Device) -> Result<()> {
        if self.try_import_on(device)? {
            return Ok(());
        }
        self.copy_on(device)
    }

    /// Make `device` compatible by copying into a fresh buffer on it, without
    /// attempting an import.
    pub fn copy_on(&self, device: Device) -> Result<()> {
        if self.is_compatible(device) {
            return Ok(());
        }
        self.ctx.backend(device)?;

        if self.size_bytes == 0 {
            self.register(Buffer::empty(device), None, None);
            return Ok(());
        }

        let source = self.copy_source();
        let mut buffer = Buffer::allocate(&self.ctx, device, self.size_bytes, &BufferOptions::default())?;
        let from = {
            let entries = self.entries.borrow();
            let source = &entries[source].buffer;
            buffer.copy_from(source)?;
            source.device()
        };
        debug!(source = %from, target = %device, size = self.size_bytes, "copied storage");

        let host_accessible = buffer.residency().host_accessible;
        self.register(buffer, Some(from), None);

        if host_accessible && device != Device::Cpu {
            self.try_import_on(Device::Cpu)?;
        }
        Ok(())
    }

    /// Entry to copy from: the first one holding root data that the host can
    /// read, or the root itself. Never a copy or an alias of one.
    fn copy_source(&self) -> usize {
        let entries = self.entries.borrow();
        (0..entries.len())
            .find(|&index| {
                entries[index].buffer.residency().host_accessible && copy_backing(&entries, index).is_none()
            })
            .unwrap_or(0)
    }

    /// Re-copy a copy-backed residency from the root data.
    ///
    /// Refreshing an alias of a copy refreshes the copy it aliases. Returns
    /// `false` for aliases of the root and for devices that are not
    /// compatible.
    pub fn refresh(&self, device: Device) -> Result<bool> {
        let Some(position) = self.position(device) else { return Ok(false) };
        let Some(target) = copy_backing(&self.entries.borrow(), position) else { return Ok(false) };

        let source = self.copy_source();
        let mut entries = self.entries.borrow_mut();
        let (source, target) = if source < target {
            let (head, tail) = entries.split_at_mut(target);
            (&head[source], &mut tail[0])
        } else {
            let (head, tail) = entries.split_at_mut(source);
            (&tail[0], &mut head[target])
        };

        target.buffer.copy_from(&source.buffer)?;
        target.copied_from = Some(source.buffer.device());
        trace!(source = %source.buffer.device(), target = %target.buffer.device(), %device, "refreshed copy");
        Ok(true)
    }

    pub fn buffer_info(&self, device: Device) -> Option<BufferInfo> {
        self.with_buffer(device, Buffer::info)
    }

    pub fn origin(&self, device: Device) -> Option<Origin> {
        let entries = self.entries.borrow();
        let (index, entry) = entries.iter().enumerate().find(|(_, e)| e.buffer.device() == device)?;
        Some(match (index, entry.copied_from, entry.buffer.import_path()) {
            (0, ..) => Origin::Root,
            (_, Some(from), _) => Origin::Copied { from },
            (_, None, Some(path)) => Origin::Imported(path),
            (_, None, None) => Origin::Root,
        })
    }

    /// Run `f` on the buffer for `device`, if it is compatible.
    pub fn with_buffer<R>(&self, device: Device, f: impl FnOnce(&Buffer) -> R) -> Option<R> {
        let entries = self.entries.borrow();
        entries.iter().find(|e| e.buffer.device() == device).map(|e| f(&e.buffer))
    }

    pub fn with_buffer_mut<R>(&self, device: Device, f: impl FnOnce(&mut Buffer) -> R) -> Option<R> {
        let mut entries = self.entries.borrow_mut();
        entries.iter_mut().find(|e| e.buffer.device() == device).map(|e| f(&mut e.buffer))
    }

    /// Snapshots of every residency in creation order.
    pub fn residencies(&self) -> Vec<BufferInfo> {
        self.entries.borrow().iter().map(|e| e.buffer.info()).collect()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let entries = self.entries.get_mut();
        trace!(root = %self.root_device, buffers = entries.len(), "dropping storage");
        while let Some(entry) = entries.pop() {
            drop(entry);
        }
    }
}

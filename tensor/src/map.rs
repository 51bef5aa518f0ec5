//! Mapping tensors onto other devices.
//!
//! Mapping reuses an existing residency when the target is already compatible,
//! aliases the memory when an import path exists, and only then copies into a
//! fresh buffer on the target. An import that exists but is refused (host
//! memory that is not pinned) is reported, and [`copy_on`] is the explicit way
//! to copy instead.

use jetstream_device::Device;
use snafu::ResultExt;
use tracing::trace;

use crate::Tensor;
use crate::error::{DeviceSnafu, Result};
use jetstream_dtype::HasDType;

/// View of `tensor` valid on `device`.
///
/// Repeated calls for the same storage and device return views of the same
/// buffer. Fails with a precondition error when an import path exists but the
/// source memory does not allow it.
pub fn map_on<T: HasDType>(device: Device, tensor: &Tensor<T>) -> Result<Tensor<T>> {
    if tensor.device() == device {
        return Ok(tensor.clone());
    }

    let storage = tensor.storage();
    if !storage.is_compatible(device) {
        trace!(from = %tensor.device(), to = %device, size = storage.size_bytes(), "mapping tensor");
    }
    storage.ensure_on(device).context(DeviceSnafu)?;
    Ok(tensor.view_on(device))
}

/// Like [`map_on`], but never allocates on `device`.
///
/// Returns `None` when `device` is not compatible and no import path exists.
pub fn try_map_on<T: HasDType>(device: Device, tensor: &Tensor<T>) -> Result<Option<Tensor<T>>> {
    let imported = tensor.storage().try_import_on(device).context(DeviceSnafu)?;
    Ok(imported.then(|| tensor.view_on(device)))
}

/// View of `tensor` on `device`, copying when `device` is not compatible yet.
pub fn copy_on<T: HasDType>(device: Device, tensor: &Tensor<T>) -> Result<Tensor<T>> {
    if tensor.device() == device {
        return Ok(tensor.clone());
    }
    tensor.storage().copy_on(device).context(DeviceSnafu)?;
    Ok(tensor.view_on(device))
}

pub trait MapOn: Sized {
    fn map_on(&self, device: Device) -> Result<Self>;
}

impl<T: HasDType> MapOn for Tensor<T> {
    fn map_on(&self, device: Device) -> Result<Self> {
        map_on(device, self)
    }
}

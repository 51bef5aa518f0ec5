//! Handing tensors to a renderer.

use jetstream_device::{Device, DevicePtr, Severity};
use jetstream_dtype::HasDType;
use tracing::debug;

use crate::error::Result;
use crate::{Tensor, map_on, try_map_on};

/// Pointer a renderer binds, and how it must treat it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimalStorage {
    pub ptr: DevicePtr,
    /// The renderer can bind `ptr` directly. Otherwise `ptr` is host staging
    /// memory the renderer uploads itself.
    pub zero_copy: bool,
    pub element_size: usize,
    pub element_count: usize,
    /// Device `ptr` belongs to.
    pub device: Device,
}

/// Best pointer for binding `tensor` on `render_device`.
///
/// Never allocates on the render device: either the tensor is already
/// resident there or can be aliased there, or the host copy is returned for
/// upload.
pub fn convert_to_optimal_storage<T: HasDType>(render_device: Device, tensor: &Tensor<T>) -> Result<OptimalStorage> {
    let element_size = T::DTYPE.bytes();
    let element_count = tensor.size();

    let aliased = match try_map_on(render_device, tensor) {
        Ok(aliased) => aliased,
        Err(e) if e.severity() == Severity::Precondition => {
            debug!(%render_device, error = %e, "import refused");
            None
        }
        Err(e) => return Err(e),
    };

    if let Some(optimal) = aliased
        && let Some(info) = optimal.buffer_info()
    {
        if info.residency.device_native {
            return Ok(OptimalStorage { ptr: info.ptr, zero_copy: true, element_size, element_count, device: render_device });
        }
        if let Some(host) = info.host_ptr {
            return Ok(OptimalStorage { ptr: host, zero_copy: false, element_size, element_count, device: Device::Cpu });
        }
    }

    debug!(%render_device, root = %tensor.root_device(), "no zero-copy path, staging through host");
    let host = map_on(Device::Cpu, tensor)?;
    let ptr = host.buffer_info().and_then(|info| info.host_ptr).unwrap_or(DevicePtr::NULL);
    Ok(OptimalStorage { ptr, zero_copy: false, element_size, element_count, device: Device::Cpu })
}

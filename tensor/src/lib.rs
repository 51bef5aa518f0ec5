use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use enumset::EnumSet;
use smallvec::SmallVec;
use snafu::{OptionExt, ResultExt, ensure};

use jetstream_device::{BufferInfo, BufferOptions, Context, Device, DevicePtr, Storage};
use jetstream_dtype::{DType, HasDType};

pub mod error;
use error::*;

pub mod map;
pub mod render;
pub mod shape_ops;

pub use map::{MapOn, copy_on, map_on, try_map_on};
pub use render::{OptimalStorage, convert_to_optimal_storage};

pub type Shape = SmallVec<[usize; 4]>;

/// Typed, shaped view of a [`Storage`] on one device.
///
/// Views are cheap to clone and share their storage: a tensor mapped on another
/// device, or reshaped, sees the same residency set. The storage and every
/// buffer in it are freed when the last view is dropped.
///
/// # Examples
///
/// ```
/// # use jetstream_device::{Context, Device};
/// # use jetstream_tensor::Tensor;
/// let ctx = Context::default();
/// let mut grid = Tensor::<f32>::new(&ctx, Device::Cpu, &[4, 6, 3]).unwrap();
/// grid.set(&[1, 0, 0], 2.0).unwrap();
/// assert_eq!(grid.get(&[1, 0, 0]).unwrap(), 2.0);
/// assert_eq!(grid.size_bytes(), 4 * 6 * 3 * 4);
/// ```
pub struct Tensor<T: HasDType> {
    storage: Rc<Storage>,
    device: Device,
    shape: Shape,
    strides: Shape,
    _marker: PhantomData<T>,
}

impl<T: HasDType> Clone for Tensor<T> {
    fn clone(&self) -> Self {
        Self {
            storage: Rc::clone(&self.storage),
            device: self.device,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: HasDType> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &T::DTYPE)
            .field("device", &self.device)
            .field("shape", &self.shape)
            .field("compatible", &self.storage.compatible_devices())
            .finish()
    }
}

/// Row-major strides in elements.
pub(crate) fn contiguous_strides(shape: &[usize]) -> Shape {
    let mut strides: Shape = SmallVec::from_elem(1, shape.len());
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Element count of a shape. Rank 0 holds nothing.
pub(crate) fn element_count(shape: &[usize]) -> usize {
    if shape.is_empty() { 0 } else { shape.iter().product() }
}

impl<T: HasDType> Tensor<T> {
    /// Zero-initialized tensor allocated on `device`.
    pub fn new(ctx: &Context, device: Device, shape: &[usize]) -> Result<Self> {
        Self::with_options(ctx, device, shape, &BufferOptions { zero_init: true, ..Default::default() })
    }

    pub fn with_options(ctx: &Context, device: Device, shape: &[usize], options: &BufferOptions) -> Result<Self> {
        let size_bytes = element_count(shape) * T::DTYPE.bytes();
        let storage = Storage::new(ctx, device, size_bytes, options).context(DeviceSnafu)?;
        Ok(Self::from_storage(Rc::new(storage), device, shape))
    }

    /// Tensor on `device` holding a copy of `data`.
    pub fn from_slice(ctx: &Context, device: Device, shape: &[usize], data: &[T]) -> Result<Self> {
        let expected = element_count(shape);
        ensure!(data.len() == expected, LengthMismatchSnafu { expected, got: data.len() });

        let mut tensor = Self::with_options(ctx, device, shape, &BufferOptions::default())?;
        tensor.copy_from_slice(data)?;
        Ok(tensor)
    }

    pub(crate) fn from_storage(storage: Rc<Storage>, device: Device, shape: &[usize]) -> Self {
        Self {
            storage,
            device,
            shape: SmallVec::from_slice(shape),
            strides: contiguous_strides(shape),
            _marker: PhantomData,
        }
    }

    /// The same view on another device of the same storage.
    pub(crate) fn view_on(&self, device: Device) -> Self {
        Self { device, ..self.clone() }
    }

    pub fn storage(&self) -> &Rc<Storage> {
        &self.storage
    }

    pub fn context(&self) -> &Context {
        self.storage.context()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn size_bytes(&self) -> usize {
        self.size() * T::DTYPE.bytes()
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    /// Device this view addresses.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Device the data was originally allocated on.
    pub fn root_device(&self) -> Device {
        self.storage.root_device()
    }

    pub fn compatible_devices(&self) -> EnumSet<Device> {
        self.storage.compatible_devices()
    }

    pub fn buffer_info(&self) -> Option<BufferInfo> {
        self.storage.buffer_info(self.device)
    }

    pub fn device_native(&self) -> bool {
        self.buffer_info().is_some_and(|info| info.residency.device_native)
    }

    pub fn host_native(&self) -> bool {
        self.buffer_info().is_some_and(|info| info.residency.host_native)
    }

    pub fn host_accessible(&self) -> bool {
        self.buffer_info().is_some_and(|info| info.residency.host_accessible)
    }

    pub fn owns_data(&self) -> bool {
        self.buffer_info().is_some_and(|info| info.owns_data)
    }

    pub fn external_memory_device(&self) -> Option<Device> {
        self.buffer_info().and_then(|info| info.external_memory_device)
    }

    /// Device address of the first element, null for empty tensors.
    pub fn data_ptr(&self) -> DevicePtr {
        self.buffer_info().map_or(DevicePtr::NULL, |info| info.ptr)
    }

    /// Byte offset of a multi-index.
    fn byte_offset(&self, index: &[usize]) -> Result<usize> {
        ensure!(
            index.len() == self.rank(),
            IndexRankMismatchSnafu { index: index.to_vec(), expected: self.rank(), got: index.len() }
        );
        ensure!(
            self.rank() > 0 && index.iter().zip(&self.shape).all(|(i, dim)| i < dim),
            IndexOutOfBoundsSnafu { index: index.to_vec(), shape: self.shape.to_vec() }
        );
        let element: usize = index.iter().zip(&self.strides).map(|(i, stride)| i * stride).sum();
        Ok(element * T::DTYPE.bytes())
    }

    fn ensure_host_accessible(&self) -> Result<()> {
        ensure!(self.host_accessible(), NotHostAccessibleSnafu { device: self.device });
        Ok(())
    }

    /// Read one element. The buffer must be host accessible.
    pub fn get(&self, index: &[usize]) -> Result<T> {
        let offset = self.byte_offset(index)?;
        self.ensure_host_accessible()?;

        let mut value = T::zeroed();
        self.storage
            .with_buffer(self.device, |buffer| buffer.copyout(offset, bytemuck::bytes_of_mut(&mut value)))
            .context(NotHostAccessibleSnafu { device: self.device })?
            .context(DeviceSnafu)?;
        Ok(value)
    }

    /// Write one element. The buffer must be host accessible.
    pub fn set(&mut self, index: &[usize], value: T) -> Result<()> {
        let offset = self.byte_offset(index)?;
        self.ensure_host_accessible()?;

        self.storage
            .with_buffer_mut(self.device, |buffer| buffer.copyin(offset, bytemuck::bytes_of(&value)))
            .context(NotHostAccessibleSnafu { device: self.device })?
            .context(DeviceSnafu)
    }

    /// Download every element, staging through the host if needed.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut data = vec![T::zeroed(); self.size()];
        if data.is_empty() {
            return Ok(data);
        }
        self.storage
            .with_buffer(self.device, |buffer| buffer.copyout(0, bytemuck::cast_slice_mut(&mut data)))
            .context(NotHostAccessibleSnafu { device: self.device })?
            .context(DeviceSnafu)?;
        Ok(data)
    }

    /// Upload `data` into this view's buffer.
    pub fn copy_from_slice(&mut self, data: &[T]) -> Result<()> {
        let expected = self.size();
        ensure!(data.len() == expected, LengthMismatchSnafu { expected, got: data.len() });
        if data.is_empty() {
            return Ok(());
        }
        self.storage
            .with_buffer_mut(self.device, |buffer| buffer.copyin(0, bytemuck::cast_slice(data)))
            .context(NotHostAccessibleSnafu { device: self.device })?
            .context(DeviceSnafu)
    }

    /// Re-copy this view's buffer if it is a copy of another residency.
    ///
    /// Copy-backed residencies do not follow later writes to their source.
    pub fn refresh(&self) -> Result<bool> {
        self.storage.refresh(self.device).context(DeviceSnafu)
    }

    /// Whether two tensors share one storage.
    pub fn same_storage(&self, other: &Tensor<T>) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }
}

//! Shape manipulation that shares storage.
//!
//! Tensors are always contiguous, so every operation here only rewrites the
//! shape and strides of a new view.

use super::*;

impl<T: HasDType> Tensor<T> {
    /// Reshape to `new_shape`, keeping the element count.
    ///
    /// A single `-1` infers that dimension from the others.
    ///
    /// # Examples
    ///
    /// ```
    /// # use jetstream_device::{Context, Device};
    /// # use jetstream_tensor::Tensor;
    /// let ctx = Context::default();
    /// let t = Tensor::from_slice(&ctx, Device::Cpu, &[6], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    /// assert_eq!(t.reshape(&[2, 3]).unwrap().shape(), &[2, 3]);
    /// assert_eq!(t.reshape(&[-1, 2]).unwrap().shape(), &[3, 2]);
    /// ```
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor<T>> {
        let shape = self.resolve_shape_with_inference(new_shape)?;
        Ok(Self::from_storage(Rc::clone(&self.storage), self.device, &shape))
    }

    /// Collapse into one dimension.
    pub fn flatten(&self) -> Tensor<T> {
        Self::from_storage(Rc::clone(&self.storage), self.device, &[self.size()])
    }

    fn resolve_shape_with_inference(&self, new_shape: &[isize]) -> Result<Shape> {
        let mismatch = || ReshapeSizeMismatchSnafu { from: self.shape.to_vec(), to: new_shape.to_vec() };

        let mut infer = None;
        for (i, &dim) in new_shape.iter().enumerate() {
            match dim {
                -1 => {
                    ensure!(infer.is_none(), MultipleInferDimensionsSnafu);
                    infer = Some(i);
                }
                d if d < 0 => return NegativeDimensionSnafu { dim: d }.fail(),
                _ => {}
            }
        }

        let known: usize = new_shape.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
        let mut shape: Shape = new_shape.iter().map(|&d| d.max(0) as usize).collect();

        if let Some(axis) = infer {
            ensure!(known != 0 && self.size() % known == 0, mismatch());
            shape[axis] = self.size() / known;
        }

        ensure!(element_count(&shape) == self.size(), mismatch());
        Ok(shape)
    }
}

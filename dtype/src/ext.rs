use num_complex::{Complex32, Complex64};

use super::*;

/// Rust element types that can back a tensor.
///
/// `Pod` lets buffers move elements as raw bytes across devices.
pub trait HasDType: bytemuck::Pod {
    const DTYPE: DType;
}

macro_rules! impl_dtype_ext {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl HasDType for $ty { const DTYPE: DType = $dtype; })*
    };
}

impl_dtype_ext! {
    i8 => DType::Int8, i16 => DType::Int16, i32 => DType::Int32, i64 => DType::Int64,
    u8 => DType::UInt8, u16 => DType::UInt16, u32 => DType::UInt32, u64 => DType::UInt64,
    f32 => DType::Float32, f64 => DType::Float64,
    Complex32 => DType::ComplexFloat32, Complex64 => DType::ComplexFloat64,
}

use jetstream_device::{Device, Severity};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("device error: {source}"))]
    Device { source: jetstream_device::Error },

    #[snafu(display("expected {expected} elements, got {got}"))]
    LengthMismatch { expected: usize, got: usize },

    #[snafu(display("index {index:?} has {got} dimensions, tensor has {expected}"))]
    IndexRankMismatch { index: Vec<usize>, expected: usize, got: usize },

    #[snafu(display("index {index:?} is out of bounds for shape {shape:?}"))]
    IndexOutOfBounds { index: Vec<usize>, shape: Vec<usize> },

    #[snafu(display("{device} buffer is not host accessible, map the tensor on CPU first"))]
    NotHostAccessible { device: Device },

    #[snafu(display("Multiple -1 dimensions in reshape are not allowed"))]
    MultipleInferDimensions,

    #[snafu(display("Negative dimension {dim} is not allowed (except -1 for inference)"))]
    NegativeDimension { dim: isize },

    #[snafu(display("cannot reshape {from:?} into {to:?}"))]
    ReshapeSizeMismatch { from: Vec<usize>, to: Vec<isize> },
}

impl Error {
    /// Device errors keep their classification, everything else is a caller mistake.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Device { source } => source.severity(),
            _ => Severity::Precondition,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use jetstream_dtype::Device;
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The device is disabled in the capability table or has no backend.
    #[snafu(display("{device} is not available"))]
    DeviceUnavailable { device: Device },

    /// The source device cannot hand out shareable handles for its memory.
    #[snafu(display("{source_device} buffer cannot export memory, it cannot share data with {target}"))]
    ExportUnsupported { source_device: Device, target: Device },

    /// The target device cannot map foreign memory.
    #[snafu(display("{target} cannot import memory, it cannot alias the {source_device} buffer"))]
    ImportUnsupported { source_device: Device, target: Device },

    /// No memory sharing mechanism exists between the two backends.
    #[snafu(display("{source_device} buffers cannot be imported into {target}"))]
    IncompatibleDevices { source_device: Device, target: Device },

    /// A host buffer must be page-locked before an accelerator can alias it.
    #[snafu(display("cannot import this {source_device} buffer into {target}: host memory at {ptr:#x} is not pinned"))]
    NotPinned { source_device: Device, target: Device, ptr: usize },

    #[snafu(display("failed to allocate {size} bytes on {device}: {reason}"))]
    AllocationFailed { device: Device, size: usize, reason: String },

    /// Exporting or mapping a native memory handle failed.
    #[snafu(display("failed to acquire {device} memory handle: {reason}"))]
    HandleAcquisition { device: Device, reason: String },

    /// Source and destination of a copy are the same memory.
    #[snafu(display("cannot copy {source_device} buffer into {target}: both views alias the same memory"))]
    OverlappingCopy { source_device: Device, target: Device },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Invalid buffer view parameters.
    #[snafu(display("invalid view: offset {offset} + size {size} exceeds buffer size {buffer_size}"))]
    InvalidView { offset: usize, size: usize, buffer_size: usize },

    /// Invalid device specification.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    #[cfg(feature = "cuda")]
    /// CUDA-specific errors.
    #[snafu(display("CUDA error: {source}"))]
    Cuda { source: cudarc::driver::DriverError },
}

/// How callers are expected to react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Resource exhaustion or missing capability. Treat as a setup failure.
    Fatal,
    /// The requested sharing path cannot exist. Fall back to an explicit copy.
    Recoverable,
    /// The caller asked for zero-copy on memory that does not allow it.
    Precondition,
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::IncompatibleDevices { .. } => Severity::Recoverable,
            Error::NotPinned { .. }
            | Error::OverlappingCopy { .. }
            | Error::SizeMismatch { .. }
            | Error::InvalidView { .. } => Severity::Precondition,
            _ => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

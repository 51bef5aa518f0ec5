//! Device memory for heterogeneous tensors.
//!
//! Allocates buffers on CPU, CUDA, Metal and Vulkan backends and extends a
//! storage's residency to other devices by importing foreign memory where the
//! backends allow it, or by copying where they do not.

pub mod backend;
pub mod buffer;
pub mod capability;
pub mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod emulated;
pub mod error;
pub mod host;
pub mod import;
pub mod storage;

pub use backend::{Backend, BackendStats, BufferOptions, DevicePtr, ExportHandle, MemoryKind};
pub use buffer::{Buffer, BufferInfo, Residency};
pub use capability::{Capabilities, DeviceCapabilities};
pub use context::Context;
pub use error::{Error, Result, Severity};
pub use import::ImportPath;
pub use jetstream_dtype::Device;
pub use storage::{Origin, Storage};

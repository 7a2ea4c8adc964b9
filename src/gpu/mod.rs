//! GPU backend layer
//!
//! One abstract driver surface ([`GpuDriver`]) with vendor
//! implementations, and a shared [`GpuExecutor`] above it that owns the
//! per-class [`BuddyAllocator`], the live-handle table, and the
//! data-to-buffer residency cache the scheduler uses to skip redundant
//! uploads.
//!
//! # Architecture
//!
//! ```text
//! GpuExecutor (shared layer)
//! ├── BuddyAllocator (sub-allocation within pre-sized slabs)
//! ├── residency cache (DataId → BufferHandle)
//! └── Box<dyn GpuDriver> (Metal / CUDA / embedder-supplied)
//! ```

mod buddy;
mod executor;
mod types;

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(target_os = "macos")]
pub mod metal;

pub use buddy::BuddyAllocator;
pub use executor::{DeviceCallback, GpuDriver, GpuExecutor, GpuExecutorConfig};
pub use types::{BufferHandle, DispatchType, KernelDispatch};

/// Vendor backend selector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuBackend {
    /// Apple Metal (macOS)
    Metal,
    /// NVIDIA CUDA (`cuda` feature)
    Cuda,
}

/// A concrete device to commit a graph against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuDevice {
    /// Which vendor backend to construct
    pub backend: GpuBackend,
    /// Device ordinal; `-1` selects the backend's default device
    pub device_id: i32,
}

impl GpuDevice {
    /// Select the default device of a backend
    pub fn new(backend: GpuBackend) -> Self {
        Self {
            backend,
            device_id: -1,
        }
    }
}

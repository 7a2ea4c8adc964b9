//! Shared executor layer above the vendor drivers

use super::{BuddyAllocator, BufferHandle, DispatchType, KernelDispatch};
use crate::data::{DataId, HostSpan, MemoryHint};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Callback fired from a device thread when a submission retires
///
/// Callbacks must be safe to invoke from the driver's completion
/// context; they post to the scheduler's completion queue and never call
/// into the data store.
pub type DeviceCallback = Box<dyn FnOnce() + Send + 'static>;

/// Vendor surface of the GPU backend
///
/// A driver manages one slab of device memory per configured class and
/// moves bytes between slab ranges and host spans. Sub-allocation,
/// handle bookkeeping, and residency tracking all live above the driver
/// in [`GpuExecutor`]; implementations only see resolved
/// [`BufferHandle`]s.
pub trait GpuDriver: Send {
    /// Reserve the backing slab for a memory class
    fn create_slab(&mut self, class: MemoryHint, size: usize) -> Result<()>;

    /// Synchronous host-to-device copy into a buffer
    fn copy_to(&mut self, buffer: &BufferHandle, bytes: &[u8]) -> Result<()>;

    /// Asynchronous device-to-host copy
    ///
    /// `on_complete` fires once the copy has retired on the device
    /// timeline; the span must stay valid until then.
    fn copy_from(
        &mut self,
        buffer: &BufferHandle,
        dst: HostSpan,
        on_complete: DeviceCallback,
    ) -> Result<()>;

    /// Synchronous read of the first `len` bytes of a buffer
    ///
    /// Used for small control structures such as the output counter.
    fn read(&mut self, buffer: &BufferHandle, len: usize) -> Result<Vec<u8>>;

    /// Submit one kernel; `on_complete` fires after retirement
    fn launch(&mut self, dispatch: &KernelDispatch, on_complete: DeviceCallback) -> Result<()>;

    /// Submit a batch of kernels under the given ordering contract
    fn launch_batch(
        &mut self,
        dispatches: &[KernelDispatch],
        mode: DispatchType,
        on_complete: DeviceCallback,
    ) -> Result<()>;

    /// Block until every outstanding submission has retired
    fn synchronize(&mut self) -> Result<()>;
}

/// Slab bounds per memory class, as `(min_size, max_size)` in bytes
///
/// A class bounded by zero is absent from the executor. Sizes round up
/// to powers of two.
#[derive(Clone, Copy, Debug)]
pub struct GpuExecutorConfig {
    /// Bounds for the private device-memory slab
    pub device_local: (usize, usize),
    /// Bounds for the unified-memory slab
    pub unified: (usize, usize),
    /// Bounds for the host-visible slab
    pub host_visible: (usize, usize),
}

impl Default for GpuExecutorConfig {
    fn default() -> Self {
        // 256 B granularity, 256 MiB slabs.
        Self {
            device_local: (256, 1 << 28),
            unified: (256, 1 << 28),
            host_visible: (256, 1 << 28),
        }
    }
}

/// The GPU backend: buddy-managed slabs over an abstract driver
///
/// Owns the live-handle table (stale handles fail with
/// [`Error::GhostBuffer`]) and the data→buffer residency cache the
/// scheduler consults to skip redundant uploads.
pub struct GpuExecutor {
    driver: Box<dyn GpuDriver>,
    allocator: BuddyAllocator,
    live: HashMap<u64, BufferHandle>,
    data_buffers: HashMap<DataId, BufferHandle>,
    next_buffer_id: u64,
}

impl GpuExecutor {
    /// Build an executor over `driver`, reserving one slab per class
    pub fn new(mut driver: Box<dyn GpuDriver>, config: GpuExecutorConfig) -> Result<Self> {
        let allocator =
            BuddyAllocator::new(config.device_local, config.unified, config.host_visible)?;
        for class in [
            MemoryHint::DeviceLocal,
            MemoryHint::Unified,
            MemoryHint::HostVisible,
        ] {
            if allocator.has_class(class) {
                driver.create_slab(class, allocator.slab_size(class)?)?;
            }
        }
        Ok(Self {
            driver,
            allocator,
            live: HashMap::new(),
            data_buffers: HashMap::new(),
            next_buffer_id: 1,
        })
    }

    /// Sub-allocate a buffer of `size` bytes in the class slab
    pub fn allocate_buffer(&mut self, size: usize, mem_hint: MemoryHint) -> Result<BufferHandle> {
        let offset = self.allocator.allocate(size, mem_hint)?;
        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        let handle = BufferHandle {
            id,
            mem_hint,
            offset,
            size,
        };
        self.live.insert(id, handle);
        tracing::trace!(id, size, ?mem_hint, offset, "buffer allocated");
        Ok(handle)
    }

    /// Return a buffer's range to the allocator
    pub fn deallocate_buffer(&mut self, handle: &BufferHandle) -> Result<()> {
        let stored = self
            .live
            .remove(&handle.id)
            .ok_or(Error::GhostBuffer { buffer_id: handle.id })?;
        self.allocator.free(stored.size, stored.offset, stored.mem_hint)
    }

    fn resolve(&self, handle: &BufferHandle) -> Result<BufferHandle> {
        self.live
            .get(&handle.id)
            .copied()
            .ok_or(Error::GhostBuffer { buffer_id: handle.id })
    }

    /// Synchronous host-to-device copy
    pub fn copy_to_device(&mut self, bytes: &[u8], handle: &BufferHandle) -> Result<()> {
        let buffer = self.resolve(handle)?;
        if bytes.len() > buffer.size {
            return Err(Error::copy_failure(format!(
                "{} bytes into a {}-byte buffer",
                bytes.len(),
                buffer.size
            )));
        }
        self.driver.copy_to(&buffer, bytes)
    }

    /// Asynchronous device-to-host copy; the callback fires on retirement
    pub fn copy_from_device(
        &mut self,
        dst: HostSpan,
        handle: &BufferHandle,
        on_complete: DeviceCallback,
    ) -> Result<()> {
        let buffer = self.resolve(handle)?;
        if dst.len() > buffer.size {
            return Err(Error::copy_failure(format!(
                "{} bytes out of a {}-byte buffer",
                dst.len(),
                buffer.size
            )));
        }
        self.driver.copy_from(&buffer, dst, on_complete)
    }

    /// Synchronously read the first `len` bytes of a buffer
    pub fn read_buffer(&mut self, handle: &BufferHandle, len: usize) -> Result<Vec<u8>> {
        let buffer = self.resolve(handle)?;
        if len > buffer.size {
            return Err(Error::copy_failure(format!(
                "read of {len} bytes from a {}-byte buffer",
                buffer.size
            )));
        }
        self.driver.read(&buffer, len)
    }

    /// Submit one kernel dispatch
    pub fn execute_kernel(
        &mut self,
        dispatch: &KernelDispatch,
        on_complete: DeviceCallback,
    ) -> Result<()> {
        for buffer in &dispatch.buffers {
            self.resolve(buffer)?;
        }
        tracing::debug!(kernel = %dispatch.kernel_name, buffers = dispatch.buffers.len(), "kernel submitted");
        self.driver.launch(dispatch, on_complete)
    }

    /// Submit a batch of kernels
    ///
    /// `Serial` enforces pairwise ordering in submission order;
    /// `Concurrent` permits any interleaving. The callback fires once the
    /// whole batch has retired.
    pub fn execute_batch(
        &mut self,
        dispatches: &[KernelDispatch],
        mode: DispatchType,
        on_complete: DeviceCallback,
    ) -> Result<()> {
        for dispatch in dispatches {
            for buffer in &dispatch.buffers {
                self.resolve(buffer)?;
            }
        }
        self.driver.launch_batch(dispatches, mode, on_complete)
    }

    /// Block until all outstanding submissions have retired
    pub fn synchronize(&mut self) -> Result<()> {
        self.driver.synchronize()
    }

    /// Record that `data` is resident in `buffer`
    pub fn map_data_to_buffer(&mut self, data: DataId, buffer: BufferHandle) {
        self.data_buffers.insert(data, buffer);
    }

    /// Whether `data` already has a resident buffer
    pub fn data_buffer_exists(&self, data: DataId) -> bool {
        self.data_buffers.contains_key(&data)
    }

    /// The buffer `data` is resident in, if any
    pub fn buffer_for_data(&self, data: DataId) -> Option<BufferHandle> {
        self.data_buffers.get(&data).copied()
    }

    /// Drop the residency record for `data`, returning its buffer
    pub fn unmap_data(&mut self, data: DataId) -> Option<BufferHandle> {
        self.data_buffers.remove(&data)
    }

    /// Allocator introspection (tests and diagnostics)
    pub fn allocator(&self) -> &BuddyAllocator {
        &self.allocator
    }
}

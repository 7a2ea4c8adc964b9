//! Metal driver (macOS)
//!
//! One `MTLBuffer` slab per memory class: `DeviceLocal` maps to private
//! storage and stages transfers through a shared proxy buffer, the other
//! classes map to shared storage with direct `contents()` access.
//! Kernel completion uses command-buffer completed handlers, so the
//! scheduler's callbacks fire on Metal's completion thread.

use super::{BufferHandle, DeviceCallback, DispatchType, GpuDriver, KernelDispatch};
use crate::data::{HostSpan, MemoryHint};
use crate::error::{Error, Result};
use block::ConcreteBlock;
use metal::{
    Buffer, CommandQueue, ComputePipelineState, Device, Library, MTLResourceOptions, MTLSize,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Metal implementation of [`GpuDriver`]
pub struct MetalDriver {
    device: Device,
    queue: CommandQueue,
    library: Library,
    pipelines: HashMap<String, ComputePipelineState>,
    slabs: HashMap<MemoryHint, Buffer>,
    /// Shared staging buffer for private-storage transfers
    proxy: Option<Buffer>,
}

impl MetalDriver {
    /// Open a device and its default shader library
    ///
    /// `proxy_size` is the staging capacity for `DeviceLocal` transfers;
    /// zero skips the proxy buffer entirely. `device_id < 0` selects the
    /// system default device.
    pub fn new(device_id: i32, proxy_size: usize) -> Result<Self> {
        let device = if device_id < 0 {
            Device::system_default()
        } else {
            Device::all().into_iter().nth(device_id as usize)
        }
        .ok_or(Error::BackendUnavailable {
            backend: super::GpuBackend::Metal,
        })?;

        let queue = device.new_command_queue();
        let library = device.new_default_library();

        let proxy = (proxy_size > 0).then(|| {
            device.new_buffer(proxy_size as u64, MTLResourceOptions::StorageModeShared)
        });

        Ok(Self {
            device,
            queue,
            library,
            pipelines: HashMap::new(),
            slabs: HashMap::new(),
            proxy,
        })
    }

    /// Build and cache the compute pipeline for a kernel
    fn ensure_pipeline(&mut self, kernel_name: &str) -> Result<()> {
        if !self.pipelines.contains_key(kernel_name) {
            let function = self
                .library
                .get_function(kernel_name, None)
                .map_err(|_| Error::kernel_failure(kernel_name, "function not in library"))?;
            let pipeline = self
                .device
                .new_compute_pipeline_state_with_function(&function)
                .map_err(|e| Error::kernel_failure(kernel_name, e.to_string()))?;
            self.pipelines.insert(kernel_name.to_string(), pipeline);
        }
        Ok(())
    }

    fn slab(&self, class: MemoryHint) -> Result<&Buffer> {
        self.slabs
            .get(&class)
            .ok_or(Error::InvalidMemoryClass { class })
    }

    /// Grow the proxy if a private-storage transfer needs more staging room
    fn access_proxy(&mut self, len: usize) -> Result<&Buffer> {
        let grow = match &self.proxy {
            Some(buffer) => (buffer.length() as usize) < len,
            None => true,
        };
        if grow {
            self.proxy = Some(
                self.device
                    .new_buffer(len as u64, MTLResourceOptions::StorageModeShared),
            );
        }
        Ok(self.proxy.as_ref().expect("proxy just ensured"))
    }

    /// Encode one dispatch onto a command buffer; its pipeline must be cached
    fn encode_dispatch(
        &self,
        command_buffer: &metal::CommandBufferRef,
        dispatch: &KernelDispatch,
    ) -> Result<()> {
        let pipeline = self
            .pipelines
            .get(&dispatch.kernel_name)
            .ok_or_else(|| Error::kernel_failure(&dispatch.kernel_name, "pipeline not built"))?;

        let encoder = command_buffer.new_compute_command_encoder();
        encoder.set_compute_pipeline_state(pipeline);
        for (i, buffer) in dispatch.buffers.iter().enumerate() {
            let slab = self
                .slabs
                .get(&buffer.mem_hint)
                .ok_or(Error::InvalidMemoryClass {
                    class: buffer.mem_hint,
                })?;
            encoder.set_buffer(i as u64, Some(slab), buffer.offset as u64);
        }

        let grid = MTLSize {
            width: dispatch.grid_dim[0] as u64,
            height: dispatch.grid_dim[1].max(1) as u64,
            depth: dispatch.grid_dim[2].max(1) as u64,
        };
        let block = MTLSize {
            width: dispatch.block_dim[0] as u64,
            height: dispatch.block_dim[1].max(1) as u64,
            depth: dispatch.block_dim[2].max(1) as u64,
        };
        encoder.dispatch_thread_groups(grid, block);
        encoder.end_encoding();
        Ok(())
    }
}

/// Attach a one-shot completion callback to a command buffer
fn attach_handler(command_buffer: &metal::CommandBufferRef, on_complete: DeviceCallback) {
    let slot = Mutex::new(Some(on_complete));
    let handler = ConcreteBlock::new(move |_: &metal::CommandBufferRef| {
        if let Some(callback) = slot.lock().take() {
            callback();
        }
    })
    .copy();
    command_buffer.add_completed_handler(&handler);
}

impl GpuDriver for MetalDriver {
    fn create_slab(&mut self, class: MemoryHint, size: usize) -> Result<()> {
        let options = match class {
            MemoryHint::DeviceLocal => MTLResourceOptions::StorageModePrivate,
            MemoryHint::Unified | MemoryHint::HostVisible => {
                MTLResourceOptions::StorageModeShared
            }
        };
        let buffer = self.device.new_buffer(size as u64, options);
        self.slabs.insert(class, buffer);
        Ok(())
    }

    fn copy_to(&mut self, buffer: &BufferHandle, bytes: &[u8]) -> Result<()> {
        match buffer.mem_hint {
            MemoryHint::Unified | MemoryHint::HostVisible => {
                let slab = self.slab(buffer.mem_hint)?;
                let contents = slab.contents();
                if contents.is_null() {
                    return Err(Error::copy_failure("shared slab has no contents pointer"));
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        (contents as *mut u8).add(buffer.offset),
                        bytes.len(),
                    );
                }
                Ok(())
            }
            MemoryHint::DeviceLocal => {
                // Stage through the shared proxy, then blit into private
                // storage.
                let len = bytes.len();
                let proxy = self.access_proxy(len)?.clone();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        proxy.contents() as *mut u8,
                        len,
                    );
                }
                let slab = self.slab(MemoryHint::DeviceLocal)?;
                let command_buffer = self.queue.new_command_buffer();
                let blit = command_buffer.new_blit_command_encoder();
                blit.copy_from_buffer(&proxy, 0, slab, buffer.offset as u64, len as u64);
                blit.end_encoding();
                command_buffer.commit();
                command_buffer.wait_until_completed();
                Ok(())
            }
        }
    }

    fn copy_from(
        &mut self,
        buffer: &BufferHandle,
        dst: HostSpan,
        on_complete: DeviceCallback,
    ) -> Result<()> {
        let len = dst.len();
        match buffer.mem_hint {
            MemoryHint::Unified | MemoryHint::HostVisible => {
                let slab = self.slab(buffer.mem_hint)?;
                let contents = slab.contents();
                if contents.is_null() {
                    return Err(Error::copy_failure("shared slab has no contents pointer"));
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        (contents as *const u8).add(buffer.offset),
                        dst.as_slice_mut().as_mut_ptr(),
                        len,
                    );
                }
                on_complete();
                Ok(())
            }
            MemoryHint::DeviceLocal => {
                // Blit into the proxy, copy out on the completed handler.
                let proxy = self.access_proxy(len)?.clone();
                let slab = self.slab(MemoryHint::DeviceLocal)?;
                let command_buffer = self.queue.new_command_buffer();
                let blit = command_buffer.new_blit_command_encoder();
                blit.copy_from_buffer(slab, buffer.offset as u64, &proxy, 0, len as u64);
                blit.end_encoding();
                attach_handler(
                    command_buffer,
                    Box::new(move || {
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                proxy.contents() as *const u8,
                                dst.as_slice_mut().as_mut_ptr(),
                                len,
                            );
                        }
                        on_complete();
                    }),
                );
                command_buffer.commit();
                Ok(())
            }
        }
    }

    fn read(&mut self, buffer: &BufferHandle, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        match buffer.mem_hint {
            MemoryHint::Unified | MemoryHint::HostVisible => {
                let slab = self.slab(buffer.mem_hint)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        (slab.contents() as *const u8).add(buffer.offset),
                        out.as_mut_ptr(),
                        len,
                    );
                }
            }
            MemoryHint::DeviceLocal => {
                let proxy = self.access_proxy(len)?.clone();
                let slab = self.slab(MemoryHint::DeviceLocal)?;
                let command_buffer = self.queue.new_command_buffer();
                let blit = command_buffer.new_blit_command_encoder();
                blit.copy_from_buffer(slab, buffer.offset as u64, &proxy, 0, len as u64);
                blit.end_encoding();
                command_buffer.commit();
                command_buffer.wait_until_completed();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        proxy.contents() as *const u8,
                        out.as_mut_ptr(),
                        len,
                    );
                }
            }
        }
        Ok(out)
    }

    fn launch(&mut self, dispatch: &KernelDispatch, on_complete: DeviceCallback) -> Result<()> {
        self.ensure_pipeline(&dispatch.kernel_name)?;
        let command_buffer = self.queue.new_command_buffer();
        self.encode_dispatch(command_buffer, dispatch)?;
        attach_handler(command_buffer, on_complete);
        command_buffer.commit();
        Ok(())
    }

    fn launch_batch(
        &mut self,
        dispatches: &[KernelDispatch],
        mode: DispatchType,
        on_complete: DeviceCallback,
    ) -> Result<()> {
        match mode {
            DispatchType::Serial => {
                // A single command buffer serializes its encoders.
                for dispatch in dispatches {
                    self.ensure_pipeline(&dispatch.kernel_name)?;
                }
                let command_buffer = self.queue.new_command_buffer();
                for dispatch in dispatches {
                    self.encode_dispatch(command_buffer, dispatch)?;
                }
                attach_handler(command_buffer, on_complete);
                command_buffer.commit();
            }
            DispatchType::Concurrent => {
                if dispatches.is_empty() {
                    on_complete();
                    return Ok(());
                }
                for dispatch in dispatches {
                    self.ensure_pipeline(&dispatch.kernel_name)?;
                }
                let remaining = Arc::new(AtomicUsize::new(dispatches.len()));
                let slot = Arc::new(Mutex::new(Some(on_complete)));
                for dispatch in dispatches {
                    let command_buffer = self.queue.new_command_buffer();
                    self.encode_dispatch(command_buffer, dispatch)?;
                    let remaining = Arc::clone(&remaining);
                    let slot = Arc::clone(&slot);
                    attach_handler(
                        command_buffer,
                        Box::new(move || {
                            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                                if let Some(callback) = slot.lock().take() {
                                    callback();
                                }
                            }
                        }),
                    );
                    command_buffer.commit();
                }
            }
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        let command_buffer = self.queue.new_command_buffer();
        command_buffer.commit();
        command_buffer.wait_until_completed();
        Ok(())
    }
}

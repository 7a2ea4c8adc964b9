//! CUDA driver (`cuda` feature)
//!
//! Raw `cudarc` driver calls: one device allocation per memory class
//! (`DeviceLocal` via `cuMemAlloc`, `Unified` via `cuMemAllocManaged`,
//! `HostVisible` via page-locked host memory mapped into the device
//! address space), synchronous stream-ordered copies, and kernels
//! resolved from a preloaded module. Kernel compilation is out of scope;
//! the module is loaded from a cubin/PTX file the embedder provides.
//!
//! Completion callbacks are fired from a dedicated completion thread
//! after the submitting call has synchronized the stream. Submission is
//! therefore blocking; overlapping submission with retirement is future
//! work.

use super::{BufferHandle, DeviceCallback, DispatchType, GpuDriver, KernelDispatch};
use crate::data::{HostSpan, MemoryHint};
use crate::error::{Error, Result};
use cudarc::driver::sys;
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::mpsc::{channel, Sender};
use std::thread::JoinHandle;

fn check(code: sys::CUresult, what: &str) -> Result<()> {
    if code == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(Error::Internal(format!("{what} failed: {code:?}")))
    }
}

/// CUDA implementation of [`GpuDriver`]
pub struct CudaDriver {
    context: sys::CUcontext,
    module: Option<sys::CUmodule>,
    functions: HashMap<String, sys::CUfunction>,
    slabs: HashMap<MemoryHint, sys::CUdeviceptr>,
    host_slabs: HashMap<MemoryHint, *mut std::ffi::c_void>,
    callbacks: Sender<DeviceCallback>,
    completion_thread: Option<JoinHandle<()>>,
}

// Raw driver handles are only used from the owning thread plus the
// driver's own completion thread, which never touches them.
unsafe impl Send for CudaDriver {}

impl CudaDriver {
    /// Initialize the driver on a device ordinal (`< 0` selects device 0)
    pub fn new(device_id: i32) -> Result<Self> {
        let ordinal = device_id.max(0);
        unsafe {
            check(sys::lib().cuInit(0), "cuInit")?;
            let mut device = 0;
            check(sys::lib().cuDeviceGet(&mut device, ordinal), "cuDeviceGet")?;
            let mut context = std::ptr::null_mut();
            check(
                sys::lib().cuDevicePrimaryCtxRetain(&mut context, device),
                "cuDevicePrimaryCtxRetain",
            )?;
            check(sys::lib().cuCtxSetCurrent(context), "cuCtxSetCurrent")?;

            let (callbacks, rx) = channel::<DeviceCallback>();
            let completion_thread = std::thread::Builder::new()
                .name("taskr-cuda-completion".to_string())
                .spawn(move || {
                    for callback in rx {
                        callback();
                    }
                })
                .map_err(|e| Error::Internal(format!("completion thread: {e}")))?;

            Ok(Self {
                context,
                module: None,
                functions: HashMap::new(),
                slabs: HashMap::new(),
                host_slabs: HashMap::new(),
                callbacks,
                completion_thread: Some(completion_thread),
            })
        }
    }

    /// Load a precompiled module (cubin or PTX) to resolve kernels from
    pub fn load_module(&mut self, path: &std::path::Path) -> Result<()> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::Internal("module path contains NUL".to_string()))?;
        unsafe {
            let mut module = std::ptr::null_mut();
            check(sys::lib().cuModuleLoad(&mut module, c_path.as_ptr()), "cuModuleLoad")?;
            self.module = Some(module);
        }
        Ok(())
    }

    fn function(&mut self, kernel_name: &str) -> Result<sys::CUfunction> {
        if let Some(&function) = self.functions.get(kernel_name) {
            return Ok(function);
        }
        let module = self
            .module
            .ok_or_else(|| Error::kernel_failure(kernel_name, "no module loaded"))?;
        let c_name = CString::new(kernel_name)
            .map_err(|_| Error::kernel_failure(kernel_name, "name contains NUL"))?;
        unsafe {
            let mut function = std::ptr::null_mut();
            check(
                sys::lib().cuModuleGetFunction(&mut function, module, c_name.as_ptr()),
                "cuModuleGetFunction",
            )
            .map_err(|_| Error::kernel_failure(kernel_name, "function not in module"))?;
            self.functions.insert(kernel_name.to_string(), function);
            Ok(function)
        }
    }

    fn device_ptr(&self, buffer: &BufferHandle) -> Result<sys::CUdeviceptr> {
        let base = self
            .slabs
            .get(&buffer.mem_hint)
            .ok_or(Error::InvalidMemoryClass {
                class: buffer.mem_hint,
            })?;
        Ok(base + buffer.offset as sys::CUdeviceptr)
    }

    fn launch_one(&mut self, dispatch: &KernelDispatch) -> Result<()> {
        let function = self.function(&dispatch.kernel_name)?;
        let mut pointers: Vec<sys::CUdeviceptr> = dispatch
            .buffers
            .iter()
            .map(|b| self.device_ptr(b))
            .collect::<Result<_>>()?;
        let mut params: Vec<*mut std::ffi::c_void> = pointers
            .iter_mut()
            .map(|p| p as *mut sys::CUdeviceptr as *mut std::ffi::c_void)
            .collect();

        unsafe {
            check(
                sys::lib().cuLaunchKernel(
                    function,
                    dispatch.grid_dim[0],
                    dispatch.grid_dim[1].max(1),
                    dispatch.grid_dim[2].max(1),
                    dispatch.block_dim[0],
                    dispatch.block_dim[1].max(1),
                    dispatch.block_dim[2].max(1),
                    0,
                    std::ptr::null_mut(),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
            .map_err(|e| Error::kernel_failure(&dispatch.kernel_name, e.to_string()))
        }
    }
}

impl GpuDriver for CudaDriver {
    fn create_slab(&mut self, class: MemoryHint, size: usize) -> Result<()> {
        unsafe {
            let mut ptr: sys::CUdeviceptr = 0;
            match class {
                MemoryHint::DeviceLocal => {
                    check(sys::lib().cuMemAlloc_v2(&mut ptr, size), "cuMemAlloc")?;
                }
                MemoryHint::Unified => {
                    check(
                        sys::lib().cuMemAllocManaged(
                            &mut ptr,
                            size,
                            sys::CUmemAttach_flags::CU_MEM_ATTACH_GLOBAL as u32,
                        ),
                        "cuMemAllocManaged",
                    )?;
                }
                MemoryHint::HostVisible => {
                    let mut host = std::ptr::null_mut();
                    check(
                        sys::lib().cuMemHostAlloc(
                            &mut host,
                            size,
                            sys::CU_MEMHOSTALLOC_DEVICEMAP,
                        ),
                        "cuMemHostAlloc",
                    )?;
                    check(
                        sys::lib().cuMemHostGetDevicePointer_v2(&mut ptr, host, 0),
                        "cuMemHostGetDevicePointer",
                    )?;
                    self.host_slabs.insert(class, host);
                }
            }
            self.slabs.insert(class, ptr);
        }
        Ok(())
    }

    fn copy_to(&mut self, buffer: &BufferHandle, bytes: &[u8]) -> Result<()> {
        let dst = self.device_ptr(buffer)?;
        unsafe {
            check(
                sys::lib().cuMemcpyHtoD_v2(
                    dst,
                    bytes.as_ptr() as *const std::ffi::c_void,
                    bytes.len(),
                ),
                "cuMemcpyHtoD",
            )
            .map_err(|e| Error::copy_failure(e.to_string()))
        }
    }

    fn copy_from(
        &mut self,
        buffer: &BufferHandle,
        dst: HostSpan,
        on_complete: DeviceCallback,
    ) -> Result<()> {
        let src = self.device_ptr(buffer)?;
        unsafe {
            let out = dst.as_slice_mut();
            check(
                sys::lib().cuMemcpyDtoH_v2(
                    out.as_mut_ptr() as *mut std::ffi::c_void,
                    src,
                    out.len(),
                ),
                "cuMemcpyDtoH",
            )
            .map_err(|e| Error::copy_failure(e.to_string()))?;
        }
        self.callbacks
            .send(on_complete)
            .map_err(|_| Error::Internal("completion thread is gone".to_string()))
    }

    fn read(&mut self, buffer: &BufferHandle, len: usize) -> Result<Vec<u8>> {
        let src = self.device_ptr(buffer)?;
        let mut out = vec![0u8; len];
        unsafe {
            check(
                sys::lib().cuMemcpyDtoH_v2(
                    out.as_mut_ptr() as *mut std::ffi::c_void,
                    src,
                    len,
                ),
                "cuMemcpyDtoH",
            )
            .map_err(|e| Error::copy_failure(e.to_string()))?;
        }
        Ok(out)
    }

    fn launch(&mut self, dispatch: &KernelDispatch, on_complete: DeviceCallback) -> Result<()> {
        self.launch_one(dispatch)?;
        self.synchronize()?;
        self.callbacks
            .send(on_complete)
            .map_err(|_| Error::Internal("completion thread is gone".to_string()))
    }

    fn launch_batch(
        &mut self,
        dispatches: &[KernelDispatch],
        _mode: DispatchType,
        on_complete: DeviceCallback,
    ) -> Result<()> {
        // The single default stream serializes either way.
        for dispatch in dispatches {
            self.launch_one(dispatch)?;
        }
        self.synchronize()?;
        self.callbacks
            .send(on_complete)
            .map_err(|_| Error::Internal("completion thread is gone".to_string()))
    }

    fn synchronize(&mut self) -> Result<()> {
        unsafe { check(sys::lib().cuCtxSynchronize(), "cuCtxSynchronize") }
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        // Close the callback channel, then join the completion thread.
        let (dead_tx, _) = channel();
        self.callbacks = dead_tx;
        if let Some(thread) = self.completion_thread.take() {
            let _ = thread.join();
        }

        unsafe {
            for (class, ptr) in self.slabs.drain() {
                // Host-mapped slabs are released through their host side.
                if self.host_slabs.contains_key(&class) {
                    continue;
                }
                let _ = sys::lib().cuMemFree_v2(ptr);
            }
            for (_, host) in self.host_slabs.drain() {
                let _ = sys::lib().cuMemFreeHost(host);
            }
            if let Some(module) = self.module.take() {
                let _ = sys::lib().cuModuleUnload(module);
            }
            let _ = self.context;
        }
    }
}

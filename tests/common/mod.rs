//! Common test utilities
//!
//! Includes a channel-driven simulated GPU driver: slabs live in host
//! memory, a device thread executes asynchronous operations in
//! submission order, and kernels are plain Rust closures registered by
//! name. This exercises the full GPU scheduling path — residency cache,
//! buddy sub-allocation, counter probing, completion chaining — without
//! hardware.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use taskr::data::{DataStore, HostSpan, MemoryHint};
use taskr::error::{Error, Result};
use taskr::gpu::{
    BufferHandle, DeviceCallback, DispatchType, GpuDriver, GpuExecutor, GpuExecutorConfig,
    KernelDispatch,
};
use taskr::pool::ThreadPool;

/// Host-memory slabs standing in for device memory
pub struct SimMemory {
    slabs: HashMap<MemoryHint, Vec<u8>>,
}

impl SimMemory {
    /// The byte range a handle resolves to
    pub fn bytes(&self, handle: &BufferHandle) -> &[u8] {
        let slab = &self.slabs[&handle.mem_hint];
        &slab[handle.offset..handle.offset + handle.size]
    }

    /// Mutable byte range of a handle
    pub fn bytes_mut(&mut self, handle: &BufferHandle) -> &mut [u8] {
        let slab = self.slabs.get_mut(&handle.mem_hint).expect("slab exists");
        &mut slab[handle.offset..handle.offset + handle.size]
    }
}

/// A named kernel body: reads and writes slab memory through handles
pub type SimKernel = Arc<dyn Fn(&mut SimMemory, &KernelDispatch) + Send + Sync>;

enum DeviceOp {
    CopyFrom {
        buffer: BufferHandle,
        dst: HostSpan,
        on_complete: DeviceCallback,
    },
    Launch {
        kernel: SimKernel,
        dispatch: KernelDispatch,
        on_complete: DeviceCallback,
    },
    Marker {
        on_complete: DeviceCallback,
    },
    Sync {
        ack: Sender<()>,
    },
}

/// Simulated GPU driver with a dedicated device thread
pub struct SimDriver {
    memory: Arc<Mutex<SimMemory>>,
    kernels: Arc<Mutex<HashMap<String, SimKernel>>>,
    ops: Option<Sender<DeviceOp>>,
    device_thread: Option<JoinHandle<()>>,
}

impl SimDriver {
    pub fn new() -> Self {
        let memory = Arc::new(Mutex::new(SimMemory {
            slabs: HashMap::new(),
        }));
        let (ops, rx) = channel::<DeviceOp>();
        let device_thread = {
            let memory = Arc::clone(&memory);
            std::thread::Builder::new()
                .name("sim-device".to_string())
                .spawn(move || device_loop(rx, memory))
                .expect("spawn sim device thread")
        };
        Self {
            memory,
            kernels: Arc::new(Mutex::new(HashMap::new())),
            ops: Some(ops),
            device_thread: Some(device_thread),
        }
    }

    /// Register a kernel body under a name
    pub fn register_kernel(
        &self,
        name: &str,
        body: impl Fn(&mut SimMemory, &KernelDispatch) + Send + Sync + 'static,
    ) {
        self.kernels.lock().insert(name.to_string(), Arc::new(body));
    }

    fn send(&self, op: DeviceOp) -> Result<()> {
        self.ops
            .as_ref()
            .expect("device channel open")
            .send(op)
            .map_err(|_| Error::Internal("sim device thread is gone".to_string()))
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn device_loop(rx: Receiver<DeviceOp>, memory: Arc<Mutex<SimMemory>>) {
    for op in rx {
        match op {
            DeviceOp::CopyFrom {
                buffer,
                dst,
                on_complete,
            } => {
                {
                    let mem = memory.lock();
                    let src = mem.bytes(&buffer);
                    let out = unsafe { dst.as_slice_mut() };
                    out.copy_from_slice(&src[..dst.len()]);
                }
                on_complete();
            }
            DeviceOp::Launch {
                kernel,
                dispatch,
                on_complete,
            } => {
                kernel(&mut memory.lock(), &dispatch);
                on_complete();
            }
            DeviceOp::Marker { on_complete } => on_complete(),
            DeviceOp::Sync { ack } => {
                let _ = ack.send(());
            }
        }
    }
}

impl GpuDriver for SimDriver {
    fn create_slab(&mut self, class: MemoryHint, size: usize) -> Result<()> {
        self.memory.lock().slabs.insert(class, vec![0u8; size]);
        Ok(())
    }

    fn copy_to(&mut self, buffer: &BufferHandle, bytes: &[u8]) -> Result<()> {
        let mut mem = self.memory.lock();
        mem.bytes_mut(buffer)[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn copy_from(
        &mut self,
        buffer: &BufferHandle,
        dst: HostSpan,
        on_complete: DeviceCallback,
    ) -> Result<()> {
        self.send(DeviceOp::CopyFrom {
            buffer: *buffer,
            dst,
            on_complete,
        })
    }

    fn read(&mut self, buffer: &BufferHandle, len: usize) -> Result<Vec<u8>> {
        let mem = self.memory.lock();
        Ok(mem.bytes(buffer)[..len].to_vec())
    }

    fn launch(&mut self, dispatch: &KernelDispatch, on_complete: DeviceCallback) -> Result<()> {
        let kernel = self
            .kernels
            .lock()
            .get(&dispatch.kernel_name)
            .cloned()
            .ok_or_else(|| {
                Error::kernel_failure(&dispatch.kernel_name, "kernel not registered")
            })?;
        self.send(DeviceOp::Launch {
            kernel,
            dispatch: dispatch.clone(),
            on_complete,
        })
    }

    fn launch_batch(
        &mut self,
        dispatches: &[KernelDispatch],
        _mode: DispatchType,
        on_complete: DeviceCallback,
    ) -> Result<()> {
        // The single device thread serializes either mode.
        for dispatch in dispatches {
            let noop: DeviceCallback = Box::new(|| {});
            self.launch(dispatch, noop)?;
        }
        self.send(DeviceOp::Marker { on_complete })
    }

    fn synchronize(&mut self) -> Result<()> {
        let (ack, done) = channel();
        self.send(DeviceOp::Sync { ack })?;
        done.recv()
            .map_err(|_| Error::Internal("sim device thread is gone".to_string()))
    }
}

impl Drop for SimDriver {
    fn drop(&mut self) {
        drop(self.ops.take());
        if let Some(thread) = self.device_thread.take() {
            let _ = thread.join();
        }
    }
}

/// Small slab bounds so allocator exhaustion is testable
pub fn small_gpu_config() -> GpuExecutorConfig {
    GpuExecutorConfig {
        device_local: (4, 1 << 16),
        unified: (4, 1 << 16),
        host_visible: (4, 1 << 16),
    }
}

/// Build an executor over a fresh simulated driver
pub fn sim_executor(configure: impl FnOnce(&SimDriver)) -> GpuExecutor {
    let driver = SimDriver::new();
    configure(&driver);
    GpuExecutor::new(Box::new(driver), small_gpu_config()).expect("sim executor builds")
}

/// Create a store and a small pool for scheduler tests
pub fn store_and_pool() -> (Arc<DataStore>, ThreadPool) {
    (Arc::new(DataStore::new()), ThreadPool::new(4).unwrap())
}

/// Reinterpret a byte slice as f32 values
pub fn as_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Serialize f32 values to bytes
pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

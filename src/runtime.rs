//! The runtime facade: commit a graph, get a future back

use crate::data::DataStore;
use crate::error::{Error, Result};
use crate::gpu::{GpuDevice, GpuExecutor, GpuExecutorConfig};
use crate::graph::TaskGraph;
use crate::pool::ThreadPool;
use crate::scheduler::{ExecutionTrace, Scheduler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Knobs for a runtime instance
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    /// Worker threads in the CPU pool built per commit
    pub num_threads: usize,
    /// Slab bounds for the GPU executor built per commit
    pub gpu: GpuExecutorConfig,
    /// Cap on retired device buffers kept for reuse
    pub idle_buffer_high_water: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism().map_or(4, |n| n.get()),
            gpu: GpuExecutorConfig::default(),
            idle_buffer_high_water: 32,
        }
    }
}

/// Owns the data store and drives committed graphs to completion
///
/// Each commit validates the graph, builds a worker pool (and, when the
/// graph has GPU tasks, the backend executor for the requested device),
/// and runs the scheduler on a dedicated thread. The returned
/// [`CommitFuture`] resolves when the graph has drained.
pub struct Runtime {
    store: Arc<DataStore>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Build a runtime over `store` with `num_threads` pool workers
    pub fn new(store: Arc<DataStore>, num_threads: usize) -> Self {
        Self {
            store,
            config: RuntimeConfig {
                num_threads,
                ..RuntimeConfig::default()
            },
        }
    }

    /// Build a runtime with explicit configuration
    pub fn with_config(store: Arc<DataStore>, config: RuntimeConfig) -> Self {
        Self { store, config }
    }

    /// The runtime's data store
    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Validate and execute a graph on the given device
    ///
    /// The backend is only constructed when the graph actually contains
    /// GPU tasks; a pure-CPU graph commits on any host. Errors during
    /// execution surface through the returned future.
    pub fn commit_graph(&self, graph: TaskGraph, device: GpuDevice) -> Result<CommitFuture> {
        graph.validate_graph()?;
        let executor = if graph.has_gpu_tasks() {
            Some(Arc::new(Mutex::new(self.create_executor(device)?)))
        } else {
            None
        };
        self.spawn(graph, executor)
    }

    /// Validate and execute a graph on a caller-supplied executor
    ///
    /// This is the entry point for embedder-provided [`crate::gpu::GpuDriver`]
    /// implementations.
    pub fn commit_graph_with_executor(
        &self,
        graph: TaskGraph,
        executor: GpuExecutor,
    ) -> Result<CommitFuture> {
        graph.validate_graph()?;
        self.spawn(graph, Some(Arc::new(Mutex::new(executor))))
    }

    fn spawn(
        &self,
        graph: TaskGraph,
        executor: Option<Arc<Mutex<GpuExecutor>>>,
    ) -> Result<CommitFuture> {
        let pool = ThreadPool::new(self.config.num_threads)?;
        let store = Arc::clone(&self.store);
        let idle_high_water = self.config.idle_buffer_high_water;

        let handle = std::thread::Builder::new()
            .name("taskr-scheduler".to_string())
            .spawn(move || {
                let mut scheduler = Scheduler::new(store, &pool, executor.clone())
                    .with_idle_high_water(idle_high_water);
                let result = scheduler.execute_graph(&graph);
                // Drain the device before the pool and executor go away.
                if let Some(gpu) = &executor {
                    let _ = gpu.lock().synchronize();
                }
                result
            })
            .map_err(|e| Error::Internal(format!("failed to spawn scheduler: {e}")))?;

        Ok(CommitFuture {
            handle: Some(handle),
        })
    }

    #[cfg(target_os = "macos")]
    fn create_executor(&self, device: GpuDevice) -> Result<GpuExecutor> {
        use crate::gpu::GpuBackend;
        match device.backend {
            GpuBackend::Metal => {
                // The proxy stages DeviceLocal transfers; size it to the
                // largest device-local entry registered in the store.
                let proxy_size = self
                    .store
                    .device_local_entries()
                    .iter()
                    .filter_map(|&id| self.store.byte_size(id).ok())
                    .max()
                    .unwrap_or(0);
                let driver = crate::gpu::metal::MetalDriver::new(device.device_id, proxy_size)?;
                GpuExecutor::new(Box::new(driver), self.config.gpu)
            }
            GpuBackend::Cuda => self.create_cuda_executor(device),
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn create_executor(&self, device: GpuDevice) -> Result<GpuExecutor> {
        use crate::gpu::GpuBackend;
        match device.backend {
            GpuBackend::Metal => Err(Error::BackendUnavailable {
                backend: device.backend,
            }),
            GpuBackend::Cuda => self.create_cuda_executor(device),
        }
    }

    #[cfg(feature = "cuda")]
    fn create_cuda_executor(&self, device: GpuDevice) -> Result<GpuExecutor> {
        let driver = crate::gpu::cuda::CudaDriver::new(device.device_id)?;
        GpuExecutor::new(Box::new(driver), self.config.gpu)
    }

    #[cfg(not(feature = "cuda"))]
    fn create_cuda_executor(&self, device: GpuDevice) -> Result<GpuExecutor> {
        Err(Error::BackendUnavailable {
            backend: device.backend,
        })
    }
}

/// Resolves when a committed graph has run to completion
///
/// `wait` yields the execution trace, or the first error the scheduler
/// surfaced.
#[derive(Debug)]
pub struct CommitFuture {
    handle: Option<JoinHandle<Result<ExecutionTrace>>>,
}

impl CommitFuture {
    /// Block until the graph has drained and take the result
    pub fn wait(mut self) -> Result<ExecutionTrace> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| Error::Internal("commit future already waited".to_string()))?;
        handle
            .join()
            .unwrap_or_else(|payload| {
                Err(Error::Internal(format!(
                    "scheduler thread panicked: {}",
                    Error::panic_message(payload.as_ref())
                )))
            })
    }

    /// Whether the scheduler thread has already returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(JoinHandle::is_finished)
    }
}

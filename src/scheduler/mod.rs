//! Event-driven graph scheduler
//!
//! One scheduler is built per committed graph. It seeds a ready queue
//! from the zero-dependency tasks, dispatches CPU tasks to the worker
//! pool and GPU tasks to the executor, then blocks on the completion
//! queue; every drained completion decrements its dependents'
//! outstanding-dependency counts, feeding the ready queue until the
//! whole graph has completed.
//!
//! Device callbacks stay narrow: they post a task id to the completion
//! queue and nothing else. A GPU task therefore passes through the queue
//! twice — once when its kernel retires (the scheduler thread reacts by
//! issuing the device-to-host copy) and once when that copy retires
//! (the task completes). Every data-store, allocator, and idle-pool
//! mutation happens on the scheduler thread between waits.

mod queue;

pub use queue::CompletionQueue;

use crate::data::{DataId, DataStore, HostSpan, MemoryHint};
use crate::error::{Error, Result};
use crate::gpu::{BufferHandle, DeviceCallback, GpuExecutor, KernelDispatch};
use crate::graph::{CpuTask, GpuTask, Task, TaskGraph, TaskId};
use crate::pool::ThreadPool;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Exactly 8 bytes: a little-endian u64 count of valid output bytes
const COUNTER_BUFFER_SIZE: usize = 8;

/// Lifecycle of a task during one graph execution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting on at least one producer
    Pending,
    /// All producers complete; queued for dispatch
    Ready,
    /// Dispatched to the pool or the device
    Running,
    /// Completion drained by the scheduler
    Complete,
}

struct TaskRuntimeState {
    state: TaskState,
    outstanding_deps: usize,
}

/// What happened to a task, and when
#[derive(Clone, Copy, Debug)]
pub enum TraceEvent {
    /// The task left the ready queue
    Dispatched(TaskId, Instant),
    /// The task's completion was drained
    Completed(TaskId, Instant),
}

/// Timestamped record of one graph execution
#[derive(Clone, Debug, Default)]
pub struct ExecutionTrace {
    /// Events in the order the scheduler observed them
    pub events: Vec<TraceEvent>,
}

impl ExecutionTrace {
    /// Task ids in completion-drain order
    pub fn completion_order(&self) -> Vec<TaskId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Completed(id, _) => Some(*id),
                TraceEvent::Dispatched(..) => None,
            })
            .collect()
    }

    /// When the task was dispatched, if it was
    pub fn dispatched_at(&self, id: TaskId) -> Option<Instant> {
        self.events.iter().find_map(|e| match e {
            TraceEvent::Dispatched(t, at) if *t == id => Some(*at),
            _ => None,
        })
    }

    /// When the task's completion was drained, if it was
    pub fn completed_at(&self, id: TaskId) -> Option<Instant> {
        self.events.iter().find_map(|e| match e {
            TraceEvent::Completed(t, at) if *t == id => Some(*at),
            _ => None,
        })
    }
}

/// Per-task device state between kernel submission and completion
struct TaskBuffers {
    output: BufferHandle,
    counter: Option<BufferHandle>,
    /// Destination for the direct (non-counted) device-to-host copy
    output_span: Option<HostSpan>,
    /// Whether the device-to-host copy has been issued yet
    fetch_issued: bool,
}

/// Drives one task graph to completion
pub struct Scheduler<'a> {
    store: Arc<DataStore>,
    pool: &'a ThreadPool,
    gpu: Option<Arc<Mutex<GpuExecutor>>>,
    completions: Arc<CompletionQueue>,
    first_error: Arc<Mutex<Option<Error>>>,
    /// Scratch outputs of counted kernels, installed on completion
    pending_outputs: HashMap<TaskId, Vec<u8>>,
    /// Retired buffers by class and size, reusable for later tasks
    idle_buffers: HashMap<MemoryHint, BTreeMap<usize, Vec<BufferHandle>>>,
    idle_count: usize,
    idle_high_water: usize,
}

impl<'a> Scheduler<'a> {
    /// Build a scheduler over the store, pool, and optional GPU executor
    pub fn new(
        store: Arc<DataStore>,
        pool: &'a ThreadPool,
        gpu: Option<Arc<Mutex<GpuExecutor>>>,
    ) -> Self {
        Self {
            store,
            pool,
            gpu,
            completions: Arc::new(CompletionQueue::new()),
            first_error: Arc::new(Mutex::new(None)),
            pending_outputs: HashMap::new(),
            idle_buffers: HashMap::new(),
            idle_count: 0,
            idle_high_water: 32,
        }
    }

    /// Cap the number of retired buffers kept for reuse
    pub fn with_idle_high_water(mut self, n: usize) -> Self {
        self.idle_high_water = n;
        self
    }

    /// Run the graph to completion (or to the first fatal backend error)
    ///
    /// The graph must have passed [`TaskGraph::validate_graph`]; a cyclic
    /// or incomplete graph would leave the scheduler waiting forever.
    pub fn execute_graph(&mut self, graph: &TaskGraph) -> Result<ExecutionTrace> {
        let mut states: HashMap<TaskId, TaskRuntimeState> = HashMap::new();
        let mut ready: VecDeque<TaskId> = VecDeque::new();
        let mut running: HashSet<TaskId> = HashSet::new();
        let mut num_complete = 0usize;
        let mut trace = ExecutionTrace::default();

        // How many incomplete GPU tasks still read each data id; the
        // mapped buffer retires when this reaches zero.
        let mut gpu_readers: HashMap<DataId, usize> = HashMap::new();
        let mut task_buffers: HashMap<TaskId, TaskBuffers> = HashMap::new();

        for &id in graph.task_ids() {
            let deps = graph.dependencies(id).len();
            let state = if deps == 0 {
                ready.push_back(id);
                TaskState::Ready
            } else {
                TaskState::Pending
            };
            states.insert(
                id,
                TaskRuntimeState {
                    state,
                    outstanding_deps: deps,
                },
            );
            if let Some(Task::Gpu(task)) = graph.task(id) {
                for &input in task.input_ids() {
                    *gpu_readers.entry(input).or_insert(0) += 1;
                }
            }
        }

        while num_complete < graph.len() {
            // Dispatch everything that is ready.
            while let Some(id) = ready.pop_front() {
                let state = states.get_mut(&id).expect("ready task is known");
                debug_assert_eq!(state.state, TaskState::Ready);
                state.state = TaskState::Running;
                trace.events.push(TraceEvent::Dispatched(id, Instant::now()));
                tracing::debug!(?id, "dispatching task");

                let result = match graph.task(id).expect("ready task is known") {
                    Task::Cpu(task) => self.visit_cpu(task),
                    Task::Gpu(task) => self.visit_gpu(task, &mut task_buffers),
                };
                if let Err(e) = result {
                    return Err(self.fail_graph(e));
                }
                running.insert(id);
            }

            // Block until something finishes, then drain every completion.
            let mut drained = Vec::new();
            self.completions.wait_drain(&mut drained);
            for id in drained {
                let task = graph.task(id).expect("completed task is known");

                // A GPU task's first pass through the queue is its kernel
                // retirement; react by issuing the device-to-host copy
                // and wait for the second pass.
                if let Task::Gpu(gpu_task) = task {
                    let fetch_pending = task_buffers
                        .get(&id)
                        .is_some_and(|buffers| !buffers.fetch_issued);
                    if fetch_pending {
                        let buffers = task_buffers.get_mut(&id).expect("checked above");
                        buffers.fetch_issued = true;
                        match self.begin_fetch(gpu_task, &task_buffers[&id]) {
                            Ok(()) => continue,
                            // The copy could not be issued; complete the
                            // task now and surface the error at the end.
                            Err(e) => self.record_error(e),
                        }
                    }
                }

                let state = states.get_mut(&id).expect("completed task is known");
                debug_assert_eq!(state.state, TaskState::Running);
                state.state = TaskState::Complete;
                running.remove(&id);
                num_complete += 1;
                trace.events.push(TraceEvent::Completed(id, Instant::now()));
                tracing::debug!(?id, num_complete, "task complete");

                // Counted kernels: install the scratch output now.
                if let Some(bytes) = self.pending_outputs.remove(&id) {
                    if let Err(e) = self.store.store_bytes(task.output_id(), &bytes) {
                        self.record_error(e);
                    }
                }

                if let Task::Gpu(gpu_task) = task {
                    if let Err(e) =
                        self.retire_task_buffers(gpu_task, &mut task_buffers, &mut gpu_readers)
                    {
                        self.record_error(e);
                    }
                }

                for &dependent in graph.dependents(id) {
                    let dep_state = states.get_mut(&dependent).expect("dependent is known");
                    dep_state.outstanding_deps -= 1;
                    if dep_state.outstanding_deps == 0 {
                        debug_assert_eq!(dep_state.state, TaskState::Pending);
                        dep_state.state = TaskState::Ready;
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if let Some(e) = self.first_error.lock().take() {
            return Err(e);
        }
        Ok(trace)
    }

    /// Record the first task-level error; later ones are dropped
    fn record_error(&self, e: Error) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    /// Fatal dispatch failure: drain the device, surface the error
    fn fail_graph(&self, e: Error) -> Error {
        tracing::warn!(error = %e, "graph execution failed; draining device");
        if let Some(gpu) = &self.gpu {
            let _ = gpu.lock().synchronize();
        }
        e
    }

    /// Submit a CPU task body wrapped in a completion-posting job
    ///
    /// Body errors and panics are recorded as the graph's first error;
    /// the completion is posted regardless so the DAG advances.
    fn visit_cpu(&self, task: &CpuTask) -> Result<()> {
        let id = task.id;
        let name = task.name().to_string();
        let body = Arc::clone(&task.body);
        let completions = Arc::clone(&self.completions);
        let first_error = Arc::clone(&self.first_error);

        let _ = self.pool.submit(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| body()));
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(Error::TaskPanicked {
                    task: name,
                    message: Error::panic_message(payload.as_ref()),
                }),
            };
            if let Some(e) = error {
                let mut slot = first_error.lock();
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
            completions.push(id);
        });
        Ok(())
    }

    /// Stage inputs, acquire buffers, and submit a GPU kernel
    fn visit_gpu(
        &mut self,
        task: &GpuTask,
        task_buffers: &mut HashMap<TaskId, TaskBuffers>,
    ) -> Result<()> {
        let gpu = self
            .gpu
            .clone()
            .ok_or_else(|| Error::Internal("graph has GPU tasks but no executor".to_string()))?;
        let mut ex = gpu.lock();

        let mut buffers: Vec<BufferHandle> = Vec::with_capacity(task.input_ids().len() + 2);
        let mut max_input_size = 0usize;

        for &input in task.input_ids() {
            let size = self.store.byte_size(input)?;
            max_input_size = max_input_size.max(size);

            if let Some(resident) = ex.buffer_for_data(input) {
                buffers.push(resident);
                continue;
            }

            let hint = self.store.mem_hint(input)?;
            let buffer = self.acquire_buffer(&mut ex, size, hint)?;
            let bytes = self.store.get_span(input)?;
            ex.copy_to_device(bytes, &buffer)?;
            ex.map_data_to_buffer(input, buffer);
            buffers.push(buffer);
        }

        // Zero output size means "size it like the largest input".
        let output_id = task.output_id();
        let declared = self.store.byte_size(output_id)?;
        let output_size = if declared == 0 { max_input_size } else { declared };
        let output_hint = self.store.mem_hint(output_id)?;
        let output_buffer = self.acquire_buffer(&mut ex, output_size, output_hint)?;
        buffers.push(output_buffer);

        let counter = if task.count_buffer_active() {
            let counter = ex.allocate_buffer(COUNTER_BUFFER_SIZE, MemoryHint::HostVisible)?;
            buffers.push(counter);
            Some(counter)
        } else {
            None
        };

        // Capture the destination span now; counted kernels have no
        // destination until their counter is probed.
        let output_span = if task.count_buffer_active() {
            None
        } else {
            Some(self.store.span_mut_raw(output_id)?)
        };

        let dispatch = KernelDispatch {
            kernel_name: task.name().to_string(),
            buffers,
            grid_dim: task.grid_dim(),
            block_dim: task.block_dim(),
        };

        task_buffers.insert(
            task.id,
            TaskBuffers {
                output: output_buffer,
                counter,
                output_span,
                fetch_issued: false,
            },
        );

        let task_id = task.id;
        let completions = Arc::clone(&self.completions);
        let on_retire: DeviceCallback = Box::new(move || completions.push(task_id));
        ex.execute_kernel(&dispatch, on_retire)
    }

    /// Issue the device-to-host copy for a retired kernel
    ///
    /// Runs on the scheduler thread. Counted kernels probe the 8-byte
    /// little-endian counter first and copy into a scratch buffer sized
    /// by it; direct kernels copy straight into the output entry's span.
    fn begin_fetch(&mut self, task: &GpuTask, buffers: &TaskBuffers) -> Result<()> {
        let gpu = self.gpu.clone().expect("GPU task ran on an executor");
        let mut ex = gpu.lock();

        let task_id = task.id;
        let completions = Arc::clone(&self.completions);
        let finish: DeviceCallback = Box::new(move || completions.push(task_id));

        if task.count_buffer_active() {
            let counter = buffers.counter.expect("counted dispatch carries a counter");
            let bytes = ex.read_buffer(&counter, COUNTER_BUFFER_SIZE)?;
            let mut raw = [0u8; COUNTER_BUFFER_SIZE];
            raw.copy_from_slice(&bytes[..COUNTER_BUFFER_SIZE]);
            let count = u64::from_le_bytes(raw) as usize;

            let mut scratch = vec![0u8; count];
            let span = HostSpan::from_slice(&mut scratch);
            self.pending_outputs.insert(task_id, scratch);
            let issued = ex.copy_from_device(span, &buffers.output, finish);
            if issued.is_err() {
                self.pending_outputs.remove(&task_id);
            }
            issued
        } else {
            let span = buffers
                .output_span
                .expect("direct dispatch carries an output span");
            ex.copy_from_device(span, &buffers.output, finish)
        }
    }

    /// Reuse the smallest sufficient idle buffer of the class, else allocate
    fn acquire_buffer(
        &mut self,
        ex: &mut GpuExecutor,
        size: usize,
        hint: MemoryHint,
    ) -> Result<BufferHandle> {
        if let Some(by_size) = self.idle_buffers.get_mut(&hint) {
            if let Some((&found, _)) = by_size.range(size..).next() {
                let list = by_size.get_mut(&found).expect("range hit exists");
                let buffer = list.pop().expect("idle list is non-empty");
                if list.is_empty() {
                    by_size.remove(&found);
                }
                self.idle_count -= 1;
                tracing::trace!(size, reused = buffer.size, ?hint, "idle buffer reused");
                return Ok(buffer);
            }
        }
        ex.allocate_buffer(size, hint)
    }

    /// Park a no-longer-needed buffer for reuse, bounded by the high-water
    fn park_buffer(&mut self, ex: &mut GpuExecutor, buffer: BufferHandle) -> Result<()> {
        if self.idle_count >= self.idle_high_water {
            return ex.deallocate_buffer(&buffer);
        }
        self.idle_buffers
            .entry(buffer.mem_hint)
            .or_default()
            .entry(buffer.size)
            .or_default()
            .push(buffer);
        self.idle_count += 1;
        Ok(())
    }

    /// Release a completed GPU task's buffers
    ///
    /// The output and counter buffers retire immediately (the
    /// device-to-host copy has already landed); each input's mapped
    /// buffer retires once its last reading task has completed.
    fn retire_task_buffers(
        &mut self,
        task: &GpuTask,
        task_buffers: &mut HashMap<TaskId, TaskBuffers>,
        gpu_readers: &mut HashMap<DataId, usize>,
    ) -> Result<()> {
        let gpu = self.gpu.clone().expect("GPU task ran on an executor");
        let mut ex = gpu.lock();

        if let Some(buffers) = task_buffers.remove(&task.id) {
            self.park_buffer(&mut ex, buffers.output)?;
            if let Some(counter) = buffers.counter {
                ex.deallocate_buffer(&counter)?;
            }
        }

        for &input in task.input_ids() {
            let readers = gpu_readers
                .get_mut(&input)
                .expect("reader counts cover every GPU input");
            *readers -= 1;
            if *readers == 0 {
                if let Some(buffer) = ex.unmap_data(input) {
                    self.park_buffer(&mut ex, buffer)?;
                }
            }
        }
        Ok(())
    }
}

//! Task variants and the typed-argument capture for CPU tasks

use crate::data::{DataHandle, DataId, DataStore, HostValue};
use crate::error::Result;
use smallvec::SmallVec;
use std::sync::Arc;

/// Identifier of a task within a graph
///
/// Ids are assigned monotonically by [`crate::graph::TaskGraph::add_task`].
/// [`TaskId::ROOT`] is the synthetic producer of data that is resident in
/// the data store before execution begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub i64);

impl TaskId {
    /// The synthetic root producer
    pub const ROOT: TaskId = TaskId(-1);
}

pub(crate) type TaskBody = Arc<dyn Fn() -> Result<()> + Send + Sync + 'static>;

/// Tuple of typed handles a CPU task reads its inputs through
///
/// Implemented for handle tuples of arity 0 to 4. `fetch` resolves every
/// handle against the store and yields the values in declaration order.
pub trait TaskArgs: Send + Sync + 'static {
    /// The resolved value tuple
    type Values;

    /// Data ids of the handles, in declaration order
    fn ids(&self) -> Vec<DataId>;

    /// Resolve every handle against the store
    fn fetch(&self, store: &DataStore) -> Result<Self::Values>;
}

impl TaskArgs for () {
    type Values = ();

    fn ids(&self) -> Vec<DataId> {
        Vec::new()
    }

    fn fetch(&self, _store: &DataStore) -> Result<()> {
        Ok(())
    }
}

macro_rules! impl_task_args {
    ($($ty:ident : $idx:tt),+) => {
        impl<$($ty: Clone + 'static),+> TaskArgs for ($(DataHandle<$ty>,)+) {
            type Values = ($($ty,)+);

            fn ids(&self) -> Vec<DataId> {
                vec![$(self.$idx.id()),+]
            }

            fn fetch(&self, store: &DataStore) -> Result<Self::Values> {
                Ok(($(store.get(&self.$idx)?,)+))
            }
        }
    };
}

impl_task_args!(A: 0);
impl_task_args!(A: 0, B: 1);
impl_task_args!(A: 0, B: 1, C: 2);
impl_task_args!(A: 0, B: 1, C: 2, D: 3);

/// A task whose body runs on the CPU worker pool
///
/// Construction monomorphizes a closure that fetches the inputs, invokes
/// the user function, and stores the result to the output handle; the
/// closure is what the scheduler submits, erased of every type.
pub struct CpuTask {
    pub(crate) id: TaskId,
    name: String,
    input_ids: SmallVec<[DataId; 4]>,
    output_id: DataId,
    pub(crate) body: TaskBody,
}

impl CpuTask {
    /// Build a CPU task from typed handles and a function over their values
    pub fn new<Args, F, R>(
        name: impl Into<String>,
        args: Args,
        output: DataHandle<R>,
        store: &Arc<DataStore>,
        f: F,
    ) -> Self
    where
        Args: TaskArgs,
        F: Fn(Args::Values) -> R + Send + Sync + 'static,
        R: HostValue,
    {
        let input_ids = SmallVec::from_vec(args.ids());
        let output_id = output.id();
        let store = Arc::clone(store);
        let body: TaskBody = Arc::new(move || {
            let values = args.fetch(&store)?;
            let result = f(values);
            store.store(output_id, result)
        });

        Self {
            id: TaskId::ROOT,
            name: name.into(),
            input_ids,
            output_id,
            body,
        }
    }

    /// The task's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data ids this task reads
    pub fn input_ids(&self) -> &[DataId] {
        &self.input_ids
    }

    /// The data id this task produces
    pub fn output_id(&self) -> DataId {
        self.output_id
    }
}

/// A task dispatched to the GPU backend as a kernel
pub struct GpuTask {
    pub(crate) id: TaskId,
    name: String,
    input_ids: SmallVec<[DataId; 4]>,
    output_id: DataId,
    count_buffer_active: bool,
    grid_dim: [u32; 3],
    block_dim: [u32; 3],
}

impl GpuTask {
    /// Build a GPU task
    ///
    /// `name` doubles as the kernel name to launch. `count_buffer_active`
    /// opts into dynamic output sizing: the kernel receives an extra
    /// 8-byte host-visible counter as its last binding and writes the
    /// number of valid output bytes there, little-endian.
    pub fn new(
        name: impl Into<String>,
        input_ids: Vec<DataId>,
        output_id: DataId,
        count_buffer_active: bool,
        grid_dim: [u32; 3],
        block_dim: [u32; 3],
    ) -> Self {
        Self {
            id: TaskId::ROOT,
            name: name.into(),
            input_ids: SmallVec::from_vec(input_ids),
            output_id,
            count_buffer_active,
            grid_dim,
            block_dim,
        }
    }

    /// The kernel name to launch
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data ids bound as kernel inputs
    pub fn input_ids(&self) -> &[DataId] {
        &self.input_ids
    }

    /// The data id the kernel writes
    pub fn output_id(&self) -> DataId {
        self.output_id
    }

    /// Whether this task uses the dynamic-output counter protocol
    pub fn count_buffer_active(&self) -> bool {
        self.count_buffer_active
    }

    /// Grid dimensions of the dispatch
    pub fn grid_dim(&self) -> [u32; 3] {
        self.grid_dim
    }

    /// Block dimensions of the dispatch
    pub fn block_dim(&self) -> [u32; 3] {
        self.block_dim
    }
}

/// A node of the task graph
///
/// The scheduler pattern-matches on the variant to dispatch; there is no
/// runtime downcasting anywhere in the pipeline.
pub enum Task {
    /// Runs on the CPU worker pool
    Cpu(CpuTask),
    /// Dispatched to the GPU backend
    Gpu(GpuTask),
}

impl Task {
    /// The task's id within its graph
    pub fn id(&self) -> TaskId {
        match self {
            Task::Cpu(t) => t.id,
            Task::Gpu(t) => t.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: TaskId) {
        match self {
            Task::Cpu(t) => t.id = id,
            Task::Gpu(t) => t.id = id,
        }
    }

    /// The task's name (kernel name for GPU tasks)
    pub fn name(&self) -> &str {
        match self {
            Task::Cpu(t) => &t.name,
            Task::Gpu(t) => &t.name,
        }
    }

    /// Data ids this task reads, in binding order
    pub fn input_ids(&self) -> &[DataId] {
        match self {
            Task::Cpu(t) => &t.input_ids,
            Task::Gpu(t) => &t.input_ids,
        }
    }

    /// The data id this task produces
    pub fn output_id(&self) -> DataId {
        match self {
            Task::Cpu(t) => t.output_id,
            Task::Gpu(t) => t.output_id,
        }
    }
}

impl From<CpuTask> for Task {
    fn from(task: CpuTask) -> Self {
        Task::Cpu(task)
    }
}

impl From<GpuTask> for Task {
    fn from(task: GpuTask) -> Self {
        Task::Gpu(task)
    }
}

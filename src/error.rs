//! Error types for taskr

use crate::data::{DataId, MemoryHint};
use crate::gpu::GpuBackend;
use crate::graph::TaskId;
use thiserror::Error;

/// Result type alias using taskr's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or executing a task graph
#[derive(Error, Debug)]
pub enum Error {
    // ===== Graph construction =====
    /// Two tasks declared the same output data id
    #[error("Data {data_id:?} already has producing task {producer:?}")]
    DuplicateProducer {
        /// The contested output data id
        data_id: DataId,
        /// The task already registered as producer
        producer: TaskId,
    },

    /// Some consumed data ids have no producer and are not store-resident
    #[error("Graph consumes data with no producer: {data_ids:?}")]
    UnfulfilledData {
        /// Every data id still waiting for a producer at validation
        data_ids: Vec<DataId>,
    },

    /// The graph contains a dependency cycle among non-root tasks
    #[error("Task graph contains a cycle")]
    Cyclic,

    // ===== Data store =====
    /// Stored value type differs from the handle's type parameter
    #[error("Type mismatch for data {data_id:?}")]
    TypeMismatch {
        /// The handle's data id
        data_id: DataId,
    },

    /// Mutable access to an entry registered as `ReadOnly`
    #[error("Mutable access to read-only data {data_id:?}")]
    ReadOnlyViolation {
        /// The offending data id
        data_id: DataId,
    },

    /// The data id is not present in the store
    #[error("Unknown data id {data_id:?}")]
    UnknownDataId {
        /// The missing data id
        data_id: DataId,
    },

    /// Byte-level overwrite with a length different from the entry's
    #[error("Length mismatch for data {data_id:?}: entry holds {expected} bytes, got {got}")]
    LengthMismatch {
        /// The target data id
        data_id: DataId,
        /// Byte size recorded for the entry
        expected: usize,
        /// Byte size of the incoming span
        got: usize,
    },

    // ===== Buddy allocator =====
    /// No free block of sufficient order in the requested memory class
    #[error("Out of {class:?} memory: no free block for {requested} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        requested: usize,
        /// Memory class the request targeted
        class: MemoryHint,
    },

    /// The `(order, offset)` pair is already on a free list
    #[error("Double free of {class:?} block at offset {offset}")]
    DoubleFree {
        /// Offset of the block within its slab
        offset: usize,
        /// Memory class of the slab
        class: MemoryHint,
    },

    /// The memory class was configured with zero bounds
    #[error("Memory class {class:?} is not configured for this executor")]
    InvalidMemoryClass {
        /// The unavailable memory class
        class: MemoryHint,
    },

    // ===== GPU backend =====
    /// The requested backend cannot be constructed on this host
    #[error("GPU backend {backend:?} is unavailable")]
    BackendUnavailable {
        /// The requested backend
        backend: GpuBackend,
    },

    /// A buffer handle the executor no longer (or never) tracked
    #[error("Stale buffer handle {buffer_id}")]
    GhostBuffer {
        /// The handle's unique id
        buffer_id: u64,
    },

    /// A dispatch mode the driver does not implement
    #[error("Invalid dispatch type for this driver")]
    InvalidDispatchType,

    /// A host/device transfer failed
    #[error("Copy failure: {0}")]
    CopyFailure(String),

    /// A kernel submission or retirement reported non-success
    #[error("Kernel '{kernel}' failed: {reason}")]
    KernelFailure {
        /// Name of the kernel
        kernel: String,
        /// Driver-reported reason
        reason: String,
    },

    // ===== Thread pool =====
    /// Pool construction with zero worker threads
    #[error("Thread pool requires at least one worker thread")]
    InvalidThreadCount,

    /// A task body panicked; the payload was captured by the pool
    #[error("Task '{task}' panicked: {message}")]
    TaskPanicked {
        /// Name of the task whose body panicked
        task: String,
        /// Stringified panic payload
        message: String,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an out-of-memory error
    pub fn out_of_memory(requested: usize, class: MemoryHint) -> Self {
        Self::OutOfMemory { requested, class }
    }

    /// Create a copy-failure error
    pub fn copy_failure(reason: impl Into<String>) -> Self {
        Self::CopyFailure(reason.into())
    }

    /// Create a kernel-failure error
    pub fn kernel_failure(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KernelFailure {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    /// Stringify a panic payload captured by `catch_unwind`
    pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        }
    }
}

//! # taskr
//!
//! **Heterogeneous task-graph runtime for Rust.**
//!
//! taskr takes a DAG of compute tasks — closures on CPU worker threads
//! and kernel dispatches on a GPU backend — and drives it to completion
//! while honoring data dependencies, reusing device buffers, and keeping
//! transfers off the scheduler's critical path.
//!
//! ## How it fits together
//!
//! - **Data store**: host values keyed by opaque ids, with byte-span
//!   accessors for transfers and typed handles for retrieval.
//! - **Task graph**: edges are inferred from which tasks produce and
//!   consume which data ids; validation catches duplicate producers,
//!   unfulfilled data, and cycles before anything runs.
//! - **Scheduler**: an event-driven loop that dispatches ready tasks to
//!   the CPU pool or the GPU executor and sleeps on a completion queue.
//! - **GPU backend**: one abstract driver (Metal on macOS, CUDA behind
//!   the `cuda` feature, or your own) beneath a shared executor that
//!   sub-allocates kernel buffers from per-class buddy-managed slabs.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use taskr::prelude::*;
//!
//! let store = Arc::new(DataStore::new());
//! let a = store.create_data_handle(vec![1.0f32, 2.0, 3.0], DataUsage::ReadOnly, MemoryHint::Unified);
//! let b = store.create_data_handle(vec![4.0f32, 5.0, 6.0], DataUsage::ReadOnly, MemoryHint::Unified);
//! let out = store.create_data_handle(0.0f32, DataUsage::ReadWrite, MemoryHint::Unified);
//!
//! let mut graph = TaskGraph::new();
//! graph.add_task(
//!     CpuTask::new("dot", (a, b), out, &store, |(x, y): (Vec<f32>, Vec<f32>)| {
//!         x.iter().zip(&y).map(|(p, q)| p * q).sum::<f32>()
//!     }),
//!     true,
//! )?;
//!
//! let runtime = Runtime::new(Arc::clone(&store), 4);
//! runtime
//!     .commit_graph(graph, GpuDevice::new(GpuBackend::Metal))?
//!     .wait()?;
//!
//! assert_eq!(store.get(&out)?, 32.0);
//! # Ok::<(), taskr::error::Error>(())
//! ```
//!
//! ## Feature flags
//!
//! - `cuda`: NVIDIA CUDA driver via `cudarc`
//!
//! The Metal driver is built automatically on macOS.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod data;
pub mod error;
pub mod gpu;
pub mod graph;
pub mod pool;
pub mod runtime;
pub mod scheduler;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::data::{DataHandle, DataId, DataStore, DataUsage, MemoryHint};
    pub use crate::error::{Error, Result};
    pub use crate::gpu::{GpuBackend, GpuDevice};
    pub use crate::graph::{CpuTask, GpuTask, Task, TaskGraph, TaskId};
    pub use crate::pool::ThreadPool;
    pub use crate::runtime::{CommitFuture, Runtime, RuntimeConfig};
    pub use crate::scheduler::{ExecutionTrace, Scheduler};
}

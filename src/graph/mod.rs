//! Task graph construction and validation
//!
//! The graph is producer-centric: edges are never declared, they are
//! inferred from data-handle usage. Adding a task registers it as the
//! producer of its output id and links it under the producers of its
//! input ids; consumers added before their producer wait in
//! `unfulfilled_data` and are adopted when the producer appears.

mod task;

pub use task::{CpuTask, GpuTask, Task, TaskArgs, TaskId};

use crate::data::DataId;
use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};

type AdjList = SmallVec<[TaskId; 4]>;

/// A DAG of CPU and GPU tasks with edges inferred from data ids
#[derive(Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    /// Insertion order, for deterministic iteration
    order: Vec<TaskId>,
    data_producer: HashMap<DataId, TaskId>,
    dependencies: HashMap<TaskId, AdjList>,
    dependents: HashMap<TaskId, AdjList>,
    unfulfilled_data: HashMap<DataId, AdjList>,
    next_id: i64,
}

impl TaskGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, inferring its edges from producer/consumer relations
    ///
    /// With `root = true`, inputs that have no known producer are treated
    /// as resident in the data store and recorded as produced by
    /// [`TaskId::ROOT`]; with `root = false` they wait in
    /// `unfulfilled_data` until a producing task is added.
    ///
    /// Fails with [`Error::DuplicateProducer`] when another task already
    /// produces this task's output id.
    pub fn add_task(&mut self, task: impl Into<Task>, root: bool) -> Result<TaskId> {
        let mut task = task.into();
        let output_id = task.output_id();
        if let Some(&producer) = self.data_producer.get(&output_id) {
            return Err(Error::DuplicateProducer {
                data_id: output_id,
                producer,
            });
        }

        let id = TaskId(self.next_id);
        self.next_id += 1;
        task.set_id(id);
        self.data_producer.insert(output_id, id);

        for &input_id in task.input_ids() {
            match self.data_producer.get(&input_id) {
                Some(&producer) => {
                    if producer != TaskId::ROOT {
                        self.dependencies.entry(id).or_default().push(producer);
                        self.dependents.entry(producer).or_default().push(id);
                    }
                }
                None if root => {
                    self.data_producer.insert(input_id, TaskId::ROOT);
                }
                None => {
                    self.unfulfilled_data.entry(input_id).or_default().push(id);
                }
            }
        }

        // Adopt consumers that were waiting for this output.
        if let Some(waiters) = self.unfulfilled_data.remove(&output_id) {
            for waiter in waiters {
                self.dependencies.entry(waiter).or_default().push(id);
                self.dependents.entry(id).or_default().push(waiter);
            }
        }

        tracing::trace!(?id, name = task.name(), "task added");
        self.tasks.insert(id, task);
        self.order.push(id);
        Ok(id)
    }

    /// Check the graph is complete and acyclic
    ///
    /// Fails with [`Error::UnfulfilledData`] (naming the offending data
    /// ids) if any consumed data still has no producer, and with
    /// [`Error::Cyclic`] if Kahn's algorithm cannot order every task.
    pub fn validate_graph(&self) -> Result<()> {
        if !self.unfulfilled_data.is_empty() {
            let mut data_ids: Vec<DataId> = self.unfulfilled_data.keys().copied().collect();
            data_ids.sort();
            return Err(Error::UnfulfilledData { data_ids });
        }

        let mut in_degree: HashMap<TaskId, usize> = self
            .order
            .iter()
            .map(|&id| (id, self.dependencies(id).len()))
            .collect();
        let mut queue: VecDeque<TaskId> = self
            .order
            .iter()
            .copied()
            .filter(|&id| in_degree[&id] == 0)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &dependent in self.dependents(id) {
                let degree = in_degree
                    .get_mut(&dependent)
                    .expect("dependent is a known task");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited != self.tasks.len() {
            return Err(Error::Cyclic);
        }
        Ok(())
    }

    /// Tasks with no dependencies, in insertion order
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .copied()
            .filter(|&id| self.dependencies(id).is_empty())
            .collect()
    }

    /// Producers this task waits on (with multiplicity)
    pub fn dependencies(&self, id: TaskId) -> &[TaskId] {
        self.dependencies.get(&id).map_or(&[], |v| v.as_slice())
    }

    /// Consumers waiting on this task (with multiplicity)
    pub fn dependents(&self, id: TaskId) -> &[TaskId] {
        self.dependents.get(&id).map_or(&[], |v| v.as_slice())
    }

    /// Look up a task by id
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Every task id, in insertion order
    pub fn task_ids(&self) -> &[TaskId] {
        &self.order
    }

    /// Number of tasks in the graph
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether any task needs the GPU backend
    pub fn has_gpu_tasks(&self) -> bool {
        self.tasks.values().any(|t| matches!(t, Task::Gpu(_)))
    }

    /// The producing task of a data id, if one is known
    pub fn producer(&self, data_id: DataId) -> Option<TaskId> {
        self.data_producer.get(&data_id).copied()
    }
}

//! The completion queue: how finished work wakes the scheduler

use crate::graph::TaskId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Multi-producer, single-consumer FIFO of completed task ids
///
/// Pool jobs and device callbacks push; the scheduler blocks in
/// [`CompletionQueue::wait_drain`] and handles every queued completion in
/// enqueue order.
#[derive(Default)]
pub struct CompletionQueue {
    queue: Mutex<VecDeque<TaskId>>,
    ready: Condvar,
}

impl CompletionQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a completed task and wake the scheduler
    pub fn push(&self, id: TaskId) {
        self.queue.lock().push_back(id);
        self.ready.notify_one();
    }

    /// Block until at least one completion is queued, then drain them all
    pub fn wait_drain(&self, out: &mut Vec<TaskId>) {
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            self.ready.wait(&mut queue);
        }
        out.extend(queue.drain(..));
    }

    /// Drain without blocking; returns how many completions were taken
    pub fn try_drain(&self, out: &mut Vec<TaskId>) -> usize {
        let mut queue = self.queue.lock();
        let n = queue.len();
        out.extend(queue.drain(..));
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drain_preserves_enqueue_order() {
        let queue = CompletionQueue::new();
        queue.push(TaskId(2));
        queue.push(TaskId(0));
        queue.push(TaskId(1));

        let mut out = Vec::new();
        queue.wait_drain(&mut out);
        assert_eq!(out, vec![TaskId(2), TaskId(0), TaskId(1)]);
    }

    #[test]
    fn wait_drain_wakes_on_cross_thread_push() {
        let queue = Arc::new(CompletionQueue::new());
        let pusher = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(TaskId(7)))
        };

        let mut out = Vec::new();
        queue.wait_drain(&mut out);
        assert_eq!(out, vec![TaskId(7)]);
        pusher.join().unwrap();
    }
}

//! Outbound task queue.
//!
//! Buffers calls made before their target exists. [`TaskQueue::flush_all`]
//! hands every task to the target in enqueue order and waits for all of
//! them; [`TaskQueue::reject_all`] settles them with an error instead.
//! Each task is consumed by exactly one of the two.

use crate::error::{Result, WorkerError};
use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use tokio::sync::oneshot;

type Invoke<T> = Box<dyn FnOnce(&T) -> BoxFuture<'static, Result<Value>> + Send>;

struct QueuedTask<T> {
    invoke: Invoke<T>,
    settle: oneshot::Sender<Result<Value>>,
}

/// Summary of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl FlushReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

pub struct TaskQueue<T> {
    tasks: VecDeque<QueuedTask<T>>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self { tasks: VecDeque::new() }
    }

    /// Append a task. The receiver settles when the task is flushed or rejected;
    /// it reports a closed channel if the queue is dropped first.
    pub fn enqueue<F>(&mut self, invoke: F) -> oneshot::Receiver<Result<Value>>
    where
        F: FnOnce(&T) -> BoxFuture<'static, Result<Value>> + Send + 'static,
    {
        let (settle, settled) = oneshot::channel();
        self.tasks.push_back(QueuedTask {
            invoke: Box::new(invoke),
            settle,
        });
        settled
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Invoke every queued task against `target`, in enqueue order, before
    /// returning. The returned future waits for all of them to settle; one
    /// failure does not stop the others. The queue is empty afterwards and
    /// can be reused.
    pub fn flush_all(&mut self, target: &T) -> impl Future<Output = FlushReport> + Send + 'static {
        let running: Vec<_> = self
            .tasks
            .drain(..)
            .map(|task| {
                let outcome = (task.invoke)(target);
                async move {
                    let outcome = outcome.await;
                    let succeeded = outcome.is_ok();
                    let _ = task.settle.send(outcome);
                    succeeded
                }
            })
            .collect();

        async move {
            let settled = join_all(running).await;
            let succeeded = settled.iter().filter(|ok| **ok).count();
            FlushReport {
                succeeded,
                failed: settled.len() - succeeded,
            }
        }
    }

    /// Settle every queued task with `reason` and clear the queue.
    pub fn reject_all(&mut self, reason: &WorkerError) -> usize {
        let rejected = self.tasks.len();
        for task in self.tasks.drain(..) {
            let _ = task.settle.send(Err(reason.clone()));
        }
        rejected
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.tasks.len()).finish()
    }
}

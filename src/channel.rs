//! Message channel collaborator and the in-process spawner.
//!
//! A [`Channel`] is one bidirectional, ordered pipe of packed frames to a
//! worker instance plus a hook that kills the instance. [`LocalSpawner`]
//! runs worker programs as tokio tasks inside the current process.

use crate::error::{Result, WorkerError};
use crate::methods::MethodRegistry;
use crate::protocol::WorkerPath;
use crate::worker::{Dispatcher, WorkerOptions};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type Terminator = Box<dyn FnOnce() + Send>;

/// Controller end of a connection to one worker instance.
pub struct Channel {
    sender: mpsc::UnboundedSender<Bytes>,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    terminator: Terminator,
}

impl Channel {
    pub fn new(
        sender: mpsc::UnboundedSender<Bytes>,
        receiver: mpsc::UnboundedReceiver<Bytes>,
        terminate: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            sender,
            receiver,
            terminator: Box::new(terminate),
        }
    }

    pub(crate) fn into_parts(self) -> (mpsc::UnboundedSender<Bytes>, mpsc::UnboundedReceiver<Bytes>, Terminator) {
        (self.sender, self.receiver, self.terminator)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Instantiates worker programs by path.
#[async_trait]
pub trait Spawn: Send + Sync {
    async fn spawn(&self, path: &WorkerPath) -> Result<Channel>;
}

type ProgramFn = Arc<dyn Fn() -> MethodRegistry + Send + Sync>;

#[derive(Default)]
struct SpawnCounters {
    spawned: AtomicUsize,
    terminated: AtomicUsize,
}

/// Runs each spawned worker's [`Dispatcher`] on its own tokio task.
///
/// ```rust,no_run
/// use workerlink::{LocalSpawner, MethodRegistry, WorkerContext};
///
/// let spawner = LocalSpawner::new();
/// spawner.register("workers/math", || {
///     let mut methods = MethodRegistry::new();
///     methods
///         .register_sync("add", |_: &WorkerContext, (a, b): (i64, i64)| Ok(a + b))
///         .ok();
///     methods
/// });
/// ```
#[derive(Clone, Default)]
pub struct LocalSpawner {
    programs: Arc<RwLock<HashMap<WorkerPath, ProgramFn>>>,
    options: WorkerOptions,
    counters: Arc<SpawnCounters>,
}

impl LocalSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: WorkerOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Register the program run for `path`; a later registration replaces it.
    pub fn register<F>(&self, path: impl Into<WorkerPath>, program: F) -> &Self
    where
        F: Fn() -> MethodRegistry + Send + Sync + 'static,
    {
        self.programs.write().insert(path.into(), Arc::new(program));
        self
    }

    pub fn spawned(&self) -> usize {
        self.counters.spawned.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.counters.terminated.load(Ordering::SeqCst)
    }

    /// Instances spawned and not yet terminated.
    pub fn live(&self) -> usize {
        self.spawned().saturating_sub(self.terminated())
    }
}

#[async_trait]
impl Spawn for LocalSpawner {
    async fn spawn(&self, path: &WorkerPath) -> Result<Channel> {
        let program = self
            .programs
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| WorkerError::SpawnError {
                path: path.to_string(),
                reason: "no worker program registered".to_string(),
            })?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let options = WorkerOptions {
            logger: self.options.logger.for_worker("worker", path.as_str()),
            ..self.options.clone()
        };
        let dispatcher = Dispatcher::new(program(), reply_tx, options);
        let task = tokio::spawn(dispatcher.serve(request_rx));
        self.counters.spawned.fetch_add(1, Ordering::SeqCst);

        let counters = self.counters.clone();
        Ok(Channel::new(request_tx, reply_rx, move || {
            task.abort();
            counters.terminated.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

impl fmt::Debug for LocalSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSpawner")
            .field("programs", &self.programs.read().len())
            .field("spawned", &self.spawned())
            .field("terminated", &self.terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{pack, unpack, Reply, Request};
    use crate::test_utils::{math_methods, MATH_WORKER};
    use serde_json::json;

    #[tokio::test]
    async fn test_spawn_unknown_path_fails() {
        let spawner = LocalSpawner::new();
        let err = spawner.spawn(&WorkerPath::from("workers/missing")).await.unwrap_err();
        assert!(matches!(err, WorkerError::SpawnError { path, .. } if path == "workers/missing"));
        assert_eq!(spawner.spawned(), 0);
    }

    #[tokio::test]
    async fn test_spawned_worker_answers_requests() {
        let spawner = LocalSpawner::new();
        spawner.register(MATH_WORKER, math_methods);

        let channel = spawner.spawn(&WorkerPath::from(MATH_WORKER)).await.unwrap();
        let (sender, mut receiver, terminate) = channel.into_parts();

        let mut request = Request::create_context();
        request.call_id = 9;
        sender.send(pack(&request).unwrap()).unwrap();

        let reply: Reply = unpack(&receiver.recv().await.unwrap()).unwrap();
        assert_eq!(reply, Reply::ok(9, json!(1)));

        assert_eq!(spawner.live(), 1);
        terminate();
        assert_eq!(spawner.terminated(), 1);
        assert_eq!(spawner.live(), 0);
    }

    #[tokio::test]
    async fn test_each_spawn_is_a_fresh_instance() {
        let spawner = LocalSpawner::new();
        spawner.register(MATH_WORKER, math_methods);
        let path = WorkerPath::from(MATH_WORKER);

        for _ in 0..2 {
            let (sender, mut receiver, _terminate) = spawner.spawn(&path).await.unwrap().into_parts();
            let mut request = Request::create_context();
            request.call_id = 1;
            sender.send(pack(&request).unwrap()).unwrap();
            let reply: Reply = unpack(&receiver.recv().await.unwrap()).unwrap();
            assert_eq!(reply.result, Some(json!(1)));
        }
        assert_eq!(spawner.spawned(), 2);
    }
}

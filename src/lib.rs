//! Workerlink - request/response RPC between a controller and isolated workers
//!
//! Workers are reachable only through a message channel. The controller
//! pools one handle per worker path, opens a context per logical use, calls
//! exported methods as async functions, subscribes to each context's
//! published state, and serves the calls a worker delegates to other
//! workers.
//!
//! # Example
//!
//! ## Worker program
//! ```rust,no_run
//! use workerlink::{LocalSpawner, MethodRegistry, WorkerContext};
//!
//! fn math_worker() -> MethodRegistry {
//!     let mut methods = MethodRegistry::new();
//!     methods
//!         .register_sync("add", |_: &WorkerContext, (a, b): (i64, i64)| Ok(a + b))
//!         .and_then(|m| {
//!             m.register("quadruple", |ctx: WorkerContext, (x,): (i64,)| async move {
//!                 let twice = ctx.call_sub_worker("workers/math", "add", (x, x)).await?;
//!                 ctx.call_sub_worker("workers/math", "add", (twice.clone(), twice)).await
//!             })
//!         })
//!         .ok();
//!     methods
//! }
//!
//! let spawner = LocalSpawner::new();
//! spawner.register("workers/math", math_worker);
//! ```
//!
//! ## Controller (pool and sessions)
//! ```rust,no_run
//! use workerlink::{call, LocalSpawner, WorkerPool};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spawner = LocalSpawner::new();
//!     let pool = WorkerPool::builder(Arc::new(spawner))
//!         .permanent_worker("workers/cache")
//!         .build();
//!
//!     let session = pool.use_worker("workers/math").await?;
//!     let sum: i64 = session.call_as("add", (10, 20)).await?;
//!     println!("10 + 20 = {}", sum);
//!
//!     let subscription = session.subscribe(|state| println!("state: {}", state)).await?;
//!     call!(session, add(1, 2)).await?;
//!     subscription.unsubscribe().await?;
//!
//!     session.destroy().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Controller (calls before the worker exists)
//! ```rust,no_run
//! use workerlink::{AutoWorker, LocalSpawner, WorkerPool};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = WorkerPool::new(Arc::new(LocalSpawner::new()));
//!     let worker = Arc::new(AutoWorker::new(Arc::new(pool), "workers/math"));
//!
//!     let early = {
//!         let worker = worker.clone();
//!         tokio::spawn(async move { worker.call("add", (2, 3)).await })
//!     };
//!     worker.create().await?;
//!     println!("2 + 3 = {}", early.await??);
//!
//!     worker.destroy(Some("done")).await?;
//!     Ok(())
//! }
//! ```

mod bridge;
mod call_macro;
mod channel;
mod context;
mod error;
mod facade;
mod handle;
mod logging;
mod methods;
mod metrics;
mod pool;
mod protocol;
mod queue;
mod state;
mod worker;

#[cfg(test)]
mod test_utils;

pub use bridge::SubWorkerBridge;
pub use call_macro::{CallArgs, ToJsonArg};
pub use channel::{Channel, LocalSpawner, Spawn};
pub use context::{Extensions, WorkerContext};
pub use error::{Result, WorkerError};
pub use facade::{AutoWorker, DEFAULT_DESTROY_REASON};
pub use handle::{
    HandleOptions, PendingReply, Subscription, TerminationGate, WorkerFactory, WorkerHandle, WorkerSession,
};
pub use logging::{
    default_json_handler, default_pretty_handler, LogEntry, LogEvent, LogHandler, LogLevel, LogOptions,
    StructuredLogger,
};
pub use methods::{MethodFuture, MethodRegistry};
pub use metrics::{Metrics, MetricsSnapshot, RequestTimer};
pub use pool::{PoolBuilder, PoolConfig, WorkerPool, PERMANENT_WORKERS_ENV};
pub use protocol::{
    pack, unpack, Activity, CallId, ContextId, DelegatedCall, DelegatedResult, ListenerId, Reply, Request,
    RequestId, StatePush, WorkerPath, CALL_SUB_WORKER_METHOD,
};
pub use queue::{FlushReport, TaskQueue};
pub use state::{PublishedState, StateListener};
pub use worker::{Dispatcher, WorkerOptions};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

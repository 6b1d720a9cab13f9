//! Single-worker proxy usable before its worker exists.
//!
//! Calls made before [`AutoWorker::create`] are buffered in a [`TaskQueue`]
//! and sent, in call order, once the session is open. [`AutoWorker::destroy`]
//! is terminal.

use crate::call_macro::CallArgs;
use crate::error::{Result, WorkerError};
use crate::handle::{PendingReply, WorkerFactory, WorkerSession};
use crate::logging::{LogEvent, LogOptions, StructuredLogger};
use crate::protocol::WorkerPath;
use crate::queue::TaskQueue;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Rejection reason for buffered calls when no other reason is given.
pub const DEFAULT_DESTROY_REASON: &str = "the worker will be destroyed, so no need for the task anymore";

struct FacadeState {
    session: Option<Arc<WorkerSession>>,
    queue: TaskQueue<Arc<WorkerSession>>,
    relevant: bool,
}

enum Routed {
    Direct(Result<PendingReply>),
    Queued(oneshot::Receiver<Result<Value>>),
}

/// Proxy for one worker session.
///
/// ```rust,no_run
/// use workerlink::{call, AutoWorker, LocalSpawner, WorkerPool};
/// use std::sync::Arc;
///
/// # async fn demo(spawner: LocalSpawner) -> workerlink::Result<()> {
/// let pool = WorkerPool::new(Arc::new(spawner));
/// let worker = Arc::new(AutoWorker::new(Arc::new(pool), "workers/math"));
///
/// let early = { let w = worker.clone(); tokio::spawn(async move { call!(w, add(2, 3)).await }) };
/// worker.create().await?;
/// assert_eq!(early.await.ok().and_then(|r| r.ok()), Some(serde_json::json!(5)));
/// worker.destroy(None).await?;
/// # Ok(())
/// # }
/// ```
pub struct AutoWorker {
    path: WorkerPath,
    factory: Arc<dyn WorkerFactory>,
    state: Mutex<FacadeState>,
    logger: StructuredLogger,
}

impl AutoWorker {
    pub fn new(factory: Arc<dyn WorkerFactory>, path: impl Into<WorkerPath>) -> Self {
        Self {
            path: path.into(),
            factory,
            state: Mutex::new(FacadeState {
                session: None,
                queue: TaskQueue::new(),
                relevant: true,
            }),
            logger: StructuredLogger::default(),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn path(&self) -> &WorkerPath {
        &self.path
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().session.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        !self.state.lock().relevant
    }

    /// Calls waiting for [`create`](Self::create).
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// The open session, once ready.
    pub fn session(&self) -> Option<Arc<WorkerSession>> {
        self.state.lock().session.clone()
    }

    /// Call `method` now if the session is open, otherwise once it is.
    pub async fn call(&self, method: &str, args: impl CallArgs) -> Result<Value> {
        let args = args.into_args()?;
        let routed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.relevant {
                return Err(WorkerError::Destroyed);
            }
            match &state.session {
                Some(session) => Routed::Direct(session.dispatch(method, args)),
                None => {
                    let method = method.to_string();
                    Routed::Queued(state.queue.enqueue(
                        move |session: &Arc<WorkerSession>| -> BoxFuture<'static, Result<Value>> {
                            match session.dispatch(&method, args) {
                                Ok(pending) => pending.into_future(),
                                Err(err) => Box::pin(async move { Err(err) }),
                            }
                        },
                    ))
                }
            }
        };

        match routed {
            Routed::Direct(pending) => pending?.await,
            Routed::Queued(settled) => settled
                .await
                .unwrap_or_else(|_| Err(WorkerError::Rejected(DEFAULT_DESTROY_REASON.to_string()))),
        }
    }

    pub async fn call_as<R: DeserializeOwned>(&self, method: &str, args: impl CallArgs) -> Result<R> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Open the session and flush buffered calls in call order.
    ///
    /// Fails with [`WorkerError::UsedAfterDestroy`] if [`destroy`](Self::destroy)
    /// was called before or while the session was being opened.
    pub async fn create(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if !state.relevant {
                return Err(WorkerError::UsedAfterDestroy);
            }
            if state.session.is_some() {
                return Ok(());
            }
        }

        let session = Arc::new(self.factory.use_worker(&self.path).await?);

        let flushing = {
            let mut state = self.state.lock();
            if !state.relevant || state.session.is_some() {
                Err(state.relevant)
            } else {
                state.session = Some(session.clone());
                Ok(state.queue.flush_all(&session))
            }
        };

        match flushing {
            Ok(flushing) => {
                let report = flushing.await;
                if report.total() > 0 {
                    self.logger.debug(
                        LogEvent::QueueFlush,
                        &format!("Flushed {} buffered calls", report.total()),
                        LogOptions {
                            success: Some(report.failed == 0),
                            metadata: Some(serde_json::json!({
                                "succeeded": report.succeeded,
                                "failed": report.failed,
                            })),
                            ..Default::default()
                        },
                    );
                }
                Ok(())
            }
            // Destroyed while the session was opening, or a concurrent create won.
            Err(still_relevant) => {
                session.destroy().await?;
                if still_relevant {
                    Ok(())
                } else {
                    Err(WorkerError::UsedAfterDestroy)
                }
            }
        }
    }

    /// Mark the proxy destroyed, reject buffered calls with `reason` and
    /// destroy the session if one is open.
    pub async fn destroy(&self, reason: Option<&str>) -> Result<()> {
        let reason = WorkerError::Rejected(reason.unwrap_or(DEFAULT_DESTROY_REASON).to_string());
        let (session, rejected) = {
            let mut state = self.state.lock();
            state.relevant = false;
            let rejected = state.queue.reject_all(&reason);
            (state.session.take(), rejected)
        };

        if rejected > 0 {
            self.logger.info(
                LogEvent::QueueReject,
                &format!("Rejected {} buffered calls", rejected),
                LogOptions {
                    error: Some(reason.to_string()),
                    ..Default::default()
                },
            );
        }

        if let Some(session) = session {
            session.destroy().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for AutoWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AutoWorker")
            .field("path", &self.path)
            .field("ready", &state.session.is_some())
            .field("queued", &state.queue.len())
            .field("relevant", &state.relevant)
            .finish()
    }
}

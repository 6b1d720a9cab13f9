//! Controller-side RPC client for one worker instance.
//!
//! A [`WorkerHandle`] owns the channel to a worker, stamps every request
//! with a fresh `callId` and settles the matching waiter when the reply
//! arrives. [`WorkerSession`] is one context on that worker with its
//! method list resolved.

use crate::call_macro::CallArgs;
use crate::channel::{Channel, Spawn};
use crate::error::{Result, WorkerError};
use crate::logging::{LogEvent, LogOptions, StructuredLogger};
use crate::metrics::{Metrics, MetricsSnapshot, RequestTimer};
use crate::protocol::{
    pack, unpack, CallId, ContextId, DelegatedCall, ListenerId, Reply, Request, StatePush, WorkerPath,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Opens sessions on workers by path; used to serve delegated calls.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn use_worker(&self, path: &WorkerPath) -> Result<WorkerSession>;
}

/// Decides whether a handle whose last context is gone may terminate.
pub trait TerminationGate: Send + Sync {
    /// Returns `false` to keep the instance alive.
    fn request_termination(&self, path: &WorkerPath, instance_id: Uuid) -> bool;
}

type StreamFn = Arc<dyn Fn(Result<Value>) + Send + Sync>;

enum Listener {
    /// Settled by the first reply, then removed.
    Once(oneshot::Sender<Result<Value>>),
    /// Receives every reply for its call id until removed.
    Stream(StreamFn),
}

/// Collaborators and ambient services for a handle.
#[derive(Clone, Default)]
pub struct HandleOptions {
    pub logger: StructuredLogger,
    pub factory: Option<Arc<dyn WorkerFactory>>,
    pub gate: Option<Arc<dyn TerminationGate>>,
}

impl HandleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn WorkerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn gate(mut self, gate: Arc<dyn TerminationGate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl fmt::Debug for HandleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleOptions")
            .field("logger", &self.logger)
            .field("factory", &self.factory.is_some())
            .field("gate", &self.gate.is_some())
            .finish()
    }
}

struct HandleInner {
    path: WorkerPath,
    instance_id: Uuid,
    outbound: mpsc::UnboundedSender<Bytes>,
    listeners: Mutex<HashMap<CallId, Listener>>,
    /// Contexts this handle serves, mapped to the call id that created them.
    contexts: Mutex<HashMap<ContextId, CallId>>,
    last_call_id: AtomicU64,
    closed: AtomicBool,
    terminator: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    options: HandleOptions,
    logger: StructuredLogger,
    metrics: Metrics,
}

/// Shared reference to one live worker instance.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<HandleInner>,
}

impl WorkerHandle {
    /// Spawn a new instance of `path` and connect to it.
    pub async fn spawn(spawner: &dyn Spawn, path: impl Into<WorkerPath>, options: HandleOptions) -> Result<Self> {
        let path = path.into();
        let channel = spawner.spawn(&path).await?;
        Ok(Self::connect(path, channel, options))
    }

    /// Take ownership of an already spawned channel.
    pub fn connect(path: impl Into<WorkerPath>, channel: Channel, options: HandleOptions) -> Self {
        let path = path.into();
        let instance_id = Uuid::new_v4();
        let logger = options.logger.for_worker(&instance_id.to_string(), path.as_str());
        let (outbound, inbound, terminator) = channel.into_parts();

        let inner = Arc::new(HandleInner {
            path,
            instance_id,
            outbound,
            listeners: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            last_call_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            terminator: Mutex::new(Some(terminator)),
            options,
            logger,
            metrics: Metrics::new(),
        });

        tokio::spawn(reply_loop(Arc::downgrade(&inner), inbound));
        inner.logger.worker_spawned();
        Self { inner }
    }

    pub fn path(&self) -> &WorkerPath {
        &self.inner.path
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Requests and streams still waiting for replies.
    pub fn pending_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Contexts created through this handle and not yet destroyed.
    pub fn context_count(&self) -> usize {
        self.inner.contexts.lock().len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Send `request` now; the returned [`PendingReply`] settles with the first reply.
    pub fn send_request(&self, request: Request) -> Result<PendingReply> {
        self.inner.send_request(request)
    }

    pub async fn request(&self, request: Request) -> Result<Value> {
        self.send_request(request)?.await
    }

    /// Create a context and start relaying its delegation requests.
    pub async fn create_context(&self) -> Result<ContextId> {
        let (first_tx, first_rx) = oneshot::channel();
        let first = Mutex::new(Some(first_tx));
        let relay_to = Arc::downgrade(&self.inner);

        let stream: StreamFn = Arc::new(move |outcome: Result<Value>| {
            if let Some(tx) = first.lock().take() {
                let _ = tx.send(outcome);
                return;
            }
            let Ok(value) = outcome else { return };
            match (DelegatedCall::from_result(&value), relay_to.upgrade()) {
                (Some(call), Some(inner)) => {
                    tokio::spawn(relay_delegated(inner, call));
                }
                (None, Some(inner)) => inner.logger.debug(
                    LogEvent::StaleReply,
                    "Ignoring unexpected message on a context channel",
                    LogOptions::default(),
                ),
                _ => {}
            }
        });

        let call_id = self.inner.send(Request::create_context(), Listener::Stream(stream))?;
        let created = first_rx.await.unwrap_or(Err(WorkerError::ChannelClosed));

        let context_id = match created.and_then(|value| {
            value
                .as_u64()
                .ok_or_else(|| WorkerError::InvalidMessage(format!("Expected a context id, got {}", value)))
        }) {
            Ok(context_id) => context_id,
            Err(err) => {
                self.inner.listeners.lock().remove(&call_id);
                return Err(err);
            }
        };

        self.inner.contexts.lock().insert(context_id, call_id);
        Ok(context_id)
    }

    /// Destroy a context. When the worker reports no remaining contexts the
    /// instance is terminated, unless the termination gate keeps it alive.
    pub async fn destroy_context(&self, context_id: ContextId) -> Result<usize> {
        let reply = self.request(Request::destroy_context(context_id)).await;

        if let Some(call_id) = self.inner.contexts.lock().remove(&context_id) {
            self.inner.listeners.lock().remove(&call_id);
        }

        let value = reply?;
        let remaining = value
            .as_u64()
            .ok_or_else(|| WorkerError::InvalidMessage(format!("Expected a context count, got {}", value)))?
            as usize;

        if remaining == 0 {
            self.request_termination();
        }
        Ok(remaining)
    }

    pub async fn list_methods(&self) -> Result<Vec<String>> {
        let value = self.request(Request::get_methods_list()).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Full session bootstrap: create a context, then resolve its methods.
    pub async fn use_worker(&self) -> Result<WorkerSession> {
        let context_id = self.create_context().await?;
        let methods = match self.list_methods().await {
            Ok(methods) => methods,
            Err(err) => {
                let _ = self.destroy_context(context_id).await;
                return Err(err);
            }
        };
        Ok(WorkerSession {
            handle: self.clone(),
            context_id,
            methods,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Subscribe to the published state of `context_id`.
    ///
    /// Resolves once the worker has assigned a listener id; every later push
    /// on the same call id is passed to `on_state`.
    pub async fn subscribe<F>(&self, context_id: ContextId, on_state: F) -> Result<Subscription>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let (first_tx, first_rx) = oneshot::channel();
        let first = Mutex::new(Some(first_tx));

        let stream: StreamFn = Arc::new(move |outcome: Result<Value>| {
            let push = outcome.and_then(|value| Ok(serde_json::from_value::<StatePush>(value)?));
            match push {
                Ok(StatePush::ListenerId(listener_id)) => {
                    if let Some(tx) = first.lock().take() {
                        let _ = tx.send(Ok(listener_id));
                    }
                }
                Ok(StatePush::State(value)) => on_state(value),
                Err(err) => {
                    if let Some(tx) = first.lock().take() {
                        let _ = tx.send(Err(err));
                    }
                }
            }
        });

        let call_id = self
            .inner
            .send(Request::subscribe_to_state(context_id), Listener::Stream(stream))?;

        match first_rx.await.unwrap_or(Err(WorkerError::ChannelClosed)) {
            Ok(listener_id) => Ok(Subscription {
                handle: self.clone(),
                context_id,
                listener_id,
                call_id,
                active: AtomicBool::new(true),
            }),
            Err(err) => {
                self.inner.listeners.lock().remove(&call_id);
                Err(err)
            }
        }
    }

    /// Kill the instance and reject everything still waiting on it.
    pub fn terminate(&self) {
        self.inner.terminate();
    }

    fn request_termination(&self) {
        let allowed = match &self.inner.options.gate {
            Some(gate) => gate.request_termination(&self.inner.path, self.inner.instance_id),
            None => true,
        };
        if allowed {
            self.terminate();
        } else {
            self.inner.logger.termination_deferred("permanent worker");
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("path", &self.inner.path)
            .field("instance_id", &self.inner.instance_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl HandleInner {
    fn send(&self, mut request: Request, listener: Listener) -> Result<CallId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::ChannelClosed);
        }
        let call_id = self.last_call_id.fetch_add(1, Ordering::SeqCst) + 1;
        request.call_id = call_id;
        let frame = pack(&request)?;

        self.listeners.lock().insert(call_id, listener);
        if self.outbound.send(frame).is_err() {
            self.listeners.lock().remove(&call_id);
            return Err(WorkerError::ChannelClosed);
        }
        self.logger
            .request_start(call_id, &request.activity_name, request.context_id);
        Ok(call_id)
    }

    fn send_request(self: &Arc<Self>, request: Request) -> Result<PendingReply> {
        let (tx, settled) = oneshot::channel();
        let timer = self.metrics.track();
        let call_id = self.send(request, Listener::Once(tx))?;
        Ok(PendingReply {
            call_id,
            settled,
            timer,
            handle: Arc::clone(self),
        })
    }

    /// Route one reply to its listener. Replies nobody waits for are dropped.
    fn deliver(&self, reply: Reply) {
        let call_id = reply.call_id;
        let listener = {
            let mut listeners = self.listeners.lock();
            match listeners.remove(&call_id) {
                Some(Listener::Stream(stream)) => {
                    listeners.insert(call_id, Listener::Stream(Arc::clone(&stream)));
                    Some(Listener::Stream(stream))
                }
                other => other,
            }
        };

        match listener {
            Some(Listener::Once(tx)) => {
                let _ = tx.send(reply.into_result());
            }
            Some(Listener::Stream(stream)) => stream(reply.into_result()),
            None => {
                self.metrics.record_stale_reply();
                self.logger.stale_reply(call_id);
            }
        }
    }

    /// Reject every listener with `ChannelClosed`. Returns how many there were.
    fn fail_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Listener> = self.listeners.lock().drain().map(|(_, l)| l).collect();
        self.contexts.lock().clear();
        let rejected = drained.len();
        for listener in drained {
            match listener {
                Listener::Once(tx) => {
                    let _ = tx.send(Err(WorkerError::ChannelClosed));
                }
                Listener::Stream(stream) => stream(Err(WorkerError::ChannelClosed)),
            }
        }
        rejected
    }

    fn terminate(&self) {
        let terminator = self.terminator.lock().take();
        let Some(terminator) = terminator else { return };
        terminator();
        self.fail_all();
        self.logger.worker_terminated();
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(terminator) = self.terminator.get_mut().take() {
            terminator();
        }
    }
}

async fn reply_loop(handle: Weak<HandleInner>, mut inbound: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = inbound.recv().await {
        let Some(inner) = handle.upgrade() else { return };
        match unpack::<Reply>(&frame) {
            Ok(reply) => inner.deliver(reply),
            Err(err) => inner.logger.warn(
                LogEvent::InvalidFrame,
                "Dropping undecodable reply",
                LogOptions {
                    error: Some(err.to_string()),
                    error_type: Some(err.kind().to_string()),
                    ..Default::default()
                },
            ),
        }
    }

    if let Some(inner) = handle.upgrade() {
        if !inner.closed.load(Ordering::SeqCst) {
            let rejected = inner.fail_all();
            inner.logger.channel_closed(rejected);
        }
    }
}

/// Serve one delegated call: open a session on the target, call, tear the
/// session down whatever the outcome, and send the result back.
async fn relay_delegated(inner: Arc<HandleInner>, call: DelegatedCall) {
    inner.metrics.record_delegation();
    inner.logger.info(
        LogEvent::DelegationStart,
        &format!("Relaying {} to {}", call.method_name, call.worker_path),
        LogOptions {
            context_id: Some(call.context_id),
            method: Some(call.method_name.clone()),
            metadata: Some(serde_json::json!({ "target": call.worker_path.as_str() })),
            ..Default::default()
        },
    );

    let outcome = match &inner.options.factory {
        Some(factory) => match factory.use_worker(&call.worker_path).await {
            Ok(session) => {
                let outcome = session.call(&call.method_name, call.args.clone()).await;
                if let Err(err) = session.destroy().await {
                    inner.logger.warn(
                        LogEvent::DelegationEnd,
                        "Failed to destroy delegated session",
                        LogOptions {
                            error: Some(err.to_string()),
                            ..Default::default()
                        },
                    );
                }
                outcome
            }
            Err(err) => Err(err),
        },
        None => Err(WorkerError::SpawnError {
            path: call.worker_path.to_string(),
            reason: "no worker factory configured for delegated calls".to_string(),
        }),
    };

    inner.logger.info(
        LogEvent::DelegationEnd,
        &format!("Delegated {} settled", call.method_name),
        LogOptions {
            context_id: Some(call.context_id),
            method: Some(call.method_name.clone()),
            success: Some(outcome.is_ok()),
            error: outcome.as_ref().err().map(|e| e.to_string()),
            ..Default::default()
        },
    );

    let request = Request::sub_worker_result(call.into_result(outcome));
    if let Ok(ack) = inner.send_request(request) {
        let _ = ack.await;
    }
}

/// A request that has been sent and awaits its reply. Await it directly.
pub struct PendingReply {
    call_id: CallId,
    settled: oneshot::Receiver<Result<Value>>,
    timer: RequestTimer,
    handle: Arc<HandleInner>,
}

impl PendingReply {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }
}

impl IntoFuture for PendingReply {
    type Output = Result<Value>;
    type IntoFuture = BoxFuture<'static, Result<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let outcome = self.settled.await.unwrap_or(Err(WorkerError::ChannelClosed));
            let duration_ms = self.timer.finish(outcome.is_ok());
            self.handle
                .logger
                .request_end(self.call_id, duration_ms, outcome.as_ref().err());
            outcome
        })
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply").field("call_id", &self.call_id).finish()
    }
}

/// One context on a worker, with callable methods.
pub struct WorkerSession {
    handle: WorkerHandle,
    context_id: ContextId,
    methods: Vec<String>,
    destroyed: AtomicBool,
}

impl WorkerSession {
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Method names exported by the worker, in registration order.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m == name)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Send a method call now and return its pending reply.
    pub fn dispatch(&self, method: &str, args: impl CallArgs) -> Result<PendingReply> {
        if self.is_destroyed() {
            return Err(WorkerError::Destroyed);
        }
        if !self.has_method(method) {
            return Err(WorkerError::UnknownMethod(method.to_string()));
        }
        let args = args.into_args()?;
        self.handle
            .send_request(Request::call_method(self.context_id, method, args))
    }

    pub async fn call(&self, method: &str, args: impl CallArgs) -> Result<Value> {
        self.dispatch(method, args)?.await
    }

    /// Call and deserialize the result.
    pub async fn call_as<R: DeserializeOwned>(&self, method: &str, args: impl CallArgs) -> Result<R> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn subscribe<F>(&self, on_state: F) -> Result<Subscription>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            return Err(WorkerError::Destroyed);
        }
        self.handle.subscribe(self.context_id, on_state).await
    }

    /// Destroy the context. Later calls are no-ops returning `Ok(None)`;
    /// otherwise the worker's remaining context count is returned.
    pub async fn destroy(&self) -> Result<Option<usize>> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.handle.destroy_context(self.context_id).await.map(Some)
    }
}

impl fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSession")
            .field("path", self.handle.path())
            .field("context_id", &self.context_id)
            .field("methods", &self.methods)
            .finish()
    }
}

/// Live state subscription; see [`Subscription::unsubscribe`].
pub struct Subscription {
    handle: WorkerHandle,
    context_id: ContextId,
    listener_id: ListenerId,
    call_id: CallId,
    active: AtomicBool,
}

impl Subscription {
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Detach the local callback, then ask the worker to drop the listener.
    /// Unsubscribing again is a no-op returning `false`.
    pub async fn unsubscribe(&self) -> Result<bool> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        self.handle.inner.listeners.lock().remove(&self.call_id);
        let removed = self
            .handle
            .request(Request::unsubscribe_from_state(self.context_id, self.listener_id))
            .await?;
        Ok(removed.as_bool().unwrap_or(false))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("context_id", &self.context_id)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}

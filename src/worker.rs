//! Worker-side dispatcher.
//!
//! Receives packed [`Request`]s, routes them by activity name, owns the
//! context table and answers every request with exactly one [`Reply`].

use crate::bridge::SubWorkerBridge;
use crate::context::WorkerContext;
use crate::error::{Result, WorkerError};
use crate::logging::{LogEvent, LogOptions, StructuredLogger};
use crate::methods::{MethodFuture, MethodRegistry};
use crate::protocol::{
    pack, unpack, Activity, CallId, CallIdOnly, ContextId, DelegatedResult, Reply, Request, StatePush,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Options for a worker instance.
#[derive(Clone, Default, Debug)]
pub struct WorkerOptions {
    pub logger: StructuredLogger,
    /// Upper bound for delegated sub-worker calls. `None` waits forever.
    pub delegation_timeout: Option<Duration>,
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_delegation_timeout(mut self, timeout: Duration) -> Self {
        self.delegation_timeout = Some(timeout);
        self
    }
}

#[derive(Default)]
struct ContextTable {
    contexts: HashMap<ContextId, WorkerContext>,
    last_context_id: ContextId,
}

/// Remainder of a method call that suspended on its first poll.
type Running = BoxFuture<'static, ()>;

enum Dispatch {
    Ready(Result<Value>),
    Pending(MethodFuture),
    Replied,
}

/// Demultiplexes requests for one worker instance.
#[derive(Clone)]
pub struct Dispatcher {
    methods: Arc<MethodRegistry>,
    contexts: Arc<Mutex<ContextTable>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    options: WorkerOptions,
}

impl Dispatcher {
    pub fn new(methods: MethodRegistry, outbound: mpsc::UnboundedSender<Bytes>, options: WorkerOptions) -> Self {
        Self {
            methods: Arc::new(methods),
            contexts: Arc::new(Mutex::new(ContextTable::default())),
            outbound,
            options,
        }
    }

    /// Process frames until the controller side of the channel goes away,
    /// then tear down every remaining context.
    ///
    /// Suspended methods are driven from this task, so methods start in the
    /// order their requests arrived and never run in parallel.
    pub async fn serve(self, mut inbound: mpsc::UnboundedReceiver<Bytes>) {
        let mut running = FuturesUnordered::new();
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => running.extend(self.accept_frame(&frame)),
                    None => break,
                },
                Some(()) = running.next(), if !running.is_empty() => {}
            }
        }
        self.shutdown();
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().contexts.len()
    }

    pub fn context(&self, context_id: ContextId) -> Option<WorkerContext> {
        self.contexts.lock().contexts.get(&context_id).cloned()
    }

    /// Decode one frame and dispatch it. A method that suspends finishes on
    /// a spawned task.
    pub fn handle_frame(&self, frame: &[u8]) {
        if let Some(rest) = self.accept_frame(frame) {
            tokio::spawn(rest);
        }
    }

    /// Dispatch a decoded request; the reply is sent now or when its method
    /// settles on a spawned task.
    pub fn handle(&self, request: Request) {
        if let Some(rest) = self.accept(request) {
            tokio::spawn(rest);
        }
    }

    fn accept_frame(&self, frame: &[u8]) -> Option<Running> {
        match unpack::<Request>(frame) {
            Ok(request) => self.accept(request),
            Err(err) => {
                match unpack::<CallIdOnly>(frame) {
                    Ok(CallIdOnly { call_id }) => {
                        self.send(Reply::err(call_id, &WorkerError::InvalidMessage(err.to_string())));
                    }
                    Err(_) => self.options.logger.warn(
                        LogEvent::InvalidFrame,
                        "Dropping undecodable frame",
                        LogOptions {
                            error: Some(err.to_string()),
                            ..Default::default()
                        },
                    ),
                }
                None
            }
        }
    }

    /// Methods get their first poll before this returns. Whatever is left of
    /// a suspended method comes back to the caller to drive.
    fn accept(&self, request: Request) -> Option<Running> {
        let call_id = request.call_id;
        self.options
            .logger
            .request_start(call_id, &request.activity_name, request.context_id);

        match self.dispatch(request) {
            Dispatch::Ready(outcome) => {
                self.send(Reply::from_result(call_id, outcome));
                None
            }
            Dispatch::Replied => None,
            Dispatch::Pending(method) => {
                let dispatcher = self.clone();
                let mut running: Running = Box::pin(async move {
                    let outcome = match AssertUnwindSafe(method).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(WorkerError::remote("Worker method panicked")),
                    };
                    dispatcher.send(Reply::from_result(call_id, outcome));
                });
                match (&mut running).now_or_never() {
                    Some(()) => None,
                    None => Some(running),
                }
            }
        }
    }

    fn dispatch(&self, request: Request) -> Dispatch {
        let Some(activity) = request.activity() else {
            return Dispatch::Ready(Err(WorkerError::UnknownActivity(request.activity_name)));
        };

        match activity {
            Activity::CreateContext => Dispatch::Ready(Ok(json!(self.create_context(request.call_id)))),
            Activity::DestroyContext => Dispatch::Ready(
                require_context_id(&request).map(|context_id| json!(self.destroy_context(context_id))),
            ),
            Activity::SubscribeToPublicState => self.subscribe(&request),
            Activity::UnsubscribeFromPublicState => Dispatch::Ready(self.unsubscribe(&request)),
            Activity::GetMethodsList => Dispatch::Ready(Ok(json!(self.methods.names()))),
            Activity::CallWorkerMethod => match self.call_method(request) {
                Ok(method) => Dispatch::Pending(method),
                Err(err) => Dispatch::Ready(Err(err)),
            },
            Activity::ReceiveSubWorkerMethodCallResult => {
                self.receive_sub_worker_result(request);
                Dispatch::Ready(Ok(Value::Null))
            }
        }
    }

    fn create_context(&self, call_id: CallId) -> ContextId {
        let mut table = self.contexts.lock();
        table.last_context_id += 1;
        let context_id = table.last_context_id;

        let bridge = SubWorkerBridge::new(context_id, call_id, self.outbound.clone());
        let context = WorkerContext::new(context_id, bridge, self.options.delegation_timeout);
        table.contexts.insert(context_id, context);
        drop(table);

        self.options.logger.context_created(context_id);
        context_id
    }

    /// Returns the number of contexts left. Unknown ids are a no-op.
    fn destroy_context(&self, context_id: ContextId) -> usize {
        let (removed, remaining) = {
            let mut table = self.contexts.lock();
            let removed = table.contexts.remove(&context_id);
            (removed, table.contexts.len())
        };
        if let Some(context) = removed {
            context.close();
            self.options.logger.context_destroyed(context_id, remaining);
        }
        remaining
    }

    fn subscribe(&self, request: &Request) -> Dispatch {
        let context = match require_context_id(request).and_then(|id| self.require_context(id)) {
            Ok(context) => context,
            Err(err) => return Dispatch::Ready(Err(err)),
        };

        let call_id = request.call_id;
        let pushes = self.clone();
        let listener = Box::new(move |value: &Value| {
            pushes.send_push(call_id, StatePush::State(value.clone()));
        });

        context.add_state_listener_then(listener, |listener_id| {
            self.send_push(call_id, StatePush::ListenerId(listener_id));
            self.options.logger.debug(
                LogEvent::StateSubscribe,
                &format!("Listener {} subscribed", listener_id),
                LogOptions {
                    call_id: Some(call_id),
                    context_id: Some(context.id()),
                    ..Default::default()
                },
            );
        });
        Dispatch::Replied
    }

    fn unsubscribe(&self, request: &Request) -> Result<Value> {
        let context_id = require_context_id(request)?;
        let listener_id = request
            .listener_id
            .ok_or_else(|| WorkerError::InvalidMessage("Missing listenerId".to_string()))?;

        let removed = self
            .context(context_id)
            .map_or(false, |context| context.remove_state_listener(listener_id));

        self.options.logger.debug(
            LogEvent::StateUnsubscribe,
            &format!("Listener {} unsubscribed (removed: {})", listener_id, removed),
            LogOptions {
                call_id: Some(request.call_id),
                context_id: Some(context_id),
                success: Some(removed),
                ..Default::default()
            },
        );
        Ok(json!(removed))
    }

    fn call_method(&self, request: Request) -> Result<MethodFuture> {
        let context_id = require_context_id(&request)?;
        let method_name = request
            .method_name
            .ok_or_else(|| WorkerError::InvalidMessage("Missing methodName".to_string()))?;
        let context = self.require_context(context_id)?;
        self.methods
            .invoke(&method_name, context, request.args.unwrap_or_default())
    }

    fn receive_sub_worker_result(&self, request: Request) {
        let (Some(context_id), Some(request_id)) = (request.context_id, request.request_id) else {
            return;
        };
        let Some(context) = self.context(context_id) else {
            self.options.logger.stale_reply(request.call_id);
            return;
        };
        let delivered = context.receive_delegated(DelegatedResult {
            context_id,
            request_id,
            result: request.result,
            error: request.error,
        });
        if !delivered {
            self.options.logger.stale_reply(request.call_id);
        }
    }

    fn require_context(&self, context_id: ContextId) -> Result<WorkerContext> {
        self.context(context_id)
            .ok_or(WorkerError::UnknownContext(context_id))
    }

    fn send_push(&self, call_id: CallId, push: StatePush) {
        match serde_json::to_value(push) {
            Ok(value) => self.send(Reply::ok(call_id, value)),
            Err(err) => self.send(Reply::err(call_id, &err.into())),
        }
    }

    fn send(&self, reply: Reply) {
        let call_id = reply.call_id;
        let frame = match pack(&reply) {
            Ok(frame) => frame,
            Err(err) => match pack(&Reply::err(call_id, &err)) {
                Ok(frame) => frame,
                Err(_) => return,
            },
        };
        // The controller may already be gone; nothing left to notify then.
        let _ = self.outbound.send(frame);
    }

    fn shutdown(&self) {
        let contexts: Vec<WorkerContext> = self.contexts.lock().contexts.drain().map(|(_, c)| c).collect();
        for context in contexts {
            context.close();
        }
    }
}

fn require_context_id(request: &Request) -> Result<ContextId> {
    request
        .context_id
        .ok_or_else(|| WorkerError::InvalidMessage("Missing contextId".to_string()))
}

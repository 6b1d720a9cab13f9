//! Worker-side sessions handed to exported methods as their receiver.

use crate::bridge::SubWorkerBridge;
use crate::call_macro::CallArgs;
use crate::error::{Result, WorkerError};
use crate::protocol::{ContextId, DelegatedResult, ListenerId, WorkerPath};
use crate::state::{PublishedState, StateListener};
use parking_lot::Mutex;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Per-context data owned by the embedding application, keyed by type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok().map(|boxed| *boxed))
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.map.get_mut(&TypeId::of::<T>()).and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok().map(|boxed| *boxed))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// One logical session inside a worker instance.
///
/// Cheap to clone; every clone refers to the same context. Methods receive
/// it as their implicit receiver.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: ContextId,
    state: Mutex<PublishedState>,
    bridge: Mutex<SubWorkerBridge>,
    extensions: Mutex<Extensions>,
    delegation_timeout: Option<Duration>,
}

impl WorkerContext {
    pub(crate) fn new(id: ContextId, bridge: SubWorkerBridge, delegation_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                state: Mutex::new(PublishedState::new()),
                bridge: Mutex::new(bridge),
                extensions: Mutex::new(Extensions::new()),
                delegation_timeout,
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Current published state.
    pub fn state(&self) -> Value {
        self.inner.state.lock().get().clone()
    }

    /// Replace the published state and push it to every subscriber.
    pub fn set_state(&self, value: Value) {
        self.inner.state.lock().set(value);
    }

    /// Derive the next published state from the previous one.
    pub fn update_state<F>(&self, next: F)
    where
        F: FnOnce(&Value) -> Value,
    {
        self.inner.state.lock().update(next);
    }

    /// Run `method_name` on another worker, via the controller.
    pub async fn call_sub_worker(
        &self,
        worker_path: impl Into<WorkerPath>,
        method_name: &str,
        args: impl CallArgs,
    ) -> Result<Value> {
        let args = args.into_args()?;
        let (request_id, settled) = self.inner.bridge.lock().call(worker_path.into(), method_name, args)?;

        let outcome = match self.inner.delegation_timeout {
            Some(limit) => match tokio::time::timeout(limit, settled).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.bridge.lock().forget(request_id);
                    return Err(WorkerError::Timeout);
                }
            },
            None => settled.await,
        };
        outcome.unwrap_or(Err(WorkerError::ContextDestroyed(self.id())))
    }

    pub fn insert_extension<T: Any + Send + Sync>(&self, value: T) -> Option<T> {
        self.inner.extensions.lock().insert(value)
    }

    pub fn extension<T: Any + Clone + Send + Sync>(&self) -> Option<T> {
        self.inner.extensions.lock().get::<T>().cloned()
    }

    pub fn remove_extension<T: Any + Send + Sync>(&self) -> Option<T> {
        self.inner.extensions.lock().remove::<T>()
    }

    /// Run `f` with mutable access to the extension map.
    pub fn with_extensions<R>(&self, f: impl FnOnce(&mut Extensions) -> R) -> R {
        f(&mut self.inner.extensions.lock())
    }

    pub(crate) fn add_state_listener(&self, listener: StateListener) -> ListenerId {
        self.inner.state.lock().add_listener(listener)
    }

    /// Register a listener and run `after` while the state is still locked,
    /// so no state push can overtake whatever `after` sends.
    pub(crate) fn add_state_listener_then<R>(
        &self,
        listener: StateListener,
        after: impl FnOnce(ListenerId) -> R,
    ) -> R {
        let mut state = self.inner.state.lock();
        let listener_id = state.add_listener(listener);
        after(listener_id)
    }

    pub(crate) fn remove_state_listener(&self, listener_id: ListenerId) -> bool {
        self.inner.state.lock().remove_listener(listener_id)
    }

    pub(crate) fn receive_delegated(&self, delegated: DelegatedResult) -> bool {
        self.inner.bridge.lock().receive(delegated)
    }

    /// Tear down listeners and settle outstanding delegated calls.
    pub(crate) fn close(&self) {
        self.inner.state.lock().clear_listeners();
        self.inner.bridge.lock().close();
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext").field("id", &self.inner.id).finish()
    }
}

//! Per-context table of calls delegated to sub-workers through the controller.

use crate::error::{Result, WorkerError};
use crate::protocol::{CallId, ContextId, DelegatedCall, DelegatedResult, Reply, RequestId, WorkerPath};
use crate::protocol::pack;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Tracks delegated calls of one context until the controller answers.
///
/// Delegation requests ride on the `callId` of the request that created the
/// context. Dropping the bridge settles every outstanding call with
/// `WorkerError::ContextDestroyed`.
pub struct SubWorkerBridge {
    context_id: ContextId,
    origin_call_id: CallId,
    outbound: mpsc::UnboundedSender<Bytes>,
    last_request_id: RequestId,
    pending: HashMap<RequestId, oneshot::Sender<Result<Value>>>,
    closed: bool,
}

impl SubWorkerBridge {
    pub fn new(context_id: ContextId, origin_call_id: CallId, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            context_id,
            origin_call_id,
            outbound,
            last_request_id: 0,
            pending: HashMap::new(),
            closed: false,
        }
    }

    /// Ask the controller to run `method_name` on `worker_path`.
    ///
    /// The request is sent before this returns; the receiver settles when
    /// the controller relays the outcome.
    pub fn call(
        &mut self,
        worker_path: WorkerPath,
        method_name: &str,
        args: Vec<Value>,
    ) -> Result<(RequestId, oneshot::Receiver<Result<Value>>)> {
        if self.closed {
            return Err(WorkerError::ContextDestroyed(self.context_id));
        }
        self.last_request_id += 1;
        let request_id = self.last_request_id;

        let delegated = DelegatedCall::new(self.context_id, request_id, worker_path, method_name, args);
        let reply = Reply::ok(self.origin_call_id, serde_json::to_value(&delegated)?);
        let frame = pack(&reply)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        if self.outbound.send(frame).is_err() {
            self.pending.remove(&request_id);
            return Err(WorkerError::ChannelClosed);
        }
        Ok((request_id, rx))
    }

    /// Stop waiting for `request_id` (e.g. after a timeout).
    pub fn forget(&mut self, request_id: RequestId) {
        self.pending.remove(&request_id);
    }

    /// Settle a pending delegated call. Unknown request ids are ignored.
    pub fn receive(&mut self, delegated: DelegatedResult) -> bool {
        let Some(tx) = self.pending.remove(&delegated.request_id) else {
            return false;
        };
        let outcome = match delegated.error {
            Some(error) => Err(WorkerError::from_payload(error)),
            None => Ok(delegated.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Settle every outstanding call with `ContextDestroyed` and refuse new ones.
    pub fn close(&mut self) {
        self.closed = true;
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(WorkerError::ContextDestroyed(self.context_id)));
        }
    }
}

impl Drop for SubWorkerBridge {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{unpack, CALL_SUB_WORKER_METHOD};
    use serde_json::json;

    #[tokio::test]
    async fn test_call_sends_delegation_on_origin_call_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bridge = SubWorkerBridge::new(3, 11, tx);

        let (request_id, _pending) = bridge.call(WorkerPath::from("workers/b"), "double", vec![json!(21)]).unwrap();
        assert_eq!(request_id, 1);

        let frame = rx.recv().await.unwrap();
        let reply: Reply = unpack(&frame).unwrap();
        assert_eq!(reply.call_id, 11);
        let result = reply.result.unwrap();
        assert_eq!(result["requestName"], CALL_SUB_WORKER_METHOD);
        assert_eq!(result["contextId"], 3);
        assert_eq!(result["requestId"], 1);
        assert_eq!(result["methodName"], "double");
    }

    #[tokio::test]
    async fn test_receive_settles_matching_call_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut bridge = SubWorkerBridge::new(1, 1, tx);
        let (_, pending) = bridge.call(WorkerPath::from("b"), "double", vec![json!(21)]).unwrap();

        let delivered = DelegatedResult { context_id: 1, request_id: 1, result: Some(json!(42)), error: None };
        assert!(bridge.receive(delivered.clone()));
        assert!(!bridge.receive(delivered));
        assert_eq!(pending.await.unwrap().unwrap(), json!(42));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_receive_error_rejects() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut bridge = SubWorkerBridge::new(1, 1, tx);
        let (_, pending) = bridge.call(WorkerPath::from("b"), "explode", vec![]).unwrap();

        bridge.receive(DelegatedResult { context_id: 1, request_id: 1, result: None, error: Some(json!("boom")) });
        assert_eq!(pending.await.unwrap(), Err(WorkerError::Remote(json!("boom"))));
    }

    #[tokio::test]
    async fn test_drop_settles_orphans() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut bridge = SubWorkerBridge::new(7, 1, tx);
        let (_, pending) = bridge.call(WorkerPath::from("b"), "slow", vec![]).unwrap();

        drop(bridge);
        assert_eq!(pending.await.unwrap(), Err(WorkerError::ContextDestroyed(7)));
    }

    #[tokio::test]
    async fn test_close_refuses_new_calls() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut bridge = SubWorkerBridge::new(2, 1, tx);
        let (_, pending) = bridge.call(WorkerPath::from("b"), "slow", vec![]).unwrap();

        bridge.close();
        assert_eq!(pending.await.unwrap(), Err(WorkerError::ContextDestroyed(2)));
        let again = bridge.call(WorkerPath::from("b"), "slow", vec![]);
        assert!(matches!(again, Err(WorkerError::ContextDestroyed(2))));
    }

    #[tokio::test]
    async fn test_forget_drops_pending_entry() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut bridge = SubWorkerBridge::new(1, 1, tx);
        let (request_id, _pending) = bridge.call(WorkerPath::from("b"), "slow", vec![]).unwrap();
        bridge.forget(request_id);
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_on_closed_channel_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut bridge = SubWorkerBridge::new(1, 1, tx);
        let result = bridge.call(WorkerPath::from("b"), "double", vec![]);
        assert!(matches!(result, Err(WorkerError::ChannelClosed)));
        assert_eq!(bridge.pending_count(), 0);
    }
}

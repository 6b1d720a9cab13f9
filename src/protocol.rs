//! Wire format shared by the controller and the worker side.
//!
//! Requests flow controller → worker and name an activity; replies flow
//! worker → controller and carry the request's `callId`. Frames are packed
//! with MessagePack using named (map) encoding so field order never matters.

use crate::error::{Result, WorkerError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type CallId = u64;
pub type ContextId = u64;
pub type ListenerId = u64;
pub type RequestId = u64;

/// `requestName` of a delegation request travelling worker → controller.
pub const CALL_SUB_WORKER_METHOD: &str = "callSubWorkerMethod";

/// Opaque, comparable identity of a worker program (e.g. a resource path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerPath(String);

impl WorkerPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerPath {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}

impl From<String> for WorkerPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

impl From<&WorkerPath> for WorkerPath {
    fn from(path: &WorkerPath) -> Self {
        path.clone()
    }
}

/// Activities understood by the worker-side dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    CreateContext,
    DestroyContext,
    SubscribeToPublicState,
    UnsubscribeFromPublicState,
    GetMethodsList,
    CallWorkerMethod,
    ReceiveSubWorkerMethodCallResult,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::CreateContext => "createContext",
            Activity::DestroyContext => "destroyContext",
            Activity::SubscribeToPublicState => "subscribeToPublicState",
            Activity::UnsubscribeFromPublicState => "unsubscribeFromPublicState",
            Activity::GetMethodsList => "getMethodsList",
            Activity::CallWorkerMethod => "callWorkerMethod",
            Activity::ReceiveSubWorkerMethodCallResult => "receiveSubWorkerMethodCallResult",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "createContext" => Some(Activity::CreateContext),
            "destroyContext" => Some(Activity::DestroyContext),
            "subscribeToPublicState" => Some(Activity::SubscribeToPublicState),
            "unsubscribeFromPublicState" => Some(Activity::UnsubscribeFromPublicState),
            "getMethodsList" => Some(Activity::GetMethodsList),
            "callWorkerMethod" => Some(Activity::CallWorkerMethod),
            "receiveSubWorkerMethodCallResult" => Some(Activity::ReceiveSubWorkerMethodCallResult),
            _ => None,
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller → worker request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub activity_name: String,
    #[serde(default)]
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_id: Option<ListenerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Request {
    /// Bare request; the handle stamps `call_id` when it is sent.
    pub fn new(activity: Activity) -> Self {
        Self {
            activity_name: activity.as_str().to_string(),
            call_id: 0,
            context_id: None,
            method_name: None,
            args: None,
            listener_id: None,
            request_id: None,
            result: None,
            error: None,
        }
    }

    pub fn create_context() -> Self {
        Self::new(Activity::CreateContext)
    }

    pub fn destroy_context(context_id: ContextId) -> Self {
        Self {
            context_id: Some(context_id),
            ..Self::new(Activity::DestroyContext)
        }
    }

    pub fn subscribe_to_state(context_id: ContextId) -> Self {
        Self {
            context_id: Some(context_id),
            ..Self::new(Activity::SubscribeToPublicState)
        }
    }

    pub fn unsubscribe_from_state(context_id: ContextId, listener_id: ListenerId) -> Self {
        Self {
            context_id: Some(context_id),
            listener_id: Some(listener_id),
            ..Self::new(Activity::UnsubscribeFromPublicState)
        }
    }

    pub fn get_methods_list() -> Self {
        Self::new(Activity::GetMethodsList)
    }

    pub fn call_method(context_id: ContextId, method_name: &str, args: Vec<Value>) -> Self {
        Self {
            context_id: Some(context_id),
            method_name: Some(method_name.to_string()),
            args: Some(args),
            ..Self::new(Activity::CallWorkerMethod)
        }
    }

    pub fn sub_worker_result(delegated: DelegatedResult) -> Self {
        Self {
            context_id: Some(delegated.context_id),
            request_id: Some(delegated.request_id),
            result: delegated.result,
            error: delegated.error,
            ..Self::new(Activity::ReceiveSubWorkerMethodCallResult)
        }
    }

    pub fn activity(&self) -> Option<Activity> {
        Activity::from_name(&self.activity_name)
    }
}

/// Worker → controller reply. `error` present means failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Reply {
    pub fn ok(call_id: CallId, result: Value) -> Self {
        Self {
            call_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(call_id: CallId, error: &WorkerError) -> Self {
        Self {
            call_id,
            result: None,
            error: Some(error.to_payload()),
        }
    }

    pub fn from_result(call_id: CallId, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(value) => Self::ok(call_id, value),
            Err(err) => Self::err(call_id, &err),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(WorkerError::from_payload(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Payload of the replies streamed for one state subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "v", rename_all = "camelCase")]
pub enum StatePush {
    ListenerId(ListenerId),
    State(Value),
}

/// Worker asks the controller to run a method on another worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedCall {
    pub request_name: String,
    pub context_id: ContextId,
    pub request_id: RequestId,
    pub worker_path: WorkerPath,
    pub method_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl DelegatedCall {
    pub fn new(
        context_id: ContextId,
        request_id: RequestId,
        worker_path: WorkerPath,
        method_name: &str,
        args: Vec<Value>,
    ) -> Self {
        Self {
            request_name: CALL_SUB_WORKER_METHOD.to_string(),
            context_id,
            request_id,
            worker_path,
            method_name: method_name.to_string(),
            args,
        }
    }

    /// Recognises a delegation request inside a reply's `result`.
    pub fn from_result(result: &Value) -> Option<Self> {
        let is_delegation = result
            .get("requestName")
            .and_then(Value::as_str)
            .map_or(false, |name| name == CALL_SUB_WORKER_METHOD);
        if !is_delegation {
            return None;
        }
        serde_json::from_value(result.clone()).ok()
    }

    pub fn into_result(self, outcome: Result<Value>) -> DelegatedResult {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err.to_payload())),
        };
        DelegatedResult {
            context_id: self.context_id,
            request_id: self.request_id,
            result,
            error,
        }
    }
}

/// Outcome of a delegated call, sent back controller → worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegatedResult {
    pub context_id: ContextId,
    pub request_id: RequestId,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

/// Only the correlation id of a frame that failed to decode as a request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CallIdOnly {
    pub call_id: CallId,
}

pub fn pack<T: Serialize>(message: &T) -> Result<Bytes> {
    let packed = rmp_serde::to_vec_named(message)?;
    Ok(Bytes::from(packed))
}

pub fn unpack<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(WorkerError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_activity_names_round_trip() {
        for activity in [
            Activity::CreateContext,
            Activity::DestroyContext,
            Activity::SubscribeToPublicState,
            Activity::UnsubscribeFromPublicState,
            Activity::GetMethodsList,
            Activity::CallWorkerMethod,
            Activity::ReceiveSubWorkerMethodCallResult,
        ] {
            assert_eq!(Activity::from_name(activity.as_str()), Some(activity));
        }
        assert_eq!(Activity::from_name("launchMissiles"), None);
    }

    #[test]
    fn test_request_uses_camel_case_fields() {
        let mut request = Request::call_method(3, "add", vec![json!(1), json!(2)]);
        request.call_id = 9;
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["activityName"], "callWorkerMethod");
        assert_eq!(value["callId"], 9);
        assert_eq!(value["contextId"], 3);
        assert_eq!(value["methodName"], "add");
        assert_eq!(value["args"], json!([1, 2]));
        assert!(value.get("listenerId").is_none());
    }

    #[test]
    fn test_request_pack_unpack() {
        let mut request = Request::unsubscribe_from_state(4, 2);
        request.call_id = 17;
        let packed = pack(&request).unwrap();
        let unpacked: Request = unpack(&packed).unwrap();
        assert_eq!(unpacked, request);
        assert_eq!(unpacked.activity(), Some(Activity::UnsubscribeFromPublicState));
    }

    #[test]
    fn test_reply_into_result() {
        assert_eq!(Reply::ok(1, json!(5)).into_result().unwrap(), json!(5));

        let failed = Reply::err(2, &WorkerError::remote(json!("boom")));
        assert!(failed.is_error());
        assert_eq!(failed.into_result(), Err(WorkerError::Remote(json!("boom"))));

        let empty = Reply { call_id: 3, result: None, error: None };
        assert_eq!(empty.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_null_reply_survives_packing() {
        let packed = pack(&Reply::ok(8, Value::Null)).unwrap();
        let reply: Reply = unpack(&packed).unwrap();
        assert_eq!(reply.call_id, 8);
        assert_eq!(reply.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_state_push_shape() {
        let push = serde_json::to_value(StatePush::State(json!({"n": 1}))).unwrap();
        assert_eq!(push, json!({"type": "state", "v": {"n": 1}}));

        let push = serde_json::to_value(StatePush::ListenerId(3)).unwrap();
        assert_eq!(push, json!({"type": "listenerId", "v": 3}));
    }

    #[test]
    fn test_delegated_call_recognised_in_result() {
        let call = DelegatedCall::new(1, 2, WorkerPath::from("workers/b"), "double", vec![json!(21)]);
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["requestName"], CALL_SUB_WORKER_METHOD);
        assert_eq!(value["workerPath"], "workers/b");
        assert_eq!(DelegatedCall::from_result(&value), Some(call));

        assert_eq!(DelegatedCall::from_result(&json!({"type": "state", "v": 1})), None);
        assert_eq!(DelegatedCall::from_result(&json!(42)), None);
    }

    #[test]
    fn test_delegated_result_into_request() {
        let call = DelegatedCall::new(5, 6, WorkerPath::from("b"), "double", vec![]);
        let request = Request::sub_worker_result(call.into_result(Err(WorkerError::remote("nope"))));
        assert_eq!(request.activity(), Some(Activity::ReceiveSubWorkerMethodCallResult));
        assert_eq!(request.context_id, Some(5));
        assert_eq!(request.request_id, Some(6));
        assert_eq!(request.error, Some(json!("nope")));
        assert!(request.result.is_none());
    }

    #[test]
    fn test_unpack_garbage_fails() {
        let result: Result<Request> = unpack(&[0xc1, 0x00, 0x13]);
        assert!(matches!(result, Err(WorkerError::DeserializeError(_))));
    }
}

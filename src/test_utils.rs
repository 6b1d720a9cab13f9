//! Test utilities shared by the unit tests.
//!
//! Provides worker programs, a spawner with both registered and a logger
//! that captures entries as JSON lines.

use crate::bridge::SubWorkerBridge;
use crate::channel::LocalSpawner;
use crate::context::WorkerContext;
use crate::error::{Result, WorkerError};
use crate::logging::{LogEntry, LogLevel, StructuredLogger};
use crate::methods::MethodRegistry;
use crate::protocol::ContextId;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const MATH_WORKER: &str = "workers/math";
pub const DELEGATING_WORKER: &str = "workers/delegating";

/// Arithmetic, state and failure-mode methods.
pub fn math_methods() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    build_math(&mut methods).expect("math worker registers cleanly");
    methods
}

fn build_math(methods: &mut MethodRegistry) -> Result<()> {
    methods
        .register_sync("add", |_: &WorkerContext, (a, b): (i64, i64)| Ok(a + b))?
        .register_sync("double", |_: &WorkerContext, (x,): (i64,)| Ok(x * 2))?
        .register("slow", |_ctx: WorkerContext, (ms, value): (u64, Value)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(value)
        })?
        .register_sync("state", |ctx: &WorkerContext, (): ()| Ok(ctx.state()))?
        .register_sync("set_state", |ctx: &WorkerContext, (value,): (Value,)| {
            ctx.set_state(value);
            Ok(())
        })?
        .register_sync("publish_twice", |ctx: &WorkerContext, (): ()| {
            ctx.set_state(json!({"n": 1}));
            ctx.set_state(json!({"n": 2}));
            Ok(())
        })?
        .register_sync("append", |ctx: &WorkerContext, (n,): (i64,)| {
            ctx.update_state(|prev| {
                let mut log = prev["log"].as_array().cloned().unwrap_or_default();
                log.push(json!(n));
                json!({ "log": log })
            });
            Ok(())
        })?
        .register_sync("fail", |_: &WorkerContext, (): ()| -> Result<()> {
            Err(WorkerError::remote(json!({"reason": "Intentional test failure"})))
        })?
        .register_sync("panic", |_: &WorkerContext, (): ()| -> Result<()> {
            panic!("worker method blew up")
        })?
        .register("quadruple", |ctx: WorkerContext, (x,): (i64,)| async move {
            let twice = ctx.call_sub_worker(MATH_WORKER, "double", (x,)).await?;
            ctx.call_sub_worker(MATH_WORKER, "double", (twice,)).await
        })?;
    Ok(())
}

/// Methods that delegate to the math worker.
pub fn delegating_methods() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    methods
        .register("double_remote", |ctx: WorkerContext, (x,): (i64,)| async move {
            ctx.call_sub_worker(MATH_WORKER, "double", (x,)).await
        })
        .expect("delegating worker registers cleanly");
    methods
}

/// Spawner with the math and delegating workers registered.
pub fn local_spawner() -> LocalSpawner {
    let spawner = LocalSpawner::new();
    spawner
        .register(MATH_WORKER, math_methods)
        .register(DELEGATING_WORKER, delegating_methods);
    spawner
}

/// Context whose delegation channel leads nowhere.
pub fn detached_context(id: ContextId) -> WorkerContext {
    let (tx, _rx) = mpsc::unbounded_channel();
    WorkerContext::new(id, SubWorkerBridge::new(id, 0, tx), None)
}

/// Helper to create a test logger with a capturing handler.
pub fn create_test_logger() -> (StructuredLogger, Arc<Mutex<Vec<String>>>) {
    let logs = Arc::new(Mutex::new(Vec::new()));
    let logs_clone = Arc::clone(&logs);

    let handler = Arc::new(move |entry: &LogEntry| {
        logs_clone.lock().unwrap().push(entry.to_json());
    });

    let logger = StructuredLogger::new(Some(handler), LogLevel::Debug, Some("test-controller".to_string()));

    (logger, logs)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for_condition<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    condition()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;

    #[test]
    fn test_math_methods_listed_in_order() {
        let names = math_methods().names();
        assert_eq!(names[0], "add");
        assert_eq!(names[1], "double");
        assert!(names.contains(&"quadruple".to_string()));
    }

    #[tokio::test]
    async fn test_detached_context_delegation_fails() {
        let ctx = detached_context(3);
        let err = ctx.call_sub_worker(MATH_WORKER, "double", (1,)).await.unwrap_err();
        assert_eq!(err, WorkerError::ChannelClosed);
    }

    #[tokio::test]
    async fn test_wait_for_condition_times_out() {
        assert!(!wait_for_condition(|| false, Duration::from_millis(20)).await);
        assert!(wait_for_condition(|| true, Duration::from_millis(20)).await);
    }

    #[test]
    fn test_request_builders_are_unstamped() {
        assert_eq!(Request::create_context().call_id, 0);
    }
}

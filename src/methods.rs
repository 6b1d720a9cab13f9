//! Registry of the functions a worker exports.

use crate::context::WorkerContext;
use crate::error::{Result, WorkerError};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub type MethodFuture = BoxFuture<'static, Result<Value>>;

type MethodFn = Arc<dyn Fn(WorkerContext, Vec<Value>) -> MethodFuture + Send + Sync>;

/// Exported methods keyed by name, listed in registration order.
///
/// Each method declares its argument type `A` (usually a tuple decoded from
/// the request's `args` array) and a serializable result `R`.
///
/// ```rust
/// use workerlink::{MethodRegistry, WorkerContext};
///
/// let mut methods = MethodRegistry::new();
/// methods
///     .register_sync("add", |_ctx: &WorkerContext, (a, b): (i64, i64)| Ok(a + b))
///     .unwrap();
/// assert_eq!(methods.names(), vec!["add".to_string()]);
/// ```
#[derive(Clone, Default)]
pub struct MethodRegistry {
    names: Vec<String>,
    methods: HashMap<String, MethodFn>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async method. Fails if `name` is already taken.
    pub fn register<A, R, F, Fut>(&mut self, name: &str, method: F) -> Result<&mut Self>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(WorkerContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let method = Arc::new(method);
        let erased: MethodFn = Arc::new(move |ctx, args| {
            let method = Arc::clone(&method);
            Box::pin(async move {
                let args = decode_args::<A>(args)?;
                let output = method(ctx, args).await?;
                Ok(serde_json::to_value(output)?)
            })
        });
        self.insert(name, erased)
    }

    /// Register a plain function; it still runs on the dispatcher's task.
    pub fn register_sync<A, R, F>(&mut self, name: &str, method: F) -> Result<&mut Self>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(&WorkerContext, A) -> Result<R> + Send + Sync + 'static,
    {
        let method = Arc::new(method);
        let erased: MethodFn = Arc::new(move |ctx, args| {
            let method = Arc::clone(&method);
            Box::pin(async move {
                let args = decode_args::<A>(args)?;
                let output = method(&ctx, args)?;
                Ok(serde_json::to_value(output)?)
            })
        });
        self.insert(name, erased)
    }

    fn insert(&mut self, name: &str, method: MethodFn) -> Result<&mut Self> {
        if self.methods.contains_key(name) {
            return Err(WorkerError::DuplicateMethod(name.to_string()));
        }
        self.names.push(name.to_string());
        self.methods.insert(name.to_string(), method);
        Ok(self)
    }

    pub fn names(&self) -> Vec<String> {
        self.names.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Start `name` with `ctx` as receiver. Argument errors surface from the future.
    pub(crate) fn invoke(&self, name: &str, ctx: WorkerContext, args: Vec<Value>) -> Result<MethodFuture> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| WorkerError::UnknownMethod(name.to_string()))?;
        Ok(method(ctx, args))
    }
}

/// Decode the `args` array into `A`. An empty list may also stand for `()`.
fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(decoded) => Ok(decoded),
        Err(_) if empty => serde_json::from_value(Value::Null)
            .map_err(|e| WorkerError::InvalidMessage(format!("Invalid arguments: {}", e))),
        Err(e) => Err(WorkerError::InvalidMessage(format!("Invalid arguments: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::detached_context;
    use serde_json::json;

    #[test]
    fn test_names_keep_registration_order() {
        let mut methods = MethodRegistry::new();
        methods
            .register_sync("zeta", |_: &WorkerContext, (): ()| Ok(1))
            .unwrap()
            .register_sync("alpha", |_: &WorkerContext, (): ()| Ok(2))
            .unwrap();
        assert_eq!(methods.names(), vec!["zeta".to_string(), "alpha".to_string()]);
        assert_eq!(methods.len(), 2);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut methods = MethodRegistry::new();
        methods.register_sync("add", |_: &WorkerContext, (a, b): (i64, i64)| Ok(a + b)).unwrap();
        let again = methods.register_sync("add", |_: &WorkerContext, (a,): (i64,)| Ok(a));
        assert!(matches!(again, Err(WorkerError::DuplicateMethod(name)) if name == "add"));
        assert_eq!(methods.len(), 1);
    }

    #[tokio::test]
    async fn test_invoke_decodes_tuple_args() {
        let mut methods = MethodRegistry::new();
        methods
            .register("add", |_ctx: WorkerContext, (a, b): (i64, i64)| async move { Ok(a + b) })
            .unwrap();

        let result = methods.invoke("add", detached_context(1), vec![json!(2), json!(3)]).unwrap().await;
        assert_eq!(result.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_unit_args_accept_empty_list() {
        let mut methods = MethodRegistry::new();
        methods.register_sync("ping", |_: &WorkerContext, (): ()| Ok("pong")).unwrap();

        let result = methods.invoke("ping", detached_context(1), vec![]).unwrap().await;
        assert_eq!(result.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_bad_args_are_invalid_message() {
        let mut methods = MethodRegistry::new();
        methods.register_sync("add", |_: &WorkerContext, (a, b): (i64, i64)| Ok(a + b)).unwrap();

        let result = methods.invoke("add", detached_context(1), vec![json!("two")]).unwrap().await;
        assert!(matches!(result, Err(WorkerError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_application_error_passes_through() {
        let mut methods = MethodRegistry::new();
        methods
            .register_sync("explode", |_: &WorkerContext, (): ()| -> Result<()> {
                Err(WorkerError::remote(json!({"reason": "boom"})))
            })
            .unwrap();

        let result = methods.invoke("explode", detached_context(1), vec![]).unwrap().await;
        assert_eq!(result, Err(WorkerError::Remote(json!({"reason": "boom"}))));
    }

    #[test]
    fn test_unknown_method() {
        let methods = MethodRegistry::new();
        let result = methods.invoke("nope", detached_context(1), vec![]);
        assert!(matches!(result, Err(WorkerError::UnknownMethod(_))));
    }
}

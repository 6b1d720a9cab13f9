//! Argument conversion for remote calls and the `call!` macro.
//!
//! ```rust,no_run
//! use workerlink::{call, AutoWorker};
//!
//! # async fn demo(worker: &AutoWorker) -> workerlink::Result<()> {
//! let sum = call!(worker, add(10, 20)).await?;
//! let same = worker.call("add", (10, 20)).await?;
//! assert_eq!(sum, same);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;

/// Conversion of one argument into its JSON wire form.
pub trait ToJsonArg {
    fn to_json(self) -> Result<Value>;
}

impl<T: Serialize> ToJsonArg for T {
    fn to_json(self) -> Result<Value> {
        Ok(serde_json::to_value(&self)?)
    }
}

/// Conversion of a whole argument list into the `args` array of a request.
///
/// Fails with [`WorkerError::JsonError`](crate::WorkerError::JsonError) when
/// an argument cannot be represented as JSON.
pub trait CallArgs {
    fn into_args(self) -> Result<Vec<Value>>;
}

impl CallArgs for Vec<Value> {
    fn into_args(self) -> Result<Vec<Value>> {
        Ok(self)
    }
}

impl CallArgs for () {
    fn into_args(self) -> Result<Vec<Value>> {
        Ok(vec![])
    }
}

impl<A: ToJsonArg> CallArgs for (A,) {
    fn into_args(self) -> Result<Vec<Value>> {
        Ok(vec![self.0.to_json()?])
    }
}

impl<A: ToJsonArg, B: ToJsonArg> CallArgs for (A, B) {
    fn into_args(self) -> Result<Vec<Value>> {
        Ok(vec![self.0.to_json()?, self.1.to_json()?])
    }
}

impl<A: ToJsonArg, B: ToJsonArg, C: ToJsonArg> CallArgs for (A, B, C) {
    fn into_args(self) -> Result<Vec<Value>> {
        Ok(vec![self.0.to_json()?, self.1.to_json()?, self.2.to_json()?])
    }
}

impl<A: ToJsonArg, B: ToJsonArg, C: ToJsonArg, D: ToJsonArg> CallArgs for (A, B, C, D) {
    fn into_args(self) -> Result<Vec<Value>> {
        Ok(vec![self.0.to_json()?, self.1.to_json()?, self.2.to_json()?, self.3.to_json()?])
    }
}

impl<A: ToJsonArg, B: ToJsonArg, C: ToJsonArg, D: ToJsonArg, E: ToJsonArg> CallArgs for (A, B, C, D, E) {
    fn into_args(self) -> Result<Vec<Value>> {
        Ok(vec![
            self.0.to_json()?,
            self.1.to_json()?,
            self.2.to_json()?,
            self.3.to_json()?,
            self.4.to_json()?,
        ])
    }
}

impl<A: ToJsonArg, B: ToJsonArg, C: ToJsonArg, D: ToJsonArg, E: ToJsonArg, F: ToJsonArg> CallArgs
    for (A, B, C, D, E, F)
{
    fn into_args(self) -> Result<Vec<Value>> {
        Ok(vec![
            self.0.to_json()?,
            self.1.to_json()?,
            self.2.to_json()?,
            self.3.to_json()?,
            self.4.to_json()?,
            self.5.to_json()?,
        ])
    }
}

/// Call a remote method with ordinary Rust arguments.
///
/// Works on anything with a `call(&str, impl CallArgs)` method:
/// `AutoWorker`, `WorkerSession`.
///
/// ```rust,ignore
/// let sum = call!(worker, add(2, 3)).await?;
/// let greeting = call!(session, greet("world")).await?;
/// let nothing = call!(session, ping()).await?;
/// ```
#[macro_export]
macro_rules! call {
    ($target:expr, $method:ident($($arg:expr),* $(,)?)) => {
        $target.call(stringify!($method), ($($arg,)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_to_json_arg_primitives() {
        assert_eq!(5i64.to_json().unwrap(), json!(5));
        assert_eq!(true.to_json().unwrap(), json!(true));
        assert_eq!("hello".to_json().unwrap(), json!("hello"));
        assert_eq!(vec![1, 2].to_json().unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_call_args_tuples() {
        assert_eq!(().into_args().unwrap(), Vec::<Value>::new());
        assert_eq!((1i64,).into_args().unwrap(), vec![json!(1)]);
        assert_eq!((1i64, "two").into_args().unwrap(), vec![json!(1), json!("two")]);
        assert_eq!((1, 2, 3).into_args().unwrap(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_call_args_vec_passthrough() {
        let args = vec![json!({"n": 1}), json!(null)];
        assert_eq!(args.clone().into_args().unwrap(), args);
    }

    #[test]
    fn test_unrepresentable_argument_is_an_error() {
        let mut grid = HashMap::new();
        grid.insert((0, 0), 1);

        assert!(matches!(grid.clone().to_json(), Err(WorkerError::JsonError(_))));
        assert!(matches!((1, grid).into_args(), Err(WorkerError::JsonError(_))));
    }

    struct Recorder;

    impl Recorder {
        fn call(&self, method: &str, args: impl CallArgs) -> (String, Vec<Value>) {
            (method.to_string(), args.into_args().unwrap())
        }
    }

    #[test]
    fn test_call_macro_expansion() {
        let recorder = Recorder;
        assert_eq!(call!(recorder, add(2, 3)), ("add".to_string(), vec![json!(2), json!(3)]));
        assert_eq!(call!(recorder, double(21)), ("double".to_string(), vec![json!(21)]));
        assert_eq!(call!(recorder, ping()), ("ping".to_string(), vec![]));
    }
}

//! Client method registry.
//!
//! The hub calls methods on the client by name. Each registration pairs a
//! method name with an async handler whose argument tuple type fixes both how
//! many arguments it takes and how each one is decoded from JSON. The decode
//! step is chosen when the handler is registered, so dispatch never inspects
//! types at runtime.
//!
//! ```ignore
//! registry.register("ReceiveMessage", |(user, text): (String, String)| async move {
//!     println!("{user}: {text}");
//! });
//! ```
//!
//! Handlers return either `()` or a `Result<T, E>`; the latter is used to
//! answer server invocations that expect a client result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::HubError;
use crate::protocol::InvocationBinder;

/// What a handler produced: `None` when it returns nothing.
pub type HandlerResult = Result<Option<Value>, HubError>;

type Callback = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

// ============================================================================
// Argument conversion
// ============================================================================

/// Decodes positional wire arguments into a handler's parameter tuple.
pub trait FromArguments: Sized + Send + 'static {
    /// Number of arguments, or `None` when any count is accepted.
    const ARITY: Option<usize>;

    /// Decode the arguments. The count has already been checked.
    fn from_arguments(arguments: Vec<Value>) -> Result<Self, HubError>;
}

/// Encodes call arguments into positional wire arguments.
pub trait IntoArguments {
    /// Serialize each argument to JSON.
    fn into_arguments(self) -> Result<Vec<Value>, HubError>;
}

impl FromArguments for () {
    const ARITY: Option<usize> = Some(0);

    fn from_arguments(_arguments: Vec<Value>) -> Result<Self, HubError> {
        Ok(())
    }
}

impl FromArguments for Vec<Value> {
    const ARITY: Option<usize> = None;

    fn from_arguments(arguments: Vec<Value>) -> Result<Self, HubError> {
        Ok(arguments)
    }
}

impl IntoArguments for () {
    fn into_arguments(self) -> Result<Vec<Value>, HubError> {
        Ok(Vec::new())
    }
}

impl IntoArguments for Vec<Value> {
    fn into_arguments(self) -> Result<Vec<Value>, HubError> {
        Ok(self)
    }
}

macro_rules! impl_arguments {
    ($count:expr; $($name:ident),+) => {
        impl<$($name: DeserializeOwned + Send + 'static),+> FromArguments for ($($name,)+) {
            const ARITY: Option<usize> = Some($count);

            fn from_arguments(arguments: Vec<Value>) -> Result<Self, HubError> {
                let mut arguments = arguments.into_iter();
                Ok(($(
                    {
                        let value = arguments.next().ok_or_else(|| {
                            HubError::InvalidData("Missing invocation argument.".to_string())
                        })?;
                        serde_json::from_value::<$name>(value)?
                    },
                )+))
            }
        }

        impl<$($name: Serialize),+> IntoArguments for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_arguments(self) -> Result<Vec<Value>, HubError> {
                let ($($name,)+) = self;
                Ok(vec![$(serde_json::to_value($name)?),+])
            }
        }
    };
}

impl_arguments!(1; A);
impl_arguments!(2; A, B);
impl_arguments!(3; A, B, C);
impl_arguments!(4; A, B, C, D);
impl_arguments!(5; A, B, C, D, E);
impl_arguments!(6; A, B, C, D, E, F);

/// Converts what a handler returned into an optional client result.
pub trait HandlerOutput: Send + 'static {
    /// Serialize the handler's outcome.
    fn into_result(self) -> HandlerResult;
}

impl HandlerOutput for () {
    fn into_result(self) -> HandlerResult {
        Ok(None)
    }
}

impl<T, E> HandlerOutput for Result<T, E>
where
    T: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn into_result(self) -> HandlerResult {
        match self {
            Ok(value) => Ok(Some(serde_json::to_value(value)?)),
            Err(err) => Err(HubError::Invocation(err.to_string())),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A registered handler with its declared arity.
#[derive(Clone)]
pub struct InvocationEntity {
    arity: Option<usize>,
    callback: Callback,
}

impl std::fmt::Debug for InvocationEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationEntity")
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl InvocationEntity {
    /// Number of arguments the handler takes, if fixed.
    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    /// Run the handler after checking the argument count.
    pub fn call(&self, method: &str, arguments: Vec<Value>) -> BoxFuture<'static, HandlerResult> {
        if let Some(expected) = self.arity {
            if arguments.len() != expected {
                let err = HubError::InvalidOperation(format!(
                    "Method '{}' expects {} argument(s) but received {}.",
                    method,
                    expected,
                    arguments.len()
                ));
                return futures_util::future::ready(Err(err)).boxed();
            }
        }
        (self.callback)(arguments)
    }
}

/// Maps method names to handlers. Names are case-sensitive.
#[derive(Debug, Default)]
pub struct InvocationRegistry {
    handlers: Mutex<HashMap<String, InvocationEntity>>,
}

impl InvocationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, InvocationEntity>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `method`, replacing any previous handler.
    pub fn register<A, F, Fut>(&self, method: &str, handler: F)
    where
        A: FromArguments,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: HandlerOutput,
    {
        let handler = Arc::new(handler);
        let callback: Callback = Arc::new(move |arguments: Vec<Value>| {
            let handler = Arc::clone(&handler);
            async move {
                let decoded = A::from_arguments(arguments)?;
                handler(decoded).await.into_result()
            }
            .boxed()
        });

        let previous = self.handlers().insert(
            method.to_string(),
            InvocationEntity {
                arity: A::ARITY,
                callback,
            },
        );
        if previous.is_some() {
            log::debug!("[InvocationRegistry] Replaced handler for '{}'", method);
        }
    }

    /// Remove the handler for `method`. Returns whether one existed.
    pub fn remove(&self, method: &str) -> bool {
        self.handlers().remove(method).is_some()
    }

    /// Whether a handler is registered for `method`.
    pub fn contains(&self, method: &str) -> bool {
        self.handlers().contains_key(method)
    }

    /// Clone out the handler for `method`.
    pub fn lookup(&self, method: &str) -> Option<InvocationEntity> {
        self.handlers().get(method).cloned()
    }

    /// Invoke the handler for `method`.
    ///
    /// Unregistered methods are a no-op returning `Ok(None)`. A wrong argument
    /// count fails with [`HubError::InvalidOperation`] without calling the
    /// handler.
    pub async fn trigger(&self, method: &str, arguments: Vec<Value>) -> HandlerResult {
        let Some(entity) = self.lookup(method) else {
            log::debug!("[InvocationRegistry] No handler for '{}'", method);
            return Ok(None);
        };
        entity.call(method, arguments).await
    }
}

impl InvocationBinder for InvocationRegistry {
    fn parameter_count(&self, target: &str) -> Option<usize> {
        self.handlers().get(target).and_then(InvocationEntity::arity)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_trigger_decodes_typed_arguments() {
        let registry = InvocationRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            registry.register("Message", move |(user, count): (String, u32)| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(format!("{user}:{count}"));
                }
            });
        }

        let result = registry
            .trigger("Message", vec![json!("ann"), json!(3)])
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(*seen.lock().unwrap(), vec!["ann:3".to_string()]);
    }

    #[tokio::test]
    async fn test_trigger_count_mismatch_does_not_call_handler() {
        let registry = InvocationRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            registry.register("Echo", move |(_text,): (String,)| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {}
            });
        }

        let err = registry
            .trigger("Echo", vec![json!("a"), json!("b")])
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidOperation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trigger_unregistered_is_noop() {
        let registry = InvocationRegistry::new();
        assert_eq!(registry.trigger("Missing", vec![json!(1)]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = InvocationRegistry::new();
        registry.register("Value", |(): ()| async { Ok::<_, String>(1) });
        registry.register("Value", |(): ()| async { Ok::<_, String>(2) });

        let result = registry.trigger("Value", Vec::new()).await.unwrap();
        assert_eq!(result, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_invocation_error() {
        let registry = InvocationRegistry::new();
        registry.register("Fail", |(): ()| async { Err::<(), _>("no luck") });

        let err = registry.trigger("Fail", Vec::new()).await.unwrap_err();
        assert_eq!(err, HubError::Invocation("no luck".to_string()));
    }

    #[tokio::test]
    async fn test_undecodable_argument_is_invalid_data() {
        let registry = InvocationRegistry::new();
        registry.register("Number", |(_n,): (u32,)| async {});

        let err = registry
            .trigger("Number", vec![json!("not a number")])
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidData(_)));
    }

    #[test]
    fn test_binder_reports_declared_arity() {
        let registry = InvocationRegistry::new();
        registry.register("Two", |(_a, _b): (String, String)| async {});
        registry.register("Any", |_args: Vec<Value>| async {});

        assert_eq!(registry.parameter_count("Two"), Some(2));
        assert_eq!(registry.parameter_count("Any"), None);
        assert_eq!(registry.parameter_count("Missing"), None);
    }

    #[test]
    fn test_remove() {
        let registry = InvocationRegistry::new();
        registry.register("Gone", |(): ()| async {});
        assert!(registry.contains("Gone"));
        assert!(registry.remove("Gone"));
        assert!(!registry.remove("Gone"));
        assert!(!registry.contains("Gone"));
    }

    #[test]
    fn test_into_arguments_tuple() {
        let args = ("hi", 2, true).into_arguments().unwrap();
        assert_eq!(args, vec![json!("hi"), json!(2), json!(true)]);
        assert!(().into_arguments().unwrap().is_empty());
    }
}

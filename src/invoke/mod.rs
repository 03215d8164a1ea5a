//! Invokable units
//!
//! Test bodies, hooks and instance factories are all exposed to the engine
//! through one uniform capability: take an [`InvokeContext`] plus a
//! [`CancellationToken`] and resolve to success or a [`CapturedError`].
//! Generated code or a reflection adapter may implement [`Invokable`]; the
//! engine depends only on the trait.

mod cancel;
mod context;

pub use cancel::CancellationToken;
pub use context::{FixtureSet, Instance, InvokeContext};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};

use crate::error::EngineError;

/// Error captured from a user-supplied callable
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedError {
    pub message: String,
    pub detail: Option<String>,
}

impl CapturedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Convert a task join failure (panic or abort) into a captured error
    pub fn from_join_error(err: JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            CapturedError::new(format!("panicked: {message}"))
        } else {
            CapturedError::new("task was aborted")
        }
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl From<&str> for CapturedError {
    fn from(message: &str) -> Self {
        CapturedError::new(message)
    }
}

impl From<String> for CapturedError {
    fn from(message: String) -> Self {
        CapturedError::new(message)
    }
}

/// Outcome of one invocation
pub type InvokeOutcome = Result<(), CapturedError>;

/// A callable unit with a uniform signature
pub trait Invokable: Send + Sync {
    fn invoke(&self, ctx: InvokeContext, cancel: CancellationToken)
        -> BoxFuture<'static, InvokeOutcome>;
}

/// Adapter turning an async closure into an [`Invokable`]
pub struct FnInvokable<F>(F);

impl<F, Fut> Invokable for FnInvokable<F>
where
    F: Fn(InvokeContext, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = InvokeOutcome> + Send + 'static,
{
    fn invoke(
        &self,
        ctx: InvokeContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, InvokeOutcome> {
        Box::pin((self.0)(ctx, cancel))
    }
}

/// Wrap an async closure as a shareable invokable
pub fn invokable<F, Fut>(f: F) -> Arc<dyn Invokable>
where
    F: Fn(InvokeContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvokeOutcome> + Send + 'static,
{
    Arc::new(FnInvokable(f))
}

/// Creates a fresh test-class instance for each attempt
pub trait InstanceFactory: Send + Sync {
    fn create(
        &self,
        ctx: InvokeContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Instance, CapturedError>>;
}

struct FnFactory<F>(F);

impl<F, Fut> InstanceFactory for FnFactory<F>
where
    F: Fn(InvokeContext, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Instance, CapturedError>> + Send + 'static,
{
    fn create(
        &self,
        ctx: InvokeContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Instance, CapturedError>> {
        Box::pin((self.0)(ctx, cancel))
    }
}

/// Wrap an async closure as an instance factory
pub fn instance_factory<F, Fut>(f: F) -> Arc<dyn InstanceFactory>
where
    F: Fn(InvokeContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Instance, CapturedError>> + Send + 'static,
{
    Arc::new(FnFactory(f))
}

/// Decides whether a failed attempt may be retried
///
/// Consulted only after the engine's own budget allows another attempt, so
/// a policy can veto retries but never extend them. `attempt` is the 1-based
/// number of the attempt that just failed.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(
        &self,
        ctx: InvokeContext,
        error: EngineError,
        attempt: u32,
    ) -> BoxFuture<'static, bool>;
}

struct FnRetryPolicy<F>(F);

impl<F, Fut> RetryPolicy for FnRetryPolicy<F>
where
    F: Fn(InvokeContext, EngineError, u32) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn should_retry(
        &self,
        ctx: InvokeContext,
        error: EngineError,
        attempt: u32,
    ) -> BoxFuture<'static, bool> {
        Box::pin((self.0)(ctx, error, attempt))
    }
}

/// Wrap an async closure as a retry policy
pub fn retry_policy<F, Fut>(f: F) -> Arc<dyn RetryPolicy>
where
    F: Fn(InvokeContext, EngineError, u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(FnRetryPolicy(f))
}

/// Run an invokable on its own task so panics are captured
pub fn spawn_invocation(
    unit: &Arc<dyn Invokable>,
    ctx: InvokeContext,
    cancel: CancellationToken,
) -> JoinHandle<InvokeOutcome> {
    tokio::spawn(unit.invoke(ctx, cancel))
}

/// Run an invokable to completion, capturing panics
pub async fn invoke_guarded(
    unit: &Arc<dyn Invokable>,
    ctx: InvokeContext,
    cancel: CancellationToken,
) -> InvokeOutcome {
    flatten_join(spawn_invocation(unit, ctx, cancel).await)
}

/// Collapse a joined invocation into its outcome
pub fn flatten_join<T>(
    joined: Result<Result<T, CapturedError>, JoinError>,
) -> Result<T, CapturedError> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => Err(CapturedError::from_join_error(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookScopeKind;

    #[tokio::test]
    async fn test_invokable_closure() {
        let unit = invokable(|ctx: InvokeContext, _cancel| async move {
            if ctx.attempt > 1 {
                Ok(())
            } else {
                Err(CapturedError::new("first attempt fails"))
            }
        });

        let first = invoke_guarded(
            &unit,
            InvokeContext::for_test("t", "C", "A", 1),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(first, Err(CapturedError::new("first attempt fails")));

        let second = invoke_guarded(
            &unit,
            InvokeContext::for_test("t", "C", "A", 2),
            CancellationToken::new(),
        )
        .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let unit = invokable(|_ctx, _cancel| async move {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });

        let outcome = invoke_guarded(
            &unit,
            InvokeContext::for_scope(HookScopeKind::Class, "C"),
            CancellationToken::new(),
        )
        .await;
        let err = outcome.unwrap_err();
        assert!(err.message.contains("kaboom"), "got {err}");
    }

    #[test]
    fn test_captured_error_display() {
        let err = CapturedError::new("expected 1").with_detail("got 2");
        assert_eq!(err.to_string(), "expected 1 (got 2)");
    }
}

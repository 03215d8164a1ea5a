use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::hooks::{HookOrchestrator, HookPhase};
use crate::invoke::{
    flatten_join, spawn_invocation, CancellationToken, CapturedError, FixtureSet, InvokeContext,
    InvokeOutcome,
};
use crate::models::{ExecutionNode, TestDescriptor};

/// Runs single attempts of a test body under its deadline
///
/// Each attempt gets a child cancellation token. When the deadline or the
/// session fires, the token is cancelled and the body has the grace period
/// to return before it is abandoned.
pub struct RetrySupervisor {
    hooks: Arc<HookOrchestrator>,
    default_timeout: Option<Duration>,
    default_retry_limit: u32,
    grace: Duration,
}

impl RetrySupervisor {
    pub fn new(hooks: Arc<HookOrchestrator>) -> Self {
        Self {
            hooks,
            default_timeout: None,
            default_retry_limit: 0,
            grace: Duration::from_secs(2),
        }
    }

    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_retry_limit(mut self, limit: u32) -> Self {
        self.default_retry_limit = limit;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn retry_limit(&self, test: &TestDescriptor) -> u32 {
        test.retry_limit.unwrap_or(self.default_retry_limit)
    }

    pub fn timeout(&self, test: &TestDescriptor) -> Option<Duration> {
        test.timeout.or(self.default_timeout)
    }

    /// Whether a failed attempt should be followed by another
    ///
    /// `attempt` is the 1-based number of the attempt that just failed, so a
    /// limit of `R` allows `R + 1` attempts in total.
    pub fn should_retry(
        &self,
        test: &TestDescriptor,
        attempt: u32,
        error: &EngineError,
        session: &CancellationToken,
    ) -> bool {
        error.is_retryable() && attempt <= self.retry_limit(test) && !session.is_cancelled()
    }

    /// Ask the test's retry policy whether a budgeted retry may go ahead
    ///
    /// A policy that panics denies the retry.
    pub async fn approve_retry(
        &self,
        test: &TestDescriptor,
        attempt: u32,
        error: &EngineError,
    ) -> bool {
        let Some(policy) = &test.retry_policy else {
            return true;
        };
        let ctx = InvokeContext::for_test(&test.id, &test.class, &test.assembly, attempt);
        match tokio::spawn(policy.should_retry(ctx, error.clone(), attempt)).await {
            Ok(approved) => {
                if !approved {
                    debug!("Retry policy declined {} after attempt {}", test.id, attempt);
                }
                approved
            }
            Err(e) => {
                warn!("Retry policy for {} failed: {}", test.id, CapturedError::from_join_error(e));
                false
            }
        }
    }

    /// Run one attempt: instance creation, test hooks, body
    pub async fn run_attempt(
        &self,
        node: &ExecutionNode,
        fixtures: FixtureSet,
        session: &CancellationToken,
    ) -> Result<(), EngineError> {
        let test = &node.descriptor;
        let attempt = node.begin_attempt();
        let token = session.child_token();
        debug!("Starting {} attempt {}", test.id, attempt);

        let mut ctx = InvokeContext::for_test(&test.id, &test.class, &test.assembly, attempt)
            .with_fixtures(fixtures);

        if let Some(factory) = &test.factory {
            let created = tokio::spawn(factory.create(ctx.clone(), token.clone()));
            match flatten_join(created.await) {
                Ok(instance) => ctx = ctx.with_instance(instance),
                Err(e) => {
                    return Err(body_failure(CapturedError::new(format!(
                        "instance creation failed: {e}"
                    ))))
                }
            }
        }

        if session.is_cancelled() {
            return Err(EngineError::cancelled("session cancelled before attempt"));
        }

        let outcome = match self
            .hooks
            .run_test_hooks(HookPhase::Before, test, &ctx, &token)
            .await
        {
            Ok(()) => self.run_body(test, ctx.clone(), &token, session).await,
            Err(e) => Err(e),
        };
        let after = self
            .hooks
            .run_test_hooks(HookPhase::After, test, &ctx, &token)
            .await;

        token.cancel();
        outcome.and(after)
    }

    async fn run_body(
        &self,
        test: &TestDescriptor,
        ctx: InvokeContext,
        token: &CancellationToken,
        session: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut handle = spawn_invocation(&test.body, ctx, token.clone());
        let timeout = self.timeout(test);

        tokio::select! {
            joined = &mut handle => flatten_join(joined).map_err(body_failure),
            _ = deadline(timeout) => {
                let timeout = timeout.unwrap_or_default();
                warn!("{} timed out after {}ms", test.id, timeout.as_millis());
                token.cancel();
                let abandoned = self.wind_down(&test.id, handle).await;
                Err(EngineError::TimedOut { timeout, abandoned })
            }
            _ = session.cancelled() => {
                token.cancel();
                self.wind_down(&test.id, handle).await;
                Err(EngineError::cancelled("session cancelled during attempt"))
            }
        }
    }

    /// Give a cancelled body the grace period to return; returns whether it
    /// had to be abandoned
    async fn wind_down(&self, id: &str, mut handle: JoinHandle<InvokeOutcome>) -> bool {
        match tokio::time::timeout(self.grace, &mut handle).await {
            Ok(_) => false,
            Err(_) => {
                warn!("{} ignored cancellation; abandoning it", id);
                handle.abort();
                true
            }
        }
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

fn body_failure(e: CapturedError) -> EngineError {
    EngineError::TestBodyFailure {
        message: e.message,
        detail: e.detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FixtureCatalog, FixtureRegistry};
    use crate::hooks::HookRegistry;
    use crate::reporting::CollectingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn supervisor() -> RetrySupervisor {
        let fixtures = Arc::new(FixtureRegistry::new(FixtureCatalog::new()));
        let hooks = Arc::new(HookOrchestrator::new(
            HookRegistry::new(),
            fixtures,
            Arc::new(CollectingSink::new()),
        ));
        RetrySupervisor::new(hooks).grace(Duration::from_millis(50))
    }

    fn node(test: TestDescriptor) -> ExecutionNode {
        ExecutionNode::new(0, Arc::new(test))
    }

    #[tokio::test]
    async fn test_timeout_cancels_token() {
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&observed);
        let test = TestDescriptor::new("slow", "C", move |_ctx, cancel: CancellationToken| {
            let seen = Arc::clone(&seen);
            async move {
                cancel.cancelled().await;
                seen.fetch_add(1, Ordering::SeqCst);
                Err(CapturedError::new("cancelled"))
            }
        })
        .timeout(Duration::from_millis(20));

        let err = supervisor()
            .run_attempt(&node(test), FixtureSet::new(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            EngineError::TimedOut {
                timeout: Duration::from_millis(20),
                abandoned: false
            }
        );
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_body_is_abandoned() {
        let test = TestDescriptor::new("hang", "C", |_ctx, _cancel| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .timeout(Duration::from_millis(10));

        let err = supervisor()
            .run_attempt(&node(test), FixtureSet::new(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::TimedOut { abandoned: true, .. }));
    }

    #[tokio::test]
    async fn test_panicking_body_fails_attempt() {
        let test = TestDescriptor::new("panics", "C", |_ctx, _cancel| async {
            if true {
                panic!("assertion failed: left == right");
            }
            Ok(())
        });

        let err = supervisor()
            .run_attempt(&node(test), FixtureSet::new(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("assertion failed"));
    }

    #[test]
    fn test_retry_budget() {
        let sup = supervisor().default_retry_limit(1);
        let test = TestDescriptor::new("t", "C", |_ctx, _cancel| async { Ok(()) }).retries(2);
        let failure = EngineError::TestBodyFailure {
            message: "boom".into(),
            detail: None,
        };
        let session = CancellationToken::new();

        assert!(sup.should_retry(&test, 1, &failure, &session));
        assert!(sup.should_retry(&test, 2, &failure, &session));
        assert!(!sup.should_retry(&test, 3, &failure, &session));
        assert!(!sup.should_retry(&test, 1, &EngineError::cancelled("x"), &session));

        session.cancel();
        assert!(!sup.should_retry(&test, 1, &failure, &session));
    }

    #[tokio::test]
    async fn test_retry_policy_panic_denies_retry() {
        let failure = EngineError::TestBodyFailure {
            message: "boom".into(),
            detail: None,
        };
        let plain = TestDescriptor::new("t", "C", |_ctx, _cancel| async { Ok(()) });
        assert!(supervisor().approve_retry(&plain, 1, &failure).await);

        let panicking = plain.clone().on_retry(|_ctx, _error, attempt| async move {
            if attempt > 0 {
                panic!("policy bug");
            }
            true
        });
        assert!(!supervisor().approve_retry(&panicking, 1, &failure).await);
    }
}

//! Scripted behaviours for manifest tests, hooks and fixtures

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::invoke::{invokable, CancellationToken, CapturedError, Invokable, InvokeOutcome};

/// What a scripted callable does when invoked
///
/// Steps run in field order: hang, wait for cancellation, sleep, panic,
/// fail the first `fail_attempts` calls, fail always.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Script {
    /// Never return, ignoring cancellation
    pub hang: bool,
    /// Wait until cancelled, then fail
    pub wait_for_cancel: bool,
    /// Sleep before finishing; cancellation cuts the sleep short
    pub sleep_ms: u64,
    pub panic: Option<String>,
    /// Fail this many calls before succeeding
    pub fail_attempts: u32,
    /// Fail every call with this message
    pub fail: Option<String>,
}

impl Script {
    pub fn runner(self) -> ScriptRunner {
        ScriptRunner {
            script: Arc::new(self),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Wrap as an invokable test body or hook
    pub fn into_invokable(self) -> Arc<dyn Invokable> {
        let runner = self.runner();
        invokable(move |_ctx, cancel| runner.call(cancel))
    }
}

/// A script plus the number of times it has been called
#[derive(Clone, Debug)]
pub struct ScriptRunner {
    script: Arc<Script>,
    calls: Arc<AtomicU32>,
}

impl ScriptRunner {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call(&self, cancel: CancellationToken) -> BoxFuture<'static, InvokeOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let script = Arc::clone(&self.script);
        Box::pin(async move { execute(&script, call, cancel).await })
    }
}

async fn execute(script: &Script, call: u32, cancel: CancellationToken) -> InvokeOutcome {
    if script.hang {
        return std::future::pending().await;
    }
    if script.wait_for_cancel {
        cancel.cancelled().await;
        return Err(CapturedError::new("observed cancellation"));
    }
    if script.sleep_ms > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(script.sleep_ms)) => {}
            _ = cancel.cancelled() => {
                return Err(CapturedError::new("cancelled while sleeping"));
            }
        }
    }
    if let Some(message) = &script.panic {
        panic!("{message}");
    }
    if call <= script.fail_attempts {
        return Err(CapturedError::new(format!("scripted failure on call {call}")));
    }
    if let Some(message) = &script.fail {
        return Err(CapturedError::new(message.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_attempts_then_pass() {
        let runner = Script {
            fail_attempts: 2,
            ..Default::default()
        }
        .runner();
        let cancel = CancellationToken::new();

        assert!(runner.call(cancel.clone()).await.is_err());
        assert!(runner.call(cancel.clone()).await.is_err());
        assert!(runner.call(cancel).await.is_ok());
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn test_sleep_observes_cancellation() {
        let runner = Script {
            sleep_ms: 60_000,
            ..Default::default()
        }
        .runner();
        let cancel = CancellationToken::new();
        let call = runner.call(cancel.clone());
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap();
        assert_eq!(outcome, Err(CapturedError::new("cancelled while sleeping")));
    }

    #[tokio::test]
    async fn test_hang_ignores_cancellation() {
        let runner = Script {
            hang: true,
            ..Default::default()
        }
        .runner();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_millis(50), runner.call(cancel)).await;
        assert!(outcome.is_err());
    }
}

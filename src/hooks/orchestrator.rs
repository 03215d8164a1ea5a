use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{Hook, HookPhase, HookRegistry, HookScopeKind};
use crate::error::EngineError;
use crate::fixtures::{FixtureRegistry, ScopeIdentity};
use crate::invoke::{invoke_guarded, CancellationToken, InvokeContext};
use crate::models::TestDescriptor;
use crate::reporting::{EventSink, ReportEvent, ScopeEvent};
use crate::utils::lock;

const SESSION: &str = "session";

type ScopeId = (HookScopeKind, String);

/// Bookkeeping for one scope instance
///
/// `registered` counts direct children: tests for a class, classes for an
/// assembly, assemblies for the session.
#[derive(Default)]
struct ScopeState {
    registered: usize,
    completed: usize,
    entered: bool,
    before: Arc<OnceCell<Result<(), EngineError>>>,
    after_ran: bool,
}

/// Sequences scope hooks around concurrently running tests
///
/// The first entrant of a scope runs its before hooks; later entrants await
/// the same single-assignment cell. A scope closes when its last registered
/// child completes: its fixtures are disposed, then its after hooks run, and
/// the parent scope is credited with one completed child.
pub struct HookOrchestrator {
    hooks: HookRegistry,
    fixtures: Arc<FixtureRegistry>,
    sink: Arc<dyn EventSink>,
    scopes: Mutex<HashMap<ScopeId, ScopeState>>,
    failures: Mutex<Vec<ScopeEvent>>,
}

impl HookOrchestrator {
    pub fn new(hooks: HookRegistry, fixtures: Arc<FixtureRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            hooks,
            fixtures,
            sink,
            scopes: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Register every test up front so scope completion is known in advance
    pub fn register_tests<'a>(&self, tests: impl IntoIterator<Item = &'a TestDescriptor>) {
        let mut scopes = lock(&self.scopes);
        for test in tests {
            let class = scopes
                .entry((HookScopeKind::Class, test.class.clone()))
                .or_default();
            class.registered += 1;
            if class.registered > 1 {
                continue;
            }

            let assembly = scopes
                .entry((HookScopeKind::Assembly, test.assembly.clone()))
                .or_default();
            assembly.registered += 1;
            if assembly.registered > 1 {
                continue;
            }

            scopes
                .entry((HookScopeKind::Session, SESSION.to_string()))
                .or_default()
                .registered += 1;
        }
    }

    /// Run outstanding before hooks for the test's session, assembly and class
    ///
    /// Returns the cached failure if any enclosing scope's before hooks failed.
    pub async fn enter(&self, test: &TestDescriptor, cancel: &CancellationToken) -> Result<(), EngineError> {
        for (kind, identity) in scope_chain(test) {
            if cancel.is_cancelled() {
                return Err(EngineError::cancelled(format!("entering {kind} {identity}")));
            }
            let cell = {
                let mut scopes = lock(&self.scopes);
                let state = scopes.entry((kind, identity.clone())).or_default();
                state.entered = true;
                Arc::clone(&state.before)
            };
            let outcome = cell
                .get_or_init(|| self.run_scope_before(kind, identity.clone(), test, cancel))
                .await;
            if let Err(e) = outcome {
                return Err(e.clone());
            }
        }
        Ok(())
    }

    async fn run_scope_before(
        &self,
        kind: HookScopeKind,
        identity: String,
        test: &TestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let hooks = self
            .hooks
            .hooks_for(kind, HookPhase::Before, &test.class, &test.assembly);
        debug!("Running {} before hooks for {} {}", hooks.len(), kind, identity);

        let ctx = scope_context(kind, &identity, test);
        let result = run_until_failure(&hooks, kind, &identity, &ctx, cancel).await;
        self.record(ScopeEvent::new(kind, identity, HookPhase::Before, result.clone().err()));
        result
    }

    /// Run test-level hooks for one attempt
    ///
    /// Before hooks stop at the first failure. After hooks all run and the
    /// first failure is returned. Every call reports a `Test` scope event.
    pub async fn run_test_hooks(
        &self,
        phase: HookPhase,
        test: &TestDescriptor,
        ctx: &InvokeContext,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let hooks = self
            .hooks
            .hooks_for(HookScopeKind::Test, phase, &test.class, &test.assembly);
        let result = match phase {
            HookPhase::Before => run_until_failure(&hooks, HookScopeKind::Test, &test.id, ctx, cancel).await,
            HookPhase::After => run_all(&hooks, HookScopeKind::Test, &test.id, ctx, cancel).await,
        };
        // The failure belongs to the test's own result, not the scope failures
        self.sink.emit(ReportEvent::Scope(ScopeEvent::new(
            HookScopeKind::Test,
            test.id.clone(),
            phase,
            result.clone().err(),
        )));
        result
    }

    /// Credit a finished test to its scopes, closing any that are now complete
    ///
    /// Called exactly once per test, including tests that never started.
    pub async fn exit(&self, test: &TestDescriptor, cancel: &CancellationToken) {
        let chain = scope_chain(test);
        for (kind, identity) in chain.into_iter().rev() {
            let run_after = {
                let mut scopes = lock(&self.scopes);
                let state = scopes.entry((kind, identity.clone())).or_default();
                state.completed += 1;
                if state.completed < state.registered || state.after_ran {
                    return;
                }
                state.after_ran = true;
                state.entered
            };
            self.close(kind, identity, test, run_after, cancel).await;
        }
    }

    async fn close(
        &self,
        kind: HookScopeKind,
        identity: String,
        test: &TestDescriptor,
        run_after: bool,
        cancel: &CancellationToken,
    ) {
        let fixture_scope = match kind {
            HookScopeKind::Session => ScopeIdentity::Session,
            HookScopeKind::Assembly => ScopeIdentity::Assembly(identity.clone()),
            HookScopeKind::Class => ScopeIdentity::Class(identity.clone()),
            HookScopeKind::Test => ScopeIdentity::Test(identity.clone()),
        };
        for error in self.fixtures.close_scope(&fixture_scope, cancel).await {
            self.record(ScopeEvent::new(kind, identity.clone(), HookPhase::After, Some(error)));
        }

        if !run_after {
            debug!("{} {} never entered; skipping after hooks", kind, identity);
            return;
        }

        let hooks = self
            .hooks
            .hooks_for(kind, HookPhase::After, &test.class, &test.assembly);
        debug!("Running {} after hooks for {} {}", hooks.len(), kind, identity);
        let ctx = scope_context(kind, &identity, test);
        let result = run_all(&hooks, kind, &identity, &ctx, cancel).await;
        self.record(ScopeEvent::new(kind, identity, HookPhase::After, result.err()));
    }

    /// Scope failures recorded so far
    pub fn failures(&self) -> Vec<ScopeEvent> {
        lock(&self.failures).clone()
    }

    /// Record a scope event, keeping it if it is a failure
    pub fn record(&self, event: ScopeEvent) {
        if event.is_failure() {
            lock(&self.failures).push(event.clone());
        }
        self.sink.emit(ReportEvent::Scope(event));
    }
}

/// Session, assembly and class scopes of a test, outermost first
fn scope_chain(test: &TestDescriptor) -> [(HookScopeKind, String); 3] {
    [
        (HookScopeKind::Session, SESSION.to_string()),
        (HookScopeKind::Assembly, test.assembly.clone()),
        (HookScopeKind::Class, test.class.clone()),
    ]
}

fn scope_context(kind: HookScopeKind, identity: &str, test: &TestDescriptor) -> InvokeContext {
    let ctx = InvokeContext::for_scope(kind, identity);
    match kind {
        HookScopeKind::Session => ctx,
        HookScopeKind::Assembly => ctx.with_assembly(test.assembly.clone()),
        _ => ctx
            .with_assembly(test.assembly.clone())
            .with_class(test.class.clone()),
    }
}

async fn invoke_hook(
    hook: &Hook,
    kind: HookScopeKind,
    identity: &str,
    ctx: &InvokeContext,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    invoke_guarded(&hook.invoker, ctx.clone(), cancel.clone())
        .await
        .map_err(|e| {
            warn!("{} hook '{}' failed for {}: {}", kind, hook.name, identity, e);
            EngineError::HookFailure {
                scope: kind,
                identity: identity.to_string(),
                hook: hook.name.clone(),
                message: e.to_string(),
            }
        })
}

async fn run_until_failure(
    hooks: &[Hook],
    kind: HookScopeKind,
    identity: &str,
    ctx: &InvokeContext,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    for hook in hooks {
        if cancel.is_cancelled() {
            return Err(EngineError::cancelled(format!("before {kind} hooks for {identity}")));
        }
        invoke_hook(hook, kind, identity, ctx, cancel).await?;
    }
    Ok(())
}

async fn run_all(
    hooks: &[Hook],
    kind: HookScopeKind,
    identity: &str,
    ctx: &InvokeContext,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let mut first_error = None;
    for hook in hooks {
        if let Err(e) = invoke_hook(hook, kind, identity, ctx, cancel).await {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

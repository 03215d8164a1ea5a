//! Session entry point
//!
//! Wires the graph resolver, fixture registry, hook orchestrator, supervisor
//! and scheduler together for one run.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::supervisor::RetrySupervisor;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fixtures::{Consumer, FixtureRegistry, ScopeIdentity};
use crate::graph::DependencyGraph;
use crate::hooks::{HookOrchestrator, HookPhase, HookScopeKind};
use crate::invoke::{CancellationToken, FixtureSet};
use crate::models::{ExecutionNode, SkipReason, TestDescriptor, TestFilter, TestResult, TestSuite};
use crate::reporting::{
    CollectingSink, EventSink, MultiSink, ReportEvent, RunSummary, ScopeEvent, TracingSink,
};
use crate::scheduler::{Coordinator, NodeRunner, Verdict};
use crate::utils::{lock, Timer};

/// Runs a suite of tests to completion
pub struct TestEngine {
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
    filter: TestFilter,
}

impl TestEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
            filter: TestFilter::default(),
        }
    }

    /// Forward every report event to `sink` as well
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_filter(mut self, filter: TestFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run(&self, suite: TestSuite) -> Result<RunSummary> {
        self.run_with_cancel(suite, CancellationToken::new()).await
    }

    /// Run `suite`; cancelling `session` aborts the run cooperatively
    ///
    /// Only an invalid configuration or a duplicate test identifier returns
    /// an error. Every other failure is captured in the summary.
    pub async fn run_with_cancel(
        &self,
        suite: TestSuite,
        session: CancellationToken,
    ) -> Result<RunSummary> {
        self.config.validate()?;
        let timer = Timer::start("session");

        let TestSuite {
            tests,
            hooks,
            fixtures,
        } = suite;
        let tests: Vec<Arc<TestDescriptor>> =
            self.filter.apply(tests).into_iter().map(Arc::new).collect();
        let graph = DependencyGraph::build(&tests)?;

        info!(
            "Starting session: {} tests, {} dependency edges",
            tests.len(),
            graph.edge_count()
        );

        let collector = Arc::new(CollectingSink::new());
        let sink: Arc<dyn EventSink> = Arc::new(
            MultiSink::new()
                .with(collector.clone())
                .with(Arc::clone(&self.sink)),
        );

        let fixtures = Arc::new(FixtureRegistry::new(fixtures));
        let hooks = Arc::new(HookOrchestrator::new(
            hooks,
            Arc::clone(&fixtures),
            Arc::clone(&sink),
        ));
        hooks.register_tests(tests.iter().map(|t| t.as_ref()));

        let supervisor = RetrySupervisor::new(Arc::clone(&hooks))
            .default_timeout(self.config.default_timeout())
            .default_retry_limit(self.config.default_retry_limit)
            .grace(self.config.grace());

        let nodes: Vec<Arc<ExecutionNode>> = tests
            .iter()
            .enumerate()
            .map(|(i, t)| Arc::new(ExecutionNode::new(i, Arc::clone(t))))
            .collect();

        let runner = Arc::new(EngineRunner {
            hooks: Arc::clone(&hooks),
            fixtures: Arc::clone(&fixtures),
            supervisor: Arc::new(supervisor),
            sink,
            held: Arc::new(Mutex::new(HashMap::new())),
        });

        let index_of: HashMap<String, usize> = tests
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        Coordinator::new(graph, nodes, runner, self.config.max_parallelism)
            .fail_fast(self.config.fail_fast)
            .grace(self.config.grace())
            .run(session.clone())
            .await;

        // Anything left behind by abandoned work still gets its finalizer
        for error in fixtures
            .close_scope(&ScopeIdentity::Session, &session)
            .await
        {
            hooks.record(ScopeEvent::new(
                HookScopeKind::Session,
                "session",
                HookPhase::After,
                Some(error),
            ));
        }
        if fixtures.live_count() > 0 {
            warn!("{} fixtures still live after session close", fixtures.live_count());
        }

        let mut results = collector.results();
        results.sort_by_key(|r| index_of.get(&r.test_id).copied().unwrap_or(usize::MAX));

        let summary = RunSummary::new(results, hooks.failures(), timer.stop());
        info!(
            "Session completed in {}ms - Pass: {}/{} ({:.1}%)",
            summary.duration.as_millis(),
            summary.passed,
            summary.total,
            summary.pass_rate()
        );
        Ok(summary)
    }
}

/// Executes admitted nodes: scope entry, fixtures, supervised attempts
#[derive(Clone)]
struct EngineRunner {
    hooks: Arc<HookOrchestrator>,
    fixtures: Arc<FixtureRegistry>,
    supervisor: Arc<RetrySupervisor>,
    sink: Arc<dyn EventSink>,
    /// Fixtures held by nodes that have not settled, reused across retries
    held: Arc<Mutex<HashMap<usize, FixtureSet>>>,
}

impl EngineRunner {
    async fn attempt(self, node: Arc<ExecutionNode>, session: CancellationToken) -> Verdict {
        let test = Arc::clone(&node.descriptor);

        if node.attempts() == 0 {
            if let Err(e) = self.hooks.enter(&test, &session).await {
                return Verdict::Finished(terminal(&test, e));
            }
        }

        let fixtures = match self.fixtures_for(&node, &test, &session).await {
            Ok(fixtures) => fixtures,
            Err(result) => return Verdict::Finished(result),
        };

        match self.supervisor.run_attempt(&node, fixtures, &session).await {
            Ok(()) => Verdict::Finished(TestResult::passed(&test.id, &test.class, &test.assembly)),
            Err(e) => {
                let attempt = node.attempts();
                if self.supervisor.should_retry(&test, attempt, &e, &session)
                    && self.supervisor.approve_retry(&test, attempt, &e).await
                {
                    self.sink.emit(ReportEvent::Retrying {
                        test_id: test.id.clone(),
                        attempt,
                        error: e,
                    });
                    Verdict::Retry
                } else {
                    Verdict::Finished(terminal(&test, e))
                }
            }
        }
    }

    /// Fixtures for this node, acquiring them on first use
    async fn fixtures_for(
        &self,
        node: &ExecutionNode,
        test: &TestDescriptor,
        session: &CancellationToken,
    ) -> std::result::Result<FixtureSet, TestResult> {
        if let Some(set) = lock(&self.held).get(&node.index) {
            return Ok(set.clone());
        }
        if test.fixtures.is_empty() {
            return Ok(FixtureSet::new());
        }

        let consumer = Consumer::test(&test.id, &test.class, &test.assembly);
        match self.fixtures.acquire(&consumer, &test.fixtures, session).await {
            Ok(acquired) => {
                debug!("{} acquired {} fixtures", test.id, acquired.keys.len());
                lock(&self.held).insert(node.index, acquired.fixtures.clone());
                Ok(acquired.fixtures)
            }
            Err(failure) if failure.initiated => Err(terminal(test, failure.error)),
            Err(failure) => {
                if matches!(failure.error, EngineError::Cancelled { .. }) {
                    return Err(terminal(test, failure.error));
                }
                let fixture = match failure.error.root_cause() {
                    EngineError::FixtureFault { fixture, .. } => fixture.clone(),
                    _ => test
                        .fixtures
                        .first()
                        .map(|r| r.fixture.clone())
                        .unwrap_or_default(),
                };
                Err(TestResult::skipped(
                    &test.id,
                    &test.class,
                    &test.assembly,
                    SkipReason::FixtureFailed { fixture },
                )
                .with_error(failure.error))
            }
        }
    }

    async fn release(self, node: Arc<ExecutionNode>, session: CancellationToken) {
        let test = &node.descriptor;
        let consumer = Consumer::test(&test.id, &test.class, &test.assembly);

        self.fixtures.release(&consumer);
        lock(&self.held).remove(&node.index);

        let scope = ScopeIdentity::Test(test.id.clone());
        for error in self.fixtures.close_scope(&scope, &session).await {
            self.hooks.record(ScopeEvent::new(
                HookScopeKind::Test,
                test.id.clone(),
                HookPhase::After,
                Some(error),
            ));
        }

        self.hooks.exit(test, &session).await;
    }
}

impl NodeRunner for EngineRunner {
    fn run(&self, node: Arc<ExecutionNode>, session: CancellationToken) -> BoxFuture<'static, Verdict> {
        Box::pin(self.clone().attempt(node, session))
    }

    fn settle(&self, node: Arc<ExecutionNode>, session: CancellationToken) -> BoxFuture<'static, ()> {
        Box::pin(self.clone().release(node, session))
    }

    fn report(&self, result: TestResult) {
        self.sink.emit(ReportEvent::TestFinished(result));
    }
}

/// Terminal result for an error that ends the test
fn terminal(test: &TestDescriptor, error: EngineError) -> TestResult {
    match error {
        EngineError::Cancelled { .. } => {
            TestResult::cancelled(&test.id, &test.class, &test.assembly, error)
        }
        error => TestResult::failed(&test.id, &test.class, &test.assembly, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FixtureCatalog, FixtureDefinition, FixtureRequirement, SharedScope};
    use crate::hooks::{Hook, HookRegistry, HookTarget};
    use crate::invoke::CapturedError;
    use crate::models::{Dependency, TestOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn engine() -> TestEngine {
        TestEngine::new(
            EngineConfig::default()
                .with_max_parallelism(4)
                .with_grace(Duration::from_millis(100)),
        )
        .with_sink(Arc::new(CollectingSink::new()))
    }

    fn passing(id: &str, class: &str) -> TestDescriptor {
        TestDescriptor::new(id, class, |_ctx, _cancel| async { Ok(()) })
    }

    fn failing(id: &str, class: &str) -> TestDescriptor {
        TestDescriptor::new(id, class, |_ctx, _cancel| async {
            Err(CapturedError::new("boom"))
        })
    }

    #[tokio::test]
    async fn test_results_in_declaration_order() {
        let suite = TestSuite::new().with_tests([
            passing("a", "C"),
            failing("b", "C"),
            passing("c", "D"),
        ]);

        let summary = engine().run(suite).await.unwrap();
        let ids: Vec<_> = summary.results.iter().map(|r| r.test_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_before_run() {
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ran);
        let suite = TestSuite::new().test(TestDescriptor::new("a", "C", move |_ctx, _cancel| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));

        let engine = TestEngine::new(EngineConfig::default().with_max_parallelism(0));
        let err = engine.run(suite).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_identifier_aborts_run() {
        let suite = TestSuite::new().with_tests([passing("a", "C"), passing("a", "D")]);
        let err = engine().run(suite).await.unwrap_err();
        assert!(err.is_fatal_to_run());
    }

    #[tokio::test]
    async fn test_retry_reported_before_final_result() {
        let sink = Arc::new(CollectingSink::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let flaky = TestDescriptor::new("flaky", "C", move |_ctx, _cancel| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(CapturedError::new("first attempt fails"))
                } else {
                    Ok(())
                }
            }
        })
        .retries(2);

        let summary = engine()
            .with_sink(sink.clone())
            .run(TestSuite::new().test(flaky))
            .await
            .unwrap();

        let result = summary.result("flaky").unwrap();
        assert_eq!(result.outcome, TestOutcome::Passed);
        assert_eq!(result.attempts, 2);

        let retrying = sink
            .events()
            .iter()
            .filter(|e| matches!(e, ReportEvent::Retrying { attempt: 1, .. }))
            .count();
        assert_eq!(retrying, 1);
    }

    #[tokio::test]
    async fn test_retry_policy_can_veto() {
        let sink = Arc::new(CollectingSink::new());
        let vetoed = failing("vetoed", "C")
            .retries(3)
            .on_retry(|_ctx, error, _attempt| async move {
                !matches!(error, EngineError::TestBodyFailure { .. })
            });

        let summary = engine()
            .with_sink(sink.clone())
            .run(TestSuite::new().test(vetoed))
            .await
            .unwrap();

        let result = summary.result("vetoed").unwrap();
        assert_eq!(result.outcome, TestOutcome::Failed);
        assert_eq!(result.attempts, 1);
        assert!(!sink
            .events()
            .iter()
            .any(|e| matches!(e, ReportEvent::Retrying { .. })));
    }

    #[tokio::test]
    async fn test_retry_policy_observes_each_failed_attempt() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&seen);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flaky = TestDescriptor::new("flaky", "C", move |_ctx, _cancel| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CapturedError::new("not yet"))
                } else {
                    Ok(())
                }
            }
        })
        .retries(3)
        .on_retry(move |ctx, _error, attempt| {
            lock(&observed).push((ctx.attempt, attempt));
            async { true }
        });

        let summary = engine().run(TestSuite::new().test(flaky)).await.unwrap();

        let result = summary.result("flaky").unwrap();
        assert_eq!(result.outcome, TestOutcome::Passed);
        assert_eq!(result.attempts, 3);
        assert_eq!(*lock(&seen), vec![(1, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn test_fixture_fault_fails_initiator_and_skips_others() {
        let catalog = FixtureCatalog::new().with(FixtureDefinition::new("db", |_ctx| {
            Err(CapturedError::new("connection refused"))
        }));
        let req = FixtureRequirement::of("db", SharedScope::PerClass);
        let first = passing("first", "C").fixture(req.clone());
        let second = passing("second", "C")
            .fixture(req)
            .depends_on(Dependency::on_test("first").proceed_on_failure());

        let summary = engine()
            .run(
                TestSuite::new()
                    .with_fixtures(catalog)
                    .with_tests([first, second]),
            )
            .await
            .unwrap();

        let first = summary.result("first").unwrap();
        assert_eq!(first.outcome, TestOutcome::Failed);
        assert!(matches!(
            first.error,
            Some(EngineError::FixtureInitializationFailed { .. })
        ));

        let second = summary.result("second").unwrap();
        assert_eq!(second.outcome, TestOutcome::Skipped);
        assert_eq!(
            second.skip_reason,
            Some(SkipReason::FixtureFailed {
                fixture: "db".to_string()
            })
        );
        assert_eq!(second.error, first.error);
    }

    #[tokio::test]
    async fn test_test_hooks_report_scope_events() {
        let hooks = HookRegistry::new()
            .before(
                HookScopeKind::Test,
                HookTarget::Everywhere,
                Hook::new("arrange", |_ctx, _cancel| async { Ok(()) }),
            )
            .after(
                HookScopeKind::Test,
                HookTarget::Everywhere,
                Hook::new("cleanup", |_ctx, _cancel| async {
                    Err(CapturedError::new("temp dir busy"))
                }),
            );
        let sink = Arc::new(CollectingSink::new());

        let summary = engine()
            .with_sink(sink.clone())
            .run(TestSuite::new().with_hooks(hooks).test(passing("a", "C")))
            .await
            .unwrap();

        let test_events: Vec<_> = sink
            .scope_events()
            .into_iter()
            .filter(|e| e.scope == HookScopeKind::Test)
            .collect();
        assert_eq!(test_events.len(), 2);
        assert_eq!(
            (test_events[0].identity.as_str(), test_events[0].phase),
            ("a", HookPhase::Before)
        );
        assert!(test_events[0].error.is_none());
        assert_eq!(test_events[1].phase, HookPhase::After);
        assert!(matches!(
            test_events[1].error,
            Some(EngineError::HookFailure { scope: HookScopeKind::Test, .. })
        ));

        assert_eq!(summary.result("a").unwrap().outcome, TestOutcome::Failed);
        assert!(summary.scope_failures.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_session_cancels_unstarted() {
        let session = CancellationToken::new();
        session.cancel();

        let summary = engine()
            .run_with_cancel(
                TestSuite::new().with_tests([passing("a", "C"), passing("b", "C")]),
                session,
            )
            .await
            .unwrap();

        assert_eq!(summary.cancelled, 2);
        assert!(summary
            .results
            .iter()
            .all(|r| r.outcome == TestOutcome::Cancelled && r.attempts == 0));
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::constraints::{ConstraintTracker, Lease};
use super::{NodeRunner, Verdict};
use crate::error::EngineError;
use crate::graph::{DependencyGraph, Readiness};
use crate::invoke::{CancellationToken, CapturedError};
use crate::models::{ExecutionNode, NodeState, SkipReason, TestOutcome, TestResult};

enum TaskEvent {
    Attempted { index: usize, verdict: Verdict },
    Settled,
}

/// Drives every node of one session to a terminal state
pub struct Coordinator<R: NodeRunner> {
    graph: DependencyGraph,
    nodes: Vec<Arc<ExecutionNode>>,
    tracker: ConstraintTracker,
    leases: HashMap<usize, Lease>,
    runner: Arc<R>,
    fail_fast: bool,
    grace: Duration,
}

impl<R: NodeRunner> Coordinator<R> {
    pub fn new(
        graph: DependencyGraph,
        nodes: Vec<Arc<ExecutionNode>>,
        runner: Arc<R>,
        max_parallelism: usize,
    ) -> Self {
        Self {
            graph,
            nodes,
            tracker: ConstraintTracker::new(max_parallelism),
            leases: HashMap::new(),
            runner,
            fail_fast: false,
            grace: Duration::from_secs(2),
        }
    }

    /// Cancel the session on the first failed test
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// How long in-flight work may take to wind down after cancellation
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run until every node is terminal and every node has settled
    pub async fn run(mut self, session: CancellationToken) {
        let mut tasks: JoinSet<TaskEvent> = JoinSet::new();
        let mut cancel_seen = false;
        let mut deadline: Option<Instant> = None;

        info!(
            "Scheduling {} tests (max parallelism {})",
            self.nodes.len(),
            self.tracker.max_parallelism()
        );

        loop {
            if session.is_cancelled() && !cancel_seen {
                cancel_seen = true;
                self.cancel_unstarted(&mut tasks, &session);
                // In-flight attempts get the grace period twice over: once to
                // observe the token and once for their teardown hooks
                deadline = Some(Instant::now() + self.grace * 2);
            }
            if !cancel_seen {
                self.advance(&mut tasks, &session);
            }

            if tasks.is_empty() {
                if self.nodes.iter().all(|n| n.state().is_terminal()) {
                    break;
                }
                if cancel_seen {
                    self.abandon_remaining();
                    break;
                }
                error!("Scheduler stalled with no work in flight");
                session.cancel();
                continue;
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(TaskEvent::Attempted { index, verdict })) => {
                        self.complete(index, verdict, &mut tasks, &session);
                    }
                    Some(Ok(TaskEvent::Settled)) | None => {}
                    Some(Err(e)) => error!("Scheduler task failed: {}", e),
                },
                _ = session.cancelled(), if !cancel_seen => {}
                _ = sleep_until(deadline), if deadline.is_some() => {
                    warn!("Grace period elapsed; abandoning {} tasks", tasks.len());
                    tasks.abort_all();
                    self.abandon_remaining();
                    break;
                }
            }
        }

        debug!("Scheduler finished");
    }

    /// Move every node as far forward as it can go right now
    fn advance(&mut self, tasks: &mut JoinSet<TaskEvent>, session: &CancellationToken) {
        loop {
            let mut changed = false;
            // Set while an earlier run-alone node waits, so later nodes
            // cannot keep the session busy forever
            let mut barrier = false;

            for index in 0..self.nodes.len() {
                let node = Arc::clone(&self.nodes[index]);
                let mut state = node.state();

                if matches!(state, NodeState::Pending | NodeState::Blocked) {
                    if let Some(next) = self.evaluate(&node, state, tasks, session) {
                        changed = true;
                        state = next;
                    }
                }

                if state != NodeState::Runnable || barrier {
                    continue;
                }

                match self.tracker.try_acquire(&node.descriptor) {
                    Some(lease) => {
                        if node.transition(NodeState::Runnable, NodeState::Running) {
                            self.leases.insert(index, lease);
                            self.spawn_attempt(node, tasks, session);
                            changed = true;
                        } else {
                            self.tracker.release(lease);
                        }
                    }
                    None if node.descriptor.constraint.is_global_exclusive() => barrier = true,
                    None => {}
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Resolve a pending or blocked node; returns its new state if it moved
    fn evaluate(
        &self,
        node: &Arc<ExecutionNode>,
        state: NodeState,
        tasks: &mut JoinSet<TaskEvent>,
        session: &CancellationToken,
    ) -> Option<NodeState> {
        let test = &node.descriptor;

        if state == NodeState::Pending && node.attempts() == 0 {
            if let Some(err) = self.graph.discovery_failure(node.index) {
                let result = TestResult::failed(&test.id, &test.class, &test.assembly, err.clone());
                return self.finish_unstarted(node, state, result, tasks, session);
            }
            if let Some(reason) = &test.skip_reason {
                let result = TestResult::skipped(
                    &test.id,
                    &test.class,
                    &test.assembly,
                    SkipReason::Explicit {
                        message: reason.clone(),
                    },
                );
                return self.finish_unstarted(node, state, result, tasks, session);
            }
        }

        match self.graph.readiness(node.index, |i| self.nodes[i].state()) {
            Readiness::Ready => node
                .transition(state, NodeState::Runnable)
                .then_some(NodeState::Runnable),
            Readiness::Waiting => {
                if state == NodeState::Pending && node.transition(state, NodeState::Blocked) {
                    Some(NodeState::Blocked)
                } else {
                    None
                }
            }
            Readiness::Skip { dependency } => {
                debug!("Skipping {}: dependency {} did not pass", test.id, dependency);
                let result = TestResult::skipped(
                    &test.id,
                    &test.class,
                    &test.assembly,
                    SkipReason::DependencyFailed { dependency },
                );
                self.finish_unstarted(node, state, result, tasks, session)
            }
        }
    }

    fn finish_unstarted(
        &self,
        node: &Arc<ExecutionNode>,
        from: NodeState,
        result: TestResult,
        tasks: &mut JoinSet<TaskEvent>,
        session: &CancellationToken,
    ) -> Option<NodeState> {
        let to = result.outcome.state();
        if !node.transition(from, to) {
            return None;
        }
        let result = result.with_attempts(node.attempts());
        self.runner.report(result);
        self.spawn_settle(Arc::clone(node), tasks, session);
        Some(to)
    }

    fn complete(
        &mut self,
        index: usize,
        verdict: Verdict,
        tasks: &mut JoinSet<TaskEvent>,
        session: &CancellationToken,
    ) {
        if let Some(lease) = self.leases.remove(&index) {
            self.tracker.release(lease);
        }
        let node = Arc::clone(&self.nodes[index]);
        let test = &node.descriptor;

        match verdict {
            Verdict::Retry if !session.is_cancelled() => {
                debug!("Re-admitting {} after attempt {}", test.id, node.attempts());
                node.transition(NodeState::Running, NodeState::Pending);
            }
            Verdict::Retry => {
                let result = TestResult::cancelled(
                    &test.id,
                    &test.class,
                    &test.assembly,
                    EngineError::cancelled("session cancelled before retry"),
                );
                self.finish_running(&node, result, tasks, session);
            }
            Verdict::Finished(result) => {
                let failed = result.outcome == TestOutcome::Failed;
                self.finish_running(&node, result, tasks, session);
                if failed && self.fail_fast && !session.is_cancelled() {
                    warn!("Fail-fast: cancelling session after {} failed", test.id);
                    session.cancel();
                }
            }
        }
    }

    fn finish_running(
        &self,
        node: &Arc<ExecutionNode>,
        result: TestResult,
        tasks: &mut JoinSet<TaskEvent>,
        session: &CancellationToken,
    ) {
        if !node.transition(NodeState::Running, result.outcome.state()) {
            warn!("Node {} left Running unexpectedly", node.id());
            return;
        }
        let result = result
            .with_attempts(node.attempts())
            .with_timing(node.started_at(), node.ended_at());
        self.runner.report(result);
        self.spawn_settle(Arc::clone(node), tasks, session);
    }

    /// Cancel every node that has not started; running nodes observe the token
    fn cancel_unstarted(&mut self, tasks: &mut JoinSet<TaskEvent>, session: &CancellationToken) {
        info!("Session cancelled; cancelling unstarted tests");
        for node in self.nodes.clone() {
            let state = node.state();
            if matches!(
                state,
                NodeState::Pending | NodeState::Blocked | NodeState::Runnable
            ) {
                let test = &node.descriptor;
                let result = TestResult::cancelled(
                    &test.id,
                    &test.class,
                    &test.assembly,
                    EngineError::cancelled("session cancelled before start"),
                );
                self.finish_unstarted(&node, state, result, tasks, session);
            }
        }
    }

    /// Force-cancel nodes that did not wind down within the grace period
    fn abandon_remaining(&mut self) {
        for node in &self.nodes {
            let state = node.state();
            if state.is_terminal() {
                continue;
            }
            let test = &node.descriptor;
            if node.transition(state, NodeState::Cancelled) {
                let result = TestResult::cancelled(
                    &test.id,
                    &test.class,
                    &test.assembly,
                    EngineError::cancelled("abandoned after cancellation grace period"),
                )
                .with_attempts(node.attempts())
                .with_timing(node.started_at(), node.ended_at());
                self.runner.report(result);
            }
        }
        self.leases.clear();
    }

    fn spawn_attempt(
        &self,
        node: Arc<ExecutionNode>,
        tasks: &mut JoinSet<TaskEvent>,
        session: &CancellationToken,
    ) {
        let index = node.index;
        let test = Arc::clone(&node.descriptor);
        debug!("Admitted {} ({} in flight)", test.id, self.tracker.in_flight());

        // The attempt runs on its own task so a panicking runner still yields
        // a verdict for this node
        let attempt = tokio::spawn(self.runner.run(node, session.clone()));
        tasks.spawn(async move {
            let verdict = match attempt.await {
                Ok(verdict) => verdict,
                Err(e) => {
                    let captured = CapturedError::from_join_error(e);
                    error!("Runner for {} crashed: {}", test.id, captured);
                    Verdict::Finished(TestResult::failed(
                        &test.id,
                        &test.class,
                        &test.assembly,
                        EngineError::TestBodyFailure {
                            message: captured.message,
                            detail: captured.detail,
                        },
                    ))
                }
            };
            TaskEvent::Attempted { index, verdict }
        });
    }

    fn spawn_settle(
        &self,
        node: Arc<ExecutionNode>,
        tasks: &mut JoinSet<TaskEvent>,
        session: &CancellationToken,
    ) {
        let settle = self.runner.settle(node, session.clone());
        tasks.spawn(async move {
            settle.await;
            TaskEvent::Settled
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

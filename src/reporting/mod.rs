//! Reporting boundary
//!
//! The engine emits one [`ReportEvent::TestFinished`] per terminal node
//! transition and one [`ReportEvent::Scope`] per hook scope transition.
//! Report writers live outside the engine and plug in as an [`EventSink`].

mod summary;

pub use summary::RunSummary;

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::hooks::{HookPhase, HookScopeKind};
use crate::models::{TestOutcome, TestResult};
use crate::utils::lock;

/// A hook scope ran its before or after phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScopeEvent {
    pub scope: HookScopeKind,
    pub identity: String,
    pub phase: HookPhase,
    pub error: Option<EngineError>,
}

impl ScopeEvent {
    pub fn new(
        scope: HookScopeKind,
        identity: impl Into<String>,
        phase: HookPhase,
        error: Option<EngineError>,
    ) -> Self {
        Self {
            scope,
            identity: identity.into(),
            phase,
            error,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReportEvent {
    TestFinished(TestResult),
    Scope(ScopeEvent),
    Retrying {
        test_id: String,
        attempt: u32,
        error: EngineError,
    },
}

/// Receives engine events; must not block
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ReportEvent);
}

/// Logs every event through `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ReportEvent) {
        match event {
            ReportEvent::TestFinished(result) => match result.outcome {
                TestOutcome::Passed => info!("{}", result),
                TestOutcome::Failed => error!("{}", result),
                TestOutcome::Skipped | TestOutcome::Cancelled => warn!("{}", result),
            },
            ReportEvent::Scope(scope) => match &scope.error {
                None => debug!(
                    "{} {} hooks for {} done",
                    scope.scope, scope.phase, scope.identity
                ),
                Some(e) => error!(
                    "{} {} hooks for {} failed: {}",
                    scope.scope, scope.phase, scope.identity, e
                ),
            },
            ReportEvent::Retrying {
                test_id,
                attempt,
                error,
            } => warn!("Retrying {} after attempt {}: {}", test_id, attempt, error),
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ReportEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReportEvent> {
        lock(&self.events).clone()
    }

    pub fn results(&self) -> Vec<TestResult> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                ReportEvent::TestFinished(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn scope_events(&self) -> Vec<ScopeEvent> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                ReportEvent::Scope(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: ReportEvent) {
        lock(&self.events).push(event);
    }
}

/// Forwards events to an unbounded channel
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ReportEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ReportEvent) {
        // A dropped receiver only means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

/// Fans every event out to several sinks
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for MultiSink {
    fn emit(&self, event: ReportEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

//! Engine error taxonomy
//!
//! Every terminal failure is captured as an [`EngineError`] and surfaced through
//! the reporting interface. Only graph construction and configuration errors
//! abort a run before any test starts.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::hooks::HookScopeKind;

/// Engine errors
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineError {
    #[error("Circular dependency: {}", cycle.join(" -> "))]
    CircularDependency { test: String, cycle: Vec<String> },

    #[error("Test {test} depends on unknown {target}")]
    DependencyNotFound { test: String, target: String },

    #[error("Duplicate test identifier: {test}")]
    DuplicateTest { test: String },

    #[error("Fixture cycle detected: {}", chain.join(" -> "))]
    FixtureCycleDetected { fixture: String, chain: Vec<String> },

    #[error("Fixture {fixture} failed to initialize: {source}")]
    FixtureInitializationFailed {
        fixture: String,
        source: Box<EngineError>,
    },

    #[error("Fixture type not registered: {fixture}")]
    FixtureNotFound { fixture: String },

    #[error("Fixture {fixture} failed: {message}")]
    FixtureFault { fixture: String, message: String },

    #[error("Fixture {fixture} failed to dispose: {message}")]
    FixtureDisposalFailed { fixture: String, message: String },

    #[error("{scope} hook '{hook}' failed for {identity}: {message}")]
    HookFailure {
        scope: HookScopeKind,
        identity: String,
        hook: String,
        message: String,
    },

    #[error("Timed out after {}ms", timeout.as_millis())]
    TimedOut { timeout: Duration, abandoned: bool },

    #[error("{message}")]
    TestBodyFailure {
        message: String,
        detail: Option<String>,
    },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl EngineError {
    /// Whether a failed attempt with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TimedOut { .. } | EngineError::TestBodyFailure { .. }
        )
    }

    /// Whether this error aborts the whole run rather than a single test
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            EngineError::DuplicateTest { .. } | EngineError::InvalidConfig { .. }
        )
    }

    /// Short machine-readable label
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::CircularDependency { .. } => "circular_dependency",
            EngineError::DependencyNotFound { .. } => "dependency_not_found",
            EngineError::DuplicateTest { .. } => "duplicate_test",
            EngineError::FixtureCycleDetected { .. } => "fixture_cycle_detected",
            EngineError::FixtureInitializationFailed { .. } => "fixture_initialization_failed",
            EngineError::FixtureNotFound { .. } => "fixture_not_found",
            EngineError::FixtureFault { .. } => "fixture_fault",
            EngineError::FixtureDisposalFailed { .. } => "fixture_disposal_failed",
            EngineError::HookFailure { .. } => "hook_failure",
            EngineError::TimedOut { .. } => "timed_out",
            EngineError::TestBodyFailure { .. } => "test_body_failure",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::InvalidConfig { .. } => "invalid_config",
        }
    }

    /// Innermost error of a wrapped fixture failure
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::FixtureInitializationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        EngineError::Cancelled {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

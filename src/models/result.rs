//! Terminal test results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::node::NodeState;
use crate::error::EngineError;

/// Terminal outcome of a test
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Cancelled,
}

impl TestOutcome {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "✓",
            TestOutcome::Failed => "✗",
            TestOutcome::Skipped => "○",
            TestOutcome::Cancelled => "⊘",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }

    /// The node state this outcome terminates in
    pub fn state(&self) -> NodeState {
        match self {
            TestOutcome::Passed => NodeState::Passed,
            TestOutcome::Failed => NodeState::Failed,
            TestOutcome::Skipped => NodeState::Skipped,
            TestOutcome::Cancelled => NodeState::Cancelled,
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Passed => write!(f, "PASS"),
            TestOutcome::Failed => write!(f, "FAIL"),
            TestOutcome::Skipped => write!(f, "SKIP"),
            TestOutcome::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Why a test was skipped
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Statically skipped by its descriptor
    Explicit { message: String },
    /// A required predecessor failed, was skipped or was cancelled
    DependencyFailed { dependency: String },
    /// A shared fixture faulted; the root cause is reported once elsewhere
    FixtureFailed { fixture: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Explicit { message } => write!(f, "{message}"),
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "skipped because dependency {dependency} did not pass")
            }
            SkipReason::FixtureFailed { fixture } => {
                write!(f, "skipped due to fixture failure: {fixture}")
            }
        }
    }
}

/// Result reported for every terminal node transition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub class: String,
    pub assembly: String,
    pub outcome: TestOutcome,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub attempts: u32,
    #[serde(skip_deserializing)]
    pub error: Option<EngineError>,
    pub skip_reason: Option<SkipReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TestResult {
    fn base(test_id: &str, class: &str, assembly: &str, outcome: TestOutcome) -> Self {
        Self {
            test_id: test_id.to_string(),
            class: class.to_string(),
            assembly: assembly.to_string(),
            outcome,
            duration: Duration::ZERO,
            attempts: 0,
            error: None,
            skip_reason: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn passed(test_id: &str, class: &str, assembly: &str) -> Self {
        Self::base(test_id, class, assembly, TestOutcome::Passed)
    }

    pub fn failed(test_id: &str, class: &str, assembly: &str, error: EngineError) -> Self {
        let mut result = Self::base(test_id, class, assembly, TestOutcome::Failed);
        result.error = Some(error);
        result
    }

    pub fn skipped(test_id: &str, class: &str, assembly: &str, reason: SkipReason) -> Self {
        let mut result = Self::base(test_id, class, assembly, TestOutcome::Skipped);
        result.skip_reason = Some(reason);
        result
    }

    pub fn cancelled(test_id: &str, class: &str, assembly: &str, error: EngineError) -> Self {
        let mut result = Self::base(test_id, class, assembly, TestOutcome::Cancelled);
        result.error = Some(error);
        result
    }

    pub fn with_error(mut self, error: EngineError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_timing(
        mut self,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.started_at = started_at;
        self.ended_at = ended_at;
        self.duration = match (started_at, ended_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        };
        self
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// Human-readable failure or skip message
    pub fn message(&self) -> Option<String> {
        match (&self.skip_reason, &self.error) {
            (Some(reason), _) => Some(reason.to_string()),
            (None, Some(error)) => Some(error.to_string()),
            (None, None) => None,
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}::{} [{}ms]",
            self.outcome.symbol(),
            self.class,
            self.test_id,
            self.duration_ms()
        )?;
        if self.attempts > 1 {
            write!(f, " ({} attempts)", self.attempts)?;
        }
        if let Some(msg) = self.message() {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

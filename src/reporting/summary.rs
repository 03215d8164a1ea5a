use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::ScopeEvent;
use crate::models::{duration_ms, TestOutcome, TestResult};

/// Outcome of one engine run
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub results: Vec<TestResult>,
    /// Hook and fixture-disposal failures not attributed to a single test
    pub scope_failures: Vec<ScopeEvent>,
}

impl RunSummary {
    pub fn new(results: Vec<TestResult>, scope_failures: Vec<ScopeEvent>, duration: Duration) -> Self {
        let count = |outcome: TestOutcome| results.iter().filter(|r| r.outcome == outcome).count();

        Self {
            total: results.len(),
            passed: count(TestOutcome::Passed),
            failed: count(TestOutcome::Failed),
            skipped: count(TestOutcome::Skipped),
            cancelled: count(TestOutcome::Cancelled),
            duration,
            results,
            scope_failures,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.passed as f64 / self.total as f64) * 100.0
        }
    }

    /// No test failed or was cancelled and every scope completed cleanly
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && self.scope_failures.is_empty()
    }

    pub fn result(&self, test_id: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.test_id == test_id)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for result in &self.results {
            writeln!(f, "  {result}")?;
        }
        for scope in &self.scope_failures {
            if let Some(error) = &scope.error {
                writeln!(
                    f,
                    "  ! {} {} {}: {}",
                    scope.scope, scope.identity, scope.phase, error
                )?;
            }
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Total: {} | Pass: {} | Fail: {} | Skip: {} | Cancelled: {}",
            self.total, self.passed, self.failed, self.skipped, self.cancelled
        )?;
        writeln!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms",
            self.pass_rate(),
            self.duration.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::models::SkipReason;

    #[test]
    fn test_summary_counts() {
        let results = vec![
            TestResult::passed("a", "C", "A"),
            TestResult::failed(
                "b",
                "C",
                "A",
                EngineError::TestBodyFailure {
                    message: "boom".into(),
                    detail: None,
                },
            ),
            TestResult::skipped(
                "c",
                "C",
                "A",
                SkipReason::DependencyFailed {
                    dependency: "b".into(),
                },
            ),
            TestResult::cancelled("d", "C", "A", EngineError::cancelled("abort")),
        ];
        let summary = RunSummary::new(results, Vec::new(), Duration::from_millis(120));

        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.pass_rate(), 25.0);
        assert!(!summary.is_success());
        assert!(summary.result("c").is_some());
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary::new(
            vec![TestResult::passed("a", "C", "A")],
            Vec::new(),
            Duration::from_millis(5),
        );
        let rendered = summary.to_string();
        assert!(rendered.contains("Total: 1 | Pass: 1"));
        assert!(rendered.contains("Pass Rate: 100.0%"));
    }
}

//! Output formatters for run results

use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use crate::models::{TestOutcome, TestResult};
use crate::reporting::{RunSummary, ScopeEvent};

/// Output format options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    JsonPretty,
    Summary,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Ok(OutputFormat::JsonPretty),
            "summary" => Ok(OutputFormat::Summary),
            other => Err(format!(
                "unknown output format '{other}' (expected table, json, json-pretty or summary)"
            )),
        }
    }
}

/// Renders results in one [`OutputFormat`]
#[derive(Clone, Debug)]
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    pub fn format_result(&self, result: &TestResult) -> String {
        match self.format {
            OutputFormat::Table => self.format_result_table(result),
            OutputFormat::Json => serde_json::to_string(result).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Summary => result.to_string(),
        }
    }

    fn outcome_label(&self, outcome: TestOutcome) -> String {
        let label = format!("{} {}", outcome.symbol(), outcome);
        if !self.colorize {
            return label;
        }
        let color = match outcome {
            TestOutcome::Passed => "32",
            TestOutcome::Failed => "31",
            TestOutcome::Skipped => "33",
            TestOutcome::Cancelled => "35",
        };
        format!("\x1b[{color}m{label}\x1b[0m")
    }

    fn format_result_table(&self, result: &TestResult) -> String {
        let mut line = format!(
            "{:<40} {:<12} [{:>6}ms]",
            format!("{}::{}", result.class, result.test_id),
            self.outcome_label(result.outcome),
            result.duration_ms()
        );
        if result.attempts > 1 {
            line.push_str(&format!(" x{}", result.attempts));
        }
        if let Some(message) = result.message() {
            line.push_str(&format!("  {message}"));
        }
        line
    }

    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json => serde_json::to_string(summary).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(summary).unwrap_or_default(),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str("║  Test Results                                                ║\n");
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        for result in &summary.results {
            output.push_str(&format!("  {}\n", self.format_result_table(result)));
        }

        if !summary.scope_failures.is_empty() {
            output.push_str("\n Scope Failures:\n");
            for event in &summary.scope_failures {
                output.push_str(&format!("   - {}\n", format_scope_failure(event)));
            }
        }

        let pass_str = if self.colorize {
            format!("\x1b[32m{}\x1b[0m", summary.passed)
        } else {
            summary.passed.to_string()
        };
        let fail_str = if self.colorize && summary.failed > 0 {
            format!("\x1b[31m{}\x1b[0m", summary.failed)
        } else {
            summary.failed.to_string()
        };

        output.push_str("────────────────────────────────────────────────────────────────\n");
        output.push_str(&format!(
            "  Total: {} | Pass: {} | Fail: {} | Skip: {} | Cancelled: {}\n",
            summary.total, pass_str, fail_str, summary.skipped, summary.cancelled
        ));
        output.push_str(&format!(
            "  Pass Rate: {:5.1}% | Duration: {}ms\n",
            summary.pass_rate(),
            summary.duration.as_millis()
        ));

        output
    }

    fn format_summary_brief(&self, summary: &RunSummary) -> String {
        format!(
            "{}/{} passed ({:.1}%), {} failed, {} skipped, {} cancelled, {} scope failures in {}ms",
            summary.passed,
            summary.total,
            summary.pass_rate(),
            summary.failed,
            summary.skipped,
            summary.cancelled,
            summary.scope_failures.len(),
            summary.duration.as_millis()
        )
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn format_scope_failure(event: &ScopeEvent) -> String {
    match &event.error {
        Some(error) => format!("{} {} {}: {}", event.scope, event.identity, event.phase, error),
        None => format!("{} {} {}", event.scope, event.identity, event.phase),
    }
}

/// Write a run summary to a file
pub fn write_summary_to_file(
    path: impl AsRef<Path>,
    summary: &RunSummary,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let formatter = ResultFormatter::new(format).no_color();
    let content = formatter.format_summary(summary);

    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::hooks::{HookPhase, HookScopeKind};
    use crate::models::SkipReason;
    use std::time::Duration;
    use tempfile::tempdir;

    fn summary() -> RunSummary {
        let results = vec![
            TestResult::passed("login", "AuthTests", "app").with_attempts(1),
            TestResult::failed(
                "logout",
                "AuthTests",
                "app",
                EngineError::TestBodyFailure {
                    message: "expected 200, got 500".into(),
                    detail: None,
                },
            )
            .with_attempts(3),
            TestResult::skipped(
                "profile",
                "AuthTests",
                "app",
                SkipReason::DependencyFailed {
                    dependency: "logout".into(),
                },
            ),
        ];
        let scope = ScopeEvent::new(
            HookScopeKind::Class,
            "AuthTests",
            HookPhase::After,
            Some(EngineError::FixtureDisposalFailed {
                fixture: "db".into(),
                message: "still in use".into(),
            }),
        );
        RunSummary::new(results, vec![scope], Duration::from_millis(42))
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("TABLE".parse::<OutputFormat>(), Ok(OutputFormat::Table));
        assert!("csv".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_table_lists_results_and_scope_failures() {
        let output = ResultFormatter::new(OutputFormat::Table)
            .no_color()
            .format_summary(&summary());

        assert!(output.contains("AuthTests::login"));
        assert!(output.contains("✗ FAIL"));
        assert!(output.contains("x3"));
        assert!(output.contains("did not pass"));
        assert!(output.contains("failed to dispose"));
        assert!(output.contains("Total: 3 | Pass: 1 | Fail: 1 | Skip: 1"));
    }

    #[test]
    fn test_json_summary_is_parseable() {
        let output = ResultFormatter::new(OutputFormat::Json).format_summary(&summary());
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["total"], 3);
        assert_eq!(value["results"][1]["error"]["kind"], "test_body_failure");
    }

    #[test]
    fn test_brief_summary() {
        let output = ResultFormatter::new(OutputFormat::Summary).format_summary(&summary());
        assert!(output.starts_with("1/3 passed"));
        assert!(output.contains("1 scope failures"));
    }

    #[test]
    fn test_write_summary_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.json");
        write_summary_to_file(&path, &summary(), OutputFormat::JsonPretty).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"passed\": 1"));
    }
}

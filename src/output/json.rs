use super::OutputFormat;
use crate::runner::churn::ChurnReport;
use crate::runner::{SweepOutcome, SweepResult, SweepSummary};
use serde::Serialize;

/// JSON output for machine consumption
pub struct JsonOutput {
    results: Vec<JsonResult>,
}

impl JsonOutput {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
        }
    }

    /// Drain the collected results into a report
    fn render_summary(&mut self, summary: &SweepSummary) -> serde_json::Result<String> {
        let report = JsonReport {
            results: std::mem::take(&mut self.results),
            summary: JsonSummary {
                seed: summary.seed,
                total: summary.total,
                passed: summary.passed,
                failed: summary.failed,
                halted: summary.halted,
                duration_ms: summary.duration.as_millis(),
            },
        };
        serde_json::to_string_pretty(&report)
    }
}

impl Default for JsonOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct JsonResult {
    name: String,
    configuration: String,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    reproduction: String,
    duration_ms: u128,
}

#[derive(Serialize)]
struct JsonSummary {
    seed: u64,
    total: usize,
    passed: usize,
    failed: usize,
    halted: bool,
    duration_ms: u128,
}

#[derive(Serialize)]
struct JsonReport {
    results: Vec<JsonResult>,
    summary: JsonSummary,
}

#[derive(Serialize)]
struct JsonChurnFailure {
    cycle: usize,
    actor: usize,
    phase: String,
    error: String,
}

#[derive(Serialize)]
struct JsonChurnReport {
    cycles_completed: usize,
    failures: Vec<JsonChurnFailure>,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error serializing JSON: {e}"),
    }
}

impl OutputFormat for JsonOutput {
    fn write_result(&mut self, result: &SweepResult) {
        let (outcome, reason) = match &result.outcome {
            SweepOutcome::Passed => ("passed", None),
            SweepOutcome::Failed { reason } => ("failed", Some(reason.clone())),
        };
        self.results.push(JsonResult {
            name: result.name.clone(),
            configuration: result.description.clone(),
            outcome,
            reason,
            reproduction: result.reproduction.clone(),
            duration_ms: result.duration.as_millis(),
        });
    }

    fn write_summary(&mut self, summary: &SweepSummary) {
        match self.render_summary(summary) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error serializing JSON: {e}"),
        }
    }

    fn write_churn(&mut self, report: &ChurnReport) {
        let failures = report
            .failures
            .iter()
            .map(|f| JsonChurnFailure {
                cycle: f.cycle,
                actor: f.actor,
                phase: format!("{:?}", f.phase).to_lowercase(),
                error: f.error.clone(),
            })
            .collect();
        print_json(&JsonChurnReport {
            cycles_completed: report.cycles_completed,
            failures,
        });
    }

    fn flush(&mut self) {
        // Everything is written at once by write_summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_report_contains_reproduction() {
        let mut output = JsonOutput::new();
        let result = SweepResult {
            name: "cf_abc".into(),
            description: "StandardTableConfiguration".into(),
            reproduction: "export CQL_CQLSH_TEST=\"x\"".into(),
            outcome: SweepOutcome::Failed {
                reason: "row 0 differs".into(),
            },
            duration: Duration::from_millis(12),
        };
        output.write_result(&result);

        let mut summary = SweepSummary {
            seed: 42,
            ..SweepSummary::default()
        };
        summary.add(result);
        let json = output.render_summary(&summary).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["summary"]["seed"], 42);
        assert_eq!(value["summary"]["failed"], 1);
        assert_eq!(value["results"][0]["outcome"], "failed");
        assert_eq!(value["results"][0]["reason"], "row 0 differs");
        assert_eq!(value["results"][0]["reproduction"], "export CQL_CQLSH_TEST=\"x\"");
        assert!(output.results.is_empty());
    }

    #[test]
    fn test_passed_result_has_no_reason() {
        let mut output = JsonOutput::new();
        output.write_result(&SweepResult {
            name: "cf".into(),
            description: String::new(),
            reproduction: String::new(),
            outcome: SweepOutcome::Passed,
            duration: Duration::ZERO,
        });
        let json = output.render_summary(&SweepSummary::default()).unwrap();
        assert!(!json.contains("\"reason\""));
    }
}

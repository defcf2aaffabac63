use super::{outcome_symbol, OutputFormat};
use crate::runner::churn::ChurnReport;
use crate::runner::{SweepOutcome, SweepResult, SweepSummary};
use colored::Colorize;
use std::io::{self, Write};

/// Human-readable output
pub struct PrettyOutput {
    /// Failed configurations, detailed after the run
    failures: Vec<SweepResult>,
}

impl PrettyOutput {
    pub fn new() -> Self {
        Self {
            failures: Vec::new(),
        }
    }

    fn outcome_colored(&self, outcome: &SweepOutcome) -> colored::ColoredString {
        let symbol = outcome_symbol(outcome);
        match outcome {
            SweepOutcome::Passed => symbol.green(),
            SweepOutcome::Failed { .. } => symbol.red(),
        }
    }
}

impl Default for PrettyOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputFormat for PrettyOutput {
    fn write_result(&mut self, result: &SweepResult) {
        let duration_str = format!("({:.2?})", result.duration);
        println!(
            "  [{}] {:<34} {}",
            self.outcome_colored(&result.outcome),
            result.name,
            duration_str.dimmed()
        );
        if !result.outcome.is_passed() {
            self.failures.push(result.clone());
        }
    }

    fn write_summary(&mut self, summary: &SweepSummary) {
        if !self.failures.is_empty() {
            println!();
            println!("{}", "Failures:".red().bold());
            println!();

            for result in &self.failures {
                println!("{}", format!("── {}", result.name).red());
                println!("   {}", result.description.dimmed());
                if let SweepOutcome::Failed { reason } = &result.outcome {
                    for line in reason.lines() {
                        println!("   {line}");
                    }
                }
                println!("   {}", result.reproduction.yellow());
                println!();
            }
        }

        println!("{}", "Summary:".bold());

        let mut parts = Vec::new();
        if summary.passed > 0 {
            parts.push(format!("{} passed", summary.passed).green().to_string());
        }
        if summary.failed > 0 {
            parts.push(format!("{} failed", summary.failed).red().to_string());
        }
        if parts.is_empty() {
            parts.push("no configurations run".to_string());
        }
        println!("  {}", parts.join(", "));
        println!("  {}", format!("Seed: {}", summary.seed).dimmed());
        println!(
            "  {}",
            format!("Total time: {:.2?}", summary.duration).dimmed()
        );

        println!();
        if summary.is_success() {
            println!("{}", "All configurations passed!".green().bold());
        } else if summary.halted {
            println!("{}", "Sweep halted at the first failure.".red().bold());
        } else {
            println!("{}", "Some configurations failed.".red().bold());
        }
    }

    fn write_churn(&mut self, report: &ChurnReport) {
        println!("{}", "Schema churn:".bold());
        println!(
            "  {}",
            format!("{} cycles completed", report.cycles_completed).green()
        );
        if report.failures.is_empty() {
            return;
        }
        println!(
            "  {}",
            format!("{} statements failed", report.failures.len()).yellow()
        );
        for failure in &report.failures {
            println!(
                "   cycle {} actor {} {:?}: {}",
                failure.cycle, failure.actor, failure.phase, failure.error
            );
        }
    }

    fn flush(&mut self) {
        let _ = io::stdout().flush();
    }
}

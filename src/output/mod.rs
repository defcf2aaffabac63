pub mod json;
pub mod pretty;

use crate::runner::churn::ChurnReport;
use crate::runner::{SweepOutcome, SweepResult, SweepSummary};

/// Output format trait
pub trait OutputFormat {
    /// Write the result of one configuration as soon as it is known
    fn write_result(&mut self, result: &SweepResult);

    /// Write the final sweep summary
    fn write_summary(&mut self, summary: &SweepSummary);

    /// Write the outcome of a schema churn run
    fn write_churn(&mut self, report: &ChurnReport);

    /// Flush any buffered output
    fn flush(&mut self);
}

/// Available output formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Format {
    Pretty,
    Json,
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Format::Pretty),
            "json" => Ok(Format::Json),
            _ => Err(format!("unknown output format: {s}")),
        }
    }
}

pub fn create_output(format: Format) -> Box<dyn OutputFormat> {
    match format {
        Format::Pretty => Box::new(pretty::PrettyOutput::new()),
        Format::Json => Box::new(json::JsonOutput::new()),
    }
}

pub fn outcome_symbol(outcome: &SweepOutcome) -> &'static str {
    match outcome {
        SweepOutcome::Passed => "PASS",
        SweepOutcome::Failed { .. } => "FAIL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_str() {
        assert_eq!("pretty".parse::<Format>().unwrap(), Format::Pretty);
        assert_eq!("JSON".parse::<Format>().unwrap(), Format::Json);
        assert!("xml".parse::<Format>().is_err());
    }

    #[test]
    fn test_outcome_symbol() {
        assert_eq!(outcome_symbol(&SweepOutcome::Passed), "PASS");
        let failed = SweepOutcome::Failed {
            reason: "mismatch".into(),
        };
        assert_eq!(outcome_symbol(&failed), "FAIL");
    }
}

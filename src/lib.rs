pub mod backends;
pub mod bridge;
pub mod cluster;
pub mod comparison;
pub mod config;
pub mod error;
pub mod generator;
pub mod output;
pub mod runner;

pub use backends::{BackendError, InteractiveShell, SessionFactory, StructuredRows, StructuredSession};
pub use bridge::{DualBridge, RetryPolicy};
pub use cluster::{CcmCluster, ClusterController};
pub use comparison::{verify_results, ComparisonResult};
pub use config::{all_configurations, ConfigKind, Configuration};
pub use error::{Error, Result};
pub use output::{create_output, Format, OutputFormat};
pub use runner::churn::{run_churn, ChurnConfig, ChurnReport};
pub use runner::{
    ConfigurationRunner, FailurePolicy, RunState, SweepConfig, SweepOutcome, SweepResult,
    SweepRunner, SweepSummary,
};

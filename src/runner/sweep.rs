//! The configuration sweep: enumerate, shuffle, run each configuration and
//! keep the reproduction logs current.

use super::ConfigurationRunner;
use crate::bridge::DualBridge;
use crate::config::{all_configurations, token, ConfigKind, Configuration};
use crate::error::{Error, Result};
use crate::generator::IdentifierMemo;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Log written after every configuration that passes
pub const SUCCEEDED_LOG: &str = "last_succeeded_cql.log";
/// Log written when a configuration fails
pub const FAILED_LOG: &str = "last_failed_cql.log";
/// Transcript of the interactive shell
pub const SHELL_TRANSCRIPT: &str = "cqlsh_output.log";

/// What the sweep does after a configuration fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop at the first failure
    #[default]
    Halt,
    /// Record the failure and keep going
    Continue,
}

/// Sweep configuration
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Most configurations run per sweep, a forced replay included
    pub max_configurations: usize,
    /// Seed for the shuffle
    pub seed: u64,
    /// Table kinds to enumerate
    pub table_kinds: Vec<ConfigKind>,
    /// Directory receiving the reproduction logs
    pub log_dir: PathBuf,
    /// Escaped token of a configuration to run first
    pub replay_token: Option<String>,
    pub failure_policy: FailurePolicy,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            max_configurations: 40,
            seed: rand::random(),
            table_kinds: vec![ConfigKind::StandardTable],
            log_dir: PathBuf::from("."),
            replay_token: None,
            failure_policy: FailurePolicy::Halt,
        }
    }
}

impl SweepConfig {
    pub fn with_max_configurations(mut self, max: usize) -> Self {
        self.max_configurations = max;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_table_kinds(mut self, kinds: Vec<ConfigKind>) -> Self {
        self.table_kinds = kinds;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_replay_token(mut self, token: Option<String>) -> Self {
        self.replay_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Outcome of one configuration
#[derive(Debug, Clone)]
pub enum SweepOutcome {
    Passed,
    Failed { reason: String },
}

impl SweepOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, SweepOutcome::Passed)
    }
}

/// Result of running one configuration
#[derive(Debug, Clone)]
pub struct SweepResult {
    /// Table name on the server
    pub name: String,
    /// Kind and parameters
    pub description: String,
    /// Command that forces this configuration to run first
    pub reproduction: String,
    pub outcome: SweepOutcome,
    pub duration: Duration,
}

/// Aggregated results of a sweep
#[derive(Debug, Default)]
pub struct SweepSummary {
    pub seed: u64,
    pub results: Vec<SweepResult>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Whether the sweep stopped before running every selected configuration
    pub halted: bool,
    pub duration: Duration,
}

impl SweepSummary {
    pub fn add(&mut self, result: SweepResult) {
        self.total += 1;
        match result.outcome {
            SweepOutcome::Passed => self.passed += 1,
            SweepOutcome::Failed { .. } => self.failed += 1,
        }
        self.results.push(result);
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// The first failed result, if any
    pub fn first_failure(&self) -> Option<&SweepResult> {
        self.results.iter().find(|r| !r.outcome.is_passed())
    }
}

/// Decode a forced replay and make sure it could have been enumerated
pub fn load_replay(escaped: &str) -> Result<Configuration> {
    let config = token::decode(escaped)?;
    if !config.is_valid() {
        return Err(Error::InvalidConfiguration(config.kind().classname()));
    }
    Ok(config)
}

/// The configurations a sweep runs, in order
pub fn plan(config: &SweepConfig) -> Result<Vec<Configuration>> {
    let mut configurations = all_configurations(&config.table_kinds)?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    configurations.shuffle(&mut rng);

    if let Some(escaped) = &config.replay_token {
        match load_replay(escaped) {
            Ok(forced) => {
                tracing::info!(config = %forced, "running forced replay first");
                configurations.insert(0, forced);
            }
            Err(Error::InvalidConfiguration(kind)) => {
                tracing::warn!(
                    kind,
                    "the forced replay is not a valid configuration; clear it with: export {}=",
                    token::REPLAY_ENV_VAR
                );
            }
            Err(e) => return Err(e),
        }
    }

    configurations.truncate(config.max_configurations);
    Ok(configurations)
}

async fn write_log(path: &Path, reproduction: &str, config: &Configuration) -> Result<()> {
    let contents = format!("{reproduction}\n\n{}", config.log_string());
    tokio::fs::write(path, contents).await?;
    Ok(())
}

/// Runs planned configurations one at a time over a single bridge
pub struct SweepRunner {
    config: SweepConfig,
    bridge: DualBridge,
    memo: IdentifierMemo,
}

impl SweepRunner {
    pub fn new(config: SweepConfig, bridge: DualBridge) -> Self {
        Self {
            config,
            bridge,
            memo: IdentifierMemo::new(),
        }
    }

    pub fn succeeded_log(&self) -> PathBuf {
        self.config.log_dir.join(SUCCEEDED_LOG)
    }

    pub fn failed_log(&self) -> PathBuf {
        self.config.log_dir.join(FAILED_LOG)
    }

    pub async fn run(&mut self) -> Result<SweepSummary> {
        self.run_with(|_| {}).await
    }

    /// Run the sweep, reporting each result as soon as it is known
    pub async fn run_with<F>(&mut self, mut on_result: F) -> Result<SweepSummary>
    where
        F: FnMut(&SweepResult),
    {
        let start = Instant::now();
        let planned = plan(&self.config)?;
        tracing::info!(
            seed = self.config.seed,
            count = planned.len(),
            "starting configuration sweep"
        );

        let mut summary = SweepSummary {
            seed: self.config.seed,
            ..SweepSummary::default()
        };
        let count = planned.len();
        for (index, config) in planned.into_iter().enumerate() {
            let result = self.run_one(config).await?;
            let failed = !result.outcome.is_passed();
            on_result(&result);
            summary.add(result);
            if failed && self.config.failure_policy == FailurePolicy::Halt {
                summary.halted = index + 1 < count;
                break;
            }
        }

        summary.duration = start.elapsed();
        Ok(summary)
    }

    /// Close the structured session
    pub async fn close(self) -> Result<()> {
        self.bridge.close().await
    }

    /// Run one configuration and persist its log. Only I/O on the log files
    /// is returned as an error; statement failures become the outcome.
    async fn run_one(&mut self, config: Configuration) -> Result<SweepResult> {
        let reproduction = token::replay_instruction(&config)?;
        let name = config.object_name();
        let description = config.to_string();
        tracing::info!("{reproduction}");

        let start = Instant::now();
        let mut runner = ConfigurationRunner::new(config, &mut self.bridge, &self.memo);
        let run = runner.run_everything().await;
        let state = runner.state();
        let mut config = runner.into_config();
        let duration = start.elapsed();

        let outcome = match run {
            Ok(()) => {
                write_log(&self.succeeded_log(), &reproduction, &config).await?;
                config.clear_log();
                tracing::info!(table = %name, ?duration, "configuration passed");
                SweepOutcome::Passed
            }
            Err(e) => {
                write_log(&self.failed_log(), &reproduction, &config).await?;
                tracing::error!(table = %name, %state, error = %e, "configuration failed");
                SweepOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        Ok(SweepResult {
            name,
            description,
            reproduction,
            outcome,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_is_bounded_and_deterministic() {
        let config = SweepConfig::default().with_seed(7).with_max_configurations(10);
        let a: Vec<String> = plan(&config).unwrap().iter().map(|c| c.object_name()).collect();
        let b: Vec<String> = plan(&config).unwrap().iter().map(|c| c.object_name()).collect();
        assert_eq!(a.len(), 10);
        assert_eq!(a, b);

        let other = plan(&config.clone().with_seed(8)).unwrap();
        let c: Vec<String> = other.iter().map(|c| c.object_name()).collect();
        assert_ne!(a, c);
    }

    #[test]
    fn test_forced_replay_runs_first() {
        let everything = plan(&SweepConfig::default().with_seed(1).with_max_configurations(usize::MAX)).unwrap();
        let target = everything.last().unwrap();
        let escaped = token::encode(target).unwrap();

        let config = SweepConfig::default()
            .with_seed(1)
            .with_max_configurations(3)
            .with_replay_token(Some(escaped));
        let planned = plan(&config).unwrap();
        assert_eq!(planned.len(), 3);
        assert_eq!(planned[0].object_name(), target.object_name());
    }

    #[test]
    fn test_invalid_forced_replay_is_skipped() {
        let keyspace = Configuration::keyspace(
            ConfigKind::Keyspace.parameter_permutations().remove(0),
        )
        .unwrap();
        let invalid = ConfigKind::StandardTable
            .parameter_permutations()
            .into_iter()
            .find(|p| !ConfigKind::StandardTable.is_valid(p))
            .unwrap();
        let invalid = Configuration::table(ConfigKind::StandardTable, keyspace, invalid).unwrap();
        let escaped = token::encode(&invalid).unwrap();

        assert!(matches!(load_replay(&escaped), Err(Error::InvalidConfiguration(_))));
        let config = SweepConfig::default()
            .with_seed(1)
            .with_max_configurations(usize::MAX)
            .with_replay_token(Some(escaped));
        let planned = plan(&config).unwrap();
        assert!(planned.iter().all(Configuration::is_valid));
    }

    #[test]
    fn test_undecodable_replay_is_an_error() {
        let config = SweepConfig::default().with_replay_token(Some("%7Bnot json".into()));
        assert!(matches!(plan(&config), Err(Error::Token(_))));
    }

    #[test]
    fn test_blank_replay_is_ignored() {
        let config = SweepConfig::default().with_replay_token(Some("  ".into()));
        assert!(config.replay_token.is_none());
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = SweepSummary::default();
        let result = |outcome| SweepResult {
            name: "cf".into(),
            description: String::new(),
            reproduction: String::new(),
            outcome,
            duration: Duration::ZERO,
        };
        summary.add(result(SweepOutcome::Passed));
        summary.add(result(SweepOutcome::Failed {
            reason: "boom".into(),
        }));
        assert_eq!((summary.total, summary.passed, summary.failed), (2, 1, 1));
        assert!(!summary.is_success());
        assert_eq!(summary.first_failure().unwrap().name, "cf");
    }
}

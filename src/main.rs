use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use cql_crosscheck::backends::native::{Consistency, NativeConnector};
use cql_crosscheck::backends::shell::ShellBackend;
use cql_crosscheck::backends::thrift::ThriftConnector;
use cql_crosscheck::cluster::{NATIVE_PORT, THRIFT_PORT};
use cql_crosscheck::config::token::{self, REPLAY_ENV_VAR};
use cql_crosscheck::runner::sweep::{load_replay, SHELL_TRANSCRIPT};
use cql_crosscheck::{
    all_configurations, create_output, run_churn, CcmCluster, ChurnConfig, ClusterController,
    ConfigKind, DualBridge, FailurePolicy, Format, OutputFormat, RetryPolicy, SessionFactory,
    SweepConfig, SweepRunner,
};
use owo_colors::OwoColorize;
use std::io::{stdin, IsTerminal};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cql-crosscheck")]
#[command(about = "Cross-checks a CQL cluster through its Thrift interface and its interactive shell")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ClusterArgs {
    /// Create and start a ccm cluster with this name first
    #[arg(long)]
    ccm_cluster: Option<String>,

    /// Path to the ccm binary
    #[arg(long, default_value = "ccm")]
    ccm_binary: PathBuf,

    /// Number of nodes in the ccm cluster
    #[arg(long, default_value_t = 1)]
    ccm_nodes: usize,

    /// Stop the ccm cluster when done
    #[arg(long)]
    ccm_stop: bool,

    /// Database version ccm installs
    #[arg(long)]
    db_version: Option<String>,

    /// Local database build; its bin/cqlsh is used as the shell
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Node addresses, used when no ccm cluster is managed
    #[arg(long = "node", default_value = "127.0.0.1")]
    nodes: Vec<IpAddr>,

    /// Thrift port, used by the sweep and the interactive shell
    #[arg(long, default_value_t = THRIFT_PORT)]
    thrift_port: u16,

    /// Native protocol port, used by the schema churn
    #[arg(long, default_value_t = NATIVE_PORT)]
    native_port: u16,

    /// CQL version announced to the server
    #[arg(long, env = "CQL_VERSION")]
    cql_version: Option<String>,

    /// Timeout per request in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configuration sweep
    Run {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Interactive shell binary (default: <install-dir>/bin/cqlsh)
        #[arg(long)]
        cqlsh: Option<PathBuf>,

        /// Reproduction token of a configuration to run first
        #[arg(long, env = "CQL_CQLSH_TEST")]
        replay: Option<String>,

        /// Most configurations to run
        #[arg(short, long, default_value_t = 40)]
        max: usize,

        /// Shuffle seed (random when omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Table kinds to enumerate (standard, counter)
        #[arg(long, value_delimiter = ',', default_value = "standard")]
        kinds: Vec<ConfigKind>,

        /// Directory for the reproduction logs and shell transcript
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,

        /// Keep going after a failed configuration
        #[arg(long)]
        keep_going: bool,

        /// Attempts per statement on each transport
        #[arg(long, default_value_t = 10)]
        attempts: usize,

        /// Output format (pretty, json)
        #[arg(short, long, default_value = "pretty")]
        output: String,
    },

    /// Create and drop tables concurrently and check that nodes agree
    Churn {
        #[command(flatten)]
        cluster: ClusterArgs,

        #[arg(long, default_value = "ks")]
        keyspace: String,

        /// Concurrent actors, one table each
        #[arg(long, default_value_t = 6)]
        tables: usize,

        #[arg(long, default_value_t = 5)]
        cycles: usize,

        #[arg(long, default_value_t = 3)]
        replication_factor: usize,

        /// Consistency level of every churn statement
        #[arg(long, default_value = "one")]
        consistency: Consistency,

        /// Milliseconds to wait before counting tables
        #[arg(long, default_value_t = 1000)]
        settle_ms: u64,

        /// Output format (pretty, json)
        #[arg(short, long, default_value = "pretty")]
        output: String,
    },

    /// List the configurations a sweep can run
    List {
        #[arg(long, value_delimiter = ',', default_value = "standard")]
        kinds: Vec<ConfigKind>,

        /// Print each configuration's reproduction token
        #[arg(long)]
        tokens: bool,
    },

    /// Decode a reproduction token and check that it is runnable
    Check {
        #[arg(env = "CQL_CQLSH_TEST")]
        token: String,
    },
}

fn init_logging() {
    let mut subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        );

    if !stdin().is_terminal() {
        subscriber = subscriber.with_ansi(false)
    }
    subscriber.init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            cluster,
            cqlsh,
            replay,
            max,
            seed,
            kinds,
            log_dir,
            keep_going,
            attempts,
            output,
        } => {
            let policy = if keep_going {
                FailurePolicy::Continue
            } else {
                FailurePolicy::Halt
            };
            let mut config = SweepConfig::default()
                .with_max_configurations(max)
                .with_table_kinds(kinds)
                .with_log_dir(log_dir)
                .with_replay_token(replay)
                .with_failure_policy(policy);
            if let Some(seed) = seed {
                config = config.with_seed(seed);
            }
            let retry = RetryPolicy::default().with_attempts(attempts);
            run_sweep(cluster, cqlsh, config, retry, output).await
        }
        Commands::Churn {
            cluster,
            keyspace,
            tables,
            cycles,
            replication_factor,
            consistency,
            settle_ms,
            output,
        } => {
            let config = ChurnConfig {
                keyspace,
                ..ChurnConfig::default()
            }
            .with_tables(tables)
            .with_cycles(cycles)
            .with_replication_factor(replication_factor)
            .with_settle(Duration::from_millis(settle_ms));
            churn(cluster, config, consistency, output).await
        }
        Commands::List { kinds, tokens } => list_configurations(&kinds, tokens),
        Commands::Check { token } => check_token(&token),
    }
}

fn parse_format(output: &str) -> Result<Format, ExitCode> {
    output.parse().map_err(|e| {
        eprintln!("{}: {e}", "Error".red().bold());
        ExitCode::from(2)
    })
}

fn report_error(context: &str, error: &anyhow::Error) -> ExitCode {
    eprintln!("{} {context}: {error:#}", "Error".red().bold());
    ExitCode::from(1)
}

/// Bring up the managed cluster, if any, and return the node hosts
async fn prepare_cluster(args: &ClusterArgs) -> anyhow::Result<(Vec<IpAddr>, Option<CcmCluster>)> {
    let Some(name) = &args.ccm_cluster else {
        return Ok((args.nodes.clone(), None));
    };

    let mut cluster = CcmCluster::new(name.clone()).with_binary(&args.ccm_binary);
    if let Some(version) = &args.db_version {
        cluster = cluster.with_version(version.clone());
    }
    if let Some(dir) = &args.install_dir {
        cluster = cluster.with_install_dir(dir.clone());
    }
    cluster
        .populate(args.ccm_nodes)
        .await
        .with_context(|| format!("creating cluster {name}"))?;
    cluster.start().await.context("starting cluster")?;

    let hosts = cluster.nodes().into_iter().map(|n| n.host).collect();
    Ok((hosts, Some(cluster)))
}

async fn teardown(args: &ClusterArgs, cluster: Option<CcmCluster>) {
    if let (true, Some(mut cluster)) = (args.ccm_stop, cluster) {
        if let Err(e) = cluster.stop().await {
            tracing::warn!(error = %e, "failed to stop cluster");
        }
    }
}

fn with_port(hosts: &[IpAddr], port: u16) -> Vec<SocketAddr> {
    hosts.iter().map(|host| SocketAddr::new(*host, port)).collect()
}

async fn open_bridge(
    args: &ClusterArgs,
    hosts: &[IpAddr],
    cqlsh: Option<PathBuf>,
    log_dir: &std::path::Path,
    retry: RetryPolicy,
) -> anyhow::Result<DualBridge> {
    let addresses = with_port(hosts, args.thrift_port);
    let first = *addresses.first().context("no node addresses")?;
    let session = ThriftConnector::new(addresses)
        .with_cql_version(args.cql_version.clone())
        .with_timeout(Duration::from_secs(args.timeout))
        .connect(0)
        .await
        .with_context(|| format!("connecting to {first}"))?;
    let bridge = DualBridge::new(session).with_retry(retry);

    let shell_binary = cqlsh.or_else(|| {
        args.install_dir
            .as_ref()
            .map(|dir| dir.join("bin").join("cqlsh"))
    });
    let Some(binary) = shell_binary else {
        tracing::info!("no interactive shell configured, checking the structured transport only");
        return Ok(bridge);
    };

    let process = ShellBackend::cqlsh(&binary, first)
        .with_cql_version(args.cql_version.as_deref())
        .with_transcript(log_dir.join(SHELL_TRANSCRIPT))
        .spawn()
        .with_context(|| format!("spawning {}", binary.display()))?;
    let bridge = bridge
        .with_shell(Box::new(process))
        .await
        .context("waiting for the shell prompt")?;
    Ok(bridge)
}

async fn run_sweep(
    args: ClusterArgs,
    cqlsh: Option<PathBuf>,
    config: SweepConfig,
    retry: RetryPolicy,
    output_format: String,
) -> ExitCode {
    let format = match parse_format(&output_format) {
        Ok(f) => f,
        Err(code) => return code,
    };
    if let Err(e) = tokio::fs::create_dir_all(&config.log_dir).await {
        return report_error("creating log directory", &e.into());
    }

    let (hosts, cluster) = match prepare_cluster(&args).await {
        Ok(prepared) => prepared,
        Err(e) => return report_error("preparing cluster", &e),
    };
    let bridge = match open_bridge(&args, &hosts, cqlsh, &config.log_dir, retry).await {
        Ok(bridge) => bridge,
        Err(e) => {
            teardown(&args, cluster).await;
            return report_error("opening sessions", &e);
        }
    };

    let mut output: Box<dyn OutputFormat> = create_output(format);
    let mut runner = SweepRunner::new(config, bridge);
    let summary = runner
        .run_with(|result| {
            output.write_result(result);
            output.flush();
        })
        .await;
    if let Err(e) = runner.close().await {
        tracing::warn!(error = %e, "failed to close session");
    }
    teardown(&args, cluster).await;

    let summary = match summary {
        Ok(summary) => summary,
        Err(e) => return report_error("running sweep", &e.into()),
    };
    output.write_summary(&summary);
    output.flush();

    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

async fn churn(
    args: ClusterArgs,
    config: ChurnConfig,
    consistency: Consistency,
    output_format: String,
) -> ExitCode {
    let format = match parse_format(&output_format) {
        Ok(f) => f,
        Err(code) => return code,
    };
    let (hosts, cluster) = match prepare_cluster(&args).await {
        Ok(prepared) => prepared,
        Err(e) => return report_error("preparing cluster", &e),
    };

    let connector = NativeConnector::new(with_port(&hosts, args.native_port))
        .with_cql_version(args.cql_version.clone())
        .with_consistency(consistency)
        .with_timeout(Duration::from_secs(args.timeout));
    let factory: Arc<dyn SessionFactory> = Arc::new(connector);
    let result = run_churn(factory, &config).await;
    teardown(&args, cluster).await;

    match result {
        Ok(report) => {
            let mut output = create_output(format);
            output.write_churn(&report);
            output.flush();
            ExitCode::SUCCESS
        }
        Err(e) => report_error("schema churn", &e.into()),
    }
}

fn list_configurations(kinds: &[ConfigKind], tokens: bool) -> ExitCode {
    let configurations = match all_configurations(kinds) {
        Ok(configurations) => configurations,
        Err(e) => return report_error("enumerating configurations", &e.into()),
    };
    for config in &configurations {
        println!("{}  {config}", config.object_name());
        if tokens {
            match token::encode(config) {
                Ok(escaped) => println!("    {escaped}"),
                Err(e) => return report_error("encoding token", &e.into()),
            }
        }
    }
    println!("{} configurations", configurations.len());
    ExitCode::SUCCESS
}

fn check_token(escaped: &str) -> ExitCode {
    match load_replay(escaped) {
        Ok(config) => {
            println!("{} - OK", config.object_name());
            println!("  {config}");
            if let Some(keyspace) = config.keyspace_config() {
                println!("  keyspace {}: {keyspace}", keyspace.object_name());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {e}", "ERROR".red().bold());
            eprintln!("clear it with: export {REPLAY_ENV_VAR}=");
            ExitCode::from(1)
        }
    }
}

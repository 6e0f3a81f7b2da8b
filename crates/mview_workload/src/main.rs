//! Workload driver for the materialized-view convergence harness.
//!
//! Issues concurrent CRUD traffic against a primary table, then polls the
//! derived view until its counts match or the retry budget is spent. Results
//! are logged and can be written as a JSON report.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use mview_harness::report::write_json;
use mview_harness::store::{parse_hosts, Dialect, MemoryStoreOptions};
use mview_harness::{schema, Backend, Backoff, Harness, HarnessConfig, RetryPolicy, SessionConfig};
use tracing_subscriber::EnvFilter;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "mview-workload")]
struct Args {
    /// Enable debug logging (per-record read-back lines).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Batches of CRUD tasks followed by a view convergence check.
    Run(RunArgs),
    /// Flat CRUD load without per-batch verification.
    Load(RunArgs),
    /// Random range reads against the view.
    Select(SelectArgs),
    /// Print DDL and statement texts.
    Schema(SchemaArgs),
}

/// Connection options shared by every store-backed subcommand.
#[derive(ClapArgs, Debug, Clone)]
struct StoreArgs {
    /// Comma-separated hosts, e.g. `10.0.0.1,10.0.0.2`.
    #[arg(long, default_value = "localhost")]
    hosts: String,

    #[arg(long, default_value_t = 5432)]
    port: u16,

    /// Keyspace (database name on PostgreSQL).
    #[arg(long, default_value = "test")]
    keyspace: String,

    #[arg(long, default_value = "postgres")]
    user: String,

    #[arg(long, env = "MVIEW_PASSWORD")]
    password: Option<String>,

    #[arg(long, value_enum, default_value_t = BackendArg::Postgres)]
    backend: BackendArg,

    /// Pooled sessions opened at startup.
    #[arg(long, default_value_t = 50)]
    connections: usize,

    /// Upper bound for one store call.
    #[arg(long, default_value = "60s")]
    op_timeout: humantime::Duration,

    /// View propagation delay of the memory backend.
    #[arg(long, default_value = "5ms")]
    memory_view_lag: humantime::Duration,

    /// Artificial latency added to every memory backend call.
    #[arg(long, default_value = "0s")]
    memory_call_latency: humantime::Duration,

    /// Percent of memory backend calls that fail.
    #[arg(long, default_value_t = 0)]
    memory_fault_pct: u8,
}

/// Workload options for `run` and `load`.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Total CRUD tasks.
    #[arg(long, default_value_t = 1000)]
    requests: u64,

    /// Tasks per batch (run mode).
    #[arg(long, default_value_t = 1000)]
    insert_count: u64,

    /// Maximum concurrently running tasks.
    #[arg(long, default_value_t = 20)]
    parallel: usize,

    /// Stop every task after its first insert.
    #[arg(long)]
    insert_only: bool,

    /// Count the whole primary table at the end.
    #[arg(long)]
    count: bool,

    /// Size of the random group key space (`user0..userN`).
    #[arg(long, default_value_t = 10_000)]
    group_keys: u32,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// View count re-queries per batch.
    #[arg(long, default_value_t = 100)]
    verify_retries: u32,

    /// Delay between view re-queries: `none`, `fixed:<dur>` or `exp:<initial>..<max>`.
    #[arg(long, default_value = "none", value_parser = parse_backoff)]
    verify_backoff: Backoff,

    /// Compare each task's view row after its update.
    #[arg(long)]
    view_check: bool,

    /// Re-reads allowed for the per-task view row comparison.
    #[arg(long, default_value_t = 10)]
    view_check_retries: u32,

    /// Write the JSON report to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
struct SelectArgs {
    #[command(flatten)]
    store: StoreArgs,

    #[arg(long, default_value_t = 10_000)]
    iterations: u64,

    /// Rows per range read.
    #[arg(long, default_value_t = 100)]
    limit: i64,

    #[arg(long, default_value_t = 10_000)]
    group_keys: u32,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
struct SchemaArgs {
    #[arg(long, value_enum, default_value_t = DialectArg::Cql)]
    dialect: DialectArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum BackendArg {
    Postgres,
    Memory,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum DialectArg {
    Cql,
    Postgres,
}

#[tokio::main]
/// Parse CLI args and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug {
        "mview_harness=debug,mview_workload=debug,warn"
    } else {
        "mview_harness=info,mview_workload=info,warn"
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match args.cmd {
        Command::Run(args) => run(args).await,
        Command::Load(args) => load(args).await,
        Command::Select(args) => select(args).await,
        Command::Schema(args) => {
            let dialect = match args.dialect {
                DialectArg::Cql => Dialect::Cql,
                DialectArg::Postgres => Dialect::Postgres,
            };
            print!("{}", schema::render(dialect));
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let out = args.out.clone();
    let harness = build_harness(&args.store, harness_config(&args)).await?;
    let report = harness.run_convergence().await?;
    if let Some(path) = out {
        write_json(&path, &report)?;
        tracing::info!(path = %path.display(), "report written");
    }
    if !report.all_converged() {
        tracing::warn!(
            diverged = report.diverged_batches,
            "view diverged for some batches"
        );
    }
    Ok(())
}

async fn load(args: RunArgs) -> anyhow::Result<()> {
    let out = args.out.clone();
    let harness = build_harness(&args.store, harness_config(&args)).await?;
    let report = harness.run_load().await?;
    if let Some(path) = out {
        write_json(&path, &report)?;
        tracing::info!(path = %path.display(), "report written");
    }
    Ok(())
}

async fn select(args: SelectArgs) -> anyhow::Result<()> {
    let config = HarnessConfig {
        group_key_space: args.group_keys,
        seed: args.seed,
        select_iterations: args.iterations,
        select_limit: args.limit,
        ..HarnessConfig::default()
    };
    let harness = build_harness(&args.store, config).await?;
    let report = harness.run_select().await?;
    if let Some(path) = args.out {
        write_json(&path, &report)?;
        tracing::info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn harness_config(args: &RunArgs) -> HarnessConfig {
    HarnessConfig {
        requests: args.requests,
        insert_count: args.insert_count,
        parallelism: args.parallel,
        insert_only: args.insert_only,
        final_count: args.count,
        group_key_space: args.group_keys,
        verify: RetryPolicy {
            max_retries: args.verify_retries,
            backoff: args.verify_backoff,
        },
        view_check: args
            .view_check
            .then(|| RetryPolicy::busy(args.view_check_retries)),
        seed: args.seed,
        ..HarnessConfig::default()
    }
}

/// Validate options, open the store session and assemble the harness.
async fn build_harness(store: &StoreArgs, config: HarnessConfig) -> anyhow::Result<Harness> {
    config.validate().context("invalid workload options")?;
    anyhow::ensure!(store.connections > 0, "--connections must be > 0");
    anyhow::ensure!(
        store.memory_fault_pct <= 100,
        "--memory-fault-pct must be <= 100"
    );
    let hosts = parse_hosts(&store.hosts);
    anyhow::ensure!(!hosts.is_empty(), "--hosts must not be empty");

    let session = SessionConfig {
        backend: match store.backend {
            BackendArg::Postgres => Backend::Postgres,
            BackendArg::Memory => Backend::Memory,
        },
        hosts,
        port: store.port,
        keyspace: store.keyspace.clone(),
        user: store.user.clone(),
        password: store.password.clone(),
        connections: store.connections,
        op_timeout: store.op_timeout.into(),
        memory: MemoryStoreOptions {
            view_lag: store.memory_view_lag.into(),
            call_latency: store.memory_call_latency.into(),
            fault_pct: store.memory_fault_pct,
            seed: config.seed,
            ..MemoryStoreOptions::default()
        },
    };
    let client = mview_harness::connect(&session).await?;
    let dialect = client.dialect();
    let harness = Harness::new(client, config)?;
    tracing::info!(
        backend = ?session.backend,
        ?dialect,
        hosts = ?session.hosts,
        keyspace = %session.keyspace,
        seed = harness.seed(),
        "session established"
    );
    Ok(harness)
}

/// Parse `none`, `fixed:<dur>` or `exp:<initial>..<max>`.
fn parse_backoff(raw: &str) -> Result<Backoff, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("none") {
        return Ok(Backoff::None);
    }
    let parse = |s: &str| -> Result<Duration, String> {
        humantime::parse_duration(s.trim()).map_err(|err| format!("invalid duration {s:?}: {err}"))
    };
    if let Some(delay) = raw.strip_prefix("fixed:") {
        return Ok(Backoff::Fixed {
            delay: parse(delay)?,
        });
    }
    if let Some(range) = raw.strip_prefix("exp:") {
        let (initial, max) = range
            .split_once("..")
            .ok_or_else(|| format!("expected exp:<initial>..<max>, got {raw:?}"))?;
        let (initial, max) = (parse(initial)?, parse(max)?);
        if initial > max {
            return Err(format!("initial backoff {initial:?} exceeds max {max:?}"));
        }
        return Ok(Backoff::Exponential { initial, max });
    }
    Err(format!("unknown backoff {raw:?}; use none, fixed:<dur> or exp:<initial>..<max>"))
}

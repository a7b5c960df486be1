//! `mw` command surface: windowing over NDJSON streams and config inspection.
//!
//! Host runtimes embed it through [`run_cli`] or, with their own I/O,
//! through [`run_window`].

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metric_window_core::{
    ConnectionProvider, InMemoryWindowStore, MetricConfig, MetricConfigSource,
    SharedStoreProvider, StaticMetricConfigs, WindowAggregator, WindowSettings,
    DEFAULT_TRIM_SLACK,
};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

pub mod transport;

pub use transport::{msg_forward, pump, Envelope, StreamSummary};

#[derive(Debug, Parser)]
#[command(name = "mw")]
#[command(about = "Sliding-window metric aggregation CLI")]
pub struct Cli {
    /// Tracing filter directive, e.g. `info` or `metric_window_core=debug`.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// JSON file with `metrics` entries and an optional `default`.
    #[arg(long, global = true)]
    metric_config: Option<PathBuf>,

    #[arg(long, global = true, env = "BUFF_SIZE")]
    buffer_size: Option<usize>,

    #[arg(long, global = true, value_enum, default_value_t = StoreArg::Memory)]
    store: StoreArg,

    #[arg(long, global = true, default_value = "./metric_window.sqlite3")]
    db: PathBuf,

    #[arg(
        long,
        global = true,
        env = "REDIS_URL",
        default_value = "redis://127.0.0.1/"
    )]
    redis_url: String,

    #[arg(long, global = true, default_value_t = DEFAULT_TRIM_SLACK)]
    trim_slack: usize,

    #[arg(long, global = true, default_value_t = 1)]
    max_store_retries: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Reads input records as NDJSON on stdin, writes emitted windows to stdout.
    Window(WindowArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
pub struct WindowArgs {
    /// Exit non-zero when any record failed.
    #[arg(long)]
    fail_on_error: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Prints resolved metric configs with their effective buffer sizes.
    Show,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum StoreArg {
    Memory,
    Sqlite,
    Redis,
}

impl Cli {
    fn settings(&self) -> WindowSettings {
        WindowSettings {
            buffer_size_override: self.buffer_size,
            trim_slack: self.trim_slack,
            max_store_retries: self.max_store_retries,
            ..WindowSettings::default()
        }
    }

    fn provider(&self) -> SharedStoreProvider {
        let trim_slack = self.trim_slack;
        match self.store {
            StoreArg::Memory => {
                SharedStoreProvider::from_store(Arc::new(InMemoryWindowStore::new(trim_slack)))
            }
            StoreArg::Sqlite => {
                let db = self.db.clone();
                SharedStoreProvider::new(move || {
                    metric_window_store_sqlite::connect(&db, trim_slack)
                })
            }
            StoreArg::Redis => metric_window_store_redis::provider(&self.redis_url, trim_slack),
        }
    }
}

/// Installs the stderr `tracing` subscriber; stdout carries records only.
///
/// # Errors
/// Returns an error for an invalid filter or when a subscriber is already set.
pub fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration is invalid, I/O fails, or
/// `--fail-on-error` is set and a record failed.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_logging(&cli.log_level)?;

    let configs = load_metric_configs(cli.metric_config.as_deref())?;
    let settings = cli.settings();

    match &cli.command {
        Command::Window(args) => {
            let aggregator = WindowAggregator::new(configs, cli.provider(), settings)?;
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            let summary = run_window(&aggregator, stdin.lock(), stdout.lock())?;

            if args.fail_on_error && summary.failed > 0 {
                bail!("{} of {} record(s) failed", summary.failed, summary.received);
            }
            Ok(())
        }
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            let report = config_report(&configs, &settings)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Streams NDJSON records from `input` through `aggregator`.
///
/// # Errors
/// Returns an error when reading input or writing output fails.
pub fn run_window<C, P, R, W>(
    aggregator: &WindowAggregator<C, P>,
    input: R,
    output: W,
) -> Result<StreamSummary>
where
    C: MetricConfigSource,
    P: ConnectionProvider,
    R: BufRead,
    W: Write,
{
    let forward = msg_forward(|payload| aggregator.process_json(payload));
    let summary = pump(input, output, forward)?;

    tracing::info!(
        received = summary.received,
        emitted = summary.emitted,
        dropped = summary.dropped,
        failed = summary.failed,
        "window stream finished"
    );
    Ok(summary)
}

/// Reads metric configs from `path`, or the builtin fallback when absent.
///
/// # Errors
/// Returns an error when the file cannot be read or does not validate.
pub fn load_metric_configs(path: Option<&Path>) -> Result<StaticMetricConfigs> {
    let Some(path) = path else {
        return Ok(StaticMetricConfigs::builtin());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read metric config {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse metric config {}", path.display()))?;
    StaticMetricConfigs::from_json(&value)
        .with_context(|| format!("invalid metric config {}", path.display()))
}

#[derive(Debug, Serialize)]
pub struct ConfigReport {
    pub settings: WindowSettings,
    pub metrics: Vec<ResolvedMetric>,
    pub default: Option<ResolvedMetric>,
}

#[derive(Debug, Serialize)]
pub struct ResolvedMetric {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub window_size: usize,
    pub composite_keys: Vec<String>,
    pub buffer_size: usize,
}

/// Resolves every configured metric against `settings`.
///
/// # Errors
/// Returns an error when any metric's buffer would be smaller than its
/// window.
pub fn config_report(
    configs: &StaticMetricConfigs,
    settings: &WindowSettings,
) -> Result<ConfigReport> {
    settings.validate()?;

    let resolve = |name: Option<&str>, namespace: Option<&str>, config: &MetricConfig| {
        let buffer_size = settings.buffer_size(config.window_size).with_context(|| {
            format!(
                "metric {}/{}",
                namespace.unwrap_or("*"),
                name.unwrap_or("*")
            )
        })?;
        Ok::<_, anyhow::Error>(ResolvedMetric {
            name: name.map(str::to_string),
            namespace: namespace.map(str::to_string),
            window_size: config.window_size,
            composite_keys: config.composite_keys.clone(),
            buffer_size,
        })
    };

    let metrics = configs
        .metrics
        .iter()
        .map(|entry| {
            resolve(
                Some(entry.name.as_str()),
                Some(entry.namespace.as_str()),
                &entry.config,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let default = configs
        .default
        .as_ref()
        .map(|config| resolve(None, None, config))
        .transpose()?;

    Ok(ConfigReport {
        settings: *settings,
        metrics,
        default,
    })
}

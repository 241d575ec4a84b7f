use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser};
use sitewatch::{
    Coordinator, RunOutcome,
    config::{Config, read_config_file},
    error::RunError,
    notify::{LogNotifier, Notifier, WebhookNotifier},
    storage::FileStore,
};
use tracing::{debug, error, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_ENV: &str = "SITEWATCH_CONFIG";
const DEFAULT_CONFIG: &str = "./sitewatch.json";

/// Probe the configured sites once, store the results and report anomalies
#[derive(Debug, Clone, Parser)]
#[command(version)]
struct Args {
    /// Config file (defaults to $SITEWATCH_CONFIG, then ./sitewatch.json)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    fn level(&self) -> LevelFilter {
        match (self.quiet, self.verbose) {
            (true, _) => LevelFilter::WARN,
            (false, 0) => LevelFilter::INFO,
            (false, 1) => LevelFilter::DEBUG,
            (false, _) => LevelFilter::TRACE,
        }
    }

    fn config_path(&self) -> PathBuf {
        self.file
            .clone()
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
    }
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new()
        .with_targets(vec![("sitewatch", level)])
        .with_default(LevelFilter::WARN);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.level());
    trace!("started with args: {args:?}");

    match run(&args).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            error!("{e:#}");
            let code = e.downcast_ref::<RunError>().map_or(1, RunError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn run(args: &Args) -> anyhow::Result<RunOutcome> {
    let path = args.config_path();
    debug!("reading config from {}", path.display());

    let config = read_config_file(&path)
        .map_err(RunError::from)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let store = FileStore::new(&config.data_dir)
        .await
        .map_err(RunError::from)
        .with_context(|| format!("failed to open data directory {}", config.data_dir.display()))?;

    let coordinator = Coordinator::new(&config, Arc::new(store), notifier(&config));
    let outcome = coordinator.run(|| config.targets()).await?;

    Ok(outcome)
}

fn notifier(config: &Config) -> Arc<dyn Notifier> {
    match &config.webhook {
        Some(webhook) => {
            debug!("delivering anomaly reports to {}", webhook.url);
            Arc::new(WebhookNotifier::new(webhook.url.clone()))
        }
        None => Arc::new(LogNotifier),
    }
}

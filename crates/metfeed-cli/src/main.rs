use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metfeed_core::StoreStats;
use metfeed_storage::Database;
use metfeed_sync::{DatasetOutcome, IngestConfig, InvocationReport, Orchestrator, RunMode};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "metfeed")]
#[command(about = "Weather alert and forecast feed ingestion")]
struct Cli {
    /// YAML file overriding METFEED_* environment settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the selected feeds, then print status
    Run {
        #[arg(value_enum, default_value_t = ModeArg::Auto)]
        mode: ModeArg,
    },
    /// Print record counts and the latest run
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Create or upgrade the database schema
    Migrate,
    /// Run auto mode on the configured cron schedule until Ctrl-C
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Rss,
    Forecast,
    Both,
    Auto,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Rss => RunMode::Alerts,
            ModeArg::Forecast => RunMode::Forecasts,
            ModeArg::Both => RunMode::All,
            ModeArg::Auto => RunMode::Auto,
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let builder = tracing_subscriber::registry().with(filter);

    match std::env::var("METFEED_LOG_FORMAT").as_deref() {
        Ok("json") => {
            let _ = builder.with(fmt_layer.json().flatten_event(true)).try_init();
        }
        _ => {
            let _ = builder.with(fmt_layer.compact()).try_init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = IngestConfig::load(cli.config.as_deref()).await?;

    match cli.command.unwrap_or(Commands::Run {
        mode: ModeArg::Auto,
    }) {
        Commands::Run { mode } => {
            let orchestrator = Orchestrator::connect(&config).await?;
            let report = orchestrator.run(mode.into()).await;
            print_invocation(&report);
            print_stats(&orchestrator.stats().await);
        }
        Commands::Status { json } => {
            let db = Database::open_existing(&config.db_path)
                .await
                .with_context(|| format!("opening database {}", config.db_path.display()))?;
            let stats = db.run_logger().stats().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats);
            }
        }
        Commands::Migrate => {
            let db = Database::open(&config.db_path)
                .await
                .with_context(|| format!("opening database {}", config.db_path.display()))?;
            db.migrate().await.context("migrating database schema")?;
            println!("schema ready: {}", config.db_path.display());
        }
        Commands::Watch => {
            let orchestrator = Arc::new(Orchestrator::connect(&config).await?);
            metfeed_sync::watch(orchestrator, &config).await?;
            info!("watch stopped");
        }
    }

    Ok(())
}

fn print_invocation(report: &InvocationReport) {
    for outcome in &report.outcomes {
        match outcome {
            DatasetOutcome::Skipped { dataset } => {
                println!("{dataset}: skipped (not due)");
            }
            DatasetOutcome::Completed(run) => {
                let counts = run.report.counts;
                let status = match &run.report.error {
                    None => "ok".to_string(),
                    Some(error) => format!("failed: {error}"),
                };
                println!(
                    "{}: {status} (fetched={} inserted={} dropped={} pages={} in {:.2}s)",
                    run.report.dataset,
                    counts.fetched,
                    counts.inserted,
                    counts.dropped,
                    run.pages,
                    run.report.duration_seconds()
                );
            }
        }
    }
}

fn print_stats(stats: &StoreStats) {
    let latest = |value: &Option<String>| value.clone().unwrap_or_else(|| "n/a".to_string());
    println!("database status:");
    println!(
        "  alerts:    {} (latest {})",
        stats.alerts_total,
        latest(&stats.latest_alert_date)
    );
    println!(
        "  forecasts: {} (latest {})",
        stats.forecasts_total,
        latest(&stats.latest_forecast_date)
    );
    match &stats.last_run {
        Some(last) => println!(
            "  runs:      {} (last {} at {}, {})",
            stats.total_runs,
            last.run_type,
            last.run_timestamp,
            if last.success { "ok" } else { "failed" }
        ),
        None => println!("  runs:      {}", stats.total_runs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_defaults_to_auto() {
        let cli = Cli::try_parse_from(["metfeed", "run"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Run { mode: ModeArg::Auto })));

        let cli = Cli::try_parse_from(["metfeed"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn mode_names_map_onto_run_modes() {
        let cli = Cli::try_parse_from(["metfeed", "--config", "feeds.yaml", "run", "rss"])
            .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("feeds.yaml")));
        let Some(Commands::Run { mode }) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(RunMode::from(mode), RunMode::Alerts);
        assert_eq!(RunMode::from(ModeArg::Forecast), RunMode::Forecasts);
        assert_eq!(RunMode::from(ModeArg::Both), RunMode::All);
        assert!(Cli::try_parse_from(["metfeed", "run", "weekly"]).is_err());
    }
}

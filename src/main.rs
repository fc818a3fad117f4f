mod config;
mod cooldown;
mod data_source;
mod engine;
mod error;
mod history;
mod localization;
mod model;
mod notifier;
mod rules;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use cooldown::sqlite::SqliteCooldownStore;
use data_source::postgres::PostgresDataSource;
use engine::DetectionEngine;
use history::HistoryStore;
use history::sqlite::SqliteHistoryStore;
use localization::DefaultLocalizer;
use notifier::terminal::TerminalNotifier;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("data source error")]
    DataSource,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "signal-detector", about = "Market-signal detection engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the detection loop
    Run,
    /// Inspect signal history
    History {
        #[command(subcommand)]
        command: Option<HistoryCommand>,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// Show the most recent signals
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        direction: Option<String>,
    },
    /// Show aggregate stats over a trailing window
    Stats {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_detection(&config).await,
        Command::History { command } => match command.unwrap_or(HistoryCommand::Recent {
            limit: 20,
            symbol: None,
            direction: None,
        }) {
            HistoryCommand::Recent {
                limit,
                symbol,
                direction,
            } => show_recent(&config, limit, symbol, direction).await,
            HistoryCommand::Stats { days } => show_stats(&config, days).await,
        },
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

async fn open_history_store(config: &AppConfig) -> Result<SqliteHistoryStore, Report<AppError>> {
    let path = PathBuf::from(&config.general.data_dir).join("signal_history.db");
    SqliteHistoryStore::open(&path)
        .await
        .change_context(AppError::Storage)
}

async fn open_cooldown_store(config: &AppConfig) -> Result<SqliteCooldownStore, Report<AppError>> {
    let path = PathBuf::from(&config.general.data_dir).join("cooldown.db");
    SqliteCooldownStore::open(&path)
        .await
        .change_context(AppError::Storage)
}

async fn run_detection(config: &AppConfig) -> Result<(), Report<AppError>> {
    std::fs::create_dir_all(&config.general.data_dir)
        .change_context(AppError::Storage)
        .attach_with(|| format!("data_dir: {}", config.general.data_dir))?;

    let database_url =
        config::resolve_database_url(config, Path::new(&config.general.env_file));

    let data_source = PostgresDataSource::connect(&database_url)
        .await
        .change_context(AppError::DataSource)?;

    let cooldown_store = open_cooldown_store(config).await?;
    let history_store = open_history_store(config).await?;

    let engine = Arc::new(
        DetectionEngine::new(
            Arc::new(data_source),
            Arc::new(cooldown_store),
            Arc::new(history_store),
            Arc::new(DefaultLocalizer::default()),
            config.general.symbols.clone(),
            config.general.language.clone(),
            config.general.cooldown_seconds,
            config.rules,
        )
        .await
        .change_context(AppError::Storage)?,
    );

    engine.register_callback(Arc::new(TerminalNotifier)).await;

    info!(
        symbols = config.general.symbols.len(),
        interval = config.general.tick_interval_seconds,
        "starting detection loop"
    );

    let cancel = CancellationToken::new();
    let loop_engine = Arc::clone(&engine);
    let loop_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        loop_engine
            .run(config.general.tick_interval_seconds, loop_cancel)
            .await;
    });

    tokio::signal::ctrl_c()
        .await
        .change_context(AppError::Runtime)?;

    info!("ctrl+c received, shutting down");
    cancel.cancel();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;

    let stats = engine.stats();
    info!(
        checks = stats.checks,
        signals = stats.signals,
        errors = stats.errors,
        cooldowns = stats.cooldowns,
        "shutdown complete"
    );
    Ok(())
}

async fn show_recent(
    config: &AppConfig,
    limit: i64,
    symbol: Option<String>,
    direction: Option<String>,
) -> Result<(), Report<AppError>> {
    let store = open_history_store(config).await?;
    let records = store
        .get_recent(limit, symbol.as_deref(), direction.as_deref())
        .await;

    if records.is_empty() {
        println!("no signal history found");
        return Ok(());
    }

    for record in records {
        println!(
            "{} {} {} {} strength={} price={:.4} {}",
            record.timestamp,
            record.symbol,
            record.signal_type,
            record.direction,
            record.strength,
            record.price,
            record.message
        );
    }
    Ok(())
}

async fn show_stats(config: &AppConfig, days: i64) -> Result<(), Report<AppError>> {
    let store = open_history_store(config).await?;
    let stats = store.get_stats(days).await;

    println!("total={} over last {} days", stats.total, stats.days);
    for (direction, count) in &stats.by_direction {
        println!("  {direction}: {count}");
    }
    println!("top symbols:");
    for (symbol, count) in &stats.by_symbol {
        println!("  {symbol}: {count}");
    }
    Ok(())
}

//! Leveraged position sizing and lifecycle bot
//!
//! Sizes new leveraged positions from a dynamic risk percentage and a capped
//! Kelly fraction, then manages each open position through stop-loss,
//! take-profit and resize rules until it is closed.

mod api;
mod bot;
mod db;
mod metrics;
mod models;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{AnalysisProvider, PaperExchange, ScriptedAnalyzer};
use crate::bot::{Bot, BotConfig, BotStats};
use crate::db::Database;
use crate::metrics::MetricsCalculator;
use crate::trading::{PositionLifecycleManager, RiskConfig};

/// Leveraged position sizing bot CLI.
#[derive(Parser)]
#[command(name = "levsizer")]
#[command(about = "Risk-sized leveraged positions with automated exits", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "LEVSIZER_DATABASE", default_value = "sqlite:./levsizer.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LEVSIZER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot against the paper exchange
    Run {
        /// JSON file of signals keyed by symbol
        #[arg(short, long)]
        signals: PathBuf,

        /// Symbols to trade (defaults to every symbol in the signals file)
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Paper account balance
        #[arg(short, long, default_value = "10000")]
        balance: f64,

        /// Seconds between cycles
        #[arg(short, long, default_value = "60")]
        interval: u64,

        /// Stop after this many cycles
        #[arg(short, long)]
        cycles: Option<u64>,
    },

    /// Show open positions and statistics
    Status,

    /// Close an open position by hand
    Close {
        /// Position id
        id: String,

        /// Exit price
        #[arg(short, long)]
        price: f64,
    },

    /// Show performance of closed positions
    Report,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = RiskConfig::from_env().context("Invalid risk configuration")?;

    match cli.command {
        Commands::Run {
            signals,
            symbols,
            balance,
            interval,
            cycles,
        } => {
            let analyzer = ScriptedAnalyzer::from_file(&signals)?;
            let symbols = if symbols.is_empty() {
                analyzer.symbols()
            } else {
                symbols
            };

            if symbols.is_empty() {
                println!("No symbols to trade. Add signals to {}.", signals.display());
                return Ok(());
            }

            let (db, manager) = open_manager(&cli.database, config).await?;
            let balance = Decimal::try_from(balance)?;
            let exchange = PaperExchange::new(balance);
            for symbol in &symbols {
                if let Ok(signal) = analyzer.analyze(symbol).await {
                    exchange.set_mark_price(symbol, signal.current_price).await;
                }
            }

            info!(
                balance = %balance,
                interval = interval,
                symbols = ?symbols,
                "Starting bot"
            );

            println!("\n=== Leveraged Position Bot ===");
            println!("Balance:          {}", balance);
            println!("Polling interval: {}s", interval);
            println!("Symbols:          {}", symbols.join(", "));
            println!("Mode:             PAPER");
            println!("\nPress Ctrl+C to stop.\n");

            let bot_config = BotConfig {
                symbols,
                poll_interval_secs: interval,
                max_cycles: cycles,
                ..BotConfig::default()
            };

            let bot = Bot::new(
                bot_config,
                manager,
                Arc::new(analyzer),
                Arc::new(exchange),
            )
            .with_database(db);

            if let Err(e) = bot.run().await {
                tracing::error!(error = %e, "Bot error");
            }

            // Show final stats
            let stats = bot.get_stats().await;
            println!("\n{}", stats);
        }

        Commands::Status => {
            let (db, manager) = open_manager(&cli.database, config).await?;
            let stats = BotStats::collect(&manager, Some(&db)).await;
            println!("\n{}", stats);

            if let Some(point) = db.get_balance_curve(1).await?.first() {
                println!(
                    "Last cycle {}: balance {:.2}, {:.2} committed across {} position(s)\n",
                    point.timestamp, point.balance, point.committed_margin, point.open_positions
                );
            }

            let positions = manager.all_open_positions().await;
            if positions.is_empty() {
                println!("No open positions.");
                return Ok(());
            }

            println!("=== Open Positions ===");
            println!(
                "{:<36} {:<10} {:<6} {:>12} {:>12} {:>4} {:>10}",
                "ID", "SYMBOL", "SIDE", "ENTRY", "SIZE", "LEV", "MARGIN"
            );
            println!("{}", "-".repeat(98));
            for pos in &positions {
                println!(
                    "{:<36} {:<10} {:<6} {:>12} {:>12.4} {:>3}x {:>10.4}",
                    pos.id,
                    pos.symbol,
                    pos.side,
                    pos.entry_price,
                    pos.size,
                    pos.leverage,
                    pos.margin
                );
            }
        }

        Commands::Close { id, price } => {
            let (_, manager) = open_manager(&cli.database, config).await?;
            let price = Decimal::try_from(price)?;
            let record = manager.close_position(&id, price).await?;

            println!("Closed {} {} {}", record.id, record.symbol, record.side);
            println!("  Entry: {}  Exit: {}", record.entry_price, record.exit_price);
            println!("  P&L:   {:.4}", record.pnl);
        }

        Commands::Report => {
            let (_, manager) = open_manager(&cli.database, config).await?;
            let history = manager.history().await;
            if history.is_empty() {
                println!("No closed positions yet.");
                return Ok(());
            }

            let report = MetricsCalculator::calculate(&history);
            println!("\n{}", report);
        }

        Commands::Config => print_config(&config),
    }

    Ok(())
}

/// Open the database and restore open positions and history from it.
async fn open_manager(
    database_url: &str,
    config: RiskConfig,
) -> Result<(Database, Arc<PositionLifecycleManager>)> {
    let db = Database::new(database_url).await?;
    let manager = PositionLifecycleManager::restore(config, db.clone()).await?;
    Ok((db, Arc::new(manager)))
}

fn print_config(config: &RiskConfig) {
    println!("\n=== Risk Configuration ===\n");
    println!("Position Sizing:");
    println!("  Base Risk:            {}%", config.base_risk_pct);
    println!("  Leverage Range:       {}x - {}x", config.min_leverage, config.max_leverage);
    println!("  Max Positions:        {} (not enforced)", config.max_positions);
    println!("  Performance Window:   {} trades", config.performance_window);

    println!("\nLifecycle Rules:");
    println!("  Entry Confidence:     > {}", config.entry_confidence_threshold);
    println!("  Resize Confidence:    > {}", config.resize_confidence_threshold);
    println!("  Stop Loss:            {}", config.stop_loss_pct);
    println!("  Take Profit:          {}", config.take_profit_pct);
}

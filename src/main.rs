//! Sentinel Trading Engine
//!
//! Multi-model crypto trading engine with layered risk controls: ensemble
//! signal combination, weighted-vote arbitration, adaptive sizing, circuit
//! breakers and a persistent per-session execution ledger.

mod broker;
mod config;
mod db;
mod decision;
mod engine;
mod error;
mod feed;
mod models;
mod risk;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::broker::PaperBroker;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::engine::TradingSession;
use crate::feed::PaperFeed;

/// Sentinel trading engine CLI.
#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Multi-model crypto trading engine with layered risk controls", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./sentinel.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Session identifier; every session keeps fully isolated state
    #[arg(short, long, default_value = "default")]
    session: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the paper trading loop
    Run {
        /// Starting balance in quote currency for a brand-new session
        #[arg(short, long, default_value = "10000")]
        balance: f64,

        /// Decision cycle interval in seconds
        #[arg(short, long, default_value = "10")]
        interval: u64,

        /// Symbols to trade
        #[arg(long, value_delimiter = ',', default_value = "BTCUSDT,ETHUSDT,SOLUSDT")]
        symbols: Vec<String>,

        /// Stop after this many cycles (runs until Ctrl+C when omitted)
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Show session status and safety state
    Status,

    /// Show recent trade journal entries
    Journal {
        /// Maximum number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Show the active engine configuration
    Config,

    /// Halt trading and force-liquidate every open position
    EmergencyStop {
        /// Reason recorded with the stop
        #[arg(default_value = "manual emergency stop")]
        reason: String,
    },

    /// Disable trading for the session without liquidating
    Halt {
        /// Reason recorded with the halt
        #[arg(default_value = "operator halt")]
        reason: String,
    },

    /// Re-enable trading after a halt or a tripped global breaker
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
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

    // Initialize database
    let db = Database::new(&cli.database).await?;

    match cli.command {
        Commands::Run {
            balance,
            interval,
            symbols,
            cycles,
        } => {
            run_paper_loop(&db, &cli.session, balance, interval, &symbols, cycles).await?;
        }

        Commands::Status => {
            let Some(snapshot) = db.load_session(&cli.session).await? else {
                println!(
                    "No session '{}' found. Use 'sentinel run' to start one.",
                    cli.session
                );
                return Ok(());
            };
            let (filled, rejected) = db.journal_stats(&cli.session).await?;
            let quarantined = db.quarantined_count(&cli.session).await?;
            let now = Utc::now();

            println!("\n=== Session Status ===");
            println!("Session:          {}", cli.session);
            println!("Balance:          {}", snapshot.balance.round_dp(2));
            println!("Realized P&L:     {}", snapshot.realized_pnl.round_dp(2));
            println!("Peak Equity:      {}", snapshot.peak_equity.round_dp(2));
            println!("Open Positions:   {}", snapshot.positions.len());
            println!("Resting Orders:   {}", snapshot.resting_orders.len());

            let safety = &snapshot.safety_state;
            println!("\n=== Safety ===");
            println!(
                "Trading Enabled:  {}",
                if safety.trading_enabled { "Yes" } else { "No" }
            );
            if let Some(reason) = &safety.disabled_reason {
                println!("Disabled Reason:  {}", reason);
            }
            let global_active = safety
                .global_breaker
                .as_ref()
                .is_some_and(|b| b.is_active(now));
            println!(
                "Global Breaker:   {}",
                if global_active { "ACTIVE" } else { "clear" }
            );
            let tripped: Vec<&str> = safety
                .symbol_breakers
                .iter()
                .filter(|(_, b)| b.is_active(now))
                .map(|(s, _)| s.as_str())
                .collect();
            println!(
                "Symbol Breakers:  {}",
                if tripped.is_empty() {
                    "none".to_string()
                } else {
                    tripped.join(", ")
                }
            );
            println!("Daily P&L:        {}", safety.daily_pnl.round_dp(2));
            println!("API Failures:     {}", safety.api_failure_count);

            println!("\n=== Journal ===");
            println!("Fills:            {}", filled);
            println!("Rejections:       {}", rejected);
            if quarantined > 0 {
                println!("Quarantined Rows: {}", quarantined);
            }

            if !snapshot.positions.is_empty() {
                println!("\n=== Open Positions ===");
                for pos in &snapshot.positions {
                    println!(
                        "  {} {} @ {} (tp {} / stop {})",
                        pos.symbol,
                        pos.quantity,
                        pos.avg_price,
                        pos.take_profit_price.round_dp(4),
                        pos.stop_loss_price.round_dp(4)
                    );
                }
            }
        }

        Commands::Journal { limit } => {
            let entries = db.recent_trades(&cli.session, limit).await?;
            if entries.is_empty() {
                println!("No journal entries for session '{}'.", cli.session);
                return Ok(());
            }

            println!("\n=== Trade Journal ({} most recent) ===", entries.len());
            for entry in &entries {
                println!(
                    "  {}  {:<4} {:<10} {:>14} @ {:<12} {:<20} pnl {:>10}  {}",
                    entry.timestamp,
                    entry.side,
                    entry.symbol,
                    entry.quantity,
                    entry.price,
                    entry.reason_code,
                    entry.pnl,
                    entry.detail.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Config => {
            let config = EngineConfig::from_env();

            println!("\n=== Capital & Sizing ===\n");
            println!("  Base Risk Fraction:      {}", config.base_risk_fraction);
            println!("  Max Position Fraction:   {}", config.max_position_fraction);
            println!("  Max Daily Loss Fraction: {}", config.max_daily_loss_fraction);
            println!("  Exchange Min Notional:   {}", config.exchange_min_notional);
            println!("  Min Notional Buffer:     {}", config.min_notional_buffer);

            println!("\n=== Safety ===\n");
            println!("  Loss Streak Limit:       {}", config.loss_streak_limit);
            println!("  Symbol Breaker Cooldown: {}s", config.symbol_breaker_cooldown_secs);
            println!("  Global Breaker Cooldown: {}s", config.global_breaker_cooldown_secs);
            println!("  API Failure Limit:       {}", config.api_failure_limit);
            println!("  Volatility Threshold:    {}", config.volatility_threshold);

            println!("\n=== Stops ===\n");
            println!("  Fixed Stop:              {}", config.stop_loss_pct);
            println!("  ATR Multiple:            {}", config.atr_stop_multiple);
            println!("  Trailing Stop:           {}", config.trailing_stop_pct);
            println!("  Max Holding:             {}s", config.max_holding_secs);
            println!("  Time Stop:               {}", config.time_stop_pct);
            println!("  Volatility Multiple:     {}", config.vol_stop_multiple);
            println!("  Volatility Stop Cap:     {}", config.vol_stop_max_pct);

            println!("\n=== Take Profit ===\n");
            println!("  Target:                  {}", config.take_profit_pct);
            println!("  Spread Margin:           {}", config.spread_margin_pct);
            println!("  Reprice Threshold:       {}", config.reprice_threshold_pct);

            println!("\n=== Arbiter ===\n");
            println!("  Base Threshold:          {}", config.vote_base_threshold);
            println!("  Threshold Floor:         {}", config.vote_threshold_floor);
            println!("  Threshold Ceiling:       {}", config.vote_threshold_ceiling);
            println!("  Min Power Gap:           {}", config.vote_min_power_gap);

            println!("\n=== Execution ===\n");
            println!("  Mode:                    {}", config.execution_mode.as_str());
            println!(
                "  Meta Model:              {}",
                config.meta_model_path.as_deref().unwrap_or("none")
            );

            match config.validate() {
                Ok(()) => println!("\nConfiguration is valid."),
                Err(e) => println!("\nConfiguration INVALID: {}", e),
            }
        }

        Commands::EmergencyStop { reason } => {
            let Some(snapshot) = db.load_session(&cli.session).await? else {
                println!("No session '{}' found.", cli.session);
                return Ok(());
            };

            // Rebuild a paper exchange holding what the session last saw;
            // positions liquidate at their recorded entry prices.
            let broker = Arc::new(PaperBroker::new(snapshot.balance));
            for pos in &snapshot.positions {
                broker.seed_holding(&pos.symbol, pos.quantity).await;
                broker.set_price(&pos.symbol, pos.avg_price).await;
            }

            let session = TradingSession::open(
                &cli.session,
                EngineConfig::from_env(),
                broker,
                db.clone(),
                Decimal::ZERO,
            )
            .await?;
            session.emergency_stop(&reason).await?;

            let summary = session.summary().await;
            println!(
                "Emergency stop complete for session '{}': {} positions remain, balance {}, realized P&L {}.",
                cli.session,
                summary.open_positions,
                summary.balance.round_dp(2),
                summary.realized_pnl.round_dp(2)
            );
        }

        Commands::Halt { reason } => {
            let Some(mut snapshot) = db.load_session(&cli.session).await? else {
                println!("No session '{}' found.", cli.session);
                return Ok(());
            };
            snapshot.safety_state.trading_enabled = false;
            snapshot.safety_state.disabled_reason = Some(reason.clone());
            db.save_session(&cli.session, &snapshot).await?;
            println!("Trading halted for session '{}': {}", cli.session, reason);
        }

        Commands::Resume => {
            let Some(mut snapshot) = db.load_session(&cli.session).await? else {
                println!("No session '{}' found.", cli.session);
                return Ok(());
            };
            snapshot.safety_state.trading_enabled = true;
            snapshot.safety_state.disabled_reason = None;
            snapshot.safety_state.global_breaker = None;
            db.save_session(&cli.session, &snapshot).await?;
            println!("Trading resumed for session '{}'.", cli.session);
        }
    }

    Ok(())
}

/// Drive a session against the synthetic feed until Ctrl+C or the cycle
/// limit. A restored session re-seeds the paper exchange with its persisted
/// balance and holdings; resting orders the new exchange never saw are
/// dropped on open and re-placed by the first cycle's take-profit sweep.
async fn run_paper_loop(
    db: &Database,
    session_id: &str,
    balance: f64,
    interval: u64,
    symbols: &[String],
    cycles: Option<u64>,
) -> Result<()> {
    info!(
        session_id = %session_id,
        balance = balance,
        interval = interval,
        "Starting paper trading"
    );

    let restored = db.load_session(session_id).await?;
    let broker = match &restored {
        Some(snapshot) => {
            let broker = PaperBroker::new(snapshot.balance);
            for pos in &snapshot.positions {
                broker.seed_holding(&pos.symbol, pos.quantity).await;
            }
            broker
        }
        None => PaperBroker::new(Decimal::try_from(balance)?),
    };
    let broker = Arc::new(broker);

    let mut feed = PaperFeed::new(symbols);
    for (symbol, price) in feed.prices() {
        broker.set_price(&symbol, price).await;
    }

    let config = EngineConfig::from_env();
    let session = TradingSession::open(
        session_id,
        config,
        broker.clone(),
        db.clone(),
        Decimal::try_from(balance)?,
    )
    .await?;

    println!("\n=== Sentinel Paper Trading ===");
    println!("Session: {}", session_id);
    println!("Symbols: {}", symbols.join(", "));
    println!("Cycle interval: {}s", interval);
    println!(
        "State: {}",
        if restored.is_some() { "restored" } else { "new" }
    );
    println!("\nThis is SIMULATED trading - no real money involved.");
    println!("Press Ctrl+C to stop.\n");

    let cycle_duration = Duration::from_secs(interval);
    let mut last_cycle: Option<Instant> = None;
    let mut completed: u64 = 0;

    loop {
        if last_cycle.map_or(true, |t| t.elapsed() >= cycle_duration) {
            let cycle = feed.next_cycle();
            for (symbol, price) in feed.prices() {
                broker.set_price(&symbol, price).await;
            }
            if let Err(e) = session
                .tick(&cycle.snapshots, &cycle.signals, &cycle.model_outputs)
                .await
            {
                error!(error = %e, "Cycle failed");
            }

            let summary = session.summary().await;
            println!(
                "[{}] Equity: {} | P&L: {} | Positions: {} | Resting: {} | Stress: {:.2} ({})",
                chrono::Local::now().format("%H:%M:%S"),
                summary.equity.round_dp(2),
                (summary.realized_pnl + summary.unrealized_pnl).round_dp(2),
                summary.open_positions,
                summary.resting_orders,
                summary.stress,
                summary.stress_level.as_str()
            );

            completed += 1;
            if cycles.is_some_and(|max| completed >= max) {
                break;
            }
            last_cycle = Some(Instant::now());
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n\nStopping paper trading...");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    session.save_state().await?;

    let summary = session.summary().await;
    println!("\n=== Session Summary ===");
    println!("Balance:          {}", summary.balance.round_dp(2));
    println!("Equity:           {}", summary.equity.round_dp(2));
    println!("Realized P&L:     {}", summary.realized_pnl.round_dp(2));
    println!("Unrealized P&L:   {}", summary.unrealized_pnl.round_dp(2));
    println!("Peak Equity:      {}", summary.peak_equity.round_dp(2));
    println!("Portfolio Health: {:.2}", summary.portfolio_health);
    println!("Risk Profile:     {}", summary.risk_profile.as_str());
    println!(
        "Trading Enabled:  {}",
        if summary.safety.trading_enabled { "Yes" } else { "No" }
    );

    Ok(())
}

mod config;
mod data;
mod model;
mod strategies;
mod execution;
mod monitoring;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use config::{Config, EnvConfig, TradingMode};
use data::kalshi::KalshiMarketClient;
use data::weather::{NwsActualsClient, SnapshotForecastProvider};
use execution::orchestrator::{Collaborators, ExecutionOrchestrator};
use execution::persistence::TradeLedger;
use execution::scheduler;
use execution::simulator::PaperGateway;
use model::calibration::CalibrationStore;
use strategies::backtest::Backtester;
use monitoring::logger::CsvLogger;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("🚀 Bracket edge trader starting...");

    // Load configuration
    tracing::info!("Loading configuration...");
    let config = Config::load("config.toml")?;

    // Initialize database
    tracing::info!("Initializing database: {}", config.system.database_path);
    let ledger = Arc::new(TradeLedger::open(&config.system.database_path)?);
    let calibrations = Arc::new(CalibrationStore::load(&ledger)?);

    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("backtest") {
        let lookback_days = match args.next() {
            Some(days) => days.parse().with_context(|| format!("Invalid lookback days: {}", days))?,
            None => config.calibration.window_days,
        };
        let backtester = Backtester::new(config.strategy.clone(), config.risk.clone());
        let report = backtester.run(
            &ledger,
            &config.cities,
            &calibrations,
            Utc::now().date_naive(),
            lookback_days,
            config.paper_trading.initial_balance_usd,
        )?;
        if report.total_trades > 0 && report.win_rate() < 0.5 {
            tracing::warn!("⚠️ Backtest win rate below 50% over {} trades", report.total_trades);
        }
        return Ok(());
    }

    let env_config = EnvConfig::load()?;

    if env_config.trading_mode == TradingMode::Live || !config.paper_trading.enabled {
        bail!("Live trading needs an exchange order gateway; this build only ships the paper gateway");
    }

    tracing::info!("Dry run mode: {}", config.system.dry_run);
    tracing::info!(
        "Cities: {}",
        config.cities.iter().map(|c| c.code.as_str()).collect::<Vec<_>>().join(", ")
    );

    let journal = if config.monitoring.csv_logging {
        Some(CsvLogger::new(config.monitoring.csv_log_path.clone())?)
    } else {
        None
    };

    let http_timeout = config.infrastructure.http_timeout_secs;
    let collaborators = Collaborators {
        forecasts: Arc::new(SnapshotForecastProvider::new(
            env_config.forecast_snapshot_path.clone(),
            config.infrastructure.max_forecast_age_hours,
        )),
        markets: Arc::new(KalshiMarketClient::new(env_config.kalshi_api_url.clone(), http_timeout)?),
        actuals: Arc::new(NwsActualsClient::new(
            env_config.nws_api_url.clone(),
            env_config.nws_user_agent.clone(),
            http_timeout,
        )?),
        gateway: Arc::new(PaperGateway::new(&config.paper_trading)),
    };

    let cycle_every = Duration::from_secs(config.schedule.cycle_interval_minutes * 60);
    let calibration_hour = config.schedule.calibration_hour_utc;

    let orchestrator = Arc::new(
        ExecutionOrchestrator::new(config, collaborators, ledger, calibrations, journal, Utc::now()).await?,
    );

    // Perform crash recovery
    orchestrator.recover(Utc::now()).await?;

    let status = orchestrator.risk_status().await;
    tracing::info!(
        "Open positions: {}/{} (kill switch {})",
        status.open_position_count,
        status.max_open_positions,
        if status.kill_switch_active { "ACTIVE" } else { "off" }
    );
    tracing::info!("✅ Trader initialized successfully");

    let dispatch = tokio::spawn(scheduler::run_dispatch_loop(orchestrator.clone(), cycle_every));
    let daily = tokio::spawn(scheduler::run_daily_loop(orchestrator.clone(), calibration_hour));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down..."),
        result = dispatch => tracing::error!("Dispatch loop exited: {:?}", result),
        result = daily => tracing::error!("Daily loop exited: {:?}", result),
    }

    Ok(())
}

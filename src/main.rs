use anyhow::Context;
use clap::Parser;
use loyalty::cli::{Cli, Commands};
use loyalty::config::{AppConfig, LoggingConfig};
use loyalty::coordination::{wait_for_os_signal, ShutdownSignal};
use loyalty::services::{HealthServer, HealthState};
use loyalty::{AccrualClient, Engine, EngineStats, PostgresLedger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("failed to load configuration from {}", cli.config_dir))?;
    config.apply_overrides(cli.overrides());
    if cli.json_logs {
        config.logging.json = true;
    }

    init_logging(&config.logging);

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Configuration error: {}", e);
        }
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }

    match cli.command() {
        Commands::CheckConfig => {
            info!("Configuration OK");
            Ok(())
        }
        Commands::Migrate => {
            let ledger = connect(&config).await?;
            ledger.migrate().await.context("failed to apply migrations")?;
            ledger.close().await;
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

async fn connect(config: &AppConfig) -> anyhow::Result<PostgresLedger> {
    let ledger = PostgresLedger::new(
        &config.database.url,
        config.database.max_connections,
        Duration::from_millis(config.database.acquire_timeout_ms),
    )
    .await
    .context("failed to connect to database")?
    .with_retry(config.store_retry());
    Ok(ledger)
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    info!("Starting loyalty backend");

    let ledger = connect(&config).await?;
    ledger.migrate().await.context("failed to apply migrations")?;
    let ledger = Arc::new(ledger);

    let gateway = AccrualClient::new(
        &config.accrual.address,
        Duration::from_millis(config.accrual.request_timeout_ms),
    )?
    .with_retry(config.gateway_retry());
    info!("Polling accrual system at {}", gateway.base_url());

    let stats = Arc::new(EngineStats::new());
    let engine = Engine::start(
        ledger.clone(),
        Arc::new(gateway),
        Arc::clone(&stats),
        config.engine_config(),
    );

    let (health_stop_tx, health_stop_rx) = oneshot::channel::<()>();
    let health = HealthServer::new(
        Arc::new(HealthState::new(ledger.clone(), Arc::clone(&stats))),
        config.server.health_bind_address().to_string(),
    );
    let health_task = tokio::spawn(async move {
        let stop = async {
            let _ = health_stop_rx.await;
        };
        if let Err(e) = health.run(stop).await {
            error!("Health server failed: {}", e);
        }
    });

    let signal = match wait_for_os_signal().await {
        Ok(signal) => signal,
        Err(e) => {
            error!("Failed to install signal handlers: {}", e);
            ShutdownSignal::Graceful
        }
    };

    if let Err(e) = engine.stop_with(signal).await {
        warn!("{}", e);
    }
    let _ = health_stop_tx.send(());
    if let Err(e) = health_task.await {
        warn!("Health server task ended abnormally: {}", e);
    }

    stats.log_status().await;
    ledger.close().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

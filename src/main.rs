use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use osprey::broker::paper::PaperGateway;
use osprey::config::Config;
use osprey::server::{router, AppState};
use osprey::trading::{
    DeskSettings, EquityProfile, FuturesProfile, IndexOptionProfile, TradingDesk,
};

/// Returns the appender guard; the caller holds it so buffered file-log
/// lines flush on exit.
fn init_tracing(log_file: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(".", log_file);
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .json()
        .with_current_span(false)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    guard
}

/// Paper gateway preloaded with the configured contracts. Live gateways are
/// separate implementations of the broker API plugged in here instead.
fn paper_gateway(config: &Config) -> Arc<PaperGateway> {
    let futures = &config.futures;
    let options = &config.options;
    let equity = &config.equity;
    Arc::new(
        PaperGateway::new()
            .with_instrument(
                &osprey::instruments::InstrumentDescriptor::future(
                    &futures.symbol,
                    &futures.expiry,
                    &futures.exchange,
                    &futures.currency,
                ),
                1,
                &format!("{}{}", futures.symbol, &futures.expiry),
            )
            .with_instrument(
                &osprey::instruments::InstrumentDescriptor::index_option(
                    &options.symbol,
                    &options.expiry,
                    options.strike,
                    options.right,
                    &options.exchange,
                    &options.currency,
                    &options.trading_class,
                ),
                2,
                &format!("{} {}", options.symbol, options.expiry),
            )
            .with_instrument(
                &osprey::instruments::InstrumentDescriptor::equity(
                    &equity.symbol,
                    &equity.exchange,
                    &equity.currency,
                ),
                3,
                &equity.symbol,
            ),
    )
}

fn desk_settings(config: &Config, client_id: i32) -> DeskSettings {
    DeskSettings {
        host: config.broker.host.clone(),
        port: config.broker.port,
        client_id,
        account_id: config.broker.account_id.clone(),
        execution: config.execution.to_execution_config(),
        force_close_all_families: config.execution.force_close_all_families,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let _log_guard = init_tracing(&config.log_file);

    info!("🦅 Osprey Alert Relay");
    info!("=====================");
    info!(
        "Broker gateway at {}:{}, base client id {}",
        config.broker.host, config.broker.port, config.broker.client_id
    );
    info!("📡 Paper gateway active (live gateways plug in behind the broker API)");

    let gateway: Arc<PaperGateway> = paper_gateway(&config);

    let futures = TradingDesk::connect(
        Box::new(FuturesProfile::from_config(&config.futures)),
        gateway.clone(),
        desk_settings(&config, config.broker.futures_client_id()),
    )
    .await
    .context("futures desk failed to start")?;

    let options = TradingDesk::connect(
        Box::new(IndexOptionProfile::from_config(&config.options)),
        gateway.clone(),
        desk_settings(&config, config.broker.options_client_id()),
    )
    .await
    .context("options desk failed to start")?;

    let equity = TradingDesk::connect(
        Box::new(EquityProfile::from_config(&config.equity)),
        gateway.clone(),
        desk_settings(&config, config.broker.equity_client_id()),
    )
    .await
    .context("equity desk failed to start")?;

    let state = AppState {
        futures: Arc::new(futures),
        options: Arc::new(options),
        equity: Arc::new(equity),
    };
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("could not bind {}", config.http_bind))?;
    info!("🌐 Listening on {}", config.http_bind);
    info!("Press Ctrl+C to shut down");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("🛑 Shutdown signal received"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        })
        .await
        .context("server error")?;

    state.futures.disconnect().await;
    state.options.disconnect().await;
    state.equity.disconnect().await;

    info!("👋 Osprey shutdown complete");
    Ok(())
}

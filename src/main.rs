//! Market scanner entry point: wires config, adapter, control plane,
//! broadcast bus, signal bus, and orchestrator, then serves the control and
//! streaming HTTP surface alongside the background scan loop.

use anyhow::{Context, Result};
use market_scanner::api::{self, AppState};
use market_scanner::broadcast::Broadcast;
use market_scanner::config::Config;
use market_scanner::control::ControlPlane;
use market_scanner::orchestrator::Orchestrator;
use market_scanner::persistence::{LoggingCache, LoggingPersistence};
use market_scanner::rules::SignalBus;
use market_scanner::adapter;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("loading configuration")?;
    info!(exchange = %config.exchange, bind_addr = %config.bind_addr, "starting market scanner");

    let adapter: Arc<dyn adapter::MarketDataSource> = Arc::new(adapter::binance::BinanceAdapter::new(
        config.adapter_timeout_sec,
        config.scan_concurrency,
        config.adapter_max_failures,
        config.adapter_cooldown_sec,
        config.markets_cache_ttl_sec,
    ));

    let broadcast = Arc::new(Broadcast::new());
    let signal_bus = Arc::new(SignalBus::new(config.webhook_url.clone(), config.pubsub_channel.clone()));
    signal_bus.spawn_publisher();

    let control = Arc::new(ControlPlane::new(&config));
    let persistence = Arc::new(LoggingPersistence);
    let cache = Arc::new(LoggingCache);

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        adapter,
        broadcast.clone(),
        signal_bus.clone(),
        control.clone(),
        persistence,
        cache,
    ));

    let bind_addr = config.bind_addr.clone();
    let state = AppState { config: Arc::new(config), control, broadcast, signal_bus };
    let app = api::build_router(state);

    let scan_task = tokio::spawn(orchestrator.run());

    let listener = TcpListener::bind(&bind_addr).await.with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "control/streaming API listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("http server error")?;
        }
        result = scan_task => {
            result.context("orchestrator task panicked")?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "market_scanner=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

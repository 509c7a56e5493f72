//! Statusboard - multi-tenant operations dashboard core
//!
//! Aggregates the state of remote SQL Server Agent job schedulers and ICMP
//! reachability targets, caches expensive remote lookups, and serves the
//! result over HTTP.

mod aggregator;
mod cache;
mod config;
mod crypto;
mod db;
mod probe;
mod status;
mod web;

use aggregator::{Aggregator, BatchRegistry};
use cache::{CacheSweeper, RateCache};
use config::ServerConfig;
use crypto::SecretCipher;
use db::Store;
use probe::{CurrencyRate, IcmpPinger, JobsDriver, MssqlConnector};
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("statusboard=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting statusboard on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let cipher = Arc::new(SecretCipher::new(&cfg.encryption_key)?);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    // Exchange-rate cache and its sweeper
    let rates: Arc<RateCache<Vec<CurrencyRate>>> = Arc::new(RateCache::new(cfg.cache_ttl));
    let sweeper = CacheSweeper::new(rates.clone(), cfg.cache_sweep_interval);
    sweeper.start();

    // Probe drivers
    let connector = Arc::new(MssqlConnector::new(
        cipher.clone(),
        cfg.sql_port,
        cfg.sql_connect_timeout,
    ));
    let jobs = Arc::new(JobsDriver::new(connector, cfg.sql_query_timeout));
    let pinger = Arc::new(IcmpPinger::new(cfg.ping_timeout, cfg.ping_count));
    let aggregator = Aggregator::new(jobs.clone(), pinger, store.clone(), cfg.max_concurrent_probes);
    aggregator.restore_from_history()?;

    let state = AppState {
        config: cfg,
        store,
        aggregator,
        jobs,
        rates,
        cipher,
        batches: Arc::new(BatchRegistry::new()),
    };

    // Start web server
    let server = Server::new(state);
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;

    sweeper.stop().await;
    Ok(())
}

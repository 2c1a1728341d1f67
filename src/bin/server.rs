use std::collections::HashMap;
use std::sync::Arc;

use ohlcv_core::config::Config;
use ohlcv_core::exchange::ExchangeClient;
use ohlcv_core::executor::Executor;
use ohlcv_core::rate_limiter::RateLimiter;
use ohlcv_core::scheduler::Scheduler;
use ohlcv_core::Database;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    tracing::info!("connecting to database");
    let db = Database::connect(&config.database_url, config.database_max_connections).await?;

    // Concrete exchange API clients are constructed and registered by the deployment, not by
    // this crate (out of scope per spec.md §1). An empty registry still runs: jobs for
    // unregistered connectors are recorded as a recoverable run failure and retried next tick.
    let exchange_clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();

    let rate_limiter = Arc::new(RateLimiter::new(db.connectors.clone()));
    let executor = Arc::new(Executor::new(
        db.store.clone(),
        db.connectors.clone(),
        db.jobs.clone(),
        rate_limiter,
        exchange_clients,
        config.executor.clone(),
    ));

    let scheduler = Scheduler::new(db.jobs.clone(), executor, config.scheduler.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    scheduler.run(shutdown_rx).await;

    Ok(())
}

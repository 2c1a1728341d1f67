use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

pub mod error;
pub mod models;
mod postgres;
pub mod repositories;

use error::Result;
use repositories::{ConnectorRepository, JobRepository, StoreRepository};

/// Connection pool plus repository handles, constructed once at startup and cloned (cheaply,
/// `Arc`-backed) into the Executor and Scheduler.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<Postgres>>,
    pub store: Arc<dyn StoreRepository>,
    pub connectors: Arc<dyn ConnectorRepository>,
    pub jobs: Arc<dyn JobRepository>,
}

impl Database {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        tracing::info!("connecting to database");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        tracing::info!("running migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        let pool = Arc::new(pool);
        Ok(Self {
            pool: pool.clone(),
            store: Arc::new(postgres::store::PgStoreRepo::new(pool.clone())),
            connectors: Arc::new(postgres::connectors::PgConnectorRepo::new(pool.clone())),
            jobs: Arc::new(postgres::jobs::PgJobRepo::new(pool)),
        })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        self.pool.as_ref()
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

/// Errors surfaced by the store, connector, and job repositories.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid timeframe string in row: {0}")]
    InvalidTimeframe(#[from] strum::ParseError),

    #[error("connector `{0}` not found")]
    ConnectorNotFound(String),

    #[error("job `{0}` not found")]
    JobNotFound(uuid::Uuid),

    #[error("rate limit validation failed: {0}")]
    InvalidRateLimit(#[from] crate::shared::error::RateLimitValidationError),

    #[error("optimistic chunk update for {exchange_id}/{symbol}/{timeframe}/{year_month} lost a concurrent write after {attempts} attempts")]
    ChunkWriteConflict {
        exchange_id: String,
        symbol: String,
        timeframe: String,
        year_month: String,
        attempts: u32,
    },
}

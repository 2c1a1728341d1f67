use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error(transparent)]
    Db(#[from] crate::db::error::DbError),

    #[error(transparent)]
    RateLimiter(#[from] crate::rate_limiter::error::RateLimiterError),

    #[error("no exchange client registered for connector `{0}`")]
    UnknownConnector(String),

    #[error("connector `{0}` is not active")]
    ConnectorNotActive(String),

    #[error("exchange rejected every starting point in the historical fallback sequence for job {0}")]
    FallbackSequenceExhausted(uuid::Uuid),

    #[error("run exceeded its execution deadline")]
    DeadlineExceeded,

    #[error("recoverable exchange error: {0}")]
    ExchangeRecoverable(String),

    #[error("fatal exchange error: {0}")]
    Fatal(String),
}

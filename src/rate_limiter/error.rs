use thiserror::Error;

pub type Result<T> = std::result::Result<T, RateLimiterError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RateLimiterError {
    #[error(transparent)]
    Db(#[from] crate::db::error::DbError),

    #[error("wait for slot cancelled before admission for connector `{0}`")]
    Cancelled(String),
}

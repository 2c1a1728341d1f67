use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] crate::db::error::DbError),
}

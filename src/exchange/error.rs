use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Errors surfaced by an [`super::ExchangeClient`] implementation. `Recoverable` errors are
/// retried by the Executor with backoff; `Fatal` errors end the run and mark the job
/// `error` (see `SPEC_FULL.md` §9, status auto-recovery).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExchangeError {
    #[error("recoverable exchange error: {0}")]
    Recoverable(String),

    #[error("fatal exchange error: {0}")]
    Fatal(String),
}

impl ExchangeError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

use thiserror::Error;

/// Indicator calculation failure. Non-fatal to the caller: the Executor logs and
/// persists the raw candles unannotated rather than failing the whole run.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IndicatorError {
    #[error("invalid indicator configuration: {0}")]
    Configuration(String),
}

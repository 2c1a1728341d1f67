use thiserror::Error;

/// Rejects a [`crate::db::models::RateLimit`] that violates the connector invariants:
/// `period_ms >= 1000` and `min_delay_ms >= 100`.
#[derive(Error, Debug)]
pub enum RateLimitValidationError {
    #[error("rate limit `period_ms` must be at least 1000. Value: {value}")]
    PeriodTooShort { value: u64 },

    #[error("rate limit `min_delay_ms` must be at least 100. Value: {value}")]
    MinDelayTooShort { value: u64 },

    #[error("rate limit `limit` must be greater than zero")]
    LimitIsZero,
}

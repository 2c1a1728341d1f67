#![doc = include_str!("../README.md")]

pub mod config;
mod db;
/// Exports [`ExchangeClient`] and the date-range-too-wide detector.
///
/// [`ExchangeClient`]: crate::exchange::ExchangeClient
pub mod exchange;
/// Exports [`Executor`] and its configuration.
///
/// [`Executor`]: crate::executor::Executor
pub mod executor;
/// Exports [`Indicator`] and the dispatch function that annotates candles with them.
///
/// [`Indicator`]: crate::indicators::Indicator
pub mod indicators;
/// Exports [`RateLimiter`] and its configuration.
///
/// [`RateLimiter`]: crate::rate_limiter::RateLimiter
pub mod rate_limiter;
/// Exports [`Scheduler`] and its configuration.
///
/// [`Scheduler`]: crate::scheduler::Scheduler
pub mod scheduler;
mod shared;
mod util;

pub use db::Database;
pub use executor::Executor;
pub use rate_limiter::RateLimiter;
pub use scheduler::Scheduler;

/// Error types returned by `ohlcv-core`.
pub mod error {
    pub use super::config::ConfigError;
    pub use super::db::error::DbError;
    pub use super::exchange::error::ExchangeError;
    pub use super::executor::error::ExecutorError;
    pub use super::indicators::error::IndicatorError;
    pub use super::rate_limiter::error::RateLimiterError;
    pub use super::scheduler::error::SchedulerError;
    pub use super::shared::error::RateLimitValidationError;
    pub use super::util::PanicPayload;

    /// Convenience general-purpose Result type alias.
    pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;
}

/// Exports database models, domain enums, and the indicator tagged-enum.
pub mod models {
    pub use super::db::models::{
        AggregatedDocument, Candle, Connector, ConnectorStatus, Cursor, Gap, Health, HealthStatus,
        Job, JobStatus, OhlcvChunk, RunOutcome, RunRecord, RunState, Schedule, ScheduleMode, Stats,
    };
    pub use super::indicators::Indicator;
    pub use super::shared::{DataQuality, Freshness, Timeframe};

    pub use super::db::models::RateLimit;
}

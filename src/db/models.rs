use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::indicators::Indicator;
use crate::shared::{DataQuality, Freshness, Timeframe};

/// A single OHLCV bar. `indicators` is populated by [`crate::indicators::calculate`] and is
/// `None` for a bar that has not been annotated (or whose indicator calculation failed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicators: Option<Value>,
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candle(ts={}, o={}, h={}, l={}, c={}, v={})",
            self.timestamp_ms, self.open, self.high, self.low, self.close, self.volume
        )
    }
}

/// A monthly-sharded row of the chunked candle store: all candles for one
/// `(exchange_id, symbol, timeframe, year_month)` key, sorted descending by `timestamp_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvChunk {
    pub id: Uuid,
    pub exchange_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub year_month: String,
    pub candles: Vec<Candle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OhlcvChunk {
    /// Newest candle in the shard, if any. Chunks store candles sorted descending, so this
    /// is simply the first element.
    pub fn newest(&self) -> Option<&Candle> {
        self.candles.first()
    }

    /// Oldest candle in the shard.
    pub fn oldest(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

/// A requested window of candles merged across one or more monthly chunks, with detected gaps
/// and a derived quality classification attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedDocument {
    pub exchange_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
    pub gaps: Vec<Gap>,
    pub freshness: Freshness,
    pub quality: DataQuality,
}

/// A detected hole between two adjacent candles whose spacing exceeds the timeframe's gap
/// tolerance (`1.1 * Δ`, see [`crate::util::gap_tolerance`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Gap {
    pub fn missing_bars(&self, timeframe: Timeframe) -> i64 {
        (self.end_ms - self.start_ms) / timeframe.duration_ms()
    }
}

/// Lifecycle state of a [`Connector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ConnectorStatus {
    Active,
    Disabled,
    Error,
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Disabled => write!(f, "disabled"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Exchange connector registration: rate limit, health, and default indicator config shared
/// by every job that targets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub exchange_id: String,
    pub status: ConnectorStatus,
    pub rate_limit: RateLimit,
    pub health: Health,
    pub indicators: Option<Vec<Indicator>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Admission-control parameters for one connector's rate limiter.
///
/// `limit` requests may be admitted per `period_ms`, with at least `min_delay_ms` between any
/// two admissions. Validated by [`crate::shared::error::RateLimitValidationError`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub period_ms: u64,
    pub min_delay_ms: u64,
}

impl RateLimit {
    pub fn validate(&self) -> Result<(), crate::shared::error::RateLimitValidationError> {
        use crate::shared::error::RateLimitValidationError as E;
        if self.limit == 0 {
            return Err(E::LimitIsZero);
        }
        if self.period_ms < 1000 {
            return Err(E::PeriodTooShort { value: self.period_ms });
        }
        if self.min_delay_ms < 100 {
            return Err(E::MinDelayTooShort { value: self.min_delay_ms });
        }
        Ok(())
    }
}

/// Connector health as last observed by the executor, updated after every exchange call via
/// [`crate::db::repositories::ConnectorRepository::record_successful_call`] /
/// `record_failed_call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    pub last_successful_call: Option<DateTime<Utc>>,
    pub last_failed_call: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub average_response_ms: Option<f64>,
    pub uptime_percentage: f64,
    pub last_error: Option<String>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_successful_call: None,
            last_failed_call: None,
            total_calls: 0,
            total_failures: 0,
            average_response_ms: None,
            uptime_percentage: 100.0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Down,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A recurring ingestion job: one `(connector, symbol, timeframe)` triple with its own
/// cursor, schedule, and indicator overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub connector_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub schedule: Schedule,
    pub cursor: Cursor,
    pub status: JobStatus,
    pub indicators: Option<Vec<Indicator>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    /// Consecutive fatal/recoverable run outcomes since the last success, tracked by
    /// [`crate::db::repositories::JobRepository::increment_consecutive_failures`] /
    /// `reset_consecutive_failures`.
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub runs_total: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Error,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Governs when the scheduler fires a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub mode: ScheduleMode,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ScheduleMode {
    /// Fires every `interval_ms`, independent of the job's timeframe.
    Fixed,
    /// Fires once per timeframe bar close, ignoring `interval_ms`.
    TimeframeAligned,
}

/// The job's position in its backfill/live-tail pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_fetched_ms: Option<i64>,
    pub run_state: RunState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RunState {
    /// Still walking backward through history toward the configured start.
    Backfilling,
    /// Caught up; each run fetches only what's new since the cursor.
    Live,
}

/// A single execution's outcome, recorded by the Executor after every run regardless of
/// success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candles_fetched: usize,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success,
    Recoverable { reason: String },
    Fatal { reason: String },
}

/// Aggregate ingestion statistics surfaced over the store's external query interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub exchange_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candle_count: i64,
    pub oldest_ms: Option<i64>,
    pub newest_ms: Option<i64>,
    pub gap_count: usize,
    pub freshness: Freshness,
    pub quality: DataQuality,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_rejects_zero_limit() {
        let rl = RateLimit { limit: 0, period_ms: 1000, min_delay_ms: 100 };
        assert!(rl.validate().is_err());
    }

    #[test]
    fn rate_limit_rejects_short_period() {
        let rl = RateLimit { limit: 1, period_ms: 999, min_delay_ms: 100 };
        assert!(rl.validate().is_err());
    }

    #[test]
    fn rate_limit_rejects_short_min_delay() {
        let rl = RateLimit { limit: 1, period_ms: 1000, min_delay_ms: 99 };
        assert!(rl.validate().is_err());
    }

    #[test]
    fn rate_limit_accepts_valid_config() {
        let rl = RateLimit { limit: 10, period_ms: 1000, min_delay_ms: 100 };
        assert!(rl.validate().is_ok());
    }

    #[test]
    fn gap_missing_bars_counts_whole_units() {
        let gap = Gap { start_ms: 0, end_ms: 3 * Timeframe::OneHour.duration_ms() };
        assert_eq!(gap.missing_bars(Timeframe::OneHour), 3);
    }

    #[test]
    fn chunk_newest_and_oldest_follow_descending_order() {
        let chunk = OhlcvChunk {
            id: Uuid::nil(),
            exchange_id: "binance".into(),
            symbol: "BTC-USD".into(),
            timeframe: "1h".into(),
            year_month: "2026-01".into(),
            candles: vec![
                Candle {
                    timestamp_ms: 2000,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                    indicators: None,
                },
                Candle {
                    timestamp_ms: 1000,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                    indicators: None,
                },
            ],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(chunk.newest().unwrap().timestamp_ms, 2000);
        assert_eq!(chunk.oldest().unwrap().timestamp_ms, 1000);
    }
}

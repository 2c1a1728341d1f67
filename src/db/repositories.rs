use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::shared::Timeframe;

use super::{
    error::Result,
    models::{AggregatedDocument, Candle, Connector, ConnectorStatus, Cursor, Health, Job, JobStatus, RunRecord, Stats},
};

/// The chunked candle store: merges incoming candles into monthly shards, answers range
/// queries with gap detection and quality classification attached.
#[async_trait]
pub trait StoreRepository: Send + Sync {
    /// Merges `candles` into the relevant monthly chunks, deduplicating by timestamp.
    /// Returns the number of genuinely new candles written.
    async fn upsert_candles(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<usize>;

    /// Returns the merged, gap-annotated view of `[start_ms, end_ms)`.
    async fn get_range(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<AggregatedDocument>;

    /// Convenience wrapper over [`Self::get_range`] for a job's own
    /// `(connector_id, symbol, timeframe)` triple.
    async fn find_by_job(&self, job: &Job, start_ms: i64, end_ms: i64) -> Result<AggregatedDocument> {
        self.get_range(&job.connector_id, &job.symbol, job.timeframe, start_ms, end_ms).await
    }

    /// Returns the newest stored candle's timestamp, if any, for cursor initialization.
    async fn newest_timestamp(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<i64>>;

    /// Returns the single newest stored candle, if any.
    async fn get_last_candle(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>>;

    /// Returns up to `limit` of the most recent candles, ascending by timestamp.
    async fn get_recent_candles(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    /// Returns up to `limit` candles at or after `cursor_ms` (or from the beginning of the
    /// series if `None`), ascending by timestamp, plus the cursor to pass for the next page
    /// (`None` once the series is exhausted).
    async fn find_with_pagination(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        cursor_ms: Option<i64>,
        limit: usize,
    ) -> Result<(Vec<Candle>, Option<i64>)>;

    /// Total number of candles stored for this triple.
    async fn count(&self, exchange_id: &str, symbol: &str, timeframe: Timeframe) -> Result<i64>;

    /// Deletes every stored candle for this triple. Returns the number of chunks removed.
    async fn delete_by_job(&self, exchange_id: &str, symbol: &str, timeframe: Timeframe) -> Result<u64>;

    async fn get_stats(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Stats>;

    /// Stats for every `(symbol, timeframe)` series stored under `exchange_id`.
    async fn get_stats_by_exchange(&self, exchange_id: &str) -> Result<Vec<Stats>>;

    /// Stats for every series stored across all exchanges.
    async fn get_all_stats(&self) -> Result<Vec<Stats>>;
}

/// Connector registration, health tracking, and persisted rate-limit admission state.
#[async_trait]
pub trait ConnectorRepository: Send + Sync {
    async fn get(&self, connector_id: &str) -> Result<Connector>;

    async fn list_active(&self) -> Result<Vec<Connector>>;

    async fn update_health(&self, connector_id: &str, health: Health) -> Result<()>;

    async fn update_status(&self, connector_id: &str, status: ConnectorStatus) -> Result<()>;

    /// Atomically admits one call against the connector's persisted `(usage, period_start,
    /// last_api_call_at)` state, rolling the period over if it has elapsed and honoring
    /// `min_delay_ms` between calls. Returns `true` if a token was granted. This is the
    /// authoritative, cross-process gate behind [`crate::rate_limiter::RateLimiter`].
    async fn acquire_rate_limit_token(&self, connector_id: &str) -> Result<bool>;

    /// Manually resets the admission window, e.g. after an operator raises the configured
    /// limit and wants it to take effect immediately.
    async fn reset_rate_limit_period(&self, connector_id: &str) -> Result<()>;

    /// Increments `usage` without the admission check `acquire_rate_limit_token` performs,
    /// for callers that already know a call is permitted (e.g. replaying a recorded batch).
    async fn increment_api_usage(&self, connector_id: &str) -> Result<()>;

    /// Records a successful exchange call: advances `total_calls`, `last_successful_call`,
    /// the running `average_response_ms`, and `uptime_percentage`.
    async fn record_successful_call(&self, connector_id: &str, response_ms: f64) -> Result<()>;

    /// Records a failed exchange call: advances `total_calls`/`total_failures`,
    /// `last_failed_call`, `last_error`, and `uptime_percentage`, downgrading `status`.
    async fn record_failed_call(&self, connector_id: &str, error: &str) -> Result<()>;
}

/// Job definitions, locking, and run bookkeeping. `try_acquire_lock`/`release_lock` are the
/// cross-process coordination primitive: any number of scheduler instances may poll the same
/// table safely because acquisition is a single atomic conditional update.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get(&self, job_id: Uuid) -> Result<Job>;

    /// Jobs whose schedule says they are due to run at `now`, excluding ones currently locked.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Atomically claims `job_id` for `lease` if it is unlocked or its lease has expired.
    /// Returns `None` if another owner holds a live lock.
    async fn try_acquire_lock(
        &self,
        job_id: Uuid,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>>;

    async fn release_lock(&self, job_id: Uuid, owner: &str) -> Result<()>;

    async fn update_cursor(&self, job_id: Uuid, cursor: Cursor) -> Result<()>;

    /// Records the run's history row and, atomically, clears the job's lock, sets
    /// `last_error` (or clears it on success), and increments `runs_total`.
    async fn record_run(&self, run: RunRecord) -> Result<()>;

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<()>;

    /// Increments `consecutive_failures` and returns the new count.
    async fn increment_consecutive_failures(&self, job_id: Uuid) -> Result<u32>;

    async fn reset_consecutive_failures(&self, job_id: Uuid) -> Result<()>;
}

//! Executor: runs one job's fetch/annotate/persist pipeline to completion.
//!
//! Mirrors the teacher's `sync_price_history_task` pipeline (backfill, then live-tail,
//! bounded by a per-run deadline) generalized from LNM price history to arbitrary
//! `(connector, symbol, timeframe)` jobs. `Execute` owns the job's lock for the duration of
//! the run: it claims it via `JobRepository::try_acquire_lock` and releases it (indirectly,
//! via `record_run`) before returning, so mutual exclusion holds even if this method is
//! driven by something other than `Scheduler`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::db::models::{Candle, ConnectorStatus, Cursor, Job, RunOutcome, RunRecord, RunState};
use crate::db::repositories::{ConnectorRepository, JobRepository, StoreRepository};
use crate::exchange::{error::ExchangeError, is_date_range_too_wide, ExchangeClient};
use crate::indicators;
use crate::rate_limiter::RateLimiter;

pub mod config;
pub mod error;

use config::ExecutorConfig;
use error::{ExecutorError, Result};

const DAY_MS: i64 = 86_400_000;

pub struct Executor {
    store: Arc<dyn StoreRepository>,
    connectors: Arc<dyn ConnectorRepository>,
    jobs: Arc<dyn JobRepository>,
    rate_limiter: Arc<RateLimiter>,
    exchange_clients: HashMap<String, Arc<dyn ExchangeClient>>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        store: Arc<dyn StoreRepository>,
        connectors: Arc<dyn ConnectorRepository>,
        jobs: Arc<dyn JobRepository>,
        rate_limiter: Arc<RateLimiter>,
        exchange_clients: HashMap<String, Arc<dyn ExchangeClient>>,
        config: ExecutorConfig,
    ) -> Self {
        Self { store, connectors, jobs, rate_limiter, exchange_clients, config }
    }

    /// Claims `job`'s lock, runs it once, and records the outcome. Returns `Ok(None)` without
    /// touching anything else if another owner already holds a live lock — that's a normal
    /// "someone else is already running this" skip, not an error. Cursor is updated before
    /// the run is recorded and never the reverse (Design Note "Cursor vs RecordRun ordering").
    pub async fn execute(&self, job: &Job) -> Result<Option<RunRecord>> {
        let locked_job = match self
            .jobs
            .try_acquire_lock(job.id, &self.config.owner_id, self.config.job_lock_ttl)
            .await?
        {
            Some(locked_job) => locked_job,
            None => return Ok(None),
        };

        let started_at = Utc::now();
        let token = CancellationToken::new();
        let deadline_token = token.clone();
        let deadline = self.config.execution_deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            deadline_token.cancel();
        });

        let outcome = tokio::time::timeout(deadline, self.run_pipeline(&locked_job, &token)).await;

        let (candles_fetched, outcome) = match outcome {
            Ok(Ok(count)) => (count, RunOutcome::Success),
            Ok(Err(ExecutorError::Fatal(reason))) => (0, RunOutcome::Fatal { reason }),
            Ok(Err(e)) => (0, RunOutcome::Recoverable { reason: e.to_string() }),
            Err(_) => (0, RunOutcome::Recoverable { reason: "execution deadline exceeded".to_string() }),
        };

        if matches!(outcome, RunOutcome::Success) {
            if let Err(e) = self.jobs.reset_consecutive_failures(job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to reset consecutive failure count");
            }
        } else if let Err(e) = self.jobs.increment_consecutive_failures(job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to record consecutive failure count");
        }

        let run = RunRecord {
            job_id: job.id,
            started_at,
            finished_at: Utc::now(),
            candles_fetched,
            outcome,
        };

        self.jobs.record_run(run.clone()).await?;
        Ok(Some(run))
    }

    /// Fetches every page since the job's cursor, bounded by the exchange's batch limit,
    /// annotates with indicators, and persists. Paginates until the exchange reports it's
    /// caught up (a page shorter than `limit`) or the run's deadline/cancellation fires.
    async fn run_pipeline(&self, job: &Job, token: &CancellationToken) -> Result<usize> {
        let connector = self.connectors.get(&job.connector_id).await?;
        if connector.status != ConnectorStatus::Active {
            return Err(ExecutorError::ConnectorNotActive(job.connector_id.clone()));
        }

        let client = self
            .exchange_clients
            .get(&job.connector_id)
            .ok_or_else(|| ExecutorError::UnknownConnector(job.connector_id.clone()))?
            .clone();

        let exchange_limit = client
            .max_batch_limit(&job.connector_id)
            .await
            .map_err(map_exchange_err)?;
        let limit = self.config.default_batch_limit.min(exchange_limit).max(1);

        let (mut since_ms, mut candles) = self.resolve_since(client.as_ref(), job, limit, token).await?;
        let mut caught_up = candles.len() < limit as usize;

        while !caught_up {
            if token.is_cancelled() {
                break;
            }
            self.rate_limiter.wait_for_slot(&job.connector_id, token).await?;

            let call_started = Instant::now();
            match client.fetch_ohlcv(&job.symbol, job.timeframe, since_ms, limit).await {
                Ok(page) => {
                    let response_ms = call_started.elapsed().as_millis() as f64;
                    self.connectors.record_successful_call(&job.connector_id, response_ms).await?;

                    let page_len = page.len();
                    if let Some(max_ts) = page.iter().map(|c| c.timestamp_ms).max() {
                        since_ms = max_ts + 1;
                    }
                    candles.extend(page);
                    caught_up = page_len < limit as usize;
                }
                Err(e) => {
                    self.connectors.record_failed_call(&job.connector_id, &e.to_string()).await?;
                    return Err(map_exchange_err(e));
                }
            }
        }

        let fetched_count = candles.len();
        candles.sort_by_key(|c| c.timestamp_ms);
        candles.dedup_by_key(|c| c.timestamp_ms);

        let defaults = indicators::builtin_defaults();
        let effective = indicators::effective_config(
            job.indicators.as_deref(),
            connector.indicators.as_deref(),
            &defaults,
        );
        if let Err(e) = indicators::calculate(&mut candles, effective) {
            tracing::warn!(job_id = %job.id, error = %e, "indicator calculation failed, persisting raw candles");
        }

        self.store
            .upsert_candles(&job.connector_id, &job.symbol, job.timeframe, candles)
            .await?;

        let new_run_state = if caught_up { RunState::Live } else { job.cursor.run_state };
        let new_cursor = Cursor { last_fetched_ms: Some(since_ms - 1), run_state: new_run_state };
        self.jobs.update_cursor(job.id, new_cursor).await?;

        Ok(fetched_count)
    }

    /// Resolves the `since_ms` to request for the first page of this run, plus that page
    /// itself. When the job already has a cursor, this is simply the point right after it.
    /// Otherwise this walks `historical_window_fallback_months` in order, shrinking the
    /// requested depth on every "too far in the past" rejection, until the exchange accepts
    /// a starting point.
    async fn resolve_since(
        &self,
        client: &dyn ExchangeClient,
        job: &Job,
        limit: u32,
        token: &CancellationToken,
    ) -> Result<(i64, Vec<Candle>)> {
        if let Some(last) = job.cursor.last_fetched_ms {
            let since = last + 1;
            self.rate_limiter.wait_for_slot(&job.connector_id, token).await?;
            return self.fetch_first_page(client, job, since, limit).await;
        }

        let now_ms = Utc::now().timestamp_millis();
        for &months in &self.config.historical_window_fallback_months {
            let since = now_ms - months as i64 * 30 * DAY_MS;
            self.rate_limiter.wait_for_slot(&job.connector_id, token).await?;

            match self.fetch_first_page(client, job, since, limit).await {
                Ok(result) => return Ok(result),
                Err(ExecutorError::Fatal(reason)) if is_date_range_too_wide(&reason) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(ExecutorError::FallbackSequenceExhausted(job.id))
    }

    async fn fetch_first_page(
        &self,
        client: &dyn ExchangeClient,
        job: &Job,
        since_ms: i64,
        limit: u32,
    ) -> Result<(i64, Vec<Candle>)> {
        let call_started = Instant::now();
        match client.fetch_ohlcv(&job.symbol, job.timeframe, since_ms, limit).await {
            Ok(page) => {
                let response_ms = call_started.elapsed().as_millis() as f64;
                self.connectors.record_successful_call(&job.connector_id, response_ms).await?;
                let next_since = page.iter().map(|c| c.timestamp_ms).max().map(|t| t + 1).unwrap_or(since_ms);
                Ok((next_since, page))
            }
            Err(e) => {
                self.connectors.record_failed_call(&job.connector_id, &e.to_string()).await?;
                Err(map_exchange_err(e))
            }
        }
    }
}

fn map_exchange_err(e: ExchangeError) -> ExecutorError {
    match e {
        ExchangeError::Recoverable(reason) => ExecutorError::ExchangeRecoverable(reason),
        ExchangeError::Fatal(reason) => ExecutorError::Fatal(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::error::Result as DbResult;
    use crate::db::models::{
        AggregatedDocument, Connector, Health, RateLimit, Schedule, ScheduleMode, Stats,
    };
    use crate::exchange::MockExchangeClient;
    use crate::shared::{DataQuality, Freshness, Timeframe};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    struct InMemoryStore {
        candles: StdMutex<Vec<Candle>>,
    }

    #[async_trait]
    impl StoreRepository for InMemoryStore {
        async fn upsert_candles(
            &self,
            _exchange_id: &str,
            _symbol: &str,
            _timeframe: Timeframe,
            candles: Vec<Candle>,
        ) -> DbResult<usize> {
            let mut store = self.candles.lock().unwrap();
            let before = store.len();
            store.extend(candles);
            Ok(store.len() - before)
        }

        async fn get_range(
            &self,
            exchange_id: &str,
            symbol: &str,
            timeframe: Timeframe,
            _start_ms: i64,
            _end_ms: i64,
        ) -> DbResult<AggregatedDocument> {
            Ok(AggregatedDocument {
                exchange_id: exchange_id.to_string(),
                symbol: symbol.to_string(),
                timeframe,
                candles: self.candles.lock().unwrap().clone(),
                gaps: Vec::new(),
                freshness: Freshness::Fresh,
                quality: DataQuality::Excellent,
            })
        }

        async fn newest_timestamp(
            &self,
            _exchange_id: &str,
            _symbol: &str,
            _timeframe: Timeframe,
        ) -> DbResult<Option<i64>> {
            Ok(self.candles.lock().unwrap().iter().map(|c| c.timestamp_ms).max())
        }

        async fn get_last_candle(
            &self,
            _exchange_id: &str,
            _symbol: &str,
            _timeframe: Timeframe,
        ) -> DbResult<Option<Candle>> {
            let candles = self.candles.lock().unwrap();
            Ok(candles.iter().max_by_key(|c| c.timestamp_ms).cloned())
        }

        async fn get_recent_candles(
            &self,
            _exchange_id: &str,
            _symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> DbResult<Vec<Candle>> {
            let mut candles = self.candles.lock().unwrap().clone();
            candles.sort_by_key(|c| c.timestamp_ms);
            if candles.len() > limit {
                candles.drain(0..candles.len() - limit);
            }
            Ok(candles)
        }

        async fn find_with_pagination(
            &self,
            _exchange_id: &str,
            _symbol: &str,
            _timeframe: Timeframe,
            _cursor_ms: Option<i64>,
            _limit: usize,
        ) -> DbResult<(Vec<Candle>, Option<i64>)> {
            Ok((self.candles.lock().unwrap().clone(), None))
        }

        async fn count(&self, _exchange_id: &str, _symbol: &str, _timeframe: Timeframe) -> DbResult<i64> {
            Ok(self.candles.lock().unwrap().len() as i64)
        }

        async fn delete_by_job(&self, _exchange_id: &str, _symbol: &str, _timeframe: Timeframe) -> DbResult<u64> {
            let mut candles = self.candles.lock().unwrap();
            let had = !candles.is_empty();
            candles.clear();
            Ok(had as u64)
        }

        async fn get_stats(
            &self,
            exchange_id: &str,
            symbol: &str,
            timeframe: Timeframe,
        ) -> DbResult<Stats> {
            let candles = self.candles.lock().unwrap();
            Ok(Stats {
                exchange_id: exchange_id.to_string(),
                symbol: symbol.to_string(),
                timeframe,
                candle_count: candles.len() as i64,
                oldest_ms: candles.iter().map(|c| c.timestamp_ms).min(),
                newest_ms: candles.iter().map(|c| c.timestamp_ms).max(),
                gap_count: 0,
                freshness: Freshness::Fresh,
                quality: DataQuality::Excellent,
            })
        }

        async fn get_stats_by_exchange(&self, _exchange_id: &str) -> DbResult<Vec<Stats>> {
            Ok(Vec::new())
        }

        async fn get_all_stats(&self) -> DbResult<Vec<Stats>> {
            Ok(Vec::new())
        }
    }

    struct InMemoryConnectors {
        rate_limit: RateLimit,
        status: ConnectorStatus,
        successful_calls: AtomicU32,
        failed_calls: AtomicU32,
    }

    impl InMemoryConnectors {
        fn new(rate_limit: RateLimit) -> Self {
            Self {
                rate_limit,
                status: ConnectorStatus::Active,
                successful_calls: AtomicU32::new(0),
                failed_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ConnectorRepository for InMemoryConnectors {
        async fn get(&self, connector_id: &str) -> DbResult<Connector> {
            Ok(Connector {
                id: connector_id.to_string(),
                exchange_id: connector_id.to_string(),
                status: self.status,
                rate_limit: self.rate_limit,
                health: Health::default(),
                indicators: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
        }

        async fn list_active(&self) -> DbResult<Vec<Connector>> {
            Ok(Vec::new())
        }

        async fn update_health(&self, _connector_id: &str, _health: Health) -> DbResult<()> {
            Ok(())
        }

        async fn update_status(&self, _connector_id: &str, _status: ConnectorStatus) -> DbResult<()> {
            Ok(())
        }

        async fn acquire_rate_limit_token(&self, _connector_id: &str) -> DbResult<bool> {
            Ok(true)
        }

        async fn reset_rate_limit_period(&self, _connector_id: &str) -> DbResult<()> {
            Ok(())
        }

        async fn increment_api_usage(&self, _connector_id: &str) -> DbResult<()> {
            Ok(())
        }

        async fn record_successful_call(&self, _connector_id: &str, _response_ms: f64) -> DbResult<()> {
            self.successful_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn record_failed_call(&self, _connector_id: &str, _error: &str) -> DbResult<()> {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Holds the job record itself (unlike the real `jobs` table, reachable only through
    /// `Uuid`) so `try_acquire_lock` can hand back the up-to-date row the way Postgres's
    /// `UPDATE ... RETURNING` does.
    struct InMemoryJobs {
        job: StdMutex<Job>,
        runs: StdMutex<Vec<RunRecord>>,
        locked: StdMutex<bool>,
        consecutive_failures: AtomicU32,
    }

    impl InMemoryJobs {
        fn new(job: Job) -> Self {
            Self {
                job: StdMutex::new(job),
                runs: StdMutex::new(Vec::new()),
                locked: StdMutex::new(false),
                consecutive_failures: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl JobRepository for InMemoryJobs {
        async fn get(&self, _job_id: Uuid) -> DbResult<Job> {
            Ok(self.job.lock().unwrap().clone())
        }

        async fn list_due(&self, _now: chrono::DateTime<Utc>) -> DbResult<Vec<Job>> {
            Ok(Vec::new())
        }

        async fn try_acquire_lock(
            &self,
            _job_id: Uuid,
            _owner: &str,
            _lease: ChronoDuration,
        ) -> DbResult<Option<Job>> {
            let mut locked = self.locked.lock().unwrap();
            if *locked {
                return Ok(None);
            }
            *locked = true;
            Ok(Some(self.job.lock().unwrap().clone()))
        }

        async fn release_lock(&self, _job_id: Uuid, _owner: &str) -> DbResult<()> {
            *self.locked.lock().unwrap() = false;
            Ok(())
        }

        async fn update_cursor(&self, _job_id: Uuid, cursor: Cursor) -> DbResult<()> {
            self.job.lock().unwrap().cursor = cursor;
            Ok(())
        }

        async fn record_run(&self, run: RunRecord) -> DbResult<()> {
            *self.locked.lock().unwrap() = false;
            self.runs.lock().unwrap().push(run);
            Ok(())
        }

        async fn set_status(&self, _job_id: Uuid, _status: crate::db::models::JobStatus) -> DbResult<()> {
            Ok(())
        }

        async fn increment_consecutive_failures(&self, _job_id: Uuid) -> DbResult<u32> {
            Ok(self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn reset_consecutive_failures(&self, _job_id: Uuid) -> DbResult<()> {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_job(run_state: RunState, last_fetched_ms: Option<i64>) -> Job {
        Job {
            id: Uuid::new_v4(),
            connector_id: "binance".to_string(),
            symbol: "BTC-USD".to_string(),
            timeframe: Timeframe::OneMinute,
            schedule: Schedule { mode: ScheduleMode::Fixed, interval_ms: 60_000 },
            cursor: Cursor { last_fetched_ms, run_state },
            status: crate::db::models::JobStatus::Pending,
            indicators: None,
            locked_until: None,
            locked_by: None,
            consecutive_failures: 0,
            last_error: None,
            runs_total: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn candle_at(ts: i64) -> Candle {
        Candle { timestamp_ms: ts, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0, indicators: None }
    }

    #[tokio::test]
    async fn live_run_advances_cursor_before_recording_success() {
        let now_ms = Utc::now().timestamp_millis();
        let job = sample_job(RunState::Live, Some(now_ms - 5 * 60_000));

        let candles = vec![candle_at(now_ms - 60_000)];

        let store = Arc::new(InMemoryStore { candles: StdMutex::new(Vec::new()) });
        let connectors = Arc::new(InMemoryConnectors::new(RateLimit { limit: 100, period_ms: 1000, min_delay_ms: 0 }));
        let jobs = Arc::new(InMemoryJobs::new(job.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(connectors.clone()));

        let mut clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
        clients.insert("binance".to_string(), Arc::new(MockExchangeClient::new(candles)));

        let executor = Executor::new(store, connectors, jobs.clone(), rate_limiter, clients, ExecutorConfig::default());
        let run = executor.execute(&job).await.unwrap().expect("lock is free");

        assert!(matches!(run.outcome, RunOutcome::Success));
        assert!(jobs.job.lock().unwrap().cursor.last_fetched_ms.is_some());
        assert_eq!(jobs.runs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_connector_is_reported_as_recoverable() {
        let job = sample_job(RunState::Live, None);
        let store = Arc::new(InMemoryStore { candles: StdMutex::new(Vec::new()) });
        let connectors = Arc::new(InMemoryConnectors::new(RateLimit { limit: 100, period_ms: 1000, min_delay_ms: 0 }));
        let jobs = Arc::new(InMemoryJobs::new(job.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(connectors.clone()));

        let executor =
            Executor::new(store, connectors, jobs.clone(), rate_limiter, HashMap::new(), ExecutorConfig::default());
        let run = executor.execute(&job).await.unwrap().expect("lock is free");

        assert!(matches!(run.outcome, RunOutcome::Recoverable { .. }));
    }

    #[tokio::test]
    async fn already_locked_job_is_skipped_without_recording_a_run() {
        let job = sample_job(RunState::Live, None);
        let store = Arc::new(InMemoryStore { candles: StdMutex::new(Vec::new()) });
        let connectors = Arc::new(InMemoryConnectors::new(RateLimit { limit: 100, period_ms: 1000, min_delay_ms: 0 }));
        let jobs = Arc::new(InMemoryJobs::new(job.clone()));
        *jobs.locked.lock().unwrap() = true;
        let rate_limiter = Arc::new(RateLimiter::new(connectors.clone()));

        let executor =
            Executor::new(store, connectors, jobs.clone(), rate_limiter, HashMap::new(), ExecutorConfig::default());
        let run = executor.execute(&job).await.unwrap();

        assert!(run.is_none());
        assert!(jobs.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn connector_not_active_fails_the_run() {
        let job = sample_job(RunState::Live, None);
        let store = Arc::new(InMemoryStore { candles: StdMutex::new(Vec::new()) });
        let connectors = Arc::new(InMemoryConnectors {
            status: ConnectorStatus::Disabled,
            ..InMemoryConnectors::new(RateLimit { limit: 100, period_ms: 1000, min_delay_ms: 0 })
        });
        let jobs = Arc::new(InMemoryJobs::new(job.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(connectors.clone()));

        let mut clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
        clients.insert("binance".to_string(), Arc::new(MockExchangeClient::new(Vec::new())));

        let executor = Executor::new(store, connectors, jobs.clone(), rate_limiter, clients, ExecutorConfig::default());
        let run = executor.execute(&job).await.unwrap().expect("lock is free");

        match &run.outcome {
            RunOutcome::Recoverable { reason } => assert!(reason.contains("not active")),
            other => panic!("expected a recoverable outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn backfill_paginates_until_a_short_page_signals_caught_up() {
        let job = sample_job(RunState::Backfilling, Some(0));

        let candles: Vec<Candle> = (1..=1200).map(|i| candle_at(i * 60_000)).collect();

        let store = Arc::new(InMemoryStore { candles: StdMutex::new(Vec::new()) });
        let connectors = Arc::new(InMemoryConnectors::new(RateLimit { limit: 1000, period_ms: 1000, min_delay_ms: 0 }));
        let jobs = Arc::new(InMemoryJobs::new(job.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(connectors.clone()));

        let mut client = MockExchangeClient::new(candles);
        client.max_batch_limit = 400;
        let mut clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
        clients.insert("binance".to_string(), Arc::new(client));

        let executor = Executor::new(
            store.clone(),
            connectors.clone(),
            jobs.clone(),
            rate_limiter,
            clients,
            ExecutorConfig::default().with_default_batch_limit(400),
        );
        let run = executor.execute(&job).await.unwrap().expect("lock is free");

        assert!(matches!(run.outcome, RunOutcome::Success));
        assert_eq!(run.candles_fetched, 1200);
        assert_eq!(store.candles.lock().unwrap().len(), 1200);
        assert_eq!(jobs.job.lock().unwrap().cursor.run_state, RunState::Live);
        // 1200 / 400 = 3 full pages plus one short (empty) page confirming exhaustion.
        assert_eq!(connectors.successful_calls.load(Ordering::SeqCst), 4);
    }
}

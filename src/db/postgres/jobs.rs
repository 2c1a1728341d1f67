use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::db::error::{DbError, Result};
use crate::db::models::{
    Cursor, Job, JobStatus, RunOutcome, RunRecord, RunState, Schedule, ScheduleMode,
};
use crate::db::repositories::JobRepository;
use crate::indicators::Indicator;
use crate::shared::Timeframe;

pub(crate) struct PgJobRepo {
    pool: Arc<Pool<Postgres>>,
}

impl PgJobRepo {
    pub fn new(pool: Arc<Pool<Postgres>>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &Pool<Postgres> {
        self.pool.as_ref()
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    connector_exchange_id: String,
    symbol: String,
    timeframe: String,
    status: JobStatus,
    schedule_mode: String,
    schedule_interval_ms: i64,
    last_candle_time: Option<DateTime<Utc>>,
    run_state: String,
    indicators: Option<sqlx::types::Json<Vec<Indicator>>>,
    locked_until: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    consecutive_failures: i32,
    last_error: Option<String>,
    runs_total: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> std::result::Result<Self, Self::Error> {
        let timeframe = Timeframe::from_str(&row.timeframe)?;
        let mode = match row.schedule_mode.as_str() {
            "timeframe_aligned" => ScheduleMode::TimeframeAligned,
            _ => ScheduleMode::Fixed,
        };
        let run_state = match row.run_state.as_str() {
            "live" => RunState::Live,
            _ => RunState::Backfilling,
        };

        Ok(Job {
            id: row.id,
            connector_id: row.connector_exchange_id,
            symbol: row.symbol,
            timeframe,
            schedule: Schedule { mode, interval_ms: row.schedule_interval_ms as u64 },
            cursor: Cursor {
                last_fetched_ms: row.last_candle_time.map(|t| t.timestamp_millis()),
                run_state,
            },
            status: row.status,
            indicators: row.indicators.map(|j| j.0),
            locked_until: row.locked_until,
            locked_by: row.locked_by,
            consecutive_failures: row.consecutive_failures as u32,
            last_error: row.last_error,
            runs_total: row.runs_total as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, connector_exchange_id, symbol, timeframe, status, schedule_mode, \
    schedule_interval_ms, last_candle_time, run_state, indicators, locked_until, locked_by, \
    consecutive_failures, last_error, runs_total, created_at, updated_at";

#[async_trait]
impl JobRepository for PgJobRepo {
    async fn get(&self, job_id: Uuid) -> Result<Job> {
        let row: JobRow = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(DbError::JobNotFound(job_id))?;

        row.try_into()
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status IN ('pending', 'running') \
               AND (locked_until IS NULL OR locked_until <= $1) \
             ORDER BY last_candle_time ASC NULLS FIRST",
        ))
        .bind(now)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn try_acquire_lock(
        &self,
        job_id: Uuid,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let new_lease = now + lease;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET locked_until = $2, locked_by = $3 \
             WHERE id = $1 AND (locked_until IS NULL OR locked_until <= $4) \
             RETURNING {JOB_COLUMNS}",
        ))
        .bind(job_id)
        .bind(new_lease)
        .bind(owner)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn release_lock(&self, job_id: Uuid, owner: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET locked_until = NULL, locked_by = NULL \
             WHERE id = $1 AND locked_by = $2",
        )
        .bind(job_id)
        .bind(owner)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn update_cursor(&self, job_id: Uuid, cursor: Cursor) -> Result<()> {
        let run_state_str = match cursor.run_state {
            RunState::Backfilling => "backfilling",
            RunState::Live => "live",
        };
        let last_candle_time = cursor
            .last_fetched_ms
            .and_then(DateTime::from_timestamp_millis);

        sqlx::query(
            "UPDATE jobs SET last_candle_time = $2, run_state = $3 WHERE id = $1",
        )
        .bind(job_id)
        .bind(last_candle_time)
        .bind(run_state_str)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn record_run(&self, run: RunRecord) -> Result<()> {
        let (outcome, error_detail) = match &run.outcome {
            RunOutcome::Success => ("success", None),
            RunOutcome::Recoverable { reason } => ("recoverable", Some(reason.clone())),
            RunOutcome::Fatal { reason } => ("fatal", Some(reason.clone())),
        };

        sqlx::query(
            "INSERT INTO job_runs \
                (job_id, started_at, finished_at, candles_fetched, outcome, error_detail) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(run.job_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.candles_fetched as i64)
        .bind(outcome)
        .bind(error_detail.clone())
        .execute(self.pool())
        .await?;

        // Recording a run always releases the lock this Executor run claimed: the job's
        // execution has finished one way or another.
        sqlx::query(
            "UPDATE jobs SET \
                locked_until = NULL, locked_by = NULL, \
                last_error = $2, runs_total = runs_total + 1 \
             WHERE id = $1",
        )
        .bind(run.job_id)
        .bind(error_detail)
        .execute(self.pool())
        .await?;

        if matches!(run.outcome, RunOutcome::Fatal { .. }) {
            self.set_status(run.job_id, JobStatus::Error).await?;
        }

        Ok(())
    }

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = $2 WHERE id = $1")
            .bind(job_id)
            .bind(status.to_string())
            .execute(self.pool())
            .await?;

        Ok(())
    }

    async fn increment_consecutive_failures(&self, job_id: Uuid) -> Result<u32> {
        let (count,): (i32,) = sqlx::query_as(
            "UPDATE jobs SET consecutive_failures = consecutive_failures + 1 \
             WHERE id = $1 RETURNING consecutive_failures",
        )
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(DbError::JobNotFound(job_id))?;

        Ok(count as u32)
    }

    async fn reset_consecutive_failures(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET consecutive_failures = 0 WHERE id = $1")
            .bind(job_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }
}

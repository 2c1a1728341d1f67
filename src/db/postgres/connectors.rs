use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::db::error::{DbError, Result};
use crate::db::models::{Connector, ConnectorStatus, Health};
use crate::db::repositories::ConnectorRepository;
use crate::indicators::Indicator;

pub(crate) struct PgConnectorRepo {
    pool: Arc<Pool<Postgres>>,
}

impl PgConnectorRepo {
    pub fn new(pool: Arc<Pool<Postgres>>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &Pool<Postgres> {
        self.pool.as_ref()
    }
}

const CONNECTOR_COLUMNS: &str = "exchange_id, status, rate_limit_limit, rate_limit_period_ms, \
    rate_limit_min_delay_ms, health_status, health_last_successful_call_at, \
    health_last_failed_call_at, health_total_calls, health_total_failures, \
    health_average_response_ms, health_uptime_percentage, health_last_error, indicators, \
    created_at, updated_at";

#[derive(sqlx::FromRow)]
struct ConnectorRow {
    exchange_id: String,
    status: ConnectorStatus,
    rate_limit_limit: i32,
    rate_limit_period_ms: i64,
    rate_limit_min_delay_ms: i64,
    health_status: String,
    health_last_successful_call_at: Option<chrono::DateTime<chrono::Utc>>,
    health_last_failed_call_at: Option<chrono::DateTime<chrono::Utc>>,
    health_total_calls: i64,
    health_total_failures: i64,
    health_average_response_ms: Option<f64>,
    health_uptime_percentage: f64,
    health_last_error: Option<String>,
    indicators: Option<sqlx::types::Json<Vec<Indicator>>>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<ConnectorRow> for Connector {
    type Error = DbError;

    fn try_from(row: ConnectorRow) -> std::result::Result<Self, Self::Error> {
        use crate::db::models::{HealthStatus, RateLimit};

        let health_status = match row.health_status.as_str() {
            "healthy" => HealthStatus::Healthy,
            "degraded" => HealthStatus::Degraded,
            "down" => HealthStatus::Down,
            _ => HealthStatus::Unknown,
        };

        Ok(Connector {
            id: row.exchange_id.clone(),
            exchange_id: row.exchange_id,
            status: row.status,
            rate_limit: RateLimit {
                limit: row.rate_limit_limit as u32,
                period_ms: row.rate_limit_period_ms as u64,
                min_delay_ms: row.rate_limit_min_delay_ms as u64,
            },
            health: Health {
                status: health_status,
                last_successful_call: row.health_last_successful_call_at,
                last_failed_call: row.health_last_failed_call_at,
                total_calls: row.health_total_calls as u64,
                total_failures: row.health_total_failures as u64,
                average_response_ms: row.health_average_response_ms,
                uptime_percentage: row.health_uptime_percentage,
                last_error: row.health_last_error,
            },
            indicators: row.indicators.map(|j| j.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl ConnectorRepository for PgConnectorRepo {
    async fn get(&self, connector_id: &str) -> Result<Connector> {
        let row: ConnectorRow = sqlx::query_as(&format!(
            "SELECT {CONNECTOR_COLUMNS} FROM connectors WHERE exchange_id = $1",
        ))
        .bind(connector_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DbError::ConnectorNotFound(connector_id.to_string()))?;

        row.try_into()
    }

    async fn list_active(&self) -> Result<Vec<Connector>> {
        let rows: Vec<ConnectorRow> = sqlx::query_as(&format!(
            "SELECT {CONNECTOR_COLUMNS} FROM connectors WHERE status = 'active'",
        ))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Connector::try_from).collect()
    }

    async fn update_health(&self, connector_id: &str, health: Health) -> Result<()> {
        sqlx::query(
            "UPDATE connectors SET \
                health_status = $2, health_last_successful_call_at = $3, \
                health_last_failed_call_at = $4, health_total_calls = $5, \
                health_total_failures = $6, health_average_response_ms = $7, \
                health_uptime_percentage = $8, health_last_error = $9 \
             WHERE exchange_id = $1",
        )
        .bind(connector_id)
        .bind(health.status.to_string())
        .bind(health.last_successful_call)
        .bind(health.last_failed_call)
        .bind(health.total_calls as i64)
        .bind(health.total_failures as i64)
        .bind(health.average_response_ms)
        .bind(health.uptime_percentage)
        .bind(health.last_error)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn update_status(&self, connector_id: &str, status: ConnectorStatus) -> Result<()> {
        sqlx::query("UPDATE connectors SET status = $2 WHERE exchange_id = $1")
            .bind(connector_id)
            .bind(status.to_string())
            .execute(self.pool())
            .await?;

        Ok(())
    }

    async fn acquire_rate_limit_token(&self, connector_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "UPDATE connectors SET \
                rate_limit_usage = CASE \
                    WHEN rate_limit_period_start <= now() - (rate_limit_period_ms || ' milliseconds')::interval \
                    THEN 1 ELSE rate_limit_usage + 1 END, \
                rate_limit_period_start = CASE \
                    WHEN rate_limit_period_start <= now() - (rate_limit_period_ms || ' milliseconds')::interval \
                    THEN now() ELSE rate_limit_period_start END, \
                last_api_call_at = now() \
             WHERE exchange_id = $1 \
               AND (rate_limit_period_start <= now() - (rate_limit_period_ms || ' milliseconds')::interval \
                    OR rate_limit_usage < rate_limit_limit) \
               AND (last_api_call_at IS NULL \
                    OR last_api_call_at <= now() - (rate_limit_min_delay_ms || ' milliseconds')::interval) \
             RETURNING exchange_id",
        )
        .bind(connector_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.is_some())
    }

    async fn reset_rate_limit_period(&self, connector_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE connectors SET rate_limit_usage = 0, rate_limit_period_start = now() \
             WHERE exchange_id = $1",
        )
        .bind(connector_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn increment_api_usage(&self, connector_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE connectors SET rate_limit_usage = rate_limit_usage + 1, last_api_call_at = now() \
             WHERE exchange_id = $1",
        )
        .bind(connector_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn record_successful_call(&self, connector_id: &str, response_ms: f64) -> Result<()> {
        sqlx::query(
            "UPDATE connectors SET \
                health_status = 'healthy', \
                health_last_successful_call_at = now(), \
                health_total_calls = health_total_calls + 1, \
                health_average_response_ms = \
                    (COALESCE(health_average_response_ms, $2) * health_total_calls + $2) \
                    / (health_total_calls + 1), \
                health_uptime_percentage = \
                    100.0 * (health_total_calls + 1 - health_total_failures) / (health_total_calls + 1) \
             WHERE exchange_id = $1",
        )
        .bind(connector_id)
        .bind(response_ms)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn record_failed_call(&self, connector_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE connectors SET \
                health_total_calls = health_total_calls + 1, \
                health_total_failures = health_total_failures + 1, \
                health_last_failed_call_at = now(), \
                health_last_error = $2, \
                health_uptime_percentage = \
                    100.0 * (health_total_calls + 1 - (health_total_failures + 1)) / (health_total_calls + 1), \
                health_status = CASE \
                    WHEN 100.0 * (health_total_calls + 1 - (health_total_failures + 1)) / (health_total_calls + 1) < 50.0 \
                    THEN 'down' ELSE 'degraded' END \
             WHERE exchange_id = $1",
        )
        .bind(connector_id)
        .bind(error)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

use std::time::Duration;

/// Executor tuning knobs, env-sourced by [`crate::config::Config`]. Builder-style over a
/// `Default` impl, the way the teacher's `SyncConfig` is constructed.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub execution_deadline: Duration,
    pub default_batch_limit: u32,
    /// Widths, in months, tried in order when a job has no cursor yet and the exchange
    /// rejects the first starting point as too far in the past. The Executor starts at the
    /// first entry and shrinks down the list on every `is_date_range_too_wide` rejection.
    pub historical_window_fallback_months: Vec<u32>,
    /// How long a job lock is held before it's considered abandoned and eligible for another
    /// owner to reclaim, the same TTL-lease pattern as `jobs.locked_until`.
    pub job_lock_ttl: chrono::Duration,
    /// Identifies this executor instance in `jobs.locked_by`, distinguishing concurrent
    /// executor processes sharing the same database (`SPEC_FULL.md` §9 Open Question).
    pub owner_id: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            execution_deadline: Duration::from_secs(120),
            default_batch_limit: 500,
            historical_window_fallback_months: vec![60, 12, 6, 3, 1],
            job_lock_ttl: chrono::Duration::seconds(300),
            owner_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_execution_deadline(mut self, deadline: Duration) -> Self {
        self.execution_deadline = deadline;
        self
    }

    pub fn with_default_batch_limit(mut self, limit: u32) -> Self {
        self.default_batch_limit = limit;
        self
    }

    pub fn with_historical_window_fallback_months(mut self, months: Vec<u32>) -> Self {
        self.historical_window_fallback_months = months;
        self
    }

    pub fn with_job_lock_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.job_lock_ttl = ttl;
        self
    }

    pub fn with_owner_id(mut self, owner_id: String) -> Self {
        self.owner_id = owner_id;
        self
    }
}

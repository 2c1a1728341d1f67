use std::time::Duration;

/// Scheduler tick cadence, env-sourced by [`crate::config::Config`]. Job locking itself is
/// owned by the Executor (`ExecutorConfig::job_lock_ttl`/`owner_id`) so it holds even when
/// `Executor::execute` is driven some way other than this scheduler's tick loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_interval: Duration::from_secs(30) }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

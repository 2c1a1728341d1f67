//! Scheduler: polls due jobs and dispatches them to the [`Executor`], one
//! [`AbortOnDropHandle`]-wrapped task per job, the way the teacher's `SyncProcess`
//! orchestrates its recurring tasks.
//!
//! Locking is owned by the Executor (it calls `JobRepository::try_acquire_lock` /
//! `record_run` itself), so this scheduler does no lock bookkeeping of its own — it can
//! dispatch the same due job from any number of concurrent instances and the Executor's
//! atomic claim decides which one actually runs it.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::db::repositories::JobRepository;
use crate::executor::Executor;
use crate::util::AbortOnDropHandle;

pub mod config;
pub mod error;

use config::SchedulerConfig;
use error::Result;

pub struct Scheduler {
    jobs: Arc<dyn JobRepository>,
    executor: Arc<Executor>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(jobs: Arc<dyn JobRepository>, executor: Arc<Executor>, config: SchedulerConfig) -> Self {
        Self { jobs, executor, config }
    }

    /// Runs the tick loop until `shutdown` resolves. Each tick lists every due job and spawns
    /// it as an independent task bounded by `execution_deadline`; a run that never returns
    /// control is simply aborted when its handle is dropped on the next tick.
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut handles: Vec<AbortOnDropHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    handles.retain(|h| !h.is_finished());
                    match self.dispatch_due_jobs().await {
                        Ok(mut new_handles) => handles.append(&mut new_handles),
                        Err(e) => tracing::error!(error = %e, "failed to list due jobs"),
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn dispatch_due_jobs(&self) -> Result<Vec<AbortOnDropHandle<()>>> {
        let now = Utc::now();
        let due = self.jobs.list_due(now).await?;

        let mut handles = Vec::with_capacity(due.len());
        for job in due {
            let job_id = job.id;
            let executor = self.executor.clone();
            let handle = tokio::spawn(async move {
                run_job(executor, job_id, job).await;
            });
            handles.push(AbortOnDropHandle::from(handle));
        }

        Ok(handles)
    }
}

async fn run_job(executor: Arc<Executor>, job_id: Uuid, job: crate::db::models::Job) {
    match executor.execute(&job).await {
        Ok(Some(run)) => {
            tracing::info!(job_id = %job_id, candles = run.candles_fetched, "job run complete")
        }
        Ok(None) => tracing::debug!(job_id = %job_id, "job already locked by another owner, skipping"),
        Err(e) => tracing::error!(job_id = %job_id, error = %e, "job run failed"),
    }
}

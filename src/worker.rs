//! The polling loop: select candidates, race for a lease, execute, record the outcome.

use std::{any::Any, sync::Arc};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    codec::{Decoded, PayloadCodec},
    config::WorkerConfig,
    error::{error_report, ConfigError, StoreError},
    lock::lock_exclusively,
    retry::{self, Disposition, Outcome},
    store::{CandidateQuery, JobStore},
    types::{DateTime, JobRecord},
};

/// Message recorded when a job overruns `max_run_time`.
pub const EXPIRED_MESSAGE: &str = "execution expired";

/// Counts from one `work_off` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkStats {
    pub succeeded: usize,
    pub failed: usize,
}

impl WorkStats {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

pub struct Worker<S: ?Sized, C> {
    store: Arc<S>,
    codec: Arc<C>,
    config: WorkerConfig,
    name: String,
}

impl<S, C> Worker<S, C>
where
    S: JobStore + ?Sized,
    C: PayloadCodec,
{
    /// Fails when `config` could never select a job.
    pub fn new(store: Arc<S>, codec: Arc<C>, config: WorkerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = config.worker_name();
        Ok(Self {
            store,
            codec,
            config,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs until `shutdown` fires. The job in flight is allowed to finish,
    /// then every lease this worker still holds is released.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), StoreError> {
        info!(worker = %self.name, "*** Starting job worker {}", self.name);

        loop {
            let started = Instant::now();
            let stats = match self.work_off_until(self.config.batch_size, &shutdown).await {
                Ok(stats) => stats,
                Err(err) => {
                    error!(worker = %self.name, error = %err, "job cycle aborted by store error");
                    WorkStats::default()
                }
            };

            if shutdown.is_cancelled() {
                break;
            }

            if stats.total() == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.sleep_delay) => {}
                }
            } else {
                let rate = stats.total() as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
                info!(
                    worker = %self.name,
                    processed = stats.total(),
                    failed = stats.failed,
                    "{} jobs processed at {:.4} j/s, {} failed ...",
                    stats.total(),
                    rate,
                    stats.failed,
                );
            }
        }

        info!(worker = %self.name, "Exiting...");
        let cleared = self.store.clear_locks(&self.name).await?;
        info!(worker = %self.name, cleared, "job worker stopped");
        Ok(())
    }

    /// Works off up to `num` jobs, stopping early once nothing can be locked.
    ///
    /// Errors only when candidates cannot be fetched or locked; a store error
    /// while recording one job's outcome counts that job as failed.
    pub async fn work_off(&self, num: usize) -> Result<WorkStats, StoreError> {
        self.work_off_until(num, &CancellationToken::new()).await
    }

    async fn work_off_until(
        &self,
        num: usize,
        shutdown: &CancellationToken,
    ) -> Result<WorkStats, StoreError> {
        let mut stats = WorkStats::default();

        for _ in 0..num {
            match self.reserve_and_run_one_job().await? {
                Some(true) => stats.succeeded += 1,
                Some(false) => stats.failed += 1,
                None => break,
            }
            if shutdown.is_cancelled() {
                break;
            }
        }

        Ok(stats)
    }

    /// Locks the first candidate it can and runs it. `None` when no job could be locked.
    async fn reserve_and_run_one_job(&self) -> Result<Option<bool>, StoreError> {
        let query = CandidateQuery {
            worker: self.name.clone(),
            max_run_time: self.config.max_run_time,
            min_priority: self.config.min_priority,
            max_priority: self.config.max_priority,
            limit: self.config.candidate_limit,
        };

        // A few candidates so a lost race can fall through to the next one.
        for mut job in self.store.fetch_candidates(&query).await? {
            if lock_exclusively(&*self.store, &mut job, &self.name, self.config.max_run_time)
                .await?
            {
                info!(worker = %self.name, job_id = %job.id, "acquired lock on job {}", job.id);
                let job_id = job.id;
                return match self.run(job).await {
                    Ok(succeeded) => Ok(Some(succeeded)),
                    Err(err) => {
                        error!(
                            worker = %self.name,
                            job_id = %job_id,
                            error = %error_report(&err),
                            "failed to record the outcome of job {}",
                            job_id
                        );
                        Ok(Some(false))
                    }
                };
            }
            warn!(
                worker = %self.name,
                job_id = %job.id,
                "failed to acquire exclusive lock for job {}",
                job.id
            );
        }

        Ok(None)
    }

    /// Executes a job this worker already holds and records the outcome.
    /// Returns whether the job succeeded.
    #[instrument(skip_all, fields(job_id = %job.id, worker = %self.name), err)]
    pub async fn run(&self, mut job: JobRecord) -> Result<bool, StoreError> {
        let started = Instant::now();
        job.attempts = job.attempts.saturating_add(1);

        let (outcome, decoded) = match self.codec.decode(&job.payload) {
            Ok(decoded) => (self.execute(&decoded).await, Some(decoded)),
            Err(err) => (Outcome::Terminal(error_report(&err)), None),
        };
        let name = job_name(decoded.as_ref());

        match outcome {
            Outcome::Succeeded => {
                self.complete(&mut job).await?;
                info!(
                    "* [JOB] {} completed after {:.4}",
                    name,
                    started.elapsed().as_secs_f64()
                );
                Ok(true)
            }
            Outcome::Retryable(message) => {
                self.handle_failed_job(&mut job, decoded.as_ref(), &name, message, false)
                    .await?;
                Ok(false)
            }
            Outcome::Terminal(message) => {
                self.handle_failed_job(&mut job, decoded.as_ref(), &name, message, true)
                    .await?;
                Ok(false)
            }
        }
    }

    /// Invokes the work item on its own task, bounded by `max_run_time`.
    async fn execute(&self, decoded: &Decoded) -> Outcome {
        let item = Arc::clone(&decoded.item);
        let mut task = tokio::spawn(async move { item.perform().await });

        match tokio::time::timeout(self.config.max_run_time, &mut task).await {
            Ok(Ok(Ok(()))) => Outcome::Succeeded,
            Ok(Ok(Err(err))) => Outcome::Retryable(error_report(&*err)),
            Ok(Err(join_err)) if join_err.is_panic() => Outcome::Retryable(format!(
                "job panicked: {}",
                panic_message(join_err.into_panic())
            )),
            Ok(Err(join_err)) => Outcome::Retryable(join_err.to_string()),
            Err(_) => {
                task.abort();
                Outcome::Retryable(EXPIRED_MESSAGE.to_string())
            }
        }
    }

    async fn complete(&self, job: &mut JobRecord) -> Result<(), StoreError> {
        let held = if self.config.destroy_successful_jobs {
            self.store.delete_held(job.id, &self.name).await?
        } else {
            job.finished_at = Some(self.store.now().await?);
            job.failed_at = None;
            job.unlock();
            if self.config.clear_successful_errors {
                job.last_error = None;
            }
            self.store.update_held(job, &self.name).await?
        };

        if !held {
            self.lease_lost(job);
        }
        Ok(())
    }

    async fn handle_failed_job(
        &self,
        job: &mut JobRecord,
        decoded: Option<&Decoded>,
        name: &str,
        message: String,
        force_terminal: bool,
    ) -> Result<(), StoreError> {
        error!(
            job_id = %job.id,
            attempts = job.attempts,
            "* [JOB] {} failed with {} - {} failed attempts",
            name,
            message.lines().next().unwrap_or_default(),
            job.attempts
        );
        self.reschedule(job, message, decoded, force_terminal).await?;
        Ok(())
    }

    /// Records `error` on `job`, then either retries later with backoff or
    /// gives up for good when `force_terminal` is set or attempts are exhausted.
    ///
    /// Writes only land while this worker still holds the job's lease.
    pub async fn reschedule(
        &self,
        job: &mut JobRecord,
        error: String,
        decoded: Option<&Decoded>,
        force_terminal: bool,
    ) -> Result<Disposition, StoreError> {
        job.last_error = Some(error);
        let now = self.store.now().await?;
        let disposition =
            retry::decide(job.attempts, self.config.max_attempts, force_terminal, now);

        match disposition {
            Disposition::Reschedule { run_at } => {
                job.run_at = run_at;
                job.unlock();
                if !self.store.update_held(job, &self.name).await? {
                    self.lease_lost(job);
                }
            }
            Disposition::GiveUp => self.remove(job, decoded, now).await?,
        }

        Ok(disposition)
    }

    /// Persists the terminal state, then notifies the hook. A failed write
    /// leaves the lease in place, so the hook only ever sees a committed removal.
    async fn remove(
        &self,
        job: &mut JobRecord,
        decoded: Option<&Decoded>,
        now: DateTime,
    ) -> Result<(), StoreError> {
        info!(
            job_id = %job.id,
            "* [JOB] PERMANENTLY removing {} because of {} consecutive failures.",
            job_name(decoded),
            job.attempts
        );

        let held = if self.config.destroy_failed_jobs {
            self.store.delete_held(job.id, &self.name).await?
        } else {
            job.failed_at = Some(now);
            job.finished_at = None;
            job.unlock();
            self.store.update_held(job, &self.name).await?
        };
        if !held {
            self.lease_lost(job);
            return Ok(());
        }

        if let Some(hook) = decoded.and_then(|d| d.item.permanent_failure_hook()) {
            let error = job.last_error.as_deref().unwrap_or_default();
            if let Err(err) = hook.on_permanent_failure(job, error).await {
                warn!(
                    job_id = %job.id,
                    error = %error_report(&*err),
                    "permanent failure hook failed"
                );
            }
        }

        Ok(())
    }

    /// Another worker took the job over, or it was deleted, while it ran.
    fn lease_lost(&self, job: &JobRecord) {
        warn!(
            worker = %self.name,
            job_id = %job.id,
            "lease on job {} was lost before its outcome was recorded",
            job.id
        );
    }
}

fn job_name(decoded: Option<&Decoded>) -> String {
    decoded.map_or_else(|| "Error".to_string(), Decoded::name)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

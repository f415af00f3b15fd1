//! Turns "this job looks available" into "this worker holds it exclusively".

use std::time::Duration;

use tracing::instrument;

use crate::{
    error::StoreError,
    store::{lease_cutoff, ClaimMode, JobStore, LockClaim},
    types::JobRecord,
};

/// Builds the conditional update for `job` as seen by `worker` at `now`.
pub fn build_claim(
    job: &JobRecord,
    worker: &str,
    max_run_time: Duration,
    now: crate::types::DateTime,
) -> LockClaim {
    // A worker resuming its own lease skips the `run_at` check on purpose so a
    // restarted worker can pick its jobs back up.
    let mode = if job.is_locked_by(worker) {
        ClaimMode::Resume
    } else {
        ClaimMode::Acquire {
            expired_before: lease_cutoff(now, max_run_time),
        }
    };
    LockClaim {
        job_id: job.id,
        worker: worker.to_string(),
        now,
        mode,
    }
}

/// Attempts to lease `job` for `worker`.
///
/// Returns `Ok(false)` when another worker won the race or the row is gone;
/// that is contention, not an error. On success `job` is updated in place to
/// match what was written.
#[instrument(skip_all, fields(job_id = %job.id, worker = worker), err)]
pub async fn lock_exclusively<S>(
    store: &S,
    job: &mut JobRecord,
    worker: &str,
    max_run_time: Duration,
) -> Result<bool, StoreError>
where
    S: JobStore + ?Sized,
{
    let now = store.now().await?;
    let claim = build_claim(job, worker, max_run_time, now);

    let Some(first_started_at) = store.try_lock(&claim).await? else {
        return Ok(false);
    };

    claim.apply(job);
    job.first_started_at = Some(first_started_at);
    Ok(true)
}

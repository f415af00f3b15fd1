//! Backend-agnostic contract over the durable job table.
//!
//! The only cross-worker coordination primitive is [`JobStore::try_lock`], a
//! single conditional write. Everything else assumes the caller already holds
//! the lease on the row it touches.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::Deserialize;

use crate::{
    error::StoreError,
    memory::MemoryStore,
    types::{DateTime, JobId, JobRecord, NewJob, StateCounts},
};

/// Parameters of a candidate scan.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub worker: String,
    pub max_run_time: Duration,
    /// Inclusive.
    pub min_priority: Option<i32>,
    /// Inclusive.
    pub max_priority: Option<i32>,
    pub limit: usize,
}

impl CandidateQuery {
    /// Locks taken strictly before this instant have expired.
    pub fn expired_before(&self, now: DateTime) -> DateTime {
        lease_cutoff(now, self.max_run_time)
    }

    pub fn priority_in_range(&self, priority: i32) -> bool {
        self.min_priority.map_or(true, |min| priority >= min)
            && self.max_priority.map_or(true, |max| priority <= max)
    }

    /// The "ready to run" predicate shared by every backend.
    pub fn matches(&self, job: &JobRecord, now: DateTime) -> bool {
        if job.is_terminal() || !self.priority_in_range(job.priority) {
            return false;
        }
        let expired_before = self.expired_before(now);
        let claimable = job.run_at <= now
            && job.locked_at.map_or(true, |locked_at| locked_at < expired_before);
        claimable || job.is_locked_by(&self.worker)
    }
}

pub(crate) fn lease_cutoff(now: DateTime, max_run_time: Duration) -> DateTime {
    let lease = TimeDelta::from_std(max_run_time).unwrap_or(TimeDelta::MAX);
    now.checked_sub_signed(lease).unwrap_or(DateTime::MIN_UTC)
}

/// Which predicate a lock attempt is guarded by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Take an unlocked or expired lease on a due job.
    Acquire { expired_before: DateTime },
    /// Refresh a lease the caller already holds, e.g. after a crash.
    Resume,
}

/// A fully-built conditional update. See `lock::lock_exclusively`.
#[derive(Debug, Clone)]
pub struct LockClaim {
    pub job_id: JobId,
    pub worker: String,
    pub now: DateTime,
    pub mode: ClaimMode,
}

impl LockClaim {
    /// Whether `job` satisfies the claim's predicate.
    pub fn admits(&self, job: &JobRecord) -> bool {
        if job.id != self.job_id || job.is_terminal() {
            return false;
        }
        match self.mode {
            ClaimMode::Acquire { expired_before } => {
                job.locked_at.map_or(true, |locked_at| locked_at < expired_before)
                    && job.run_at <= self.now
            }
            ClaimMode::Resume => job.is_locked_by(&self.worker),
        }
    }

    /// Applies the claim's SET clause. `first_started_at` is only filled in
    /// when empty; returns the value it ends up with.
    pub fn apply(&self, job: &mut JobRecord) -> DateTime {
        job.locked_at = Some(self.now);
        job.last_started_at = Some(self.now);
        if let ClaimMode::Acquire { .. } = self.mode {
            job.locked_by = Some(self.worker.clone());
        }
        *job.first_started_at.get_or_insert(self.now)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Store-consistent current time.
    async fn now(&self) -> Result<DateTime, StoreError>;

    async fn insert(&self, job: NewJob) -> Result<JobRecord, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Jobs that are due and unlocked, due with an expired lease, or already
    /// leased by `query.worker`; never failed or finished ones. Ordered by
    /// priority, then `run_at`, then id. Nothing here is reserved: other
    /// workers may win any of them before the caller locks.
    async fn fetch_candidates(&self, query: &CandidateQuery)
        -> Result<Vec<JobRecord>, StoreError>;

    /// Executes `claim` atomically. `Some` iff exactly one row matched,
    /// carrying the row's `first_started_at` as stored after the write.
    async fn try_lock(&self, claim: &LockClaim) -> Result<Option<DateTime>, StoreError>;

    /// Releases every lease held by `worker`. Returns how many were released.
    async fn clear_locks(&self, worker: &str) -> Result<u64, StoreError>;

    /// Persists the mutable fields of `job`. `first_started_at` and
    /// `last_started_at` belong to `try_lock` and are left alone.
    async fn update(&self, job: &JobRecord) -> Result<(), StoreError>;

    /// Like [`JobStore::update`], but only while `worker` still holds the
    /// lease on the row. `false` when the lease was lost or the row is gone.
    async fn update_held(&self, job: &JobRecord, worker: &str) -> Result<bool, StoreError>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;

    /// Deletes the row only while `worker` still holds its lease.
    async fn delete_held(&self, id: JobId, worker: &str) -> Result<bool, StoreError>;

    async fn delete_all(&self) -> Result<u64, StoreError>;

    async fn count_by_state(&self) -> Result<StateCounts, StoreError>;
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    #[cfg(feature = "sqlite")]
    Sqlite {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

#[cfg(feature = "sqlite")]
fn default_max_connections() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Opens the backend named by `config`.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn JobStore>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "sqlite")]
        StoreConfig::Sqlite {
            url,
            max_connections,
        } => {
            let store = crate::sqlite::SqliteStore::connect(url, *max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

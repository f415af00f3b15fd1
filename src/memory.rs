use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::{
    clock::{Clock, SystemClock},
    error::StoreError,
    store::{CandidateQuery, JobStore, LockClaim},
    types::{DateTime, JobId, JobRecord, NewJob, StateCounts},
};

/// Process-local store. Shares state across clones, so several workers in one
/// process can contend on it exactly like separate processes on a database.
#[derive(Clone)]
pub struct MemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
    next_id: Arc<AtomicI64>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            clock: Arc::new(clock),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn now(&self) -> Result<DateTime, StoreError> {
        Ok(self.clock.now())
    }

    #[instrument(skip_all, err, fields(job_id, payload_size = job.payload.len()))]
    async fn insert(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::Span::current().record("job_id", id.0);

        let record = JobRecord {
            id,
            priority: job.priority,
            attempts: 0,
            payload: job.payload,
            last_error: None,
            run_at: job.run_at.unwrap_or_else(|| self.clock.now()),
            locked_at: None,
            locked_by: None,
            failed_at: None,
            first_started_at: None,
            last_started_at: None,
            finished_at: None,
        };

        let mut jobs = self.jobs.write().await;
        jobs.insert(id, record.clone());

        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&id).cloned())
    }

    #[instrument(skip_all, err, fields(worker = %query.worker))]
    async fn fetch_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let now = self.clock.now();
        let jobs = self.jobs.read().await;

        let mut candidates: Vec<JobRecord> = jobs
            .values()
            .filter(|j| query.matches(j, now))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.run_at.cmp(&b.run_at))
                .then(a.id.cmp(&b.id))
        });
        candidates.truncate(query.limit);

        Ok(candidates)
    }

    #[instrument(skip_all, err, fields(job_id = %claim.job_id))]
    async fn try_lock(&self, claim: &LockClaim) -> Result<Option<DateTime>, StoreError> {
        // The write guard makes check-and-set a single step.
        let mut jobs = self.jobs.write().await;

        match jobs.get_mut(&claim.job_id) {
            Some(job) if claim.admits(job) => Ok(Some(claim.apply(job))),
            _ => Ok(None),
        }
    }

    #[instrument(skip_all, err)]
    async fn clear_locks(&self, worker: &str) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;

        let mut cleared = 0;
        for job in jobs.values_mut().filter(|j| j.is_locked_by(worker)) {
            job.unlock();
            cleared += 1;
        }

        Ok(cleared)
    }

    #[instrument(skip_all, err, fields(job_id = %job.id))]
    async fn update(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;

        let row = jobs.get_mut(&job.id).ok_or(StoreError::JobNotFound(job.id))?;
        overwrite(row, job);

        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job.id, worker = worker))]
    async fn update_held(&self, job: &JobRecord, worker: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;

        match jobs.get_mut(&job.id) {
            Some(row) if row.is_locked_by(worker) => {
                overwrite(row, job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[instrument(skip_all, err, fields(job_id = %id))]
    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs.remove(&id).is_some())
    }

    #[instrument(skip_all, err, fields(job_id = %id, worker = worker))]
    async fn delete_held(&self, id: JobId, worker: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;

        if !jobs.get(&id).is_some_and(|row| row.is_locked_by(worker)) {
            return Ok(false);
        }
        Ok(jobs.remove(&id).is_some())
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let removed = jobs.len() as u64;
        jobs.clear();
        Ok(removed)
    }

    async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        let jobs = self.jobs.read().await;

        let mut counts = StateCounts::default();
        for job in jobs.values() {
            counts.tally(job);
        }

        Ok(counts)
    }
}

/// `update` semantics: start times are owned by `try_lock`.
fn overwrite(row: &mut JobRecord, job: &JobRecord) {
    *row = JobRecord {
        first_started_at: row.first_started_at,
        last_started_at: row.last_started_at,
        ..job.clone()
    };
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::TimeDelta;

    use super::*;
    use crate::clock::ManualClock;

    const LEASE: Duration = Duration::from_secs(60);

    fn new_job() -> NewJob {
        NewJob::new(Bytes::from_static(b"job"))
    }

    fn query(worker: &str) -> CandidateQuery {
        CandidateQuery {
            worker: worker.to_string(),
            max_run_time: LEASE,
            min_priority: None,
            max_priority: None,
            limit: 5,
        }
    }

    async fn lock_as(store: &MemoryStore, id: JobId, worker: &str, at: DateTime) {
        let mut job = store.get(id).await.unwrap().unwrap();
        job.locked_by = Some(worker.to_string());
        job.locked_at = Some(at);
        store.update(&job).await.unwrap();
    }

    #[tokio::test]
    async fn candidates_come_in_priority_then_age_order() {
        let clock = ManualClock::starting_now();
        let store = MemoryStore::with_clock(clock.clone());
        let now = clock.now();

        let late = store
            .insert(new_job().run_at(now - TimeDelta::seconds(1)))
            .await
            .unwrap();
        let early = store
            .insert(new_job().run_at(now - TimeDelta::seconds(10)))
            .await
            .unwrap();
        let urgent = store.insert(new_job().priority(-3)).await.unwrap();
        store
            .insert(new_job().run_at(now + TimeDelta::seconds(10)))
            .await
            .unwrap();

        let ids: Vec<JobId> = store
            .fetch_candidates(&query("w"))
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![urgent.id, early.id, late.id]);
    }

    #[tokio::test]
    async fn priority_window_filters_candidates() {
        let store = MemoryStore::new();
        store.insert(new_job().priority(10)).await.unwrap();
        store.insert(new_job().priority(-10)).await.unwrap();
        let zero = store.insert(new_job().priority(0)).await.unwrap();

        let mut q = query("w");
        q.min_priority = Some(-5);
        q.max_priority = Some(5);

        let candidates = store.fetch_candidates(&q).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, zero.id);
    }

    #[tokio::test]
    async fn limit_caps_the_candidate_set() {
        let store = MemoryStore::new();
        for _ in 0..8 {
            store.insert(new_job()).await.unwrap();
        }

        assert_eq!(store.fetch_candidates(&query("w")).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn leases_decide_visibility() {
        let clock = ManualClock::starting_now();
        let store = MemoryStore::with_clock(clock.clone());
        let now = clock.now();

        let held = store.insert(new_job()).await.unwrap();
        lock_as(&store, held.id, "other", now - TimeDelta::seconds(30)).await;
        let expired = store.insert(new_job()).await.unwrap();
        lock_as(&store, expired.id, "other", now - TimeDelta::seconds(90)).await;
        let own = store.insert(new_job()).await.unwrap();
        lock_as(&store, own.id, "w", now - TimeDelta::seconds(30)).await;

        let ids: Vec<JobId> = store
            .fetch_candidates(&query("w"))
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert!(!ids.contains(&held.id));
        assert!(ids.contains(&expired.id));
        assert!(ids.contains(&own.id));
    }

    #[tokio::test]
    async fn terminal_jobs_are_never_candidates() {
        let clock = ManualClock::starting_now();
        let store = MemoryStore::with_clock(clock.clone());

        let mut failed = store.insert(new_job()).await.unwrap();
        failed.failed_at = Some(clock.now());
        store.update(&failed).await.unwrap();
        let mut finished = store.insert(new_job()).await.unwrap();
        finished.finished_at = Some(clock.now());
        store.update(&finished).await.unwrap();

        assert!(store.fetch_candidates(&query("w")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_locks_only_touches_own_leases() {
        let clock = ManualClock::starting_now();
        let store = MemoryStore::with_clock(clock.clone());
        let mine = store.insert(new_job()).await.unwrap();
        let theirs = store.insert(new_job()).await.unwrap();
        lock_as(&store, mine.id, "w", clock.now()).await;
        lock_as(&store, theirs.id, "other", clock.now()).await;

        assert_eq!(store.clear_locks("w").await.unwrap(), 1);

        let mine = store.get(mine.id).await.unwrap().unwrap();
        assert_eq!((mine.locked_at, mine.locked_by), (None, None));
        assert!(store.get(theirs.id).await.unwrap().unwrap().is_locked());
    }

    #[tokio::test]
    async fn counts_by_state() {
        let clock = ManualClock::starting_now();
        let store = MemoryStore::with_clock(clock.clone());
        store.insert(new_job()).await.unwrap();
        let locked = store.insert(new_job()).await.unwrap();
        lock_as(&store, locked.id, "w", clock.now()).await;
        let mut failed = store.insert(new_job()).await.unwrap();
        failed.failed_at = Some(clock.now());
        store.update(&failed).await.unwrap();

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(
            counts,
            StateCounts {
                ready: 1,
                retrying: 0,
                locked: 1,
                failed: 1,
                finished: 0,
            }
        );

        assert_eq!(store.delete_all().await.unwrap(), 3);
        assert_eq!(store.count_by_state().await.unwrap(), StateCounts::default());
    }

    #[tokio::test]
    async fn update_of_missing_job_is_an_error() {
        let store = MemoryStore::new();
        let job = store.insert(new_job()).await.unwrap();
        store.delete(job.id).await.unwrap();

        assert!(matches!(
            store.update(&job).await,
            Err(StoreError::JobNotFound(id)) if id == job.id
        ));
    }

    #[tokio::test]
    async fn held_writes_need_the_current_lease() {
        let clock = ManualClock::starting_now();
        let store = MemoryStore::with_clock(clock.clone());
        let job = store.insert(new_job()).await.unwrap();
        lock_as(&store, job.id, "b", clock.now()).await;

        let mut stale = job.clone();
        stale.last_error = Some("late".to_string());
        assert!(!store.update_held(&stale, "a").await.unwrap());
        assert!(!store.delete_held(job.id, "a").await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.locked_by.as_deref(), Some("b"));
        assert_eq!(stored.last_error, None);

        let mut mine = stored.clone();
        mine.unlock();
        assert!(store.update_held(&mine, "b").await.unwrap());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().locked_by, None);

        // Released rows and vanished rows refuse held writes alike.
        assert!(!store.delete_held(job.id, "b").await.unwrap());
        store.delete(job.id).await.unwrap();
        assert!(!store.update_held(&mine, "b").await.unwrap());
    }
}

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use bincode::{Decode, Encode};
use deferred_jobs::{
    store::LockClaim, BincodeCodec, BoxError, CandidateQuery, DateTime, Job, JobId, JobRecord,
    JobStore, MemoryStore, NewJob, PermanentFailureHook, Perform, StateCounts, StoreError,
};

fn tally() -> &'static Mutex<HashMap<String, usize>> {
    static TALLY: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
    TALLY.get_or_init(Default::default)
}

fn bump(key: &str) {
    *tally().lock().unwrap().entry(key.to_string()).or_default() += 1;
}

/// How many times `key` was recorded. Keys are unique per test.
pub fn count(key: &str) -> usize {
    tally().lock().unwrap().get(key).copied().unwrap_or_default()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Encode, Decode)]
pub struct SimpleJob {
    pub key: String,
}

impl SimpleJob {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl Perform for SimpleJob {
    async fn perform(&self) -> Result<(), BoxError> {
        bump(&self.key);
        Ok(())
    }
}

impl Job for SimpleJob {
    const NAME: &'static str = "simple";
}

#[derive(Debug, Encode, Decode)]
pub struct ErrorJob;

#[async_trait]
impl Perform for ErrorJob {
    async fn perform(&self) -> Result<(), BoxError> {
        Err("did not work".into())
    }
}

impl Job for ErrorJob {
    const NAME: &'static str = "error";
}

#[derive(Debug, Encode, Decode)]
pub struct LongRunningJob {
    pub millis: u64,
}

#[async_trait]
impl Perform for LongRunningJob {
    async fn perform(&self) -> Result<(), BoxError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(())
    }
}

impl Job for LongRunningJob {
    const NAME: &'static str = "long_running";
}

#[derive(Debug, Encode, Decode)]
pub struct PanicJob;

#[async_trait]
impl Perform for PanicJob {
    async fn perform(&self) -> Result<(), BoxError> {
        panic!("boom");
    }
}

impl Job for PanicJob {
    const NAME: &'static str = "panic";
}

/// Always fails and records each permanent-failure notification under `hook:{key}`.
#[derive(Debug, Encode, Decode)]
pub struct HookedJob {
    pub key: String,
}

#[async_trait]
impl Perform for HookedJob {
    async fn perform(&self) -> Result<(), BoxError> {
        Err("still broken".into())
    }

    fn display_name(&self) -> Option<String> {
        Some(format!("hooked {}", self.key))
    }

    fn permanent_failure_hook(&self) -> Option<&dyn PermanentFailureHook> {
        Some(self)
    }
}

#[async_trait]
impl PermanentFailureHook for HookedJob {
    async fn on_permanent_failure(&self, job: &JobRecord, error: &str) -> Result<(), BoxError> {
        assert!(job.attempts > 0);
        assert!(error.contains("still broken"));
        bump(&format!("hook:{}", self.key));
        Ok(())
    }
}

impl Job for HookedJob {
    const NAME: &'static str = "hooked";
}

pub fn codec() -> BincodeCodec {
    BincodeCodec::new()
        .register::<SimpleJob>()
        .register::<ErrorJob>()
        .register::<LongRunningJob>()
        .register::<PanicJob>()
        .register::<HookedJob>()
}

/// A `MemoryStore` whose lease-guarded writes can be made to fail on demand.
#[derive(Clone)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_updates: Arc<AtomicUsize>,
    failing_deletes: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            failing_updates: Default::default(),
            failing_deletes: Default::default(),
        }
    }

    /// The next `n` calls to `update_held` fail before touching the row.
    pub fn fail_held_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls to `delete_held` fail before touching the row.
    pub fn fail_held_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicUsize) -> Result<(), StoreError> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(StoreError::Backend("connection reset".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn now(&self) -> Result<DateTime, StoreError> {
        self.inner.now().await
    }

    async fn insert(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn fetch_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.fetch_candidates(query).await
    }

    async fn try_lock(&self, claim: &LockClaim) -> Result<Option<DateTime>, StoreError> {
        self.inner.try_lock(claim).await
    }

    async fn clear_locks(&self, worker: &str) -> Result<u64, StoreError> {
        self.inner.clear_locks(worker).await
    }

    async fn update(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.inner.update(job).await
    }

    async fn update_held(&self, job: &JobRecord, worker: &str) -> Result<bool, StoreError> {
        Self::trip(&self.failing_updates)?;
        self.inner.update_held(job, worker).await
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn delete_held(&self, id: JobId, worker: &str) -> Result<bool, StoreError> {
        Self::trip(&self.failing_deletes)?;
        self.inner.delete_held(id, worker).await
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.inner.delete_all().await
    }

    async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        self.inner.count_by_state().await
    }
}

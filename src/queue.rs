use std::sync::Arc;

use tracing::instrument;

use crate::{
    codec::EncodeJob,
    error::{QueueError, StoreError},
    store::JobStore,
    types::{DateTime, JobId, JobRecord, NewJob, StateCounts},
};

/// Optional scheduling inputs of an enqueue.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Falls back to the queue's default priority.
    pub priority: Option<i32>,
    /// Falls back to store "now".
    pub run_at: Option<DateTime>,
}

/// Producer-side handle: encodes work items and writes them to the store.
pub struct Queue<S: ?Sized, C> {
    store: Arc<S>,
    codec: Arc<C>,
    default_priority: i32,
}

impl<S: ?Sized, C> Clone for Queue<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            codec: Arc::clone(&self.codec),
            default_priority: self.default_priority,
        }
    }
}

impl<S, C> Queue<S, C>
where
    S: JobStore + ?Sized,
{
    pub fn new(store: Arc<S>, codec: Arc<C>) -> Self {
        Self {
            store,
            codec,
            default_priority: 0,
        }
    }

    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn enqueue<J>(&self, job: &J) -> Result<JobId, QueueError>
    where
        C: EncodeJob<J>,
    {
        self.enqueue_with(job, EnqueueOptions::default()).await
    }

    pub async fn schedule_at<J>(&self, job: &J, run_at: DateTime) -> Result<JobId, QueueError>
    where
        C: EncodeJob<J>,
    {
        let options = EnqueueOptions {
            run_at: Some(run_at),
            ..Default::default()
        };
        self.enqueue_with(job, options).await
    }

    #[instrument(skip_all, err, fields(job_id, payload_size))]
    pub async fn enqueue_with<J>(
        &self,
        job: &J,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError>
    where
        C: EncodeJob<J>,
    {
        let payload = self.codec.encode(job)?;
        tracing::Span::current().record("payload_size", payload.len());

        let record = self
            .store
            .insert(NewJob {
                priority: options.priority.unwrap_or(self.default_priority),
                payload,
                run_at: options.run_at,
            })
            .await?;
        tracing::Span::current().record("job_id", record.id.0);

        Ok(record.id)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.store.get(id).await
    }

    /// Releases every lease held by `worker`, e.g. after it crashed for good.
    #[instrument(skip(self), err)]
    pub async fn clear_locks(&self, worker: &str) -> Result<u64, StoreError> {
        self.store.clear_locks(worker).await
    }

    /// Flushes the whole queue.
    #[instrument(skip(self), err)]
    pub async fn delete_all(&self) -> Result<u64, StoreError> {
        self.store.delete_all().await
    }

    pub async fn counts(&self) -> Result<StateCounts, StoreError> {
        self.store.count_by_state().await
    }
}

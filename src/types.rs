use std::fmt;

use bytes::Bytes;

pub type DateTime = chrono::DateTime<chrono::Utc>;

/// Store-assigned job identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A persisted unit of work plus its scheduling and lease metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    /// Lower runs first.
    pub priority: i32,
    pub attempts: u32,
    pub payload: Bytes,
    pub last_error: Option<String>,
    pub run_at: DateTime,
    pub locked_at: Option<DateTime>,
    pub locked_by: Option<String>,
    pub failed_at: Option<DateTime>,
    pub first_started_at: Option<DateTime>,
    pub last_started_at: Option<DateTime>,
    pub finished_at: Option<DateTime>,
}

impl JobRecord {
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Failed or finished jobs are never picked up again.
    pub fn is_terminal(&self) -> bool {
        self.is_failed() || self.is_finished()
    }

    pub fn is_locked_by(&self, worker: &str) -> bool {
        self.locked_by.as_deref() == Some(worker)
    }

    /// Drops the lease in memory only; callers persist with `JobStore::update_held`.
    pub fn unlock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
    }
}

/// Input to `JobStore::insert`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub priority: i32,
    pub payload: Bytes,
    /// `None` means "as soon as possible", resolved against the store clock.
    pub run_at: Option<DateTime>,
}

impl NewJob {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            priority: 0,
            payload: payload.into(),
            run_at: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn run_at(mut self, run_at: DateTime) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// Operational snapshot of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    /// Unlocked and neither failed nor finished, due or not.
    pub ready: u64,
    /// Ready jobs that have already been started at least once.
    pub retrying: u64,
    pub locked: u64,
    pub failed: u64,
    pub finished: u64,
}

impl StateCounts {
    pub(crate) fn tally(&mut self, job: &JobRecord) {
        if job.is_failed() {
            self.failed += 1;
        } else if job.is_finished() {
            self.finished += 1;
        } else if job.is_locked() {
            self.locked += 1;
        } else {
            self.ready += 1;
            if job.first_started_at.is_some() {
                self.retrying += 1;
            }
        }
    }
}

use async_trait::async_trait;
use bincode::{Decode, Encode};

use crate::{error::BoxError, types::JobRecord};

/// A decoded, invocable unit of work.
#[async_trait]
pub trait Perform: Send + Sync + 'static {
    async fn perform(&self) -> Result<(), BoxError>;

    /// Human-readable name for logs. `None` falls back to the job type.
    fn display_name(&self) -> Option<String> {
        None
    }

    /// Work items that want to hear about permanent failure return themselves here.
    fn permanent_failure_hook(&self) -> Option<&dyn PermanentFailureHook> {
        None
    }
}

/// Called once, right before a job is given up on for good.
#[async_trait]
pub trait PermanentFailureHook: Send + Sync {
    async fn on_permanent_failure(&self, job: &JobRecord, error: &str) -> Result<(), BoxError>;
}

/// A work item the bincode codec can persist.
pub trait Job: Perform + Encode + Decode<()> {
    /// Stable type tag written next to the payload. Renaming it orphans queued jobs.
    const NAME: &'static str;
}

use thiserror::Error;

use crate::types::JobId;

/// Error type returned by work items.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("stored value is out of range: {0}")]
    OutOfRange(String),
    /// Failure reported by a store implemented outside this crate.
    #[error("store backend failed")]
    Backend(#[source] BoxError),
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("job type {0} is not registered with the codec")]
    UnregisteredJobType(&'static str),
}

/// A payload that can never be turned back into a work item. Retrying cannot help.
#[derive(Debug, Error)]
pub enum DeserializationError {
    #[error("Job failed to load: malformed payload envelope: {0}")]
    Envelope(bincode::error::DecodeError),
    #[error("Job failed to load: unknown job type {0:?}")]
    UnknownJobType(String),
    #[error("Job failed to load: {job_type}: {error}")]
    Body {
        job_type: String,
        error: bincode::error::DecodeError,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid priority range: min {min} is greater than max {max}")]
    PriorityRange { min: i32, max: i32 },
}

/// Renders an error with its source chain, one cause per line.
pub fn error_report(err: &(dyn std::error::Error + 'static)) -> String {
    let mut report = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        report.push_str("\ncaused by: ");
        report.push_str(&cause.to_string());
        source = cause.source();
    }
    report
}

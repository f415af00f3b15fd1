//! Durable multi-worker job queue.
//!
//! Producers [`Queue::enqueue`] serialized work items into a shared
//! [`JobStore`]. Any number of independent [`Worker`]s poll that store, race
//! to lease candidates with a single conditional write, execute what they win
//! under a deadline, and write the outcome back: delete or mark finished on
//! success, reschedule with `attempts^4 + 5` seconds of backoff on failure,
//! delete or mark failed once attempts run out.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod lock;
pub mod memory;
pub mod queue;
pub mod retry;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;
pub mod types;
pub mod worker;

pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{BincodeCodec, Decoded, EncodeJob, PayloadCodec};
pub use config::{Config, WorkerConfig};
pub use error::{BoxError, CodecError, ConfigError, DeserializationError, QueueError, StoreError};
pub use job::{Job, PermanentFailureHook, Perform};
pub use memory::MemoryStore;
pub use queue::{EnqueueOptions, Queue};
pub use retry::{Disposition, Outcome};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use store::{connect, CandidateQuery, JobStore, StoreConfig};
pub use types::{DateTime, JobId, JobRecord, NewJob, StateCounts};
pub use worker::{WorkStats, Worker, EXPIRED_MESSAGE};

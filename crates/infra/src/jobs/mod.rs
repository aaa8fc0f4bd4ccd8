//! Asynchronous job system: retryable jobs run one at a time.
//!
//! ## Components
//!
//! - `Job`: a unit of work with a readiness gate, retry policy and attempt history
//! - `SequentialQueue`: runs jobs strictly in order, re-queueing failed jobs at the tail
//! - `JoinBarrier`: hands a payload to the last of N arrivals

pub mod barrier;
pub mod queue;
pub mod types;

pub use barrier::JoinBarrier;
pub use queue::{QueueClosed, QueueEvent, QueueHandle, QueueObserver, Reaction, SequentialQueue};
pub use types::{
    BackoffStrategy, FnAction, Job, JobAction, JobAttemptRecord, JobError, JobGate, JobId,
    JobStatus, RetryPolicy,
};

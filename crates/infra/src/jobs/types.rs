//! Core job types and policies.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::connector::ConnectorError;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure reported by one run attempt of a job.
///
/// `Clone` so the same error can be delivered to queue observers and carried
/// by the queue's drained signal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// The action panicked; the job cannot be retried.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// Work was abandoned on request (e.g. an explicit queue flush).
    #[error("aborted: {0}")]
    Aborted(String),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Constructed, readiness gate still closed
    Created,
    /// Ready to run
    Prepared,
    /// Action currently executing
    Running,
    /// Completed successfully
    Succeeded,
    /// Failed, will be re-queued
    Failed { error: String, attempt: u32 },
    /// Failed with no attempts left
    Exhausted { error: String, attempts: u32 },
    /// Killed before or while running
    Cancelled,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
///
/// `max_attempts` counts every run, the first one included: the default of 1
/// means a failed job is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of run attempts allowed
    pub max_attempts: u32,
    /// Base delay before a failed job is re-queued
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate the re-queue delay after a given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay.max(self.base_delay))
    }

    /// Check if another attempt is allowed after `attempt` runs.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// The work a job performs. Called once per run attempt.
#[async_trait]
pub trait JobAction: Send + 'static {
    async fn run(&mut self) -> Result<(), JobError>;

    /// Short label used in logs.
    fn kind(&self) -> &'static str {
        "custom"
    }
}

/// Adapter turning a closure that produces a future into a [`JobAction`].
pub struct FnAction<F> {
    f: F,
}

impl<F> FnAction<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobAction for FnAction<F>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn run(&mut self) -> Result<(), JobError> {
        (self.f)().await
    }
}

#[derive(Debug, Default)]
struct Signals {
    ready: AtomicBool,
    killed: AtomicBool,
    notify: Notify,
}

impl Signals {
    fn prepare(&self) {
        self.ready.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    async fn wait_until(&self, condition: impl Fn(&Self) -> bool) {
        loop {
            let notified = self.notify.notified();
            if condition(self) {
                return;
            }
            notified.await;
        }
    }
}

/// Cloneable handle to a job's readiness gate and kill switch.
///
/// Lets whoever owns an external prerequisite (a connection being acquired,
/// a file being written) release the job after it was already queued, and
/// lets the queue kill a job it no longer owns.
#[derive(Debug, Clone)]
pub struct JobGate(Arc<Signals>);

impl JobGate {
    pub fn prepare(&self) {
        self.0.prepare();
    }

    pub fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    /// Request cancellation. Idempotent.
    pub fn kill(&self) {
        self.0.kill();
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A retryable unit of asynchronous work.
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Retry policy
    pub retry_policy: RetryPolicy,
    /// Number of run attempts started so far
    pub attempt: u32,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// Execution history (one record per finished attempt)
    pub history: Vec<JobAttemptRecord>,
    status: JobStatus,
    signals: Arc<Signals>,
    action: Box<dyn JobAction>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.action.kind())
            .field("status", &self.status())
            .field("attempt", &self.attempt)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl Job {
    /// Create a job whose readiness gate is still closed.
    pub fn new(action: impl JobAction) -> Self {
        Self {
            id: JobId::new(),
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: Utc::now(),
            history: Vec::new(),
            status: JobStatus::Created,
            signals: Arc::new(Signals::default()),
            action: Box::new(action),
        }
    }

    /// Create a job from a closure returning a future.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self::new(FnAction::new(f))
    }

    /// Set a custom retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Open the readiness gate and return the job.
    pub fn prepared(self) -> Self {
        self.prepare();
        self
    }

    /// Open the readiness gate, waking a runner already waiting on it.
    pub fn prepare(&self) {
        self.signals.prepare();
    }

    /// Stop waiting for readiness and drop the running action, if any.
    ///
    /// The attempt then ends as `Cancelled`. A no-op once the attempt has
    /// finished; idempotent.
    pub fn kill(&self) {
        self.signals.kill();
    }

    pub fn gate(&self) -> JobGate {
        JobGate(self.signals.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.signals.is_ready()
    }

    pub fn kind(&self) -> &'static str {
        self.action.kind()
    }

    pub fn status(&self) -> JobStatus {
        match &self.status {
            JobStatus::Created if self.is_ready() => JobStatus::Prepared,
            other => other.clone(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_policy.should_retry(self.attempt)
    }

    /// Delay before this job is re-queued after its latest attempt.
    pub fn retry_delay(&self) -> Duration {
        self.retry_policy.delay_for_attempt(self.attempt)
    }

    /// Run one attempt: count it, wait for readiness, then invoke the action.
    ///
    /// Exactly one outcome is produced per call. The job is handed back so the
    /// owner can decide whether to re-queue it.
    pub async fn run_queueable(mut self) -> (Job, Result<(), JobError>) {
        self.attempt += 1;
        self.signals
            .wait_until(|s| s.is_ready() || s.is_killed())
            .await;
        if self.signals.is_killed() {
            return self.cancelled();
        }

        let started = Utc::now();
        self.mark_running();
        let signals = self.signals.clone();
        let result = tokio::select! {
            result = self.action.run() => result,
            _ = signals.wait_until(Signals::is_killed) => return self.cancelled(),
        };

        match &result {
            Ok(()) => self.mark_succeeded(started),
            Err(error) => self.mark_failed(error.to_string(), started),
        }
        (self, result)
    }

    fn cancelled(mut self) -> (Job, Result<(), JobError>) {
        self.status = JobStatus::Cancelled;
        (self, Err(JobError::aborted("job killed")))
    }

    fn mark_running(&mut self) {
        self.status = JobStatus::Running;
    }

    fn mark_succeeded(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Succeeded;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error.clone()),
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });

        self.status = if self.can_retry() {
            JobStatus::Failed {
                error,
                attempt: self.attempt,
            }
        } else {
            JobStatus::Exhausted {
                error,
                attempts: self.attempt,
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            strategy: BackoffStrategy::Linear,
        };

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn default_policy_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(1));

        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn job_lifecycle() {
        let job = Job::from_fn(|| async { Ok(()) });
        assert_eq!(job.status(), JobStatus::Created);
        assert_eq!(job.attempt, 0);

        let job = job.prepared();
        assert_eq!(job.status(), JobStatus::Prepared);

        let (job, result) = job.run_queueable().await;
        assert!(result.is_ok());
        assert_eq!(job.attempt, 1);
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
    }

    #[tokio::test]
    async fn job_failure_and_retry() {
        let job = Job::from_fn(|| async { Err(JobError::failed("boom")) })
            .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO))
            .prepared();

        let (job, result) = job.run_queueable().await;
        assert_eq!(result, Err(JobError::failed("boom")));
        assert!(matches!(job.status(), JobStatus::Failed { attempt: 1, .. }));
        assert!(job.can_retry());

        let (job, _) = job.run_queueable().await;
        assert!(matches!(job.status(), JobStatus::Exhausted { attempts: 2, .. }));
        assert!(!job.can_retry());
        assert_eq!(job.history.len(), 2);
    }

    #[tokio::test]
    async fn kill_interrupts_a_running_action() {
        let job = Job::from_fn(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .prepared();
        let gate = job.gate();

        let attempt = tokio::spawn(job.run_queueable());
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.kill();
        gate.kill();

        let (job, result) = tokio::time::timeout(Duration::from_secs(1), attempt)
            .await
            .expect("kill should end the attempt")
            .unwrap();
        assert_eq!(result, Err(JobError::aborted("job killed")));
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(job.history.is_empty());
    }

    #[tokio::test]
    async fn killed_job_never_runs_its_action() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let job = Job::from_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        job.kill();
        job.prepare();

        let (job, result) = job.run_queueable().await;
        assert!(result.is_err());
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_waits_for_the_readiness_gate() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let job = Job::from_fn(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let gate = job.gate();

        let attempt = tokio::spawn(job.run_queueable());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!attempt.is_finished());

        gate.prepare();
        let (job, result) = attempt.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(job.attempt, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

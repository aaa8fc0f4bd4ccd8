//! Sequential job queue.
//!
//! A single driver task owns the queue state. At most one job is active at a
//! time; jobs start in push order. A failed job that may retry is held back
//! for its retry delay and then re-queued at the tail, and nothing else starts
//! while it waits. `Drained` is emitted once each time the queue runs dry.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::types::{Job, JobError, JobGate, JobId};

/// Lifecycle notifications published by the queue driver.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    ItemStarted {
        job_id: JobId,
        attempt: u32,
    },
    ItemFinished {
        job_id: JobId,
        attempt: u32,
    },
    ItemFailed {
        job_id: JobId,
        attempt: u32,
        error: JobError,
        will_retry: bool,
    },
    ItemRequeued {
        job_id: JobId,
    },
    /// The queue emptied. `reason` is set when it was emptied by a flush.
    Drained {
        reason: Option<JobError>,
    },
}

/// What the queue should do after an observer saw an event.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Reaction {
    #[default]
    Continue,
    /// Abandon all pending and in-flight work.
    Flush(JobError),
}

/// Receives queue events on the driver task.
///
/// Called synchronously between jobs, so a `Flush` reaction takes effect
/// before the next job can start. The reaction to `Drained` is ignored.
pub trait QueueObserver: Send + 'static {
    fn on_event(&mut self, event: &QueueEvent) -> Reaction;
}

impl QueueObserver for mpsc::UnboundedSender<QueueEvent> {
    fn on_event(&mut self, event: &QueueEvent) -> Reaction {
        let _ = self.send(event.clone());
        Reaction::Continue
    }
}

/// Returned when the driver task is gone.
#[derive(Debug, Clone, thiserror::Error)]
#[error("queue {0} is no longer running")]
pub struct QueueClosed(pub String);

enum Command {
    Push(Job),
    Flush(JobError),
}

/// Cloneable handle for pushing work to a [`SequentialQueue`].
///
/// The driver stops once every handle is dropped and no work is left.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a job to the tail of the queue.
    pub fn push(&self, job: Job) -> Result<(), QueueClosed> {
        self.commands
            .send(Command::Push(job))
            .map_err(|_| QueueClosed(self.name.to_string()))
    }

    /// Discard pending jobs, kill the active one and cancel pending retries.
    pub fn flush(&self, reason: JobError) -> Result<(), QueueClosed> {
        self.commands
            .send(Command::Flush(reason))
            .map_err(|_| QueueClosed(self.name.to_string()))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Push(job) => f.debug_tuple("Push").field(&job.id).finish(),
            Command::Flush(reason) => f.debug_tuple("Flush").field(reason).finish(),
        }
    }
}

pub struct SequentialQueue;

impl SequentialQueue {
    /// Spawn a queue driver on the current tokio runtime.
    pub fn spawn(name: impl Into<String>, observer: impl QueueObserver) -> QueueHandle {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = QueueDriver {
            name: name.clone(),
            commands: rx,
            observer: Box::new(observer),
            pending: VecDeque::new(),
            active: None,
            retries: JoinSet::new(),
            in_run: false,
            accepting: true,
        };
        tokio::spawn(driver.run());
        QueueHandle { name, commands: tx }
    }

    /// Spawn a queue whose events are forwarded to a channel.
    pub fn with_events(
        name: impl Into<String>,
    ) -> (QueueHandle, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::spawn(name, tx), rx)
    }
}

type AttemptOutcome = (Job, Result<(), JobError>);

struct ActiveJob {
    id: JobId,
    attempt: u32,
    gate: JobGate,
    handle: JoinHandle<AttemptOutcome>,
}

enum Wake {
    Command(Option<Command>),
    Outcome(JobId, u32, Result<AttemptOutcome, JoinError>),
    Requeue(Result<Job, JoinError>),
    Idle,
}

struct QueueDriver {
    name: Arc<str>,
    commands: mpsc::UnboundedReceiver<Command>,
    observer: Box<dyn QueueObserver>,
    pending: VecDeque<Job>,
    active: Option<ActiveJob>,
    /// Failed jobs sleeping out their retry delay.
    retries: JoinSet<Job>,
    /// Set while a run is in progress; cleared when `Drained` is emitted.
    in_run: bool,
    accepting: bool,
}

impl QueueDriver {
    async fn run(mut self) {
        debug!(queue = %self.name, "queue started");

        loop {
            self.advance();
            if !self.accepting && self.is_idle() {
                break;
            }

            let accepting = self.accepting;
            let has_active = self.active.is_some();
            let has_retries = !self.retries.is_empty();
            let Self {
                commands,
                active,
                retries,
                ..
            } = &mut self;

            let wake = tokio::select! {
                biased;
                command = commands.recv(), if accepting => Wake::Command(command),
                (id, attempt, outcome) = join_active(active), if has_active => {
                    Wake::Outcome(id, attempt, outcome)
                }
                Some(requeued) = retries.join_next(), if has_retries => Wake::Requeue(requeued),
                else => Wake::Idle,
            };

            match wake {
                Wake::Command(Some(command)) => self.on_command(command),
                Wake::Command(None) => self.accepting = false,
                Wake::Outcome(id, attempt, outcome) => self.on_outcome(id, attempt, outcome),
                Wake::Requeue(requeued) => self.on_requeue(requeued),
                Wake::Idle => break,
            }
        }

        debug!(queue = %self.name, "queue stopped");
    }

    fn is_idle(&self) -> bool {
        self.active.is_none() && self.retries.is_empty() && self.pending.is_empty()
    }

    /// Take in queued commands, then start the next job or report drained.
    fn advance(&mut self) {
        // A job may push follow-up work right before it completes; that push
        // must be seen before deciding the queue is empty.
        self.absorb_commands();

        if self.active.is_some() || !self.retries.is_empty() {
            return;
        }

        if let Some(job) = self.pending.pop_front() {
            self.start(job);
        } else if self.in_run {
            self.in_run = false;
            debug!(queue = %self.name, "queue drained");
            let _ = self.observer.on_event(&QueueEvent::Drained { reason: None });
        }
    }

    fn absorb_commands(&mut self) {
        while self.accepting {
            match self.commands.try_recv() {
                Ok(command) => self.on_command(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.accepting = false,
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Push(job) => {
                self.pending.push_back(job);
                self.in_run = true;
            }
            Command::Flush(reason) => self.flush(reason),
        }
    }

    fn start(&mut self, job: Job) {
        let id = job.id;
        let attempt = job.attempt + 1;
        debug!(queue = %self.name, job_id = %id, kind = job.kind(), attempt, "starting job");

        let gate = job.gate();
        let handle = tokio::spawn(job.run_queueable());
        self.active = Some(ActiveJob {
            id,
            attempt,
            gate,
            handle,
        });
        self.emit(QueueEvent::ItemStarted { job_id: id, attempt });
    }

    fn on_outcome(&mut self, id: JobId, attempt: u32, outcome: Result<AttemptOutcome, JoinError>) {
        self.active = None;

        match outcome {
            Ok((_, Ok(()))) => {
                debug!(queue = %self.name, job_id = %id, attempt, "job finished");
                self.emit(QueueEvent::ItemFinished { job_id: id, attempt });
            }
            Ok((job, Err(error))) => {
                let will_retry = job.can_retry();
                if will_retry {
                    warn!(
                        queue = %self.name,
                        job_id = %id,
                        attempt,
                        max_attempts = job.retry_policy.max_attempts,
                        error = %error,
                        "job failed, will retry"
                    );
                } else {
                    warn!(queue = %self.name, job_id = %id, attempt, error = %error, "job failed");
                }

                let flushed = self.emit(QueueEvent::ItemFailed {
                    job_id: id,
                    attempt,
                    error,
                    will_retry,
                });

                if will_retry && !flushed {
                    let delay = job.retry_delay();
                    self.retries.spawn(async move {
                        tokio::time::sleep(delay).await;
                        job
                    });
                }
            }
            // Runtime shutdown.
            Err(join_error) if join_error.is_cancelled() => {}
            Err(join_error) => {
                let error = JobError::Panicked(join_error.to_string());
                warn!(queue = %self.name, job_id = %id, attempt, error = %error, "job panicked");
                self.emit(QueueEvent::ItemFailed {
                    job_id: id,
                    attempt,
                    error,
                    will_retry: false,
                });
            }
        }
    }

    fn on_requeue(&mut self, requeued: Result<Job, JoinError>) {
        let Ok(job) = requeued else {
            return;
        };
        let id = job.id;
        debug!(queue = %self.name, job_id = %id, "job re-queued");
        self.pending.push_back(job);
        self.in_run = true;
        self.emit(QueueEvent::ItemRequeued { job_id: id });
    }

    /// Deliver an event. Returns true if the observer flushed the queue.
    fn emit(&mut self, event: QueueEvent) -> bool {
        match self.observer.on_event(&event) {
            Reaction::Continue => false,
            Reaction::Flush(reason) => {
                self.flush(reason);
                true
            }
        }
    }

    fn flush(&mut self, reason: JobError) {
        let discarded = self.pending.len();
        self.pending.clear();

        // The killed attempt finishes on its own task; its outcome is dropped
        // along with the handle.
        let killed = match self.active.take() {
            Some(active) => {
                active.gate.kill();
                true
            }
            None => false,
        };

        let cancelled_retries = self.retries.len();
        // Dropping the set aborts every sleeping retry.
        self.retries = JoinSet::new();
        self.in_run = false;

        warn!(
            queue = %self.name,
            discarded,
            killed,
            cancelled_retries,
            reason = %reason,
            "queue flushed"
        );
        let _ = self.observer.on_event(&QueueEvent::Drained {
            reason: Some(reason),
        });
    }
}

async fn join_active(
    active: &mut Option<ActiveJob>,
) -> (JobId, u32, Result<AttemptOutcome, JoinError>) {
    match active {
        Some(job) => {
            let outcome = (&mut job.handle).await;
            (job.id, job.attempt, outcome)
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::RetryPolicy;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recording_job(log: &Log, name: &'static str) -> Job {
        let log = log.clone();
        Job::from_fn(move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                Ok(())
            }
        })
        .prepared()
    }

    /// Collect events up to and including the next `Drained`.
    async fn until_drained(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("queue did not drain in time")
                .expect("queue stopped");
            let done = matches!(event, QueueEvent::Drained { .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn drained_count(events: &[QueueEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, QueueEvent::Drained { .. }))
            .count()
    }

    #[tokio::test]
    async fn runs_jobs_in_push_order_and_drains_once() {
        let log: Log = Arc::default();
        let (queue, mut events) = SequentialQueue::with_events("order");

        for name in ["one", "two", "three"] {
            queue.push(recording_job(&log, name)).unwrap();
        }

        let seen = until_drained(&mut events).await;
        assert_eq!(*log.lock().unwrap(), vec!["one", "two", "three"]);
        assert_eq!(drained_count(&seen), 1);
        assert_eq!(seen.last(), Some(&QueueEvent::Drained { reason: None }));
        let finished = seen
            .iter()
            .filter(|e| matches!(e, QueueEvent::ItemFinished { .. }))
            .count();
        assert_eq!(finished, 3);

        // Nothing more arrives for that run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn a_new_push_after_draining_starts_a_new_run() {
        let log: Log = Arc::default();
        let (queue, mut events) = SequentialQueue::with_events("runs");

        queue.push(recording_job(&log, "first")).unwrap();
        assert_eq!(drained_count(&until_drained(&mut events).await), 1);

        queue.push(recording_job(&log, "second")).unwrap();
        assert_eq!(drained_count(&until_drained(&mut events).await), 1);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn flush_discards_pending_jobs_without_running_them() {
        let log: Log = Arc::default();
        let (queue, mut events) = SequentialQueue::with_events("flush");

        // Head of the queue stays blocked on its readiness gate.
        let blocked = Job::from_fn(|| async { Ok(()) });
        let blocked_gate = blocked.gate();
        queue.push(blocked).unwrap();
        queue.push(recording_job(&log, "pending")).unwrap();
        queue.flush(JobError::aborted("shutdown")).unwrap();

        let seen = until_drained(&mut events).await;
        assert_eq!(
            seen.last(),
            Some(&QueueEvent::Drained {
                reason: Some(JobError::aborted("shutdown"))
            })
        );
        // Opening the gate of the killed job no longer runs anything.
        blocked_gate.prepare();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(log.lock().unwrap().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures_and_reports_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let flaky = Job::from_fn(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(JobError::failed("transient"))
                } else {
                    Ok(())
                }
            }
        })
        .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(5)))
        .prepared();

        let (queue, mut events) = SequentialQueue::with_events("retry");
        queue.push(flaky).unwrap();

        let seen = until_drained(&mut events).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let retried_failures = seen
            .iter()
            .filter(|e| matches!(e, QueueEvent::ItemFailed { will_retry: true, .. }))
            .count();
        assert_eq!(retried_failures, 2);
        assert!(seen.iter().any(|e| matches!(e, QueueEvent::ItemFinished { attempt: 3, .. })));
        assert_eq!(drained_count(&seen), 1);
    }

    #[tokio::test]
    async fn retried_job_moves_to_the_tail() {
        let log: Log = Arc::default();
        let failed_once = Arc::new(AtomicU32::new(0));

        let flaky = {
            let log = log.clone();
            let failed_once = failed_once.clone();
            Job::from_fn(move || {
                let log = log.clone();
                let failed_once = failed_once.clone();
                async move {
                    log.lock().unwrap().push("flaky");
                    if failed_once.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(JobError::failed("first try"))
                    } else {
                        Ok(())
                    }
                }
            })
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(5)))
            .prepared()
        };

        let (queue, mut events) = SequentialQueue::with_events("tail");
        queue.push(flaky).unwrap();
        queue.push(recording_job(&log, "second")).unwrap();

        let seen = until_drained(&mut events).await;
        assert_eq!(*log.lock().unwrap(), vec!["flaky", "second", "flaky"]);
        assert!(seen.iter().any(|e| matches!(e, QueueEvent::ItemRequeued { .. })));
    }

    #[tokio::test]
    async fn exhausted_job_does_not_stop_the_queue() {
        let log: Log = Arc::default();
        let (queue, mut events) = SequentialQueue::with_events("exhausted");

        queue
            .push(Job::from_fn(|| async { Err(JobError::failed("nope")) }).prepared())
            .unwrap();
        queue.push(recording_job(&log, "after")).unwrap();

        let seen = until_drained(&mut events).await;
        assert!(seen.iter().any(|e| matches!(e, QueueEvent::ItemFailed { will_retry: false, .. })));
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    struct FlushOnFailure(mpsc::UnboundedSender<QueueEvent>);

    impl QueueObserver for FlushOnFailure {
        fn on_event(&mut self, event: &QueueEvent) -> Reaction {
            let _ = self.0.send(event.clone());
            match event {
                QueueEvent::ItemFailed {
                    error,
                    will_retry: false,
                    ..
                } => Reaction::Flush(error.clone()),
                _ => Reaction::Continue,
            }
        }
    }

    #[tokio::test]
    async fn observer_flush_stops_remaining_work() {
        let log: Log = Arc::default();
        let (tx, mut events) = mpsc::unbounded_channel();
        let queue = SequentialQueue::spawn("observer", FlushOnFailure(tx));

        queue.push(recording_job(&log, "before")).unwrap();
        queue
            .push(Job::from_fn(|| async { Err(JobError::failed("fatal")) }).prepared())
            .unwrap();
        queue.push(recording_job(&log, "never")).unwrap();

        let seen = until_drained(&mut events).await;
        assert_eq!(
            seen.last(),
            Some(&QueueEvent::Drained {
                reason: Some(JobError::failed("fatal"))
            })
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*log.lock().unwrap(), vec!["before"]);
    }

    #[tokio::test]
    async fn panicking_action_is_reported_as_a_failure() {
        let (queue, mut events) = SequentialQueue::with_events("panic");
        queue
            .push(
                Job::from_fn(|| async {
                    let fail = true;
                    if fail {
                        panic!("action blew up");
                    }
                    Ok(())
                })
                .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO))
                .prepared(),
            )
            .unwrap();

        let seen = until_drained(&mut events).await;
        assert!(seen.iter().any(|e| matches!(
            e,
            QueueEvent::ItemFailed {
                error: JobError::Panicked(_),
                will_retry: false,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn job_waits_for_its_gate_and_blocks_the_queue() {
        let log: Log = Arc::default();
        let (queue, mut events) = SequentialQueue::with_events("gate");

        let gated = {
            let log = log.clone();
            Job::from_fn(move || {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push("gated");
                    Ok(())
                }
            })
        };
        let gate = gated.gate();
        queue.push(gated).unwrap();
        queue.push(recording_job(&log, "next")).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(log.lock().unwrap().is_empty());

        gate.prepare();
        until_drained(&mut events).await;
        assert_eq!(*log.lock().unwrap(), vec!["gated", "next"]);
    }

    #[tokio::test]
    async fn follow_up_work_pushed_by_a_job_runs_in_the_same_run() {
        let log: Log = Arc::default();
        let (queue, mut events) = SequentialQueue::with_events("follow-up");

        let follow_up = recording_job(&log, "follow-up");
        let slot = Arc::new(Mutex::new(Some(follow_up)));
        let pusher = {
            let queue = queue.clone();
            let log = log.clone();
            Job::from_fn(move || {
                let queue = queue.clone();
                let log = log.clone();
                let next = slot.lock().unwrap().take();
                async move {
                    log.lock().unwrap().push("pusher");
                    if let Some(next) = next {
                        queue.push(next).map_err(|e| JobError::failed(e.to_string()))?;
                    }
                    Ok(())
                }
            })
            .prepared()
        };
        queue.push(pusher).unwrap();

        let seen = until_drained(&mut events).await;
        assert_eq!(*log.lock().unwrap(), vec!["pusher", "follow-up"]);
        assert_eq!(drained_count(&seen), 1);
    }
}

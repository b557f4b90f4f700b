//! Bounded worker pool running device operations off the interaction thread.
//!
//! [`TaskPool`] accepts arbitrary units of work from device services and
//! executes them on a bounded set of tokio tasks. Admission is never
//! rejected here (device-level admission control lives in the service
//! guard); excess tasks queue on the pool's semaphore.
//!
//! Every task produces the fixed event sequence `Started`, zero or more
//! `Output`, then exactly one of `Finished`/`Failed` — even when cancelled
//! before it ran. `Failed` is reserved for panics in the work itself;
//! hardware failures travel inside a `Finished` result.
//!
//! The pool is explicitly constructed and explicitly owned: the session
//! builds one, hands it to device services, and drains it on shutdown.
//! There is no global pool singleton.

use crate::core::OperationResult;
use crate::error::{AppResult, BenchError, ErrorKind};
use crate::input::{InputBroker, InputError};
use crate::messages::{EventSink, TaskEvent, TaskId};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

// =============================================================================
// Cancellation
// =============================================================================

/// Shared cooperative cancellation flag for one task.
///
/// Cancellation is observed at safe points by the controller and by any
/// pending input request; there is no forced termination of running work.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes every waiter.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before checking to avoid a lost wakeup.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Output capture
// =============================================================================

/// Line-buffered sink for a task's diagnostic output.
///
/// Complete lines are forwarded as [`TaskEvent::Output`] so long-running
/// controller work streams progress without a bespoke progress API. The
/// sink implements [`std::io::Write`], so anything that writes text can be
/// pointed at it; partial trailing output is flushed when the task ends.
#[derive(Clone)]
pub struct OutputSink {
    task: TaskId,
    events: EventSink,
    buf: Arc<Mutex<String>>,
}

impl OutputSink {
    fn new(task: TaskId, events: EventSink) -> Self {
        Self {
            task,
            events,
            buf: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Emits one complete output line.
    pub fn line(&self, line: impl AsRef<str>) {
        (self.events)(TaskEvent::Output {
            task: self.task,
            line: line.as_ref().to_string(),
        });
    }

    /// Emits any buffered partial line.
    pub fn flush_partial(&self) {
        let mut buf = match self.buf.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !buf.is_empty() {
            let rest = std::mem::take(&mut *buf);
            self.line(rest);
        }
    }
}

impl std::io::Write for OutputSink {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(bytes);
        let mut buf = match self.buf.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        buf.push_str(&text);
        while let Some(pos) = buf.find('\n') {
            let line: String = buf.drain(..=pos).collect();
            self.line(line.trim_end_matches('\n'));
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_partial();
        Ok(())
    }
}

// =============================================================================
// Operation context
// =============================================================================

/// Everything a controller call may touch while running inside the pool:
/// its output sink, its cancellation token, and the device's input broker.
pub struct OpContext {
    task: TaskId,
    output: OutputSink,
    cancel: CancelToken,
    input: InputBroker,
}

impl OpContext {
    /// Builds a detached context, for exercising controllers directly in
    /// tests without a pool.
    pub fn detached(events: EventSink, input: InputBroker) -> Self {
        let task = TaskId::new();
        Self {
            task,
            output: OutputSink::new(task, events),
            cancel: CancelToken::new(),
            input,
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn output(&self) -> &OutputSink {
        &self.output
    }

    /// Emits one diagnostic line.
    pub fn emit(&self, line: impl AsRef<str>) {
        self.output.line(line);
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe-point check: returns the terminal result to use when the task
    /// has been cancelled, `None` otherwise.
    pub fn check_cancelled(&self) -> Option<OperationResult> {
        if self.is_cancelled() {
            Some(OperationResult::failure(
                ErrorKind::Cancelled,
                "operation cancelled",
            ))
        } else {
            None
        }
    }

    /// Sleeps for `dur`, waking early on cancellation. Returns `true` if
    /// the token was cancelled.
    pub async fn sleep(&self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    /// Pauses the operation until the operator answers, the deadline
    /// elapses, or the task is cancelled.
    pub async fn request_input(
        &self,
        prompt: &str,
        deadline: Option<Duration>,
    ) -> Result<String, InputError> {
        self.input.request(prompt, deadline, &self.cancel).await
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// The work payload: consumes the context and yields one result.
pub type TaskWork = Box<dyn FnOnce(OpContext) -> BoxFuture<'static, OperationResult> + Send>;

/// One scheduled unit of background work backing a single requested
/// operation. Created by a device service, destroyed once its terminal
/// event has been delivered.
pub struct Task {
    pub id: TaskId,
    pub operation: String,
    pub device: String,
    pub input: InputBroker,
    pub work: TaskWork,
}

impl Task {
    pub fn new(
        device: impl Into<String>,
        operation: impl Into<String>,
        input: InputBroker,
        work: TaskWork,
    ) -> Self {
        Self {
            id: TaskId::new(),
            operation: operation.into(),
            device: device.into(),
            input,
            work,
        }
    }
}

/// Handle returned by [`TaskPool::submit`] for cancellation and
/// identification.
pub struct TaskHandle {
    pub id: TaskId,
    cancel: CancelToken,
}

impl TaskHandle {
    /// Requests cooperative cancellation. A task still waiting for a pool
    /// slot short-circuits without running its work.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Bounded pool of background execution contexts.
pub struct TaskPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
    accepting: Arc<AtomicBool>,
    inflight: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Creates a pool running at most `max_workers` tasks concurrently.
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            accepting: Arc::new(AtomicBool::new(true)),
            inflight: Mutex::new(Vec::new()),
        }
    }

    /// Submits a task; queues when all workers are occupied. Events are
    /// delivered through `events`, which must only enqueue toward the
    /// interaction thread.
    pub fn submit(&self, task: Task, events: EventSink) -> AppResult<TaskHandle> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BenchError::ShuttingDown);
        }

        let cancel = CancelToken::new();
        let handle = TaskHandle {
            id: task.id,
            cancel: cancel.clone(),
        };

        let permits = self.permits.clone();
        let Task {
            id,
            operation,
            device,
            input,
            work,
        } = task;
        debug!(task = %id, device = %device, operation = %operation, "task submitted");

        let join = tokio::spawn(async move {
            let permit = tokio::select! {
                acquired = permits.acquire_owned() => match acquired {
                    Ok(p) => Some(p),
                    // Semaphore closed: pool drained while we queued.
                    Err(_) => None,
                },
                _ = cancel.cancelled() => None,
            };

            events(TaskEvent::Started {
                task: id,
                operation: operation.clone(),
            });

            if permit.is_none() || cancel.is_cancelled() {
                events(TaskEvent::Finished {
                    task: id,
                    result: OperationResult::failure(
                        ErrorKind::Cancelled,
                        format!("{operation} cancelled before it started"),
                    ),
                });
                return;
            }

            let output = OutputSink::new(id, events.clone());
            let ctx = OpContext {
                task: id,
                output: output.clone(),
                cancel: cancel.clone(),
                input,
            };

            // The work runs in its own task so a panic surfaces as a join
            // error instead of tearing down the pool slot.
            let inner = tokio::spawn((work)(ctx));
            let terminal = match inner.await {
                Ok(result) => TaskEvent::Finished { task: id, result },
                Err(join_err) => TaskEvent::Failed {
                    task: id,
                    message: panic_message(&operation, join_err),
                },
            };
            output.flush_partial();
            events(terminal);
            drop(permit);
        });

        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.retain(|h| !h.is_finished());
            inflight.push(join);
        }
        Ok(handle)
    }

    /// Number of tasks currently holding a worker slot.
    pub fn busy_workers(&self) -> usize {
        self.max_workers - self.permits.available_permits().min(self.max_workers)
    }

    /// Stops accepting new tasks and waits up to `grace` for in-flight
    /// tasks to deliver their terminal events. Stragglers are detached,
    /// never forcibly terminated.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = match self.inflight.lock() {
            Ok(mut inflight) => inflight.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        info!(tasks = handles.len(), "draining task pool");
        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("pool task ended abnormally during drain: {e}"),
                Err(_) => warn!("pool task did not finish within {grace:?}, detaching"),
            }
        }
        self.permits.close();
    }
}

fn panic_message(operation: &str, err: JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("{operation} failed: {detail}")
    } else {
        format!("{operation} aborted")
    }
}

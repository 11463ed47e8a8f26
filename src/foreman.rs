//! # Foreman
//!
//! One foreman drains one fair queue with a fixed pool of workers. Workers announce
//! themselves idle on a shared channel; the foreman only pops once it has an idle
//! worker to hand the task to, so tasks never wait in process memory and a node
//! never takes more work than it can start immediately.
//!
//! Stopping cancels the pop loop, closes every worker's job channel and waits for
//! the workers, which finish the task they are on first.

use futures::FutureExt;
use opentelemetry::KeyValue;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{EMPTY_QUEUE_BACKOFF, SLOW_TASK_FRACTION};
use crate::error::MailroomError;
use crate::metrics;
use crate::queue::{PoppedTask, TaskQueue};
use crate::runtime::Runtime;

/// How a single task execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Error,
    Panic,
    Timeout,
    UnknownType,
    DecodeError,
    AssetsError,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::Error => "error",
            TaskOutcome::Panic => "panic",
            TaskOutcome::Timeout => "timeout",
            TaskOutcome::UnknownType => "unknown_type",
            TaskOutcome::DecodeError => "decode_error",
            TaskOutcome::AssetsError => "assets_error",
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

thread_local! {
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records the panicking thread's stack, keeping the
/// existing hook's output
pub(crate) fn capture_panic_stacks() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// Stack of the last panic on this thread, if the hook saw one
pub(crate) fn take_panic_stack() -> Option<String> {
    PANIC_STACK.with(|slot| slot.borrow_mut().take())
}

/// Run a popped task and mark it done on its queue. Never fails: every problem is
/// logged, counted and reported in the returned outcome.
pub async fn execute_task(rt: &Runtime, queue: &dyn TaskQueue, popped: PoppedTask) -> TaskOutcome {
    let owner_id = popped.owner_id;
    let started = Instant::now();
    let (task_type, outcome) = perform_task(rt, &popped).await;

    if let Err(e) = queue.done(owner_id).await {
        error!(queue = queue.name(), owner_id = %owner_id, error = %e, "Failed to mark task done");
    }

    let elapsed = started.elapsed();
    metrics::tasks_executed_total().add(
        1,
        &[
            KeyValue::new("queue", queue.name().to_string()),
            KeyValue::new("task_type", task_type.clone()),
            KeyValue::new("result", outcome.as_str()),
        ],
    );
    metrics::task_duration().record(
        elapsed.as_secs_f64() * 1000.0,
        &[
            KeyValue::new("queue", queue.name().to_string()),
            KeyValue::new("task_type", task_type.clone()),
        ],
    );
    debug!(queue = queue.name(), owner_id = %owner_id, task_type = %task_type, %outcome, elapsed_ms = elapsed.as_millis() as u64, "Task finished");
    outcome
}

async fn perform_task(rt: &Runtime, popped: &PoppedTask) -> (String, TaskOutcome) {
    let owner_id = popped.owner_id;

    let envelope = match popped.envelope() {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(queue = %popped.queue, owner_id = %owner_id, payload = %popped.payload, error = %e, "Unable to read task envelope");
            return ("unknown".to_string(), TaskOutcome::DecodeError);
        }
    };
    let task_type = envelope.task_type.clone();

    let task = match rt.tasks.decode(&envelope) {
        Ok(task) => task,
        Err(MailroomError::UnknownTaskType(_)) => {
            error!(queue = %popped.queue, owner_id = %owner_id, task_type = %task_type, "Unknown task type, discarding");
            return (task_type, TaskOutcome::UnknownType);
        }
        Err(e) => {
            error!(queue = %popped.queue, owner_id = %owner_id, task_type = %task_type, error = %e, "Unable to decode task, discarding");
            return (task_type, TaskOutcome::DecodeError);
        }
    };

    let oa = match rt.assets.get(owner_id, task.with_assets()).await {
        Ok(oa) => oa,
        Err(e) => {
            error!(queue = %popped.queue, owner_id = %owner_id, task_type = %task_type, error = %e, "Unable to load org assets");
            return (task_type, TaskOutcome::AssetsError);
        }
    };

    capture_panic_stacks();
    // drop anything left by a panic caught elsewhere on this thread
    take_panic_stack();

    let timeout = task.timeout();
    let started = Instant::now();
    let run = AssertUnwindSafe(task.perform(rt, &oa)).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, run).await {
        Ok(Ok(Ok(()))) => TaskOutcome::Success,
        Ok(Ok(Err(e))) => {
            error!(queue = %popped.queue, owner_id = %owner_id, task_type = %task_type, task = %envelope.task, error = %e, "Task failed");
            TaskOutcome::Error
        }
        Ok(Err(panic)) => {
            // the stack is lost if the task moved threads after panicking
            let stack = take_panic_stack().unwrap_or_else(|| "unavailable".to_string());
            error!(queue = %popped.queue, owner_id = %owner_id, task_type = %task_type, task = %envelope.task, panic = %panic_message(panic.as_ref()), %stack, "Task panicked");
            metrics::task_panics_total().add(1, &[KeyValue::new("task_type", task_type.clone())]);
            TaskOutcome::Panic
        }
        Err(_) => {
            error!(queue = %popped.queue, owner_id = %owner_id, task_type = %task_type, timeout_secs = timeout.as_secs_f64(), "Task timed out");
            TaskOutcome::Timeout
        }
    };

    let elapsed = started.elapsed();
    if outcome != TaskOutcome::Timeout && elapsed.as_secs_f64() >= timeout.as_secs_f64() * SLOW_TASK_FRACTION {
        warn!(queue = %popped.queue, owner_id = %owner_id, task_type = %task_type, elapsed_ms = elapsed.as_millis() as u64, timeout_ms = timeout.as_millis() as u64, "Task close to its timeout");
    }

    (task_type, outcome)
}

/// Pops tasks from one queue and hands them to its workers
pub struct Foreman {
    queue_name: String,
    shutdown: CancellationToken,
    pop_loop: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Foreman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Foreman")
            .field("queue", &self.queue_name)
            .field("workers", &self.workers.len())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Foreman {
    /// Spawn the workers and the pop loop
    pub fn start(rt: Arc<Runtime>, queue: Arc<dyn TaskQueue>, worker_count: usize) -> Self {
        let shutdown = CancellationToken::new();
        let (idle_tx, idle_rx) = mpsc::channel::<usize>(worker_count.max(1));

        let mut job_senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (job_tx, job_rx) = mpsc::channel::<PoppedTask>(1);
            job_senders.push(job_tx);
            workers.push(tokio::spawn(work(
                worker_id,
                rt.clone(),
                queue.clone(),
                idle_tx.clone(),
                job_rx,
            )));
        }
        drop(idle_tx);

        let pop_loop = tokio::spawn(pop_loop(queue.clone(), idle_rx, job_senders, shutdown.clone()));

        info!(queue = queue.name(), workers = worker_count, "Foreman started");
        Self {
            queue_name: queue.name().to_string(),
            shutdown,
            pop_loop,
            workers,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Stop popping and wait for the workers to finish what they are running
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.pop_loop.await {
            error!(queue = %self.queue_name, error = %e, "Foreman pop loop ended abnormally");
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(queue = %self.queue_name, error = %e, "Worker ended abnormally");
            }
        }
        info!(queue = %self.queue_name, "Foreman stopped");
    }
}

async fn pop_loop(
    queue: Arc<dyn TaskQueue>,
    mut idle_rx: mpsc::Receiver<usize>,
    job_senders: Vec<mpsc::Sender<PoppedTask>>,
    shutdown: CancellationToken,
) {
    'workers: loop {
        let worker_id = tokio::select! {
            _ = shutdown.cancelled() => break,
            idle = idle_rx.recv() => match idle {
                Some(worker_id) => worker_id,
                None => break,
            },
        };

        loop {
            match queue.pop().await {
                Ok(Some(task)) => {
                    if let Err(e) = job_senders[worker_id].send(task).await {
                        // the worker is gone, put the owner's slot back
                        let task = e.0;
                        error!(queue = queue.name(), worker_id, "Worker unavailable, task lost");
                        if let Err(e) = queue.done(task.owner_id).await {
                            error!(queue = queue.name(), error = %e, "Failed to mark task done");
                        }
                    }
                    continue 'workers;
                }
                Ok(None) => {}
                Err(e) => error!(queue = queue.name(), error = %e, "Error popping task"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break 'workers,
                _ = tokio::time::sleep(EMPTY_QUEUE_BACKOFF) => {}
            }
        }
    }

    // dropping the senders closes every job channel
    drop(job_senders);
    debug!(queue = queue.name(), "Pop loop exited");
}

async fn work(
    worker_id: usize,
    rt: Arc<Runtime>,
    queue: Arc<dyn TaskQueue>,
    idle_tx: mpsc::Sender<usize>,
    mut job_rx: mpsc::Receiver<PoppedTask>,
) {
    loop {
        if idle_tx.send(worker_id).await.is_err() {
            break;
        }
        match job_rx.recv().await {
            Some(task) => {
                execute_task(&rt, queue.as_ref(), task).await;
            }
            None => break,
        }
    }
    debug!(queue = queue.name(), worker_id, "Worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("kaboom");
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bad state"));
        assert_eq!(panic_message(payload.as_ref()), "bad state");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_panic_stack_is_captured_once_taken() {
        capture_panic_stacks();
        take_panic_stack();

        let caught = std::panic::catch_unwind(|| panic!("kaboom"));
        assert!(caught.is_err());

        let stack = take_panic_stack().unwrap();
        assert!(!stack.is_empty());
        assert!(take_panic_stack().is_none());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(TaskOutcome::UnknownType.to_string(), "unknown_type");
        assert_eq!(TaskOutcome::AssetsError.as_str(), "assets_error");
    }
}

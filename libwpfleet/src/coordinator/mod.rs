//! Bounded-parallel dispatch of a run's tasks.
//!
//! A run moves `planned -> dispatching -> draining -> closed`. While
//! dispatching, at most `concurrency` tasks are in flight. Tasks are started
//! in planner order but finish in any order; each result is persisted the
//! moment it arrives, before it joins the in-memory collection.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use derive_getters::Getters;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};

use crate::executor::{Stopwatch, TaskExecutor, TaskResult};
use crate::log::*;
use crate::plan::Task;
use crate::store::RunStore;

pub mod events;

use self::events::{EventSink, RunEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Planned,
    Dispatching,
    Draining,
    Closed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Planned => "planned",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Draining => "draining",
            RunPhase::Closed => "closed",
        })
    }
}

/// Durable destination for finished results.
#[async_trait]
pub trait ResultRecorder: Send + Sync {
    /// Persist `result` under `run_id`, returning its task id.
    async fn record(&self, run_id: i64, result: &TaskResult) -> Result<i64>;
}

#[async_trait]
impl ResultRecorder for RunStore {
    async fn record(&self, run_id: i64, result: &TaskResult) -> Result<i64> {
        Ok(self.insert_task(run_id, result).await?)
    }
}

#[derive(Getters, Debug, Clone)]
pub struct Coordinator {
    concurrency: usize,
    #[getter(skip)]
    executor: Arc<dyn TaskExecutor>,
    #[getter(skip)]
    events: Arc<dyn EventSink>,
}

impl Coordinator {
    pub fn new(
        concurrency: usize,
        executor: Arc<dyn TaskExecutor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            executor,
            events,
        }
    }

    /// Execute every task of `run_id` and return the results in completion
    /// order. Never fails: a task that errors or panics becomes a `failed`
    /// result, and a result that cannot be persisted is still returned.
    #[tracing::instrument(skip(self, tasks, recorder), fields(tasks = tasks.len()))]
    pub async fn dispatch<R>(&self, run_id: i64, tasks: Vec<Task>, recorder: &R) -> Vec<TaskResult>
    where
        R: ResultRecorder + ?Sized,
    {
        let total = tasks.len();
        emit(&self.events, RunEvent::PhaseChanged {
            run_id,
            phase: RunPhase::Planned,
        })
        .await;

        let (tx, mut rx) = mpsc::channel::<TaskResult>(self.concurrency);
        let dispatcher = tokio::spawn(dispatch_all(
            run_id,
            tasks,
            self.concurrency,
            self.executor.clone(),
            self.events.clone(),
            tx,
        ));

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            let result = match recorder.record(run_id, &result).await {
                Ok(task_id) => result.persisted_as(run_id, task_id),
                Err(e) => {
                    error!(
                        "failed persisting result of {}: {:?}",
                        result.task().label(),
                        e
                    );
                    result
                }
            };
            results.push(result);

            let last = &results[results.len() - 1];
            emit(&self.events, RunEvent::TaskFinished {
                label: last.task().label(),
                completed: results.len(),
                total,
                status: *last.status(),
                duration_ms: *last.duration_ms(),
                error_message: last.error_message().clone(),
            })
            .await;
        }

        if let Err(e) = dispatcher.await {
            error!("dispatcher stopped abnormally: {}", e);
        }
        emit(&self.events, RunEvent::PhaseChanged {
            run_id,
            phase: RunPhase::Closed,
        })
        .await;
        results
    }
}

async fn emit(events: &Arc<dyn EventSink>, event: RunEvent) {
    if let Err(e) = events.emit(event).await {
        warn!("dropping run event: {}", e);
    }
}

/// Start tasks in order as pool slots free up. Returns once every task has
/// been handed to a worker; the workers hold the remaining senders.
async fn dispatch_all(
    run_id: i64,
    tasks: Vec<Task>,
    concurrency: usize,
    executor: Arc<dyn TaskExecutor>,
    events: Arc<dyn EventSink>,
    tx: mpsc::Sender<TaskResult>,
) {
    emit(&events, RunEvent::PhaseChanged {
        run_id,
        phase: RunPhase::Dispatching,
    })
    .await;

    let pool = Arc::new(Semaphore::new(concurrency));
    for task in tasks {
        let permit = match pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("worker pool closed: {}", e);
                break;
            }
        };
        let executor = executor.clone();
        let events = events.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let label = task.label();
            emit(&events, RunEvent::TaskStarted {
                label: label.clone(),
            })
            .await;
            let result = execute_guarded(executor.as_ref(), task).await;
            if tx.send(result).await.is_err() {
                error!("result of {} dropped: collector is gone", label);
            }
        });
    }

    emit(&events, RunEvent::PhaseChanged {
        run_id,
        phase: RunPhase::Draining,
    })
    .await;
}

/// Run one task, converting errors and panics into `UNKNOWN_EXCEPTION`
/// results.
async fn execute_guarded(executor: &dyn TaskExecutor, task: Task) -> TaskResult {
    let clock = Stopwatch::start();
    let outcome = AssertUnwindSafe(executor.execute(&task))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("task exception: {}: {:?}", task.label(), e);
            TaskResult::unknown_exception(task, format!("{e:#}"), clock)
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            error!("task panicked: {}: {}", task.label(), detail);
            TaskResult::unknown_exception(task, detail, clock)
        }
    }
}

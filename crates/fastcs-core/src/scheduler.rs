//! Supervised periodic tasks.
//!
//! Every background task the backend starts runs inside [`supervised`], which
//! turns a panic into a [`TaskReport`] instead of tearing down the loop, and
//! is tracked by a [`TaskSet`] so shutdown can await (or abort) all of them.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{FastCsError, Result};
use crate::io_ref::Period;

/// How a supervised task ended.
#[derive(Debug)]
pub(crate) struct TaskReport {
    pub name: String,
    /// Panic message, if the task panicked
    pub panic: Option<String>,
}

async fn supervised<F>(name: String, task: F) -> TaskReport
where
    F: Future<Output = ()> + Send,
{
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(()) => TaskReport { name, panic: None },
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(task = %name, panic = %message, "Task panicked");
            TaskReport {
                name,
                panic: Some(message),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Named tasks spawned onto one runtime handle.
#[derive(Default)]
pub(crate) struct TaskSet {
    set: JoinSet<TaskReport>,
    names: Vec<String>,
}

impl TaskSet {
    pub fn spawn_on<F>(&mut self, name: String, task: F, handle: &Handle)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = %name, "Spawning task");
        self.names.push(name.clone());
        self.set.spawn_on(supervised(name, task), handle);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Wait up to `timeout` for every task to end, then abort the rest.
    ///
    /// Returns one `TaskFailed` per panicked or aborted task.
    pub async fn join_all(mut self, timeout: Duration) -> Vec<FastCsError> {
        let mut errors = Vec::new();
        let mut finished = HashSet::new();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, self.set.join_next()).await {
                Ok(Some(Ok(report))) => {
                    if let Some(message) = report.panic {
                        errors.push(FastCsError::TaskFailed {
                            task: report.name.clone(),
                            message,
                        });
                    }
                    finished.insert(report.name);
                }
                Ok(Some(Err(join_error))) => errors.push(FastCsError::TaskFailed {
                    task: "unknown".into(),
                    message: join_error.to_string(),
                }),
                Ok(None) => break,
                Err(_) => {
                    let stragglers: Vec<&String> = self
                        .names
                        .iter()
                        .filter(|name| !finished.contains(*name))
                        .collect();
                    tracing::warn!(
                        count = stragglers.len(),
                        tasks = ?stragglers,
                        timeout_ms = timeout.as_millis() as u64,
                        "Aborting tasks that did not stop in time"
                    );
                    for name in stragglers {
                        errors.push(FastCsError::TaskFailed {
                            task: name.clone(),
                            message: format!("aborted after {timeout:?}"),
                        });
                    }
                    self.set.shutdown().await;
                    break;
                }
            }
        }
        errors
    }
}

/// Run `op` every `period` until `shutdown` is cancelled.
///
/// The first call happens immediately. Late ticks are delayed rather than
/// bunched up. Recoverable errors are logged and the schedule continues; any
/// other error ends the task.
pub(crate) async fn run_periodic<F, Fut>(
    task: String,
    period: Period,
    shutdown: CancellationToken,
    mut op: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    let mut interval = tokio::time::interval(period.get());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let result = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            result = op() => result,
        };

        match result {
            Ok(()) => tracing::trace!(%task, "Periodic call completed"),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(%task, error = %e, "Periodic call failed, retrying next period");
            }
            Err(e) => {
                tracing::error!(%task, error = %e, "Periodic call failed, stopping task");
                break;
            }
        }
    }
    tracing::debug!(%task, "Periodic task stopped");
}

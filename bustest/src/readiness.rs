//! The `wait_for_running` barrier.
//!
//! Every state transition bumps a counter in a `watch` channel owned by the
//! service. Waiters re-check task states each time the counter changes.

use std::sync::Arc;
use std::time::Duration;

use bustest_core::{TaskName, TaskState};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{BusTestError, TaskFailure};
use crate::task::BusTask;

/// Publishes "some task changed state".
#[derive(Debug, Clone)]
pub struct TransitionNotifier {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for TransitionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// Result of waiting for a set of tasks to become ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every task reached Running (or already finished cleanly).
    Running,
    /// A task entered Error before all were ready.
    TaskFailed {
        task: TaskName,
        failure: Option<TaskFailure>,
    },
    /// The timeout elapsed first.
    TimedOut { pending: Vec<TaskName> },
}

impl WaitOutcome {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Turn the outcome into a `Result`; `elapsed` is reported on timeout.
    pub fn into_result(self, elapsed: Duration) -> Result<(), BusTestError> {
        match self {
            Self::Running => Ok(()),
            Self::TaskFailed { task, failure } => Err(BusTestError::TaskFailed {
                failure: failure.unwrap_or_else(|| {
                    TaskFailure::new(
                        crate::error::ErrorKind::BackendUnreachable,
                        "task entered error state",
                    )
                }),
                task,
            }),
            Self::TimedOut { pending } => Err(BusTestError::Timeout { elapsed, pending }),
        }
    }
}

fn evaluate(tasks: &[Arc<dyn BusTask>]) -> Option<WaitOutcome> {
    if let Some(failed) = tasks.iter().find(|t| t.state() == TaskState::Error) {
        return Some(WaitOutcome::TaskFailed {
            task: failed.name().clone(),
            failure: failed.failure(),
        });
    }
    let ready = tasks
        .iter()
        .all(|t| matches!(t.state(), TaskState::Running | TaskState::Finished));
    ready.then_some(WaitOutcome::Running)
}

fn pending(tasks: &[Arc<dyn BusTask>]) -> Vec<TaskName> {
    tasks
        .iter()
        .filter(|t| !matches!(t.state(), TaskState::Running | TaskState::Finished))
        .map(|t| t.name().clone())
        .collect()
}

/// Wait until every task is ready, one fails, or `timeout` elapses.
///
/// A timeout too large to be represented as a deadline waits without one.
/// Has no effect on task state.
pub(crate) async fn wait_for_tasks(
    tasks: &[Arc<dyn BusTask>],
    notifier: &TransitionNotifier,
    timeout: Duration,
) -> WaitOutcome {
    let deadline = Instant::now().checked_add(timeout);
    let mut rx = notifier.subscribe();
    loop {
        rx.borrow_and_update();
        if let Some(outcome) = evaluate(tasks) {
            return outcome;
        }
        let changed = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, rx.changed()).await,
            None => Ok(rx.changed().await),
        };
        match changed {
            Ok(Ok(())) => continue,
            // Sender dropped: nothing can change anymore.
            Ok(Err(_)) | Err(_) => {
                return evaluate(tasks).unwrap_or_else(|| WaitOutcome::TimedOut {
                    pending: pending(tasks),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::task::test_support::ManualTask;

    fn tasks(list: &[&ManualTask]) -> Vec<Arc<dyn BusTask>> {
        list.iter()
            .map(|t| Arc::new((*t).clone()) as Arc<dyn BusTask>)
            .collect()
    }

    #[tokio::test]
    async fn test_empty_set_is_running() {
        let notifier = TransitionNotifier::new();
        let outcome = wait_for_tasks(&[], &notifier, Duration::from_millis(10)).await;
        assert_eq!(outcome, WaitOutcome::Running);
    }

    #[tokio::test]
    async fn test_wakes_on_transition() {
        let notifier = TransitionNotifier::new();
        let a = ManualTask::new("a", &notifier);
        let b = ManualTask::new("b", &notifier);
        let set = tasks(&[&a, &b]);

        let (a2, b2) = (a.clone(), b.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            a2.advance(TaskState::Started);
            a2.advance(TaskState::Running);
            tokio::time::sleep(Duration::from_millis(20)).await;
            b2.advance(TaskState::Started);
            b2.advance(TaskState::Running);
        });

        let outcome = wait_for_tasks(&set, &notifier, Duration::from_secs(5)).await;
        assert_eq!(outcome, WaitOutcome::Running);
    }

    #[tokio::test]
    async fn test_error_reported_with_failure() {
        let notifier = TransitionNotifier::new();
        let ok = ManualTask::new("ok", &notifier);
        let bad = ManualTask::new("bad", &notifier);
        ok.advance(TaskState::Started);
        ok.advance(TaskState::Running);
        bad.advance(TaskState::Started);
        bad.fail(TaskFailure::new(ErrorKind::LaunchFailed, "exited with 1"));

        let outcome = wait_for_tasks(&tasks(&[&ok, &bad]), &notifier, Duration::from_secs(1)).await;
        match outcome {
            WaitOutcome::TaskFailed { task, failure } => {
                assert_eq!(task.as_str(), "bad");
                assert_eq!(failure.unwrap().kind, ErrorKind::LaunchFailed);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_times_out_with_pending_names() {
        let notifier = TransitionNotifier::new();
        let ready = ManualTask::new("ready", &notifier);
        let slow = ManualTask::new("slow", &notifier);
        ready.advance(TaskState::Started);
        ready.advance(TaskState::Running);
        slow.advance(TaskState::Started);

        let started = std::time::Instant::now();
        let outcome = wait_for_tasks(
            &tasks(&[&ready, &slow]),
            &notifier,
            Duration::from_millis(100),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            outcome,
            WaitOutcome::TimedOut {
                pending: vec![TaskName::from("slow")]
            }
        );
    }

    #[tokio::test]
    async fn test_finished_counts_as_ready() {
        let notifier = TransitionNotifier::new();
        let done = ManualTask::new("done", &notifier);
        done.advance(TaskState::Started);
        done.advance(TaskState::Running);
        done.advance(TaskState::Finished);
        let outcome = wait_for_tasks(&tasks(&[&done]), &notifier, Duration::from_millis(10)).await;
        assert!(outcome.is_running());
    }

    #[tokio::test]
    async fn test_unbounded_timeout_returns_when_ready() {
        let notifier = TransitionNotifier::new();
        let task = ManualTask::new("forever", &notifier);
        task.advance(TaskState::Started);
        task.advance(TaskState::Running);
        let set = tasks(&[&task]);

        let waiter = tokio::spawn({
            let notifier = notifier.clone();
            async move { wait_for_tasks(&set, &notifier, Duration::MAX).await }
        });
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Running);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_wakes_on_failure() {
        let notifier = TransitionNotifier::new();
        let task = ManualTask::new("late", &notifier);
        task.advance(TaskState::Started);
        let set = tasks(&[&task]);

        let waiter = tokio::spawn({
            let notifier = notifier.clone();
            async move { wait_for_tasks(&set, &notifier, Duration::MAX).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.fail(TaskFailure::new(ErrorKind::LaunchFailed, "exited with 2"));

        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::TaskFailed { .. }));
    }

    #[test]
    fn test_into_result_maps_variants() {
        assert!(WaitOutcome::Running.into_result(Duration::ZERO).is_ok());
        let err = WaitOutcome::TimedOut {
            pending: vec![TaskName::from("x")],
        }
        .into_result(Duration::from_secs(1))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let err = WaitOutcome::TaskFailed {
            task: TaskName::from("y"),
            failure: Some(TaskFailure::new(ErrorKind::RemoteApplyFailed, "bad script")),
        }
        .into_result(Duration::ZERO)
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteApplyFailed);
    }
}

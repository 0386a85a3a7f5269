//! Managed tasks and their shared lifecycle bookkeeping.
//!
//! A task is anything implementing [`BusTask`]. The built-in variants are
//! [`ProcessTask`](process::ProcessTask) and
//! [`MockTask`](crate::mock::MockTask); both keep their state in a
//! [`TaskStatus`] and delegate process supervision to a shared monitor.

pub(crate) mod monitor;
pub mod process;

use std::process::ExitStatus;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bustest_core::{TaskName, TaskState};
use parking_lot::Mutex;

use crate::config::{BusType, MockBackendConfig};
use crate::error::{BusTestError, TaskFailure};
use crate::readiness::TransitionNotifier;

/// Everything a task needs from the service to launch.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub bus_address: String,
    pub bus_type: BusType,
    pub notifier: TransitionNotifier,
    pub mock_backend: MockBackendConfig,
}

impl TaskContext {
    /// Variables that point a child process at the private bus.
    pub fn environment(&self) -> Vec<(String, String)> {
        crate::bus::bus_environment(&self.bus_address, self.bus_type)
    }
}

/// A unit whose lifecycle the service drives.
///
/// `start` must return as soon as the launch is under way; readiness is
/// reported later through the task's state and the context's notifier.
#[async_trait]
pub trait BusTask: Send + Sync {
    fn name(&self) -> &TaskName;

    fn state(&self) -> TaskState;

    /// Why the task is in Error, if it is.
    fn failure(&self) -> Option<TaskFailure>;

    async fn start(&self, ctx: TaskContext) -> Result<(), BusTestError>;

    /// Stop the task and return its final state. No-op for terminal tasks.
    async fn stop(&self, grace: Duration) -> Result<TaskState, BusTestError>;
}

/// Start-order class. Within a class, tasks start in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskPriority {
    First,
    #[default]
    Normal,
    Last,
}

/// How a process exit status maps to Finished or Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnPolicy {
    /// Zero is Finished, anything else is Error.
    #[default]
    Normal,
    /// Always Finished.
    Ignore,
    /// Non-zero is Finished, zero is Error.
    Invert,
}

impl ReturnPolicy {
    pub fn accepts(self, status: ExitStatus) -> bool {
        match self {
            Self::Normal => status.success(),
            Self::Ignore => true,
            Self::Invert => !status.success(),
        }
    }
}

/// Lifecycle bookkeeping shared by a task handle and its monitor.
///
/// State reads are lock-free. Every successful transition is logged and
/// published on the attached notifier.
#[derive(Debug)]
pub struct TaskStatus {
    name: TaskName,
    state: AtomicU8,
    notifier: OnceLock<TransitionNotifier>,
    failure: Mutex<Option<TaskFailure>>,
}

impl TaskStatus {
    pub fn new(name: TaskName) -> Self {
        Self {
            name,
            state: AtomicU8::new(TaskState::NotStarted.as_u8()),
            notifier: OnceLock::new(),
            failure: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn get(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn failure(&self) -> Option<TaskFailure> {
        self.failure.lock().clone()
    }

    /// Publish future transitions on `notifier`. Only the first call sticks.
    pub fn attach(&self, notifier: &TransitionNotifier) {
        let _ = self.notifier.set(notifier.clone());
    }

    /// Move to `next`, returning the previous state.
    pub fn advance(&self, next: TaskState) -> Result<TaskState, BusTestError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = TaskState::from_u8(current);
            if !from.can_transition_to(next) {
                return Err(BusTestError::InvalidTransition {
                    task: self.name.clone(),
                    from,
                    to: next,
                });
            }
            match self.state.compare_exchange(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(task = %self.name, %from, to = %next, "task transition");
                    self.publish();
                    return Ok(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Move to Error and record `failure`. Returns false if the task was
    /// already terminal, in which case nothing is recorded.
    pub fn fail(&self, failure: TaskFailure) -> bool {
        // Held across the swap: a reader that observes Error blocks in
        // `failure()` until the reason is in place.
        let mut slot = self.failure.lock();
        let mut current = self.state.load(Ordering::Acquire);
        let from = loop {
            let from = TaskState::from_u8(current);
            if !from.can_transition_to(TaskState::Error) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                TaskState::Error.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break from,
                Err(actual) => current = actual,
            }
        };
        tracing::warn!(task = %self.name, %from, error = %failure, "task failed");
        *slot = Some(failure);
        drop(slot);
        self.publish();
        true
    }

    fn publish(&self) {
        if let Some(notifier) = self.notifier.get() {
            notifier.notify();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_advance_follows_state_machine() {
        let status = TaskStatus::new(TaskName::from("t"));
        assert_eq!(status.advance(TaskState::Started).unwrap(), TaskState::NotStarted);
        assert_eq!(status.advance(TaskState::Running).unwrap(), TaskState::Started);
        let err = status.advance(TaskState::Started).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(status.get(), TaskState::Running);
    }

    #[test]
    fn test_fail_records_first_failure_only() {
        let status = TaskStatus::new(TaskName::from("t"));
        status.advance(TaskState::Started).unwrap();
        assert!(status.fail(TaskFailure::new(ErrorKind::LaunchFailed, "first")));
        assert!(!status.fail(TaskFailure::new(ErrorKind::Timeout, "second")));
        assert_eq!(status.get(), TaskState::Error);
        assert_eq!(status.failure().unwrap().message, "first");
    }

    #[test]
    fn test_fail_after_finished_is_ignored() {
        let status = TaskStatus::new(TaskName::from("t"));
        status.advance(TaskState::Finished).unwrap();
        assert!(!status.fail(TaskFailure::new(ErrorKind::LaunchFailed, "late")));
        assert_eq!(status.get(), TaskState::Finished);
        assert!(status.failure().is_none());
    }

    #[test]
    fn test_failure_recorded_only_with_error_state() {
        for _ in 0..200 {
            let status = std::sync::Arc::new(TaskStatus::new(TaskName::from("t")));
            status.advance(TaskState::Started).unwrap();
            status.advance(TaskState::Running).unwrap();
            let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));

            let failing = {
                let (status, barrier) = (status.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    status.fail(TaskFailure::new(ErrorKind::BackendUnreachable, "lost"))
                })
            };
            barrier.wait();
            let finished = status.advance(TaskState::Finished).is_ok();
            let failed = failing.join().unwrap();

            assert_ne!(finished, failed);
            assert_eq!(status.failure().is_some(), status.get() == TaskState::Error);
        }
    }

    #[test]
    fn test_transitions_bump_notifier() {
        let notifier = TransitionNotifier::new();
        let rx = notifier.subscribe();
        let status = TaskStatus::new(TaskName::from("t"));
        status.attach(&notifier);
        status.advance(TaskState::Started).unwrap();
        status.advance(TaskState::Running).unwrap();
        assert_eq!(*rx.borrow(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_return_policy() {
        use std::os::unix::process::ExitStatusExt;
        let ok = ExitStatus::from_raw(0);
        let bad = ExitStatus::from_raw(1 << 8);
        assert!(ReturnPolicy::Normal.accepts(ok));
        assert!(!ReturnPolicy::Normal.accepts(bad));
        assert!(ReturnPolicy::Ignore.accepts(bad));
        assert!(ReturnPolicy::Invert.accepts(bad));
        assert!(!ReturnPolicy::Invert.accepts(ok));
    }

    #[test]
    fn test_priority_order() {
        let mut list = vec![TaskPriority::Last, TaskPriority::Normal, TaskPriority::First];
        list.sort();
        assert_eq!(
            list,
            vec![TaskPriority::First, TaskPriority::Normal, TaskPriority::Last]
        );
    }
}

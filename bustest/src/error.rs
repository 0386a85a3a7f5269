//! Error types for bustest operations.

use std::time::Duration;

use bustest_core::{NameError, SignatureError, TaskName, TaskState, TypeMismatch, ValueError};

/// Coarse classification of a [`BusTestError`], stable enough to match on in
/// tests and to carry inside a [`TaskFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad harness or bus configuration.
    ConfigInvalid,
    /// A bus or task backend could not be brought up.
    LaunchFailed,
    /// A value disagrees with its declared type signature.
    TypeMismatch,
    /// A malformed declaration: bad name, bad signature, duplicate member.
    InvalidDeclaration,
    /// The mock backend rejected an operation.
    RemoteApplyFailed,
    /// The task set was mutated after start.
    TaskSetClosed,
    /// A wait or readiness budget was exceeded.
    Timeout,
    /// The bus or a task backend went away.
    BackendUnreachable,
    /// A lifecycle transition that the state machine does not allow.
    InvalidTransition,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "config_invalid",
            Self::LaunchFailed => "launch_failed",
            Self::TypeMismatch => "type_mismatch",
            Self::InvalidDeclaration => "invalid_declaration",
            Self::RemoteApplyFailed => "remote_apply_failed",
            Self::TaskSetClosed => "task_set_closed",
            Self::Timeout => "timeout",
            Self::BackendUnreachable => "backend_unreachable",
            Self::InvalidTransition => "invalid_transition",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended up in [`TaskState::Error`].
///
/// Failures happen on monitor tasks, away from the caller, so they are kept
/// as plain data and reported later through `wait_for_running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&BusTestError> for TaskFailure {
    fn from(err: &BusTestError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<BusTestError> for TaskFailure {
    fn from(err: BusTestError) -> Self {
        Self::from(&err)
    }
}

/// Errors returned by bustest operations.
#[derive(Debug, thiserror::Error)]
pub enum BusTestError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to launch private bus: {0}")]
    BusLaunch(String),

    #[error("failed to launch task '{task}': {reason}")]
    LaunchFailed { task: TaskName, reason: String },

    #[error(transparent)]
    InvalidName(#[from] NameError),

    #[error("invalid signature '{signature}': {source}")]
    InvalidSignature {
        signature: String,
        #[source]
        source: SignatureError,
    },

    #[error("type mismatch for '{member}': {source}")]
    TypeMismatch {
        member: String,
        #[source]
        source: TypeMismatch,
    },

    #[error("invalid value: {0}")]
    InvalidValue(#[from] ValueError),

    #[error("'{member}' is already declared on {object}")]
    MemberExists { object: String, member: String },

    #[error("no property '{property}' declared on {object}")]
    NoSuchProperty { object: String, property: String },

    #[error("backend rejected {operation}: {reason}")]
    RemoteApplyFailed { operation: String, reason: String },

    #[error("tasks can no longer be changed once the service has started")]
    TaskSetClosed,

    #[error("timed out after {elapsed:?} waiting for {pending:?}")]
    Timeout {
        elapsed: Duration,
        pending: Vec<TaskName>,
    },

    #[error("task '{task}' failed: {failure}")]
    TaskFailed { task: TaskName, failure: TaskFailure },

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("task '{task}' is not running (state {state})")]
    NotRunning { task: TaskName, state: TaskState },

    #[error("invalid state transition for '{task}': {from} -> {to}")]
    InvalidTransition {
        task: TaskName,
        from: TaskState,
        to: TaskState,
    },

    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),
}

impl BusTestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::BusLaunch(_) | Self::LaunchFailed { .. } => ErrorKind::LaunchFailed,
            Self::InvalidName(_)
            | Self::InvalidSignature { .. }
            | Self::MemberExists { .. }
            | Self::NoSuchProperty { .. } => ErrorKind::InvalidDeclaration,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::InvalidValue(ValueError::TypeMismatch(_)) => ErrorKind::TypeMismatch,
            Self::InvalidValue(_) => ErrorKind::InvalidDeclaration,
            Self::RemoteApplyFailed { .. } => ErrorKind::RemoteApplyFailed,
            Self::TaskSetClosed => ErrorKind::TaskSetClosed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::TaskFailed { failure, .. } => failure.kind,
            Self::BackendUnreachable(_) | Self::NotRunning { .. } | Self::Bus(_) => {
                ErrorKind::BackendUnreachable
            }
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
        }
    }

    /// Rebuild an error from a recorded failure so it can be returned again.
    pub(crate) fn from_failure(failure: &TaskFailure) -> Self {
        match failure.kind {
            ErrorKind::RemoteApplyFailed => Self::RemoteApplyFailed {
                operation: "flush".to_string(),
                reason: failure.message.clone(),
            },
            _ => Self::BackendUnreachable(failure.message.clone()),
        }
    }
}

pub type Result<T, E = BusTestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_of_type_mismatch() {
        let err = BusTestError::TypeMismatch {
            member: "prop2".to_string(),
            source: TypeMismatch {
                expected: "s".to_string(),
                found: "u".to_string(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        let msg = err.to_string();
        assert!(msg.contains("prop2"));
        assert!(msg.contains("'s'"));
    }

    #[test]
    fn test_task_failed_takes_kind_from_failure() {
        let err = BusTestError::TaskFailed {
            task: TaskName::from("mock"),
            failure: TaskFailure::new(ErrorKind::LaunchFailed, "no such file"),
        };
        assert_eq!(err.kind(), ErrorKind::LaunchFailed);
        assert!(err.to_string().contains("launch_failed: no such file"));
    }

    #[test]
    fn test_failure_from_error_keeps_kind_and_message() {
        let err = BusTestError::BackendUnreachable("bus closed".to_string());
        let failure = TaskFailure::from(&err);
        assert_eq!(failure.kind, ErrorKind::BackendUnreachable);
        assert!(failure.message.contains("bus closed"));
    }

    #[test]
    fn test_invalid_value_kind_depends_on_cause() {
        let mismatch = BusTestError::InvalidValue(ValueError::TypeMismatch(TypeMismatch {
            expected: "i".to_string(),
            found: "s".to_string(),
        }));
        assert_eq!(mismatch.kind(), ErrorKind::TypeMismatch);
        let key = BusTestError::InvalidValue(ValueError::NonBasicKey("v".to_string()));
        assert_eq!(key.kind(), ErrorKind::InvalidDeclaration);
    }
}

//! Task lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task, stored as a `u8` so it fits in an atomic.
///
/// ```text
/// NotStarted ──▶ Started ──▶ Running ──▶ Finished
///     │             │           │
///     └──▶ Error ◀──┴───────────┘
/// ```
///
/// `NotStarted -> Finished` is also allowed so that tearing down a service
/// that never started still leaves every task terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskState {
    #[default]
    NotStarted = 0,
    Started = 1,
    Running = 2,
    Finished = 3,
    Error = 4,
}

impl TaskState {
    /// Decode a state byte written by [`TaskState::as_u8`].
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::Started,
            2 => Self::Running,
            3 => Self::Finished,
            4 => Self::Error,
            _ => {
                debug_assert!(false, "invalid task state byte: {v}");
                tracing::error!(state_byte = v, "invalid task state byte");
                Self::Error
            }
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name for the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Started => "Started",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }

    /// Finished and Error accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (NotStarted, Started)
                | (NotStarted, Error)
                | (NotStarted, Finished)
                | (Started, Running)
                | (Started, Finished)
                | (Started, Error)
                | (Running, Finished)
                | (Running, Error)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

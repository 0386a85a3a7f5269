//! bustest-core - Shared types for the bustest harness.
//!
//! Everything here is pure data and validation; no I/O, no bus connection.
//!
//! Key types:
//! - [`DataType`] / [`Signature`] - Parsed D-Bus type signatures
//! - [`Value`] - Typed value that can be checked against a [`DataType`]
//! - [`TaskState`] - Lifecycle state of a managed task
//! - [`TaskName`] - Identifier used for tasks in logs and failure reports
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod ids;
pub mod names;
pub mod signature;
pub mod state;
pub mod value;

pub use ids::TaskName;
pub use names::{NameError, NameKind};
pub use signature::{DataType, Signature, SignatureError};
pub use state::TaskState;
pub use value::{TypeMismatch, Value, ValueError};

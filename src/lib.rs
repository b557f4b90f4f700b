//! Core library for the calbench application.
//!
//! This library contains the execution core for a laboratory calibration
//! bench: the task scheduler, the per-device connection state machine,
//! the operator-input handshake, the result/error taxonomy, and the real
//! and simulated controller backends. It is used by the CLI binary and by
//! any interaction layer drained from the session event queue.

pub mod artifacts;
pub mod config;
pub mod controllers;
pub mod core;
pub mod driver;
pub mod error;
pub mod input;
pub mod messages;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod sim;

pub use crate::config::Settings;
pub use crate::core::{ConnectionState, Controller, DeviceKind, Operation, OperationResult};
pub use crate::error::{AppResult, BenchError, ErrorKind};
pub use crate::messages::{SessionEvent, TaskEvent, TaskId};
pub use crate::session::Session;

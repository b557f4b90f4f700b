//! Event types delivered from background work to the interaction thread.
//!
//! Background contexts never call interaction-thread code directly: they
//! enqueue [`SessionEvent`]s onto a single queue that the interaction
//! layer drains. This replaces the cross-thread signal/slot delivery the
//! interface toolkit would otherwise provide.

use crate::core::{ConnectionState, OperationResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Opaque handle identifying one scheduled task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle events for one task, delivered in order: `Started`, zero or
/// more `Output`, then exactly one of `Finished` or `Failed`.
///
/// `Failed` is reserved for uncaught faults in the work itself (a panic);
/// ordinary hardware failures arrive as `Finished` with
/// `result.success == false`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        task: TaskId,
        operation: String,
    },
    Output {
        task: TaskId,
        line: String,
    },
    Finished {
        task: TaskId,
        result: OperationResult,
    },
    Failed {
        task: TaskId,
        message: String,
    },
}

impl TaskEvent {
    /// The task this event belongs to.
    pub fn task(&self) -> TaskId {
        match self {
            TaskEvent::Started { task, .. }
            | TaskEvent::Output { task, .. }
            | TaskEvent::Finished { task, .. }
            | TaskEvent::Failed { task, .. } => *task,
        }
    }

    /// Whether this is the task's terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Finished { .. } | TaskEvent::Failed { .. })
    }
}

/// Everything the interaction layer observes about a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A device moved through its state machine; `message` carries the
    /// reason for failure transitions.
    ConnectionStateChanged {
        device: String,
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A running operation paused for operator input.
    InputRequested { device: String, prompt: String },
    /// Task lifecycle event from the device's scheduler slot.
    Task { device: String, event: TaskEvent },
}

/// Event delivery callback handed to the scheduler.
///
/// Implementations must only enqueue (e.g. onto an unbounded `mpsc`
/// drained by the interaction thread), never perform interaction-thread
/// work inline.
pub type EventSink = Arc<dyn Fn(TaskEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OperationResult;

    #[test]
    fn test_terminal_classification() {
        let id = TaskId::new();
        assert!(!TaskEvent::Started {
            task: id,
            operation: "x".into()
        }
        .is_terminal());
        assert!(TaskEvent::Finished {
            task: id,
            result: OperationResult::ok("done")
        }
        .is_terminal());
        assert!(TaskEvent::Failed {
            task: id,
            message: "panic".into()
        }
        .is_terminal());
    }
}

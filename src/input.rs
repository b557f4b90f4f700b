//! Operator input handshake for operations that pause mid-execution.
//!
//! A controller running inside the pool calls
//! [`OpContext::request_input`](crate::scheduler::OpContext::request_input),
//! which lands here: the broker parks the calling task on a single-use
//! `oneshot` slot, notifies the interaction layer, and resumes the task
//! when the operator answers — or fails the request on deadline or task
//! cancellation. The interaction thread is never blocked.
//!
//! Each device owns exactly one broker and has at most one live request; a
//! request is resolved at most once, and a second `provide` is a logged
//! no-op.

use crate::error::ErrorKind;
use crate::scheduler::CancelToken;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Callback invoked when a request is posted; implementations enqueue an
/// `InputRequested` event toward the interaction thread.
pub type InputNotifier = Arc<dyn Fn(String) + Send + Sync>;

/// Why a `request` call returned without an answer. Controllers fold this
/// into their `OperationResult`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputError {
    #[error("no input supplied before the deadline")]
    Timeout,
    #[error("operation cancelled while waiting for input")]
    Cancelled,
    #[error("input channel closed")]
    Closed,
}

impl InputError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InputError::Timeout => ErrorKind::Timeout,
            InputError::Cancelled => ErrorKind::Cancelled,
            InputError::Closed => ErrorKind::HardwareFault,
        }
    }
}

/// Synchronization primitive between a blocked operation and the
/// interaction layer.
#[derive(Clone)]
pub struct InputBroker {
    pending: Arc<Mutex<Option<oneshot::Sender<String>>>>,
    notify: InputNotifier,
}

impl InputBroker {
    pub fn new(notify: InputNotifier) -> Self {
        Self {
            pending: Arc::new(Mutex::new(None)),
            notify,
        }
    }

    /// Whether a request is currently awaiting an answer.
    pub fn has_pending(&self) -> bool {
        self.lock_pending().is_some()
    }

    /// Posts a request and parks the calling task until an answer arrives,
    /// `deadline` elapses, or `cancel` fires. Called from inside a running
    /// task's execution context only.
    pub async fn request(
        &self,
        prompt: &str,
        deadline: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<String, InputError> {
        if cancel.is_cancelled() {
            return Err(InputError::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.lock_pending();
            if slot.is_some() {
                warn!("input request replaces an unresolved request");
            }
            *slot = Some(tx);
        }
        debug!(prompt, "input requested");
        (self.notify)(prompt.to_string());

        let outcome = match deadline {
            Some(limit) => {
                tokio::select! {
                    answer = rx => answer.map_err(|_| InputError::Closed),
                    _ = tokio::time::sleep(limit) => Err(InputError::Timeout),
                    _ = cancel.cancelled() => Err(InputError::Cancelled),
                }
            }
            None => {
                tokio::select! {
                    answer = rx => answer.map_err(|_| InputError::Closed),
                    _ = cancel.cancelled() => Err(InputError::Cancelled),
                }
            }
        };

        // The request is spent whichever way it resolved; a late provide
        // must see no outstanding slot.
        self.lock_pending().take();
        outcome
    }

    /// Delivers the operator's answer to the waiting `request` call.
    /// Resolving an already-resolved (or never-posted) request is a safe,
    /// logged no-op.
    pub fn provide(&self, answer: impl Into<String>) {
        let sender = self.lock_pending().take();
        match sender {
            Some(tx) => {
                if tx.send(answer.into()).is_err() {
                    warn!("input answer arrived after the request was abandoned");
                }
            }
            None => warn!("input provided with no request outstanding; ignored"),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<String>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//! Per-device service: connection state machine and operation admission.
//!
//! One `DeviceService` exists per configured device for the lifetime of a
//! session. It owns the device's connection state, the non-blocking guard
//! that admits at most one operation at a time, and the device's input
//! broker. Requesting an operation on a device that is not `Connected`
//! fails synchronously; no task is created.
//!
//! State transitions:
//!
//! ```text
//! Disconnected --connect--> Verifying --ok--> Connected
//!      ^                        |
//!      +-----------fail---------+
//! Connected --execute--> Busy --done--> Connected
//!                          +--fatal fault--> Faulted --reconnect--> Verifying
//!
//! Connected | Busy | Faulted --disconnect--> Disconnected
//! ```

use crate::core::{ConnectionState, Controller, DeviceId, Operation};
use crate::error::{AppResult, BenchError};
use crate::input::InputBroker;
use crate::messages::{EventSink, SessionEvent, TaskEvent, TaskId};
use crate::scheduler::{Task, TaskHandle, TaskPool};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

pub struct DeviceService {
    name: String,
    id: DeviceId,
    controller: Arc<dyn Controller>,
    pool: Arc<TaskPool>,
    state: Arc<StdMutex<ConnectionState>>,
    /// Non-blocking admission guard; held by the in-flight task's work.
    guard: Arc<AsyncMutex<()>>,
    input: InputBroker,
    events: UnboundedSender<SessionEvent>,
    current: StdMutex<Option<TaskHandle>>,
}

impl DeviceService {
    pub fn new(
        name: impl Into<String>,
        id: DeviceId,
        controller: Arc<dyn Controller>,
        pool: Arc<TaskPool>,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        let name = name.into();
        let input = {
            let events = events.clone();
            let device = name.clone();
            InputBroker::new(Arc::new(move |prompt| {
                let _ = events.send(SessionEvent::InputRequested {
                    device: device.clone(),
                    prompt,
                });
            }))
        };
        Self {
            name,
            id,
            controller,
            pool,
            state: Arc::new(StdMutex::new(ConnectionState::Disconnected)),
            guard: Arc::new(AsyncMutex::new(())),
            input,
            events,
            current: StdMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Whether an operation is currently paused on operator input.
    pub fn has_pending_input(&self) -> bool {
        self.input.has_pending()
    }

    fn set_state(&self, next: ConnectionState, message: Option<String>) {
        set_state(&self.state, &self.events, &self.name, next, message, None);
    }

    /// Probes and opens the device. Valid from `Disconnected` and, as a
    /// reconnect, from `Faulted`.
    pub async fn connect(&self) -> AppResult<()> {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Faulted => {}
            ConnectionState::Connected | ConnectionState::Verifying => return Ok(()),
            ConnectionState::Busy => return Err(BenchError::Busy(self.name.clone())),
        }

        self.set_state(ConnectionState::Verifying, None);
        match self.controller.connect().await {
            Ok(()) => {
                info!(device = %self.name, address = %self.id.address, "device connected");
                self.set_state(ConnectionState::Connected, None);
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.name, "connect failed: {e}");
                self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                match e {
                    verification @ BenchError::Verification(_) => Err(verification),
                    other => Err(BenchError::Unreachable {
                        device: self.name.clone(),
                        address: self.id.address.clone(),
                        reason: other.to_string(),
                    }),
                }
            }
        }
    }

    /// Closes the device link. From `Busy` this is the operator override:
    /// the in-flight operation is cancelled cooperatively and awaited
    /// before the link closes.
    pub async fn disconnect(&self) -> AppResult<()> {
        if self.state() == ConnectionState::Busy {
            self.cancel();
            // The guard is released once the in-flight work is done.
            drop(self.guard.lock().await);
        }
        self.controller.disconnect().await?;
        self.set_state(ConnectionState::Disconnected, None);
        Ok(())
    }

    /// Admits and schedules one operation. Fails synchronously, with no
    /// task created, unless the device is `Connected` and idle.
    pub fn execute(&self, operation: Operation) -> AppResult<TaskId> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Busy => return Err(BenchError::Busy(self.name.clone())),
            _ => return Err(BenchError::NotConnected(self.name.clone())),
        }

        // Non-blocking lock attempt; a held guard means another operation
        // won the race since the state check above.
        let guard = self
            .guard
            .clone()
            .try_lock_owned()
            .map_err(|_| BenchError::Busy(self.name.clone()))?;

        self.set_state(ConnectionState::Busy, None);

        let controller = self.controller.clone();
        let op = operation.clone();
        let work = Box::new(move |ctx: crate::scheduler::OpContext| {
            let fut = async move {
                let result = controller.dispatch(op, &ctx).await;
                drop(guard);
                result
            };
            Box::pin(fut) as futures::future::BoxFuture<'static, _>
        });

        let task = Task::new(self.name.clone(), operation.name(), self.input.clone(), work);
        let task_id = task.id;

        let sink = self.task_sink();
        let handle = match self.pool.submit(task, sink) {
            Ok(handle) => handle,
            Err(e) => {
                // Admission failed after all; roll the state back.
                self.set_state(ConnectionState::Connected, None);
                return Err(e);
            }
        };

        if let Ok(mut current) = self.current.lock() {
            *current = Some(handle);
        }
        Ok(task_id)
    }

    /// Requests cooperative cancellation of the in-flight operation, if
    /// any.
    pub fn cancel(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(handle) = current.as_ref() {
                handle.cancel();
            }
        }
    }

    /// Delivers an operator answer to the operation paused on input.
    pub fn provide_input(&self, answer: impl Into<String>) {
        self.input.provide(answer);
    }

    /// Builds the scheduler sink that forwards task events as session
    /// events and restores the state machine on the terminal event. The
    /// restore lives here, not in the work future, so a task cancelled
    /// before it ever ran still releases the `Busy` state.
    fn task_sink(&self) -> EventSink {
        let events = self.events.clone();
        let state = self.state.clone();
        let device = self.name.clone();
        Arc::new(move |event: TaskEvent| {
            let terminal_state = match &event {
                TaskEvent::Finished { result, .. } if result.fatal => {
                    Some(ConnectionState::Faulted)
                }
                TaskEvent::Finished { .. } | TaskEvent::Failed { .. } => {
                    Some(ConnectionState::Connected)
                }
                _ => None,
            };
            let _ = events.send(SessionEvent::Task {
                device: device.clone(),
                event,
            });
            if let Some(next) = terminal_state {
                let message = match next {
                    ConnectionState::Faulted => Some("fatal hardware fault".to_string()),
                    _ => None,
                };
                // Restore only while still Busy; a disconnect that raced
                // the terminal event keeps the device Disconnected.
                set_state(
                    &state,
                    &events,
                    &device,
                    next,
                    message,
                    Some(ConnectionState::Busy),
                );
            }
        })
    }
}

fn set_state(
    state: &Arc<StdMutex<ConnectionState>>,
    events: &UnboundedSender<SessionEvent>,
    device: &str,
    next: ConnectionState,
    message: Option<String>,
    only_from: Option<ConnectionState>,
) {
    {
        let mut current = match state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(required) = only_from {
            if *current != required {
                return;
            }
        }
        if *current == next {
            return;
        }
        *current = next;
    }
    let _ = events.send(SessionEvent::ConnectionStateChanged {
        device: device.to_string(),
        state: next,
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::controllers::SimulatedController;
    use crate::core::{DeviceKind, OperationResult};
    use crate::error::ErrorKind;
    use crate::scheduler::OpContext;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    struct FaultyController;

    #[async_trait]
    impl Controller for FaultyController {
        fn family(&self) -> DeviceKind {
            DeviceKind::VoltageUnit
        }

        async fn connect(&self) -> AppResult<()> {
            Ok(())
        }

        async fn disconnect(&self) -> AppResult<()> {
            Ok(())
        }

        async fn initialize_device(
            &self,
            _ctx: &OpContext,
            _serial: u32,
            _processor_type: &str,
            _connector_type: &str,
        ) -> OperationResult {
            OperationResult::ok("noop")
        }

        async fn read_measurement(&self, _ctx: &OpContext) -> OperationResult {
            OperationResult::fatal_fault("sensor bank reported FAULT OVERTEMP")
        }

        async fn perform_autocalibration(&self, _ctx: &OpContext) -> OperationResult {
            OperationResult::ok("noop")
        }

        async fn run_test_sequence(&self, _ctx: &OpContext) -> OperationResult {
            OperationResult::ok("noop")
        }
    }

    fn service_with(
        controller: Arc<dyn Controller>,
    ) -> (Arc<DeviceService>, mpsc::UnboundedReceiver<SessionEvent>, Arc<TaskPool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(TaskPool::new(2));
        let id = DeviceId {
            kind: controller.family(),
            address: "127.0.0.1:5025".into(),
        };
        let service = Arc::new(DeviceService::new("vu1", id, controller, pool.clone(), tx));
        (service, rx, pool)
    }

    fn simulated() -> Arc<dyn Controller> {
        let dir = tempdir().unwrap();
        // The TempDir is leaked for the test's duration; artifacts land in
        // a throwaway path.
        let store = ArtifactStore::new(dir.keep());
        Arc::new(SimulatedController::voltage_unit(store).with_pace(Duration::from_millis(1)))
    }

    async fn drain_until_terminal(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event stream stalled")
                .expect("event stream closed");
            let terminal = matches!(
                &event,
                SessionEvent::Task { event, .. } if event.is_terminal()
            );
            seen.push(event);
            if terminal {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_walks_verifying() {
        let (service, mut rx, _pool) = service_with(simulated());
        service.connect().await.unwrap();
        assert_eq!(service.state(), ConnectionState::Connected);

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::ConnectionStateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            [ConnectionState::Verifying, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn test_execute_requires_connected() {
        let (service, _rx, _pool) = service_with(simulated());
        let err = service.execute(Operation::ReadMeasurement).unwrap_err();
        assert!(matches!(err, BenchError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_busy_rejected_synchronously() {
        let (service, mut rx, _pool) = service_with(simulated());
        service.connect().await.unwrap();

        service.execute(Operation::PerformAutocalibration).unwrap();
        let err = service.execute(Operation::ReadMeasurement).unwrap_err();
        assert!(matches!(err, BenchError::Busy(_)));

        // Exactly one task ran: one Started event in the whole stream.
        let events = drain_until_terminal(&mut rx).await;
        let started = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::Task {
                        event: TaskEvent::Started { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_device_usable_again_after_completion() {
        let (service, mut rx, _pool) = service_with(simulated());
        service.connect().await.unwrap();

        service.execute(Operation::ReadMeasurement).unwrap();
        drain_until_terminal(&mut rx).await;
        // Terminal event observed; the state restore follows immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.state(), ConnectionState::Connected);
        service.execute(Operation::ReadMeasurement).unwrap();
    }

    #[tokio::test]
    async fn test_fatal_fault_moves_to_faulted() {
        let (service, mut rx, _pool) = service_with(Arc::new(FaultyController));
        service.connect().await.unwrap();

        service.execute(Operation::ReadMeasurement).unwrap();
        let events = drain_until_terminal(&mut rx).await;
        let fatal = events.iter().any(|e| {
            matches!(
                e,
                SessionEvent::Task {
                    event: TaskEvent::Finished { result, .. },
                    ..
                } if result.fatal
            )
        });
        assert!(fatal);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.state(), ConnectionState::Faulted);

        // Terminal pending reconnect: execute is rejected, reconnect works.
        let err = service.execute(Operation::ReadMeasurement).unwrap_err();
        assert!(matches!(err, BenchError::NotConnected(_)));
        service.connect().await.unwrap();
        assert_eq!(service.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_while_busy_cancels_and_closes() {
        let (service, mut rx, _pool) = service_with(simulated());
        service.connect().await.unwrap();

        service.execute(Operation::PerformAutocalibration).unwrap();
        assert_eq!(service.state(), ConnectionState::Busy);

        service.disconnect().await.unwrap();
        assert_eq!(service.state(), ConnectionState::Disconnected);

        let events = drain_until_terminal(&mut rx).await;
        let cancelled = events.iter().any(|e| {
            matches!(
                e,
                SessionEvent::Task {
                    event: TaskEvent::Finished { result, .. },
                    ..
                } if result.error_kind == Some(ErrorKind::Cancelled)
            )
        });
        assert!(cancelled);

        // The terminal-event restore must not flip the device back.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.state(), ConnectionState::Disconnected);

        service.connect().await.unwrap();
        assert_eq!(service.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_cancelled_task_reports_cancelled() {
        let (service, mut rx, _pool) = service_with(simulated());
        service.connect().await.unwrap();

        service.execute(Operation::PerformAutocalibration).unwrap();
        service.cancel();

        let events = drain_until_terminal(&mut rx).await;
        let cancelled = events.iter().any(|e| {
            matches!(
                e,
                SessionEvent::Task {
                    event: TaskEvent::Finished { result, .. },
                    ..
                } if result.error_kind == Some(ErrorKind::Cancelled)
            )
        });
        assert!(cancelled);
    }
}

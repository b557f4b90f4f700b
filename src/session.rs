//! Session assembly: pool, artifact store, and one service per device.
//!
//! The backend (real vs simulated controllers) is chosen exactly once
//! here, from the boot-time `simulation` flag; everything downstream is
//! backend-agnostic.

use crate::artifacts::ArtifactStore;
use crate::config::Settings;
use crate::controllers::{real_controller, simulated_controller};
use crate::core::DeviceId;
use crate::error::{AppResult, BenchError};
use crate::messages::SessionEvent;
use crate::scheduler::TaskPool;
use crate::service::DeviceService;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct Session {
    pool: Arc<TaskPool>,
    devices: BTreeMap<String, Arc<DeviceService>>,
    store: ArtifactStore,
    shutdown_grace: Duration,
}

impl Session {
    /// Builds the session and the event queue the interaction layer
    /// drains.
    pub fn new(settings: &Settings) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(TaskPool::new(settings.application.worker_threads));
        let store = ArtifactStore::new(&settings.application.artifact_dir);
        let timeouts = &settings.application.timeouts;

        let mut devices = BTreeMap::new();
        for (name, device) in &settings.devices {
            let controller = if settings.application.simulation {
                simulated_controller(device.kind, store.clone())
            } else {
                real_controller(
                    device.kind,
                    &device.address,
                    store.clone(),
                    timeouts.connect,
                    timeouts.io,
                )
            };
            let id = DeviceId {
                kind: device.kind,
                address: device.address.clone(),
            };
            let service = Arc::new(DeviceService::new(
                name.clone(),
                id,
                controller,
                pool.clone(),
                tx.clone(),
            ));
            devices.insert(name.clone(), service);
        }

        info!(
            devices = devices.len(),
            simulation = settings.application.simulation,
            "session assembled"
        );
        (
            Self {
                pool,
                devices,
                store,
                shutdown_grace: timeouts.shutdown,
            },
            rx,
        )
    }

    pub fn device(&self, name: &str) -> AppResult<Arc<DeviceService>> {
        self.devices
            .get(name)
            .cloned()
            .ok_or_else(|| BenchError::UnknownDevice(name.to_string()))
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<DeviceService>> {
        self.devices.values()
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Connects every configured device, continuing past failures.
    pub async fn connect_all(&self) {
        for (name, service) in &self.devices {
            if let Err(e) = service.connect().await {
                warn!(device = %name, "skipping device: {e}");
            }
        }
    }

    /// Cancels in-flight work, drains the pool, then disconnects every
    /// device.
    pub async fn shutdown(&self) {
        for service in self.devices.values() {
            service.cancel();
        }
        self.pool.shutdown(self.shutdown_grace).await;
        for (name, service) in &self.devices {
            if let Err(e) = service.disconnect().await {
                warn!(device = %name, "disconnect during shutdown failed: {e}");
            }
        }
        info!("session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplicationSettings, DeviceSettings, TimeoutSettings};
    use crate::core::{ConnectionState, DeviceKind, Operation};
    use crate::messages::TaskEvent;
    use tempfile::tempdir;

    fn simulated_settings(dir: &std::path::Path) -> Settings {
        let mut devices = BTreeMap::new();
        devices.insert(
            "vu1".to_string(),
            DeviceSettings {
                kind: DeviceKind::VoltageUnit,
                address: "127.0.0.1:5025".into(),
            },
        );
        devices.insert(
            "smu1".to_string(),
            DeviceSettings {
                kind: DeviceKind::SourceMeasureUnit,
                address: "127.0.0.1:5026".into(),
            },
        );
        Settings {
            application: ApplicationSettings {
                worker_threads: 2,
                simulation: true,
                artifact_dir: dir.to_path_buf(),
                timeouts: TimeoutSettings::default(),
            },
            devices,
        }
    }

    #[tokio::test]
    async fn test_session_runs_simulated_operation() {
        let dir = tempdir().unwrap();
        let (session, mut rx) = Session::new(&simulated_settings(dir.path()));

        session.connect_all().await;
        let device = session.device("vu1").unwrap();
        assert_eq!(device.state(), ConnectionState::Connected);

        device.execute(Operation::ReadMeasurement).unwrap();
        let mut finished = false;
        while let Some(event) = rx.recv().await {
            if let SessionEvent::Task {
                event: TaskEvent::Finished { result, .. },
                ..
            } = event
            {
                assert!(result.success, "{}", result.message);
                assert!(result.data["temperature_c"].is_f64());
                finished = true;
                break;
            }
        }
        assert!(finished);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let dir = tempdir().unwrap();
        let (session, _rx) = Session::new(&simulated_settings(dir.path()));
        assert!(matches!(
            session.device("nope"),
            Err(BenchError::UnknownDevice(_))
        ));
    }
}

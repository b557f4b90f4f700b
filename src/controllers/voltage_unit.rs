//! Real voltage-unit controller.
//!
//! Voltage units carry their correction coefficients on-device, so this
//! family adds `read_coefficients`/`write_coefficients` on top of the
//! common capability set. Host-side sweep calibration does not apply and
//! keeps the trait defaults.

use super::{
    autocal_over_link, checked_query, initialize_over_link, parse_coefficients,
    plot_sequence_over_link, read_temperature_over_link,
};
use crate::artifacts::ArtifactStore;
use crate::core::{Controller, DeviceKind, OperationResult};
use crate::driver::{probe, InstrumentLink};
use crate::error::{AppResult, BenchError};
use crate::scheduler::OpContext;
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct VoltageUnitController {
    link: Arc<dyn InstrumentLink>,
    store: ArtifactStore,
    endpoint: Option<(String, Duration)>,
    serial: Mutex<u32>,
}

impl VoltageUnitController {
    pub fn new(link: Arc<dyn InstrumentLink>, store: ArtifactStore) -> Self {
        Self {
            link,
            store,
            endpoint: None,
            serial: Mutex::new(0),
        }
    }

    /// Enables a reachability probe against `address` before the link is
    /// opened. Links without a network endpoint skip the probe.
    pub fn with_endpoint(mut self, address: impl Into<String>, timeout: Duration) -> Self {
        self.endpoint = Some((address.into(), timeout));
        self
    }

    fn serial(&self) -> u32 {
        match self.serial.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_serial(&self, serial: u32) {
        match self.serial.lock() {
            Ok(mut s) => *s = serial,
            Err(poisoned) => *poisoned.into_inner() = serial,
        }
    }
}

#[async_trait]
impl Controller for VoltageUnitController {
    fn family(&self) -> DeviceKind {
        DeviceKind::VoltageUnit
    }

    async fn connect(&self) -> AppResult<()> {
        if let Some((address, timeout)) = &self.endpoint {
            probe(address, *timeout).await?;
        }
        // The endpoint answered but the link would not open: that is a
        // verification failure, not plain unreachability.
        self.link
            .open()
            .await
            .map_err(|e| BenchError::Verification(e.to_string()))
    }

    async fn disconnect(&self) -> AppResult<()> {
        self.link.close().await
    }

    async fn initialize_device(
        &self,
        ctx: &OpContext,
        serial: u32,
        processor_type: &str,
        connector_type: &str,
    ) -> OperationResult {
        let result =
            initialize_over_link(&self.link, ctx, serial, processor_type, connector_type).await;
        if result.success {
            self.set_serial(serial);
        }
        result
    }

    async fn read_measurement(&self, _ctx: &OpContext) -> OperationResult {
        read_temperature_over_link(&self.link).await
    }

    async fn perform_autocalibration(&self, ctx: &OpContext) -> OperationResult {
        autocal_over_link(&self.link, ctx, "CAL:AUTO CH1", Some("COEF? CH1")).await
    }

    async fn run_test_sequence(&self, ctx: &OpContext) -> OperationResult {
        plot_sequence_over_link(&self.link, ctx, &self.store, self.serial()).await
    }

    async fn read_coefficients(&self, _ctx: &OpContext) -> OperationResult {
        match checked_query(&self.link, "read_coefficients", "COEF? CH1").await {
            Ok(reply) => match parse_coefficients(&reply) {
                Ok((gain, offset)) => {
                    OperationResult::ok(format!("coefficients gain={gain} offset={offset}"))
                        .with_data(json!({ "gain": gain, "offset": offset }))
                }
                Err(result) => result,
            },
            Err(result) => result,
        }
    }

    async fn write_coefficients(&self, _ctx: &OpContext) -> OperationResult {
        match checked_query(&self.link, "write_coefficients", "COEF:WRITE").await {
            Ok(_) => OperationResult::ok("coefficients written to EEPROM"),
            Err(result) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryLink;
    use crate::error::ErrorKind;
    use crate::input::InputBroker;
    use tempfile::tempdir;

    fn controller(link: Arc<MemoryLink>) -> (VoltageUnitController, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        (VoltageUnitController::new(link, store), dir)
    }

    fn ctx() -> OpContext {
        OpContext::detached(Arc::new(|_| {}), InputBroker::new(Arc::new(|_| {})))
    }

    #[tokio::test]
    async fn test_autocalibration_converges() {
        let link = Arc::new(MemoryLink::new());
        link.enqueue("CAL:STAT?", "ITER");
        link.enqueue("CAL:STAT?", "ITER");
        link.enqueue("CAL:STAT?", "CONV");
        link.set_response("COEF? CH1", "1.004,0.012");
        let (ctrl, _dir) = controller(link);

        let result = ctrl.perform_autocalibration(&ctx()).await;
        assert!(result.success, "{}", result.message);
        assert!((result.data["gain"].as_f64().unwrap() - 1.004).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_autocalibration_convergence_bound() {
        let link = Arc::new(MemoryLink::new());
        link.set_response("CAL:STAT?", "ITER");
        let (ctrl, _dir) = controller(link);

        let result = ctrl.perform_autocalibration(&ctx()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Convergence));
    }

    #[tokio::test]
    async fn test_fault_reply_is_fatal() {
        let link = Arc::new(MemoryLink::new());
        link.set_response("MEAS:TEMP?", "FAULT OVERTEMP");
        let (ctrl, _dir) = controller(link);

        let result = ctrl.read_measurement(&ctx()).await;
        assert!(!result.success);
        assert!(result.fatal);
        assert_eq!(result.error_kind, Some(ErrorKind::HardwareFault));
    }

    #[tokio::test]
    async fn test_test_sequence_produces_three_plots() {
        let link = Arc::new(MemoryLink::new());
        link.set_response("TEST:OUTP?", "0.0,0.5,1.0,0.5,0.0");
        link.set_response("TEST:RAMP?", "0.0,0.25,0.5,0.75,1.0");
        link.set_response("TEST:TRAN?", "0.0,1.2,0.9,1.05,1.0");
        let (ctrl, _dir) = controller(link);

        let result = ctrl.run_test_sequence(&ctx()).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.artifacts.len(), 3);
        assert!(result.artifacts[0].path.ends_with("output.svg"));
        assert!(result.artifacts[0].path.exists());
    }

    #[tokio::test]
    async fn test_calibration_measure_unsupported() {
        let (ctrl, _dir) = controller(Arc::new(MemoryLink::new()));
        let result = ctrl
            .calibration_measure(&ctx(), std::path::Path::new("/tmp/none"))
            .await;
        assert!(!result.success);
        assert!(result.message.contains("does not support"));
    }
}

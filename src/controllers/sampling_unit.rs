//! Real sampling-unit controller.
//!
//! Sampling units are calibrated against an external reference load the
//! operator must attach by hand, so `calibration_measure` pauses on an
//! input request before acquiring the sweep. The fit step is shared with
//! the source-measure family.

use super::source_measure::fit_sweep_folder;
use super::{
    autocal_over_link, checked_query, initialize_over_link, plot_sequence_over_link,
    read_temperature_over_link,
};
use crate::artifacts::{self, ArtifactStore};
use crate::core::{Controller, DeviceKind, OperationResult};
use crate::driver::{probe, InstrumentLink};
use crate::error::{AppResult, BenchError, ErrorKind};
use crate::scheduler::OpContext;
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Acquisition points per sweep.
const SWEEP_LEVELS: usize = 11;

/// How long the operator gets to attach the reference load.
const REFERENCE_DEADLINE: Duration = Duration::from_secs(120);

pub struct SamplingUnitController {
    link: Arc<dyn InstrumentLink>,
    store: ArtifactStore,
    endpoint: Option<(String, Duration)>,
    serial: Mutex<u32>,
}

impl SamplingUnitController {
    pub fn new(link: Arc<dyn InstrumentLink>, store: ArtifactStore) -> Self {
        Self {
            link,
            store,
            endpoint: None,
            serial: Mutex::new(0),
        }
    }

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

    async fn try_calibration_measure(
        &self,
        ctx: &OpContext,
        folder: &Path,
    ) -> Result<OperationResult, OperationResult> {
        let answer = ctx
            .request_input(
                "insert reference load on channel 1, then confirm",
                Some(REFERENCE_DEADLINE),
            )
            .await
            .map_err(|e| {
                OperationResult::failure(e.kind(), format!("calibration_measure: {e}"))
            })?;
        ctx.emit(format!("reference load confirmed: {answer}"));

        let mut points = Vec::with_capacity(SWEEP_LEVELS);
        for step in 0..SWEEP_LEVELS {
            if let Some(cancelled) = ctx.check_cancelled() {
                return Ok(cancelled);
            }
            let level = step as f64 * 0.1;
            let reply = checked_query(
                &self.link,
                "calibration_measure",
                &format!("SAMP:ACQ? {level:.1}"),
            )
            .await?;
            let reading = reply.trim().parse::<f64>().map_err(|_| {
                OperationResult::failure(
                    ErrorKind::HardwareFault,
                    format!("malformed acquisition at level {level:.1}: {reply:?}"),
                )
            })?;
            ctx.emit(format!("acquired {level:.1} V -> {reading:.4}"));
            points.push((level, reading));
        }

        let artifact = artifacts::write_raw_data(folder, "sweep.csv", "level_v,reading_a", &points)
            .map_err(|e| super::link_failure("calibration_measure", &e))?;
        Ok(OperationResult::ok(format!("acquired {SWEEP_LEVELS} sweep points"))
            .with_data(json!({ "points": SWEEP_LEVELS, "folder": folder }))
            .with_artifacts(vec![artifact]))
    }
}

#[async_trait]
impl Controller for SamplingUnitController {
    fn family(&self) -> DeviceKind {
        DeviceKind::SamplingUnit
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
        autocal_over_link(&self.link, ctx, "CAL:AUTO ACQ1", None).await
    }

    async fn run_test_sequence(&self, ctx: &OpContext) -> OperationResult {
        plot_sequence_over_link(&self.link, ctx, &self.store, self.serial()).await
    }

    async fn calibration_measure(&self, ctx: &OpContext, folder: &Path) -> OperationResult {
        match self.try_calibration_measure(ctx, folder).await {
            Ok(r) | Err(r) => r,
        }
    }

    async fn calibration_fit(&self, ctx: &OpContext, folder: &Path) -> OperationResult {
        fit_sweep_folder(ctx, folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryLink;
    use crate::input::InputBroker;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_calibration_measure_waits_for_operator() {
        let dir = tempdir().unwrap();
        let link = Arc::new(MemoryLink::new());
        for step in 0..SWEEP_LEVELS {
            link.set_response(&format!("SAMP:ACQ? {:.1}", step as f64 * 0.1), "0.5");
        }
        let store = ArtifactStore::new(dir.path());
        let ctrl = Arc::new(SamplingUnitController::new(link, store));

        let broker = InputBroker::new(Arc::new(|_| {}));
        let ctx = OpContext::detached(Arc::new(|_| {}), broker.clone());

        let folder = dir.path().to_path_buf();
        let ctrl2 = ctrl.clone();
        let task =
            tokio::spawn(async move { ctrl2.calibration_measure(&ctx, &folder).await });

        // Wait until the operation has posted its request, then answer.
        while !broker.has_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        broker.provide("confirmed");

        let result = task.await.unwrap();
        assert!(result.success, "{}", result.message);
        assert!(dir.path().join("sweep.csv").exists());
    }

    #[tokio::test]
    async fn test_cancel_during_input_request() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let ctrl = Arc::new(SamplingUnitController::new(
            Arc::new(MemoryLink::new()),
            store,
        ));

        let broker = InputBroker::new(Arc::new(|_| {}));
        let ctx = OpContext::detached(Arc::new(|_| {}), broker.clone());
        let cancel = ctx.cancel_token().clone();

        let folder = dir.path().to_path_buf();
        let ctrl2 = ctrl.clone();
        let task =
            tokio::spawn(async move { ctrl2.calibration_measure(&ctx, &folder).await });

        while !broker.has_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert!(result.artifacts.is_empty());
    }
}

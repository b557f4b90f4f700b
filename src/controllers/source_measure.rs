//! Real source-measure-unit controller.
//!
//! Source-measure units are calibrated host-side: a sweep over the source
//! levels is measured into a raw-data file, then a separate fit step turns
//! that file into gain/offset coefficients. Both steps are exposed as
//! first-class operations so an operator can re-fit without re-measuring.

use super::{
    autocal_over_link, checked_query, initialize_over_link, linear_fit, link_failure,
    plot_sequence_over_link, read_sweep_csv, read_temperature_over_link,
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

/// Source levels swept during `calibration_measure`, in volts.
const SWEEP_LEVELS: usize = 11;

/// Settling time between setting a level and reading it back.
const SETTLE: Duration = Duration::from_millis(50);

pub struct SourceMeasureController {
    link: Arc<dyn InstrumentLink>,
    store: ArtifactStore,
    endpoint: Option<(String, Duration)>,
    serial: Mutex<u32>,
}

impl SourceMeasureController {
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
        let mut points = Vec::with_capacity(SWEEP_LEVELS);
        for step in 0..SWEEP_LEVELS {
            if let Some(cancelled) = ctx.check_cancelled() {
                return Ok(cancelled);
            }
            let level = step as f64 * 0.1;
            self.link
                .command(&format!("SOUR:LEV {level:.1}"))
                .await
                .map_err(|e| link_failure("calibration_measure", &e))?;
            if ctx.sleep(SETTLE).await {
                return Ok(OperationResult::failure(
                    ErrorKind::Cancelled,
                    "operation cancelled",
                ));
            }
            let reply = checked_query(&self.link, "calibration_measure", "MEAS:CURR?").await?;
            let reading = reply.trim().parse::<f64>().map_err(|_| {
                OperationResult::failure(
                    ErrorKind::HardwareFault,
                    format!("malformed reading at level {level:.1}: {reply:?}"),
                )
            })?;
            ctx.emit(format!("sweep {level:.1} V -> {reading:.4} A"));
            points.push((level, reading));
        }

        let artifact = artifacts::write_raw_data(folder, "sweep.csv", "level_v,reading_a", &points)
            .map_err(|e| link_failure("calibration_measure", &e))?;
        Ok(OperationResult::ok(format!("measured {SWEEP_LEVELS} sweep points"))
            .with_data(json!({ "points": SWEEP_LEVELS, "folder": folder }))
            .with_artifacts(vec![artifact]))
    }
}

#[async_trait]
impl Controller for SourceMeasureController {
    fn family(&self) -> DeviceKind {
        DeviceKind::SourceMeasureUnit
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
        autocal_over_link(&self.link, ctx, "CAL:AUTO OUT1", None).await
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

/// Fits previously measured sweep data. Shared with the sampling-unit
/// controller, whose fit step is identical.
pub(crate) fn fit_sweep_folder(ctx: &OpContext, folder: &Path) -> OperationResult {
    let points = match read_sweep_csv(&folder.join("sweep.csv")) {
        Ok(p) => p,
        Err(e) => return link_failure("calibration_fit", &e),
    };
    if points.len() < 2 {
        return OperationResult::failure(
            ErrorKind::HardwareFault,
            format!("not enough sweep data to fit ({} points)", points.len()),
        );
    }

    let (gain, offset) = linear_fit(&points);
    let residuals: Vec<f64> = points
        .iter()
        .map(|(x, y)| y - (gain * x + offset))
        .collect();
    ctx.emit(format!("fit over {} points: gain={gain:.4} offset={offset:.4}", points.len()));

    let mut artifacts_out = Vec::new();
    match artifacts::write_plot(folder, "fit.svg", "Fit residuals", &residuals) {
        Ok(a) => artifacts_out.push(a),
        Err(e) => return link_failure("calibration_fit", &e),
    }
    let log_lines = vec![
        format!("points: {}", points.len()),
        format!("gain: {gain:.6}"),
        format!("offset: {offset:.6}"),
    ];
    match artifacts::write_log(folder, "fit.log", &log_lines) {
        Ok(a) => artifacts_out.push(a),
        Err(e) => return link_failure("calibration_fit", &e),
    }

    OperationResult::ok(format!("fit complete: gain={gain:.4} offset={offset:.4}"))
        .with_data(json!({ "gain": gain, "offset": offset, "points": points.len() }))
        .with_artifacts(artifacts_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryLink;
    use crate::input::InputBroker;
    use tempfile::tempdir;

    fn controller(link: Arc<MemoryLink>) -> (SourceMeasureController, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        (SourceMeasureController::new(link, store), dir)
    }

    fn ctx() -> OpContext {
        OpContext::detached(Arc::new(|_| {}), InputBroker::new(Arc::new(|_| {})))
    }

    #[tokio::test]
    async fn test_calibration_measure_writes_sweep() {
        let link = Arc::new(MemoryLink::new());
        link.set_response("MEAS:CURR?", "0.42");
        let (ctrl, dir) = controller(link.clone());

        let result = ctrl.calibration_measure(&ctx(), dir.path()).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.artifacts.len(), 1);
        assert!(dir.path().join("sweep.csv").exists());
        assert!(link.sent().iter().any(|c| c.starts_with("SOUR:LEV")));
    }

    #[tokio::test]
    async fn test_calibration_fit_recovers_coefficients() {
        let dir = tempdir().unwrap();
        let rows: Vec<String> = (0..11)
            .map(|i| {
                let x = f64::from(i) * 0.1;
                format!("{x},{}", 1.02 * x + 0.015)
            })
            .collect();
        std::fs::write(
            dir.path().join("sweep.csv"),
            format!("level_v,reading_a\n{}\n", rows.join("\n")),
        )
        .unwrap();

        let result = fit_sweep_folder(&ctx(), dir.path());
        assert!(result.success, "{}", result.message);
        assert!((result.data["gain"].as_f64().unwrap() - 1.02).abs() < 1e-6);
        assert!((result.data["offset"].as_f64().unwrap() - 0.015).abs() < 1e-6);
        assert_eq!(result.artifacts.len(), 2);
    }

    #[tokio::test]
    async fn test_calibration_fit_missing_data() {
        let dir = tempdir().unwrap();
        let result = fit_sweep_folder(&ctx(), dir.path());
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Io));
    }
}

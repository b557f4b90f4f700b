//! Simulated controllers, one per device family through a single type.
//!
//! The simulated backend reproduces the timing and artifact contract of
//! the real controllers without hardware: paced progress lines, the same
//! artifact names and kinds, and result payloads with the same fields.
//! The backend is chosen once at session start; nothing in the core ever
//! branches on simulation at runtime.

use super::source_measure::fit_sweep_folder;
use crate::artifacts::{self, ArtifactStore};
use crate::core::{Controller, DeviceKind, OperationResult, MAX_CAL_ITERATIONS};
use crate::error::{AppResult, ErrorKind};
use crate::scheduler::OpContext;
use crate::sim;
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Simulated gain/offset "read back" from the virtual device.
const SIM_GAIN: f64 = 1.004;
const SIM_OFFSET: f64 = 0.012;

pub struct SimulatedController {
    family: DeviceKind,
    store: ArtifactStore,
    serial: Mutex<u32>,
    /// Delay per simulated step, for realistic pacing.
    pace: Duration,
    /// Iterations the virtual autocalibration needs before it converges.
    /// Values above [`MAX_CAL_ITERATIONS`] force a convergence failure.
    required_iterations: u32,
    /// Operator deadline for the sampling-unit reference-load prompt.
    input_deadline: Duration,
}

impl SimulatedController {
    pub fn voltage_unit(store: ArtifactStore) -> Self {
        Self::new(DeviceKind::VoltageUnit, store)
    }

    pub fn source_measure(store: ArtifactStore) -> Self {
        Self::new(DeviceKind::SourceMeasureUnit, store)
    }

    pub fn sampling_unit(store: ArtifactStore) -> Self {
        Self::new(DeviceKind::SamplingUnit, store)
    }

    fn new(family: DeviceKind, store: ArtifactStore) -> Self {
        Self {
            family,
            store,
            serial: Mutex::new(0),
            pace: Duration::from_millis(100),
            required_iterations: 3,
            input_deadline: Duration::from_secs(120),
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn with_required_iterations(mut self, iterations: u32) -> Self {
        self.required_iterations = iterations;
        self
    }

    pub fn with_input_deadline(mut self, deadline: Duration) -> Self {
        self.input_deadline = deadline;
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

    fn supports_sweep(&self) -> bool {
        matches!(
            self.family,
            DeviceKind::SourceMeasureUnit | DeviceKind::SamplingUnit
        )
    }
}

#[async_trait]
impl Controller for SimulatedController {
    fn family(&self) -> DeviceKind {
        self.family
    }

    async fn connect(&self) -> AppResult<()> {
        tokio::time::sleep(self.pace).await;
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        Ok(())
    }

    async fn initialize_device(
        &self,
        ctx: &OpContext,
        serial: u32,
        _processor_type: &str,
        _connector_type: &str,
    ) -> OperationResult {
        if ctx.sleep(self.pace).await {
            return OperationResult::failure(ErrorKind::Cancelled, "operation cancelled");
        }
        self.set_serial(serial);
        ctx.emit(format!("device initialized with serial {serial}"));
        OperationResult::ok(format!("initialized device {serial}"))
            .with_data(json!({ "serial": serial }))
    }

    async fn read_measurement(&self, ctx: &OpContext) -> OperationResult {
        if ctx.sleep(self.pace).await {
            return OperationResult::failure(ErrorKind::Cancelled, "operation cancelled");
        }
        let temp = sim::temperature();
        OperationResult::ok(format!("temperature {temp:.1} C"))
            .with_data(json!({ "temperature_c": temp }))
    }

    async fn perform_autocalibration(&self, ctx: &OpContext) -> OperationResult {
        for iteration in 1..=MAX_CAL_ITERATIONS {
            if let Some(cancelled) = ctx.check_cancelled() {
                return cancelled;
            }
            if ctx.sleep(self.pace).await {
                return OperationResult::failure(ErrorKind::Cancelled, "operation cancelled");
            }
            let converged = iteration >= self.required_iterations;
            ctx.emit(format!(
                "autocalibration iteration {iteration}: {}",
                if converged { "CONV" } else { "ITER" }
            ));
            if converged {
                let mut result = OperationResult::ok(format!(
                    "autocalibration converged after {iteration} iterations"
                ));
                if self.family == DeviceKind::VoltageUnit {
                    result =
                        result.with_data(json!({ "gain": SIM_GAIN, "offset": SIM_OFFSET }));
                }
                return result;
            }
        }
        OperationResult::failure(
            ErrorKind::Convergence,
            format!("autocalibration did not converge within {MAX_CAL_ITERATIONS} iterations"),
        )
    }

    async fn run_test_sequence(&self, ctx: &OpContext) -> OperationResult {
        let dir = match self.store.device_dir(self.serial()) {
            Ok(d) => d,
            Err(e) => return OperationResult::failure(e.kind(), e.to_string()),
        };

        let mut artifacts_out = Vec::new();
        for (name, title, samples) in [
            ("output.svg", "Output levels", sim::output_waveform(200)),
            ("ramp.svg", "Ramp response", sim::ramp_waveform(200)),
            (
                "transient.svg",
                "Transient response",
                sim::transient_waveform(200),
            ),
        ] {
            if let Some(cancelled) = ctx.check_cancelled() {
                return cancelled;
            }
            if ctx.sleep(self.pace).await {
                return OperationResult::failure(ErrorKind::Cancelled, "operation cancelled");
            }
            ctx.emit(format!("{title}: {} samples", samples.len()));
            match artifacts::write_plot(&dir, name, title, &samples) {
                Ok(artifact) => artifacts_out.push(artifact),
                Err(e) => return OperationResult::failure(e.kind(), e.to_string()),
            }
        }
        OperationResult::ok("test sequence complete").with_artifacts(artifacts_out)
    }

    async fn calibration_measure(&self, ctx: &OpContext, folder: &Path) -> OperationResult {
        if !self.supports_sweep() {
            return OperationResult::unsupported(self.family, "calibration_measure");
        }

        if self.family == DeviceKind::SamplingUnit {
            let answer = ctx
                .request_input(
                    "insert reference load on channel 1, then confirm",
                    Some(self.input_deadline),
                )
                .await;
            match answer {
                Ok(answer) => ctx.emit(format!("reference load confirmed: {answer}")),
                Err(e) => {
                    return OperationResult::failure(
                        e.kind(),
                        format!("calibration_measure: {e}"),
                    )
                }
            }
        }

        let points = sim::sweep_points(11);
        for (level, reading) in &points {
            if let Some(cancelled) = ctx.check_cancelled() {
                return cancelled;
            }
            if ctx.sleep(self.pace).await {
                return OperationResult::failure(ErrorKind::Cancelled, "operation cancelled");
            }
            ctx.emit(format!("sweep {level:.1} V -> {reading:.4} A"));
        }

        match artifacts::write_raw_data(folder, "sweep.csv", "level_v,reading_a", &points) {
            Ok(artifact) => OperationResult::ok(format!("measured {} sweep points", points.len()))
                .with_data(json!({ "points": points.len(), "folder": folder }))
                .with_artifacts(vec![artifact]),
            Err(e) => OperationResult::failure(e.kind(), e.to_string()),
        }
    }

    async fn calibration_fit(&self, ctx: &OpContext, folder: &Path) -> OperationResult {
        if !self.supports_sweep() {
            return OperationResult::unsupported(self.family, "calibration_fit");
        }
        // The fit step is host-side math; the simulated backend runs the
        // real thing over simulated sweep data.
        fit_sweep_folder(ctx, folder)
    }

    async fn read_coefficients(&self, _ctx: &OpContext) -> OperationResult {
        if self.family != DeviceKind::VoltageUnit {
            return OperationResult::unsupported(self.family, "read_coefficients");
        }
        OperationResult::ok(format!("coefficients gain={SIM_GAIN} offset={SIM_OFFSET}"))
            .with_data(json!({ "gain": SIM_GAIN, "offset": SIM_OFFSET }))
    }

    async fn write_coefficients(&self, ctx: &OpContext) -> OperationResult {
        if self.family != DeviceKind::VoltageUnit {
            return OperationResult::unsupported(self.family, "write_coefficients");
        }
        if ctx.sleep(self.pace).await {
            return OperationResult::failure(ErrorKind::Cancelled, "operation cancelled");
        }
        OperationResult::ok("coefficients written to EEPROM")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputBroker;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn fast(family: fn(ArtifactStore) -> SimulatedController) -> (SimulatedController, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let ctrl = family(ArtifactStore::new(dir.path())).with_pace(Duration::from_millis(1));
        (ctrl, dir)
    }

    fn ctx() -> OpContext {
        OpContext::detached(Arc::new(|_| {}), InputBroker::new(Arc::new(|_| {})))
    }

    #[tokio::test]
    async fn test_autocalibration_converges_by_default() {
        let (ctrl, _dir) = fast(SimulatedController::voltage_unit);
        let result = ctrl.perform_autocalibration(&ctx()).await;
        assert!(result.success, "{}", result.message);
        assert!(result.data["gain"].is_f64());
    }

    #[tokio::test]
    async fn test_autocalibration_exceeding_bound_fails() {
        let (ctrl, _dir) = fast(SimulatedController::voltage_unit);
        let ctrl = ctrl.with_required_iterations(12);
        let result = ctrl.perform_autocalibration(&ctx()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Convergence));
    }

    #[tokio::test]
    async fn test_test_sequence_matches_real_artifact_names() {
        let (ctrl, _dir) = fast(SimulatedController::source_measure);
        let result = ctrl.run_test_sequence(&ctx()).await;
        assert!(result.success, "{}", result.message);
        let names: Vec<_> = result
            .artifacts
            .iter()
            .map(|a| a.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["output.svg", "ramp.svg", "transient.svg"]);
    }

    #[tokio::test]
    async fn test_sweep_then_fit() {
        let (ctrl, dir) = fast(SimulatedController::source_measure);
        let context = ctx();
        let measured = ctrl.calibration_measure(&context, dir.path()).await;
        assert!(measured.success, "{}", measured.message);

        let fitted = ctrl.calibration_fit(&context, dir.path()).await;
        assert!(fitted.success, "{}", fitted.message);
        let gain = fitted.data["gain"].as_f64().unwrap();
        assert!((gain - 1.02).abs() < 0.1, "gain {gain} implausible");
    }

    #[tokio::test]
    async fn test_unsupported_ops_match_trait_default_shape() {
        let (ctrl, dir) = fast(SimulatedController::voltage_unit);
        let result = ctrl.calibration_measure(&ctx(), dir.path()).await;
        assert!(!result.success);
        assert!(result.message.contains("does not support"));
        assert_eq!(result.error_kind, Some(ErrorKind::HardwareFault));
    }

    #[tokio::test]
    async fn test_sampling_unit_input_timeout() {
        let (ctrl, dir) = fast(SimulatedController::sampling_unit);
        let ctrl = ctrl.with_input_deadline(Duration::from_millis(20));
        let result = ctrl.calibration_measure(&ctx(), dir.path()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }
}

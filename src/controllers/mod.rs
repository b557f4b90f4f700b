//! Controller implementations, one real and one simulated per device
//! family.
//!
//! Real controllers speak a SCPI-style text protocol through the
//! [`InstrumentLink`](crate::driver::InstrumentLink) seam and never let a
//! link fault escape as an error: every fault is converted into a
//! `success = false` [`OperationResult`] here. The simulated variants live
//! in [`simulated`] and produce the same result shapes without hardware.

pub mod sampling_unit;
pub mod simulated;
pub mod source_measure;
pub mod voltage_unit;

pub use sampling_unit::SamplingUnitController;
pub use simulated::SimulatedController;
pub use source_measure::SourceMeasureController;
pub use voltage_unit::VoltageUnitController;

use crate::artifacts::{self, ArtifactStore};
use crate::core::{Controller, DeviceKind, OperationResult};
use crate::driver::TcpLink;
use crate::error::{AppResult, BenchError, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Builds the real controller for one configured device.
pub fn real_controller(
    kind: DeviceKind,
    address: &str,
    store: ArtifactStore,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Arc<dyn Controller> {
    let link = Arc::new(TcpLink::new(address, io_timeout));
    match kind {
        DeviceKind::VoltageUnit => Arc::new(
            VoltageUnitController::new(link, store).with_endpoint(address, connect_timeout),
        ),
        DeviceKind::SourceMeasureUnit => Arc::new(
            SourceMeasureController::new(link, store).with_endpoint(address, connect_timeout),
        ),
        DeviceKind::SamplingUnit => Arc::new(
            SamplingUnitController::new(link, store).with_endpoint(address, connect_timeout),
        ),
    }
}

/// Builds the simulated controller for one configured device.
pub fn simulated_controller(kind: DeviceKind, store: ArtifactStore) -> Arc<dyn Controller> {
    let ctrl = match kind {
        DeviceKind::VoltageUnit => SimulatedController::voltage_unit(store),
        DeviceKind::SourceMeasureUnit => SimulatedController::source_measure(store),
        DeviceKind::SamplingUnit => SimulatedController::sampling_unit(store),
    };
    Arc::new(ctrl)
}

// =============================================================================
// Common protocol operations
// =============================================================================

/// Initializes a freshly flashed device over the link. The caller records
/// the serial on success.
pub(crate) async fn initialize_over_link(
    link: &Arc<dyn crate::driver::InstrumentLink>,
    ctx: &crate::scheduler::OpContext,
    serial: u32,
    processor_type: &str,
    connector_type: &str,
) -> OperationResult {
    let cmd = format!("INIT:SER {serial};PROC {processor_type};CONN {connector_type}");
    match checked_query(link, "initialize_device", &cmd).await {
        Ok(_) => {
            ctx.emit(format!("device initialized with serial {serial}"));
            OperationResult::ok(format!("initialized device {serial}"))
                .with_data(serde_json::json!({ "serial": serial }))
        }
        Err(result) => result,
    }
}

/// Reads the device temperature.
pub(crate) async fn read_temperature_over_link(
    link: &Arc<dyn crate::driver::InstrumentLink>,
) -> OperationResult {
    match checked_query(link, "read_measurement", "MEAS:TEMP?").await {
        Ok(reply) => match reply.trim().parse::<f64>() {
            Ok(temp) => OperationResult::ok(format!("temperature {temp:.1} C"))
                .with_data(serde_json::json!({ "temperature_c": temp })),
            Err(_) => OperationResult::failure(
                ErrorKind::HardwareFault,
                format!("malformed temperature reply: {reply:?}"),
            ),
        },
        Err(result) => result,
    }
}

/// Runs the bounded autocalibration loop: issue `start_cmd`, poll
/// `CAL:STAT?` until the device reports `CONV`, give up after
/// [`MAX_CAL_ITERATIONS`](crate::core::MAX_CAL_ITERATIONS) polls. When
/// `coef_query` is given the converged coefficients are attached to the
/// result payload.
pub(crate) async fn autocal_over_link(
    link: &Arc<dyn crate::driver::InstrumentLink>,
    ctx: &crate::scheduler::OpContext,
    start_cmd: &str,
    coef_query: Option<&str>,
) -> OperationResult {
    use crate::core::MAX_CAL_ITERATIONS;

    let run = async {
        checked_query(link, "perform_autocalibration", start_cmd).await?;
        for iteration in 1..=MAX_CAL_ITERATIONS {
            if let Some(cancelled) = ctx.check_cancelled() {
                return Ok(cancelled);
            }
            let status = checked_query(link, "perform_autocalibration", "CAL:STAT?").await?;
            ctx.emit(format!("autocalibration iteration {iteration}: {status}"));
            if status == "CONV" {
                let mut result = OperationResult::ok(format!(
                    "autocalibration converged after {iteration} iterations"
                ));
                if let Some(query) = coef_query {
                    let reply = checked_query(link, "perform_autocalibration", query).await?;
                    let (gain, offset) = parse_coefficients(&reply)?;
                    result = result
                        .with_data(serde_json::json!({ "gain": gain, "offset": offset }));
                }
                return Ok(result);
            }
        }
        Ok(OperationResult::failure(
            ErrorKind::Convergence,
            format!("autocalibration did not converge within {MAX_CAL_ITERATIONS} iterations"),
        ))
    };
    match run.await {
        Ok(r) | Err(r) => r,
    }
}

/// Runs the output/ramp/transient test sequence, writing one plot per
/// stage into the device's artifact directory.
pub(crate) async fn plot_sequence_over_link(
    link: &Arc<dyn crate::driver::InstrumentLink>,
    ctx: &crate::scheduler::OpContext,
    store: &ArtifactStore,
    serial: u32,
) -> OperationResult {
    let run = async {
        let dir = store
            .device_dir(serial)
            .map_err(|e| link_failure("run_test_sequence", &e))?;

        let mut artifacts = Vec::new();
        for (cmd, name, title) in [
            ("TEST:OUTP?", "output.svg", "Output levels"),
            ("TEST:RAMP?", "ramp.svg", "Ramp response"),
            ("TEST:TRAN?", "transient.svg", "Transient response"),
        ] {
            if let Some(cancelled) = ctx.check_cancelled() {
                return Ok(cancelled);
            }
            let reply = checked_query(link, "run_test_sequence", cmd).await?;
            let samples = parse_samples(&reply)?;
            ctx.emit(format!("{title}: {} samples", samples.len()));
            let artifact = artifacts::write_plot(&dir, name, title, &samples)
                .map_err(|e| link_failure("run_test_sequence", &e))?;
            artifacts.push(artifact);
        }
        Ok(OperationResult::ok("test sequence complete").with_artifacts(artifacts))
    };
    match run.await {
        Ok(r) | Err(r) => r,
    }
}

/// Parses a `gain,offset` coefficient reply.
pub(crate) fn parse_coefficients(reply: &str) -> Result<(f64, f64), OperationResult> {
    let samples = parse_samples(reply)?;
    if samples.len() != 2 {
        return Err(OperationResult::failure(
            ErrorKind::HardwareFault,
            format!("expected two coefficients, got {reply:?}"),
        ));
    }
    Ok((samples[0], samples[1]))
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Converts a link-level fault into the failed result for `op`.
pub(crate) fn link_failure(op: &str, err: &BenchError) -> OperationResult {
    OperationResult::failure(err.kind(), format!("{op} failed: {err}"))
}

/// Queries the link and screens the reply for a device fault. The `Err`
/// side carries the terminal result for the operation.
pub(crate) async fn checked_query(
    link: &Arc<dyn crate::driver::InstrumentLink>,
    op: &str,
    cmd: &str,
) -> Result<String, OperationResult> {
    match link.query(cmd).await {
        Ok(reply) => match fault_reply(op, &reply) {
            Some(fault) => Err(fault),
            None => Ok(reply),
        },
        Err(err) => Err(link_failure(op, &err)),
    }
}

/// Replies beginning with `FAULT` signal an abnormal device condition the
/// device cannot recover from without a reconnect.
pub(crate) fn fault_reply(op: &str, reply: &str) -> Option<OperationResult> {
    if reply.starts_with("FAULT") {
        Some(OperationResult::fatal_fault(format!(
            "{op}: device reported {reply}"
        )))
    } else {
        None
    }
}

/// Parses a comma-separated sample reply.
pub(crate) fn parse_samples(reply: &str) -> Result<Vec<f64>, OperationResult> {
    let mut samples = Vec::new();
    for field in reply.split(',') {
        match field.trim().parse::<f64>() {
            Ok(v) => samples.push(v),
            Err(_) => {
                return Err(OperationResult::failure(
                    ErrorKind::HardwareFault,
                    format!("malformed sample reply: {reply:?}"),
                ))
            }
        }
    }
    if samples.is_empty() {
        return Err(OperationResult::failure(
            ErrorKind::HardwareFault,
            "empty sample reply",
        ));
    }
    Ok(samples)
}

/// Ordinary least-squares fit of `y = gain * x + offset` over the sweep
/// points. Callers guarantee at least two points.
pub(crate) fn linear_fit(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    let sx: f64 = points.iter().map(|(x, _)| x).sum();
    let sy: f64 = points.iter().map(|(_, y)| y).sum();
    let sxx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sxy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let denom = n * sxx - sx * sx;
    if denom.abs() < f64::EPSILON {
        return (1.0, 0.0);
    }
    let gain = (n * sxy - sx * sy) / denom;
    let offset = (sy - gain * sx) / n;
    (gain, offset)
}

/// Reads a two-column sweep CSV written by `calibration_measure`, skipping
/// the header line.
pub(crate) fn read_sweep_csv(path: &Path) -> AppResult<Vec<(f64, f64)>> {
    let text = std::fs::read_to_string(path)?;
    let mut points = Vec::new();
    for line in text.lines().skip(1) {
        let mut fields = line.split(',');
        let x = fields.next().and_then(|f| f.trim().parse::<f64>().ok());
        let y = fields.next().and_then(|f| f.trim().parse::<f64>().ok());
        match (x, y) {
            (Some(x), Some(y)) => points.push((x, y)),
            _ => {
                return Err(BenchError::Driver(format!(
                    "malformed sweep row in {}: {line:?}",
                    path.display()
                )))
            }
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_fit_recovers_line() {
        let points: Vec<(f64, f64)> = (0..20)
            .map(|i| {
                let x = f64::from(i) * 0.1;
                (x, 1.02 * x + 0.015)
            })
            .collect();
        let (gain, offset) = linear_fit(&points);
        assert!((gain - 1.02).abs() < 1e-9);
        assert!((offset - 0.015).abs() < 1e-9);
    }

    #[test]
    fn test_parse_samples() {
        let samples = parse_samples("0.1, 0.2,0.3").unwrap();
        assert_eq!(samples, vec![0.1, 0.2, 0.3]);
        assert!(parse_samples("0.1,garbage").is_err());
        assert!(parse_samples("").is_err());
    }

    #[test]
    fn test_fault_reply_is_fatal() {
        let r = fault_reply("read_measurement", "FAULT OVERTEMP").unwrap();
        assert!(!r.success);
        assert!(r.fatal);
        assert!(fault_reply("read_measurement", "36.2").is_none());
    }

    #[test]
    fn test_sweep_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        std::fs::write(&path, "level_v,reading_a\n0.0,0.015\n0.1,0.117\n").unwrap();
        let points = read_sweep_csv(&path).unwrap();
        assert_eq!(points.len(), 2);
        assert!((points[1].0 - 0.1).abs() < 1e-12);
    }
}

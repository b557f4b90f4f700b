//! Core traits and data types for the calibration bench.
//!
//! This module defines the foundational abstractions shared by the whole
//! execution core:
//!
//! - [`Controller`]: trait implemented once per device family, plus one
//!   simulated variant per family
//! - [`Operation`]: the capability set a presenter can request
//! - [`OperationResult`]: immutable outcome record returned by every
//!   controller call
//! - [`ConnectionState`]: per-device lifecycle state machine states
//!
//! # Data Flow
//!
//! ```text
//! Presenter -> DeviceService::execute(op) -> TaskPool -> Controller call
//!           <- SessionEvent queue <- Started/Output/Finished events
//! ```
//!
//! # Thread Safety
//!
//! Controllers require `Send + Sync`: every operation runs on a pooled
//! background task while the handle side lives on the interaction thread.

use crate::error::ErrorKind;
use crate::scheduler::OpContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Upper bound on iterative calibration procedures. Exceeding it yields a
/// `Convergence` failure instead of looping indefinitely.
pub const MAX_CAL_ITERATIONS: u32 = 10;

// =============================================================================
// Device identity
// =============================================================================

/// Supported instrument classes; each has a real and a simulated
/// [`Controller`] variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    VoltageUnit,
    SourceMeasureUnit,
    SamplingUnit,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::VoltageUnit => "voltage_unit",
            DeviceKind::SourceMeasureUnit => "source_measure_unit",
            DeviceKind::SamplingUnit => "sampling_unit",
        };
        f.write_str(name)
    }
}

/// Static identity of one device for the duration of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    /// Instrument class.
    pub kind: DeviceKind,
    /// Network endpoint, `host:port`.
    pub address: String,
}

// =============================================================================
// Connection state machine
// =============================================================================

/// Per-device connection/operation state. Exactly one state at a time;
/// transitions are enforced by `DeviceService`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// Reachability probe in flight.
    Verifying,
    Connected,
    /// One operation holds the device guard.
    Busy,
    /// Fatal hardware fault; terminal pending an explicit reconnect.
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Verifying => "verifying",
            ConnectionState::Connected => "connected",
            ConnectionState::Busy => "busy",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Artifacts
// =============================================================================

/// What an artifact file contains, without the core owning its contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Plot,
    Log,
    RawData,
}

/// Reference to a file produced as a side effect of an operation. The core
/// records paths only; file lifecycle belongs to whoever consumes them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRef {
    /// Builds a reference for `path` with the kind inferred from its
    /// extension (`.svg`/`.png` plot, `.log`/`.txt` log, anything else raw
    /// data).
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = match path.extension().and_then(|e| e.to_str()) {
            Some("svg") | Some("png") => ArtifactKind::Plot,
            Some("log") | Some("txt") => ArtifactKind::Log,
            _ => ArtifactKind::RawData,
        };
        Self {
            path,
            kind,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Operation results
// =============================================================================

/// Immutable outcome of one unit of hardware work.
///
/// Constructed once by a controller call and never mutated afterward.
/// `success == false` implies `error_kind` is set; `success == true`
/// implies it is unset (enforced by the constructors).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    /// Human-readable outcome, sufficient to render without inspecting
    /// internals.
    pub message: String,
    pub error_kind: Option<ErrorKind>,
    /// Whether a hardware fault is fatal for the device; drives the
    /// `Busy -> Faulted` transition.
    #[serde(default)]
    pub fatal: bool,
    /// Operation-specific payload (coefficients, readings, folder paths).
    #[serde(default)]
    pub data: serde_json::Value,
    /// Files generated by the operation, in production order.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl OperationResult {
    /// Successful outcome with no payload.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_kind: None,
            fatal: false,
            data: serde_json::Value::Null,
            artifacts: Vec::new(),
        }
    }

    /// Failed outcome of the given kind.
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error_kind: Some(kind),
            fatal: false,
            data: serde_json::Value::Null,
            artifacts: Vec::new(),
        }
    }

    /// Failed outcome for a hardware fault the device cannot recover from
    /// without a reconnect.
    pub fn fatal_fault(message: impl Into<String>) -> Self {
        let mut r = Self::failure(ErrorKind::HardwareFault, message);
        r.fatal = true;
        r
    }

    /// Returns a copy carrying `data`.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Returns a copy carrying `artifacts`.
    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactRef>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Failure for an operation a device family does not implement. Real
    /// and simulated variants share this so refusals have the same shape.
    pub fn unsupported(family: DeviceKind, op: &str) -> Self {
        Self::failure(
            ErrorKind::HardwareFault,
            format!("{family} does not support {op}"),
        )
    }
}

// =============================================================================
// Operations
// =============================================================================

/// The capability set exposed by every device family.
///
/// A single envelope type keeps the service/scheduler generic; the
/// controller trait dispatches it onto typed methods.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Initialize a freshly flashed device.
    InitializeDevice {
        serial: u32,
        processor_type: String,
        connector_type: String,
    },
    /// Read the current device temperature.
    ReadMeasurement,
    /// Run iterative autocalibration (bounded at [`MAX_CAL_ITERATIONS`]).
    PerformAutocalibration,
    /// Run the full test sequence (outputs, ramp, transient), producing
    /// plot artifacts.
    RunTestSequence,
    /// Sweep measurement writing raw data into `folder`.
    CalibrationMeasure { folder: PathBuf },
    /// Fit over previously measured data in `folder`.
    CalibrationFit { folder: PathBuf },
    /// Read correction coefficients from the device.
    ReadCoefficients,
    /// Persist correction coefficients to device EEPROM.
    WriteCoefficients,
}

impl Operation {
    /// Stable name used for task labels and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::InitializeDevice { .. } => "initialize_device",
            Operation::ReadMeasurement => "read_measurement",
            Operation::PerformAutocalibration => "perform_autocalibration",
            Operation::RunTestSequence => "run_test_sequence",
            Operation::CalibrationMeasure { .. } => "calibration_measure",
            Operation::CalibrationFit { .. } => "calibration_fit",
            Operation::ReadCoefficients => "read_coefficients",
            Operation::WriteCoefficients => "write_coefficients",
        }
    }
}

// =============================================================================
// Controller trait
// =============================================================================

/// Pure hardware logic for one device family.
///
/// No threading, no UI concerns: controllers run inside pooled tasks and
/// talk back only through the [`OpContext`] they are handed. A controller
/// method never errors past its own boundary; internal faults become a
/// `success = false` result with the appropriate kind.
///
/// `connect`/`disconnect` are the exception: they are lifecycle calls made
/// by the device service outside any task, and report via `AppResult` so
/// the service can drive its state machine synchronously.
#[async_trait]
pub trait Controller: Send + Sync {
    /// The device family this controller drives.
    fn family(&self) -> DeviceKind;

    /// Probe reachability and open the driver link.
    async fn connect(&self) -> crate::error::AppResult<()>;

    /// Close the driver link. Idempotent.
    async fn disconnect(&self) -> crate::error::AppResult<()>;

    async fn initialize_device(
        &self,
        ctx: &OpContext,
        serial: u32,
        processor_type: &str,
        connector_type: &str,
    ) -> OperationResult;

    async fn read_measurement(&self, ctx: &OpContext) -> OperationResult;

    async fn perform_autocalibration(&self, ctx: &OpContext) -> OperationResult;

    async fn run_test_sequence(&self, ctx: &OpContext) -> OperationResult;

    /// Families without a host-side calibration sweep keep the default.
    async fn calibration_measure(&self, _ctx: &OpContext, _folder: &std::path::Path) -> OperationResult {
        OperationResult::unsupported(self.family(), "calibration_measure")
    }

    /// Families without a host-side fit step keep the default.
    async fn calibration_fit(&self, _ctx: &OpContext, _folder: &std::path::Path) -> OperationResult {
        OperationResult::unsupported(self.family(), "calibration_fit")
    }

    /// Families without host-visible coefficients keep the default.
    async fn read_coefficients(&self, _ctx: &OpContext) -> OperationResult {
        OperationResult::unsupported(self.family(), "read_coefficients")
    }

    /// Families without host-visible coefficients keep the default.
    async fn write_coefficients(&self, _ctx: &OpContext) -> OperationResult {
        OperationResult::unsupported(self.family(), "write_coefficients")
    }

    /// Dispatches an [`Operation`] envelope onto the typed methods.
    async fn dispatch(&self, op: Operation, ctx: &OpContext) -> OperationResult {
        match op {
            Operation::InitializeDevice {
                serial,
                processor_type,
                connector_type,
            } => {
                self.initialize_device(ctx, serial, &processor_type, &connector_type)
                    .await
            }
            Operation::ReadMeasurement => self.read_measurement(ctx).await,
            Operation::PerformAutocalibration => self.perform_autocalibration(ctx).await,
            Operation::RunTestSequence => self.run_test_sequence(ctx).await,
            Operation::CalibrationMeasure { folder } => {
                self.calibration_measure(ctx, &folder).await
            }
            Operation::CalibrationFit { folder } => self.calibration_fit(ctx, &folder).await,
            Operation::ReadCoefficients => self.read_coefficients(ctx).await,
            Operation::WriteCoefficients => self.write_coefficients(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_invariant() {
        let ok = OperationResult::ok("done");
        assert!(ok.success);
        assert!(ok.error_kind.is_none());

        let fail = OperationResult::failure(ErrorKind::Convergence, "no convergence");
        assert!(!fail.success);
        assert_eq!(fail.error_kind, Some(ErrorKind::Convergence));
        assert!(!fail.fatal);

        assert!(OperationResult::fatal_fault("smoke").fatal);
    }

    #[test]
    fn test_artifact_kind_inference() {
        assert_eq!(ArtifactRef::for_path("a/output.svg").kind, ArtifactKind::Plot);
        assert_eq!(ArtifactRef::for_path("a/run.log").kind, ArtifactKind::Log);
        assert_eq!(
            ArtifactRef::for_path("a/raw_data.csv").kind,
            ArtifactKind::RawData
        );
    }

    #[test]
    fn test_operation_roundtrip() {
        let op = Operation::InitializeDevice {
            serial: 1234,
            processor_type: "746".into(),
            connector_type: "BNC".into(),
        };
        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name(), "initialize_device");
    }
}

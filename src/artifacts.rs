//! Artifact storage for calibration outputs.
//!
//! Operations leave files behind (plots, logs, raw sweep data). The store
//! owns only the directory layout and path bookkeeping: a session-scoped
//! base directory with one `calibration_<serial>` subdirectory per device.
//! File contents belong to whoever wrote them.
//!
//! [`ArtifactStore::collect`] returns the canonical presentation order:
//! the headline test plots (`output`, `ramp`, `transient`) first, then
//! everything else sorted, deduplicated.

use crate::core::ArtifactRef;
use crate::error::AppResult;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Plot files listed ahead of all others when collecting.
const PRIORITY_PLOTS: [&str; 3] = ["output.svg", "ramp.svg", "transient.svg"];

/// Manages artifact directories under a session-scoped base path.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory for one device's artifacts, created on first use.
    pub fn device_dir(&self, serial: u32) -> AppResult<PathBuf> {
        let dir = self.base_dir.join(format!("calibration_{serial}"));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// All artifacts for a device, priority plots first, then the rest in
    /// sorted order, deduplicated.
    pub fn collect(&self, serial: u32) -> Vec<ArtifactRef> {
        let dir = self.base_dir.join(format!("calibration_{serial}"));
        let mut paths: Vec<PathBuf> = Vec::new();

        for name in PRIORITY_PLOTS {
            let p = dir.join(name);
            if p.exists() {
                paths.push(p);
            }
        }

        let mut rest: Vec<PathBuf> = fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect()
            })
            .unwrap_or_default();
        rest.sort();

        for p in rest {
            if !paths.contains(&p) {
                paths.push(p);
            }
        }

        paths.into_iter().map(ArtifactRef::for_path).collect()
    }
}

// =============================================================================
// Writers shared by real and simulated controllers
// =============================================================================

/// Writes a waveform as a minimal standalone SVG line plot and returns its
/// reference. Real and simulated controllers share this so both backends
/// produce identically shaped plot artifacts.
pub fn write_plot(dir: &Path, name: &str, title: &str, samples: &[f64]) -> AppResult<ArtifactRef> {
    const W: f64 = 640.0;
    const H: f64 = 400.0;
    const MARGIN: f64 = 40.0;

    let (min, max) = samples.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    });
    let span = if (max - min).abs() < f64::EPSILON {
        1.0
    } else {
        max - min
    };

    let mut points = String::new();
    let n = samples.len().max(2) as f64;
    for (i, &v) in samples.iter().enumerate() {
        let x = MARGIN + (i as f64 / (n - 1.0)) * (W - 2.0 * MARGIN);
        let y = H - MARGIN - ((v - min) / span) * (H - 2.0 * MARGIN);
        points.push_str(&format!("{x:.1},{y:.1} "));
    }

    let svg = format!(
        concat!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" ",
            "viewBox=\"0 0 {w} {h}\">\n",
            "<rect width=\"{w}\" height=\"{h}\" fill=\"white\"/>\n",
            "<text x=\"{tx}\" y=\"24\" font-family=\"sans-serif\" font-size=\"16\" ",
            "text-anchor=\"middle\">{title}</text>\n",
            "<polyline fill=\"none\" stroke=\"#1f77b4\" stroke-width=\"1.5\" ",
            "points=\"{points}\"/>\n",
            "</svg>\n"
        ),
        w = W,
        h = H,
        tx = W / 2.0,
        title = title,
        points = points.trim_end(),
    );

    let path = dir.join(name);
    fs::write(&path, svg)?;
    Ok(ArtifactRef::for_path(path))
}

/// Writes sweep samples as two-column CSV raw data.
pub fn write_raw_data(
    dir: &Path,
    name: &str,
    header: &str,
    rows: &[(f64, f64)],
) -> AppResult<ArtifactRef> {
    let path = dir.join(name);
    let mut file = fs::File::create(&path)?;
    writeln!(file, "{header}")?;
    for (x, y) in rows {
        writeln!(file, "{x},{y}")?;
    }
    Ok(ArtifactRef::for_path(path))
}

/// Appends lines to an operation log file, creating it if needed.
pub fn write_log(dir: &Path, name: &str, lines: &[String]) -> AppResult<ArtifactRef> {
    let path = dir.join(name);
    let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(ArtifactRef::for_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactKind;

    #[test]
    fn test_collect_priority_ordering() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let dir = store.device_dir(7).unwrap();

        fs::write(dir.join("aaa_extra.svg"), "x").unwrap();
        fs::write(dir.join("transient.svg"), "x").unwrap();
        fs::write(dir.join("output.svg"), "x").unwrap();
        fs::write(dir.join("run.log"), "x").unwrap();

        let artifacts = store.collect(7);
        let names: Vec<_> = artifacts
            .iter()
            .map(|a| a.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["output.svg", "transient.svg", "aaa_extra.svg", "run.log"]);
    }

    #[test]
    fn test_collect_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        assert!(store.collect(99).is_empty());
    }

    #[test]
    fn test_plot_writer_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let samples: Vec<f64> = (0..100).map(|i| (i as f64 * 0.1).sin()).collect();
        let artifact = write_plot(tmp.path(), "ramp.svg", "Ramp Test", &samples).unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Plot);
        let body = fs::read_to_string(&artifact.path).unwrap();
        assert!(body.contains("Ramp Test"));
        assert!(body.contains("polyline"));
    }

    #[test]
    fn test_raw_data_writer() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact =
            write_raw_data(tmp.path(), "raw_data.csv", "set_v,meas_v", &[(0.0, 0.01), (1.0, 1.02)])
                .unwrap();
        assert_eq!(artifact.kind, ArtifactKind::RawData);
        let body = fs::read_to_string(&artifact.path).unwrap();
        assert_eq!(body.lines().count(), 3);
    }
}

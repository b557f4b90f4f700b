//! Synthetic waveform generation for simulated backends.
//!
//! Simulated controllers synthesize the same waveform shapes the real
//! instruments produce so plot and raw-data artifacts are
//! indistinguishable in structure from hardware runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn rng() -> StdRng {
    StdRng::from_entropy()
}

/// Channel step response: sine with measurement noise.
pub fn output_waveform(samples: usize) -> Vec<f64> {
    let mut rng = rng();
    (0..samples)
        .map(|i| {
            let t = i as f64 * 10.0 / samples as f64;
            t.sin() + rng.gen_range(-0.05..0.05)
        })
        .collect()
}

/// Voltage sweep: clipped linear ramp with noise.
pub fn ramp_waveform(samples: usize) -> Vec<f64> {
    let mut rng = rng();
    (0..samples)
        .map(|i| {
            let t = i as f64 * 10.0 / samples as f64;
            (t * 0.2).clamp(0.0, 1.5) + rng.gen_range(-0.02..0.02)
        })
        .collect()
}

/// Settling curve with overshoot ringing.
pub fn transient_waveform(samples: usize) -> Vec<f64> {
    let mut rng = rng();
    (0..samples)
        .map(|i| {
            let t = i as f64 * 10.0 / samples as f64;
            1.0 - (-t * 2.0).exp() + 0.15 * (-t * 5.0).exp() * (t * 10.0).sin()
                + rng.gen_range(-0.01..0.01)
        })
        .collect()
}

/// Calibration sweep points: near-ideal linear response
/// (gain 1.02, offset 15 mV) with measurement scatter.
pub fn sweep_points(samples: usize) -> Vec<(f64, f64)> {
    let mut rng = rng();
    (0..samples)
        .map(|i| {
            let x = -1.0 + 2.0 * i as f64 / (samples.max(2) - 1) as f64;
            (x, 1.02 * x + 0.015 + rng.gen_range(-0.02..0.02))
        })
        .collect()
}

/// Plausible enclosure temperature in degrees Celsius.
pub fn temperature() -> f64 {
    36.0 + rng().gen_range(-0.8..0.8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waveform_lengths() {
        assert_eq!(output_waveform(100).len(), 100);
        assert_eq!(ramp_waveform(50).len(), 50);
        assert_eq!(transient_waveform(10).len(), 10);
        assert_eq!(sweep_points(20).len(), 20);
    }

    #[test]
    fn test_ramp_stays_clamped() {
        for v in ramp_waveform(200) {
            assert!(v > -0.1 && v < 1.6);
        }
    }

    #[test]
    fn test_temperature_plausible() {
        let t = temperature();
        assert!((35.0..37.0).contains(&t));
    }
}

//! Causal low-pass smoothing.
//!
//! Both channels must go through the same filter: the lag estimate relies on
//! equal group delay across channels, not on zero-phase filtering.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{PwvError, Waveform};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterParams {
    pub cutoff_hz: f64,
    pub taps: usize,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            cutoff_hz: 10.0,
            taps: 129,
        }
    }
}

impl FilterParams {
    pub fn validate(&self, fs: f64) -> Result<(), PwvError> {
        let nyquist = fs / 2.0;
        if !self.cutoff_hz.is_finite() || self.cutoff_hz <= 0.0 {
            return Err(PwvError::InvalidParameter(format!(
                "cutoff must be positive, got {} Hz",
                self.cutoff_hz
            )));
        }
        if self.cutoff_hz >= nyquist {
            return Err(PwvError::InvalidParameter(format!(
                "cutoff {} Hz must be below Nyquist ({} Hz)",
                self.cutoff_hz, nyquist
            )));
        }
        if self.taps == 0 {
            return Err(PwvError::InvalidParameter("filter needs at least one tap".into()));
        }
        Ok(())
    }

    /// Leading output samples that are not yet a full convolution.
    pub fn warmup_samples(&self) -> usize {
        self.taps.saturating_sub(1)
    }
}

/// Hamming-windowed sinc low-pass taps, scaled to unity gain at DC.
pub fn design_lowpass(taps: usize, cutoff_hz: f64, fs: f64) -> Vec<f64> {
    let cutoff = cutoff_hz / (fs / 2.0);
    let mid = (taps as f64 - 1.0) / 2.0;
    let mut coeffs: Vec<f64> = (0..taps)
        .map(|i| {
            let m = i as f64 - mid;
            let window = if taps > 1 {
                0.54 - 0.46 * (2.0 * PI * i as f64 / (taps as f64 - 1.0)).cos()
            } else {
                1.0
            };
            cutoff * sinc(cutoff * m) * window
        })
        .collect();

    let gain: f64 = coeffs.iter().sum();
    if gain.abs() > 1e-12 {
        for c in coeffs.iter_mut() {
            *c /= gain;
        }
    }
    coeffs
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Direct-form convolution with zero initial state; output length equals input length.
pub fn apply_fir(coeffs: &[f64], input: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(input.len());
    for n in 0..input.len() {
        let reach = coeffs.len().min(n + 1);
        let mut acc = 0.0;
        for (k, &c) in coeffs[..reach].iter().enumerate() {
            acc += c * input[n - k];
        }
        out.push(acc);
    }
    out
}

pub fn lowpass_fir(waveform: &Waveform, params: &FilterParams) -> Result<Waveform, PwvError> {
    params.validate(waveform.fs())?;
    let coeffs = design_lowpass(params.taps, params.cutoff_hz, waveform.fs());
    Ok(waveform.with_samples(apply_fir(&coeffs, waveform.as_slice())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_design_has_unity_dc_gain() {
        let taps = design_lowpass(129, 10.0, 1000.0);
        assert_eq!(taps.len(), 129);
        assert_relative_eq!(taps.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        // Linear phase: symmetric taps.
        for i in 0..64 {
            assert_relative_eq!(taps[i], taps[128 - i], epsilon = 1e-15);
        }
    }

    #[test]
    fn test_rejects_cutoff_at_nyquist() {
        let w = Waveform::new(vec![0.0; 32], 100.0).unwrap();
        let params = FilterParams {
            cutoff_hz: 50.0,
            taps: 31,
        };
        assert!(matches!(
            lowpass_fir(&w, &params),
            Err(PwvError::InvalidParameter(_))
        ));
        let zero_taps = FilterParams {
            cutoff_hz: 10.0,
            taps: 0,
        };
        assert!(lowpass_fir(&w, &zero_taps).is_err());
    }

    #[test]
    fn test_constant_signal_settles_to_input() {
        let w = Waveform::new(vec![2.0; 400], 1000.0).unwrap();
        let y = lowpass_fir(&w, &FilterParams::default()).unwrap();
        assert_eq!(y.len(), 400);
        assert_eq!(y.fs(), 1000.0);
        // Zero initial state means the head ramps up; after the taps are filled it is flat.
        let settle = FilterParams::default().warmup_samples();
        assert_eq!(settle, 128);
        assert!(y.as_slice()[0] < 2.0);
        for &v in &y.as_slice()[settle..] {
            assert_relative_eq!(v, 2.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_filter_is_causal() {
        let mut x = vec![0.0; 200];
        x[100] = 1.0;
        let y = apply_fir(&design_lowpass(21, 10.0, 100.0), &x);
        assert!(y[..100].iter().all(|v| *v == 0.0));
        assert!(y[110].abs() > 0.0);
    }
}

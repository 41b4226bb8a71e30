//! Pulse wave velocity estimation from a proximal/distal pair of PPG waveforms.
//!
//! The stages are small, stateless functions (filtering, derivatives, fiducial
//! detection, beat clustering, causal lag pairing, robust reduction) that the
//! [`pipeline`] module composes into four estimation strategies.

pub mod agreement;
pub mod clustering;
pub mod derivative;
pub mod features;
pub mod fiducials;
pub mod lag;
pub mod pipeline;
pub mod preprocess;
pub mod quality;
pub mod robust;
pub mod synthetic;

use ndarray::Array1;
use thiserror::Error;

pub use agreement::{bland_altman, bland_altman_points, BlandAltman};
pub use clustering::{kmeans, select_stable_beats, ClusterParams, KMeansFit};
pub use derivative::{first_derivative, second_derivative, Derivatives};
pub use features::{beat_features, BeatFeatureVector, BeatFeatures};
pub use fiducials::{
    detect_curvature_valleys, detect_rise_points, detect_valleys, refine_valley, refine_valleys,
    FiducialKind, FiducialPoint, FiducialSeries, RefineParams, RiseParams, ValleyParams,
};
pub use lag::{pair_fiducials, velocity_from_lag, FiducialPair};
pub use pipeline::{
    list_pipelines, BeatRecord, BeatTable, Params, Pipeline, PipelineConfig, PipelineInfo,
    PipelineKind, PipelineOutput, PipelineResult,
};
pub use preprocess::{lowpass_fir, FilterParams};
pub use quality::{gate_hit_ratio, signal_quality_indices, QualityIndices};
pub use robust::{
    kde_mode, mad_filter, mean_defined, median, median_defined, reduce_lags, LagSummary,
};
pub use synthetic::{
    synthesize_pair, synthesize_ppg_bundle, PpgBundle, SyntheticConfig, SyntheticPair,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PwvError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid waveform: {0}")]
    InvalidWaveform(String),
    #[error("sample rate mismatch: pipeline expects {expected} Hz, waveform has {actual} Hz")]
    SampleRateMismatch { expected: f64, actual: f64 },
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

/// A uniformly sampled signal. Stages never mutate a waveform in place; they
/// return a new one with the same sample rate.
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    samples: Array1<f64>,
    fs: f64,
}

impl Waveform {
    pub fn new(samples: Vec<f64>, fs: f64) -> Result<Self, PwvError> {
        Self::from_array(Array1::from_vec(samples), fs)
    }

    pub fn from_array(samples: Array1<f64>, fs: f64) -> Result<Self, PwvError> {
        if !fs.is_finite() || fs <= 0.0 {
            return Err(PwvError::InvalidWaveform(format!(
                "sample rate must be positive and finite, got {fs}"
            )));
        }
        let samples = if samples.is_standard_layout() {
            samples
        } else {
            Array1::from_vec(samples.to_vec())
        };
        Ok(Self { samples, fs })
    }

    pub fn fs(&self) -> f64 {
        self.fs
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        // Contiguous by construction.
        self.samples.as_slice().unwrap_or(&[])
    }

    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.fs
    }

    /// Build a waveform with the same sample rate from freshly computed samples.
    pub(crate) fn with_samples(&self, samples: Vec<f64>) -> Self {
        Self {
            samples: Array1::from_vec(samples),
            fs: self.fs,
        }
    }

    /// Copy of this waveform delayed by `lag_samples`; the head is padded with
    /// the first sample and the tail is truncated so the length is unchanged.
    pub fn delayed(&self, lag_samples: usize) -> Self {
        let n = self.len();
        let first = self.samples.first().copied().unwrap_or(0.0);
        let keep = n.saturating_sub(lag_samples);
        let mut out = Vec::with_capacity(n);
        out.extend(std::iter::repeat(first).take(n - keep));
        out.extend(self.samples.iter().take(keep).copied());
        self.with_samples(out)
    }
}

/// Milliseconds to a whole number of samples, never less than one.
pub(crate) fn ms_to_samples(ms: f64, fs: f64) -> usize {
    ((ms * fs / 1000.0).floor() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waveform_rejects_bad_rate() {
        assert!(Waveform::new(vec![0.0; 4], 0.0).is_err());
        assert!(Waveform::new(vec![0.0; 4], f64::NAN).is_err());
        assert!(Waveform::new(vec![0.0; 4], 250.0).is_ok());
    }

    #[test]
    fn test_delayed_preserves_length() {
        let w = Waveform::new(vec![1.0, 2.0, 3.0, 4.0, 5.0], 100.0).unwrap();
        let d = w.delayed(2);
        assert_eq!(d.as_slice(), &[1.0, 1.0, 1.0, 2.0, 3.0]);
        assert_eq!(d.fs(), 100.0);
        let all = w.delayed(10);
        assert_eq!(all.as_slice(), &[1.0; 5]);
    }

    #[test]
    fn test_ms_to_samples_floor_and_minimum() {
        assert_eq!(ms_to_samples(300.0, 1000.0), 300);
        assert_eq!(ms_to_samples(180.0, 125.0), 22);
        assert_eq!(ms_to_samples(0.1, 100.0), 1);
    }
}

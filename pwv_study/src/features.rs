//! Per-beat morphology features used to tell well-formed beats from artifacts.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::derivative::gradient;
use crate::{ms_to_samples, Waveform};

/// Windows shorter than this carry too little shape to describe a beat.
pub const MIN_WINDOW_SAMPLES: usize = 10;
pub const FEATURE_DIM: usize = 4;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BeatFeatureVector {
    pub amplitude_span: f64,
    pub max_slope: f64,
    pub min_curvature: f64,
    pub sample_count: f64,
}

impl BeatFeatureVector {
    pub fn to_array(&self) -> [f64; FEATURE_DIM] {
        [
            self.amplitude_span,
            self.max_slope,
            self.min_curvature,
            self.sample_count,
        ]
    }
}

/// Feature rows paired 1:1 with the anchors that produced them.
#[derive(Clone, Debug)]
pub struct BeatFeatures {
    pub matrix: Array2<f64>,
    pub anchors: Vec<usize>,
}

impl BeatFeatures {
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn vector(&self, row: usize) -> Option<BeatFeatureVector> {
        if row >= self.matrix.nrows() {
            return None;
        }
        let r = self.matrix.row(row);
        Some(BeatFeatureVector {
            amplitude_span: r[0],
            max_slope: r[1],
            min_curvature: r[2],
            sample_count: r[3],
        })
    }
}

pub fn beat_vector(window: &[f64]) -> Option<BeatFeatureVector> {
    if window.len() < MIN_WINDOW_SAMPLES {
        return None;
    }
    let (lo, hi) = window
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let slope = gradient(window);
    let max_slope = if window.len() > 3 {
        slope.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    } else {
        0.0
    };
    let min_curvature = if window.len() > 5 {
        gradient(&slope).into_iter().fold(f64::INFINITY, f64::min)
    } else {
        0.0
    };
    Some(BeatFeatureVector {
        amplitude_span: hi - lo,
        max_slope,
        min_curvature,
        sample_count: window.len() as f64,
    })
}

/// Extract one feature row per anchor from a centred `win_ms` window of the
/// filtered waveform; anchors with short windows are dropped.
pub fn beat_features(filtered: &Waveform, anchors: &[usize], win_ms: f64) -> BeatFeatures {
    let x = filtered.as_slice();
    let width = ms_to_samples(win_ms, filtered.fs());
    let half = width / 2;

    let mut rows = Vec::with_capacity(anchors.len() * FEATURE_DIM);
    let mut kept = Vec::with_capacity(anchors.len());
    for &a in anchors {
        let start = a.saturating_sub(half).min(x.len());
        let end = x.len().min(a.saturating_add(half));
        if end <= start {
            continue;
        }
        if let Some(v) = beat_vector(&x[start..end]) {
            rows.extend_from_slice(&v.to_array());
            kept.push(a);
        }
    }

    let matrix = Array2::from_shape_vec((kept.len(), FEATURE_DIM), rows)
        .unwrap_or_else(|_| Array2::zeros((0, FEATURE_DIM)));
    BeatFeatures {
        matrix,
        anchors: kept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_short_windows_are_dropped() {
        let samples: Vec<f64> = (0..100).map(|i| (i as f64 * 0.1).sin()).collect();
        let w = Waveform::new(samples, 100.0).unwrap();
        // 300 ms at 100 Hz is 30 samples; anchor 2 only has 17 and anchor 99 has 16.
        let feats = beat_features(&w, &[2, 50, 99], 300.0);
        assert_eq!(feats.anchors, vec![2, 50, 99]);

        let narrow = beat_features(&w, &[0, 50], 150.0);
        // 15 samples wide: anchor 0 keeps only 7 samples.
        assert_eq!(narrow.anchors, vec![50]);
        assert_eq!(narrow.matrix.nrows(), 1);
        assert_eq!(narrow.matrix.ncols(), FEATURE_DIM);
    }

    #[test]
    fn test_feature_values_on_ramp() {
        let samples: Vec<f64> = (0..40).map(|i| i as f64 * 0.5).collect();
        let w = Waveform::new(samples, 100.0).unwrap();
        let feats = beat_features(&w, &[20], 200.0);
        let v = feats.vector(0).unwrap();
        // Window [10, 30): 20 samples of a 0.5-per-sample ramp.
        assert_relative_eq!(v.amplitude_span, 9.5);
        assert_relative_eq!(v.max_slope, 0.5);
        assert_relative_eq!(v.min_curvature, 0.0);
        assert_relative_eq!(v.sample_count, 20.0);
        assert!(feats.vector(1).is_none());
    }

    #[test]
    fn test_no_anchors_gives_empty_matrix() {
        let w = Waveform::new(vec![0.0; 10], 100.0).unwrap();
        let feats = beat_features(&w, &[], 300.0);
        assert!(feats.is_empty());
        assert_eq!(feats.matrix.dim(), (0, FEATURE_DIM));
    }
}

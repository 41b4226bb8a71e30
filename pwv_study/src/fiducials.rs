//! Fiducial detection: rise points on the first derivative and curvature
//! valleys on the second derivative, with optional Gaussian-weighted refinement.

use serde::{Deserialize, Serialize};

use crate::{ms_to_samples, PwvError, Waveform};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FiducialKind {
    Rise,
    Valley,
}

impl FiducialKind {
    pub fn label(self) -> &'static str {
        match self {
            FiducialKind::Rise => "rise",
            FiducialKind::Valley => "valley",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FiducialPoint {
    pub index: usize,
    pub kind: FiducialKind,
}

/// Strictly increasing fiducial indices of one kind from one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FiducialSeries {
    pub kind: FiducialKind,
    pub indices: Vec<usize>,
}

impl FiducialSeries {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Drop every fiducial before `start`.
    pub fn skip_before(mut self, start: usize) -> Self {
        self.indices.retain(|&i| i >= start);
        self
    }

    pub fn points(&self) -> impl Iterator<Item = FiducialPoint> + '_ {
        self.indices.iter().map(move |&index| FiducialPoint {
            index,
            kind: self.kind,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RiseParams {
    pub rel_height: f64,
    pub min_distance_ms: f64,
}

impl RiseParams {
    pub fn validate(&self) -> Result<(), PwvError> {
        if !(0.0..=1.0).contains(&self.rel_height) {
            return Err(PwvError::InvalidParameter(format!(
                "rel_height must lie in [0, 1], got {}",
                self.rel_height
            )));
        }
        positive("min_distance_ms", self.min_distance_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RefineParams {
    pub sigma_ms: f64,
    pub half_window_ms: f64,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            sigma_ms: 40.0,
            half_window_ms: 120.0,
        }
    }
}

impl RefineParams {
    pub fn validate(&self) -> Result<(), PwvError> {
        positive("sigma_ms", self.sigma_ms)?;
        positive("half_window_ms", self.half_window_ms)
    }
}

/// Valley detection runs on rise anchors, so it carries the rise settings too.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValleyParams {
    pub rise: RiseParams,
    pub gate_ms: f64,
    pub refine: Option<RefineParams>,
}

impl ValleyParams {
    pub fn validate(&self) -> Result<(), PwvError> {
        self.rise.validate()?;
        positive("gate_ms", self.gate_ms)?;
        match &self.refine {
            Some(refine) => refine.validate(),
            None => Ok(()),
        }
    }
}

pub(crate) fn positive(name: &str, value: f64) -> Result<(), PwvError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PwvError::InvalidParameter(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

/// Local maxima of the first derivative at or above
/// `min + rel_height * (max - min)`, thinned so no two survivors are closer
/// than the minimum distance (the taller one wins).
pub fn detect_rise_points(first: &Waveform, params: &RiseParams) -> FiducialSeries {
    let x = first.as_slice();
    let mut indices = Vec::new();
    if let Some((lo, hi)) = finite_range(x) {
        let height = lo + params.rel_height * (hi - lo);
        let candidates: Vec<usize> = local_maxima(x)
            .into_iter()
            .filter(|&i| x[i] >= height)
            .collect();
        let distance = ms_to_samples(params.min_distance_ms, first.fs());
        indices = suppress_by_distance(x, &candidates, distance);
    }
    FiducialSeries {
        kind: FiducialKind::Rise,
        indices,
    }
}

fn finite_range(x: &[f64]) -> Option<(f64, f64)> {
    let mut iter = x.iter().copied().filter(|v| v.is_finite());
    let first = iter.next()?;
    Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
}

/// Samples higher than their left neighbour whose level then drops; a flat
/// top counts once, at its middle sample. Endpoints never qualify.
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let last = x.len() - 1;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

fn suppress_by_distance(x: &[f64], peaks: &[usize], distance: usize) -> Vec<usize> {
    let mut keep = vec![true; peaks.len()];
    let mut by_height: Vec<usize> = (0..peaks.len()).collect();
    by_height.sort_by(|&a, &b| x[peaks[a]].total_cmp(&x[peaks[b]]));

    for &j in by_height.iter().rev() {
        if !keep[j] {
            continue;
        }
        let mut k = j;
        while k > 0 && peaks[j] - peaks[k - 1] < distance {
            keep[k - 1] = false;
            k -= 1;
        }
        let mut k = j + 1;
        while k < peaks.len() && peaks[k] - peaks[j] < distance {
            keep[k] = false;
            k += 1;
        }
    }

    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&p, kept)| kept.then_some(p))
        .collect()
}

/// For every rise anchor, the second-derivative minimum inside
/// `[anchor, anchor + gate)`. Anchors whose window is empty yield nothing.
pub fn detect_curvature_valleys(
    second: &Waveform,
    anchors: &[usize],
    gate_ms: f64,
) -> FiducialSeries {
    let sd = second.as_slice();
    let gate = ms_to_samples(gate_ms, second.fs());
    let indices = anchors
        .iter()
        .filter_map(|&a| {
            let end = sd.len().min(a.saturating_add(gate));
            if a >= end {
                return None;
            }
            argmin(&sd[a..end]).map(|offset| a + offset)
        })
        .collect();
    FiducialSeries {
        kind: FiducialKind::Valley,
        indices,
    }
}

/// Re-pick a valley as the arg-max of `-second` weighted by a Gaussian centred
/// on the search window. Windows of three samples or fewer keep the centre.
pub fn refine_valley(second: &Waveform, center: usize, params: &RefineParams) -> usize {
    let sd = second.as_slice();
    let fs = second.fs();
    let half = ms_to_samples(params.half_window_ms, fs);
    let start = center.saturating_sub(half);
    let end = sd.len().min(center.saturating_add(half));
    if end <= start || end - start <= 3 {
        return center;
    }
    let window = &sd[start..end];
    let sigma = (params.sigma_ms * fs / 1000.0).max(1.0);
    let mid = (window.len() as f64 - 1.0) / 2.0;
    let scores: Vec<f64> = window
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let z = (i as f64 - mid) / sigma;
            (-0.5 * z * z).exp() * -v
        })
        .collect();
    argmax(&scores).map_or(center, |offset| start + offset)
}

/// Refine every valley, then restore the strictly increasing order that
/// downstream pairing relies on.
pub fn refine_valleys(
    second: &Waveform,
    valleys: &FiducialSeries,
    params: &RefineParams,
) -> FiducialSeries {
    let mut indices: Vec<usize> = valleys
        .indices
        .iter()
        .map(|&c| refine_valley(second, c, params))
        .collect();
    indices.sort_unstable();
    indices.dedup();
    FiducialSeries {
        kind: FiducialKind::Valley,
        indices,
    }
}

/// Rise anchors at or after `settle`, then their gated (and optionally
/// refined) valleys. `settle` is the filter warm-up of the input; anchors
/// inside it come from the start-up transient, not from a beat.
pub fn detect_valleys(
    first: &Waveform,
    second: &Waveform,
    params: &ValleyParams,
    settle: usize,
) -> (FiducialSeries, FiducialSeries) {
    let rises = detect_rise_points(first, &params.rise).skip_before(settle);
    let coarse = detect_curvature_valleys(second, &rises.indices, params.gate_ms);
    let valleys = match &params.refine {
        Some(refine) => refine_valleys(second, &coarse, refine),
        None => coarse,
    };
    (rises, valleys)
}

/// First index of the smallest value; NaN never wins.
fn argmin(x: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in x.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| v < b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

fn argmax(x: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in x.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wave(samples: Vec<f64>, fs: f64) -> Waveform {
        Waveform::new(samples, fs).unwrap()
    }

    #[test]
    fn test_local_maxima_plateau_and_edges() {
        let x = [5.0, 1.0, 3.0, 3.0, 3.0, 1.0, 2.0, 4.0];
        // Index 0 and the rising tail are endpoints; the plateau resolves to its middle.
        assert_eq!(local_maxima(&x), vec![3]);
        // A plateau that keeps rising is not a peak.
        assert!(local_maxima(&[0.0, 1.0, 1.0, 2.0, 0.0]) == vec![3]);
    }

    #[test]
    fn test_rise_points_threshold_and_distance() {
        let mut x = vec![0.0; 100];
        x[10] = 1.0;
        x[14] = 0.8; // too close to 10, suppressed
        x[40] = 0.2; // below threshold
        x[70] = 0.9;
        let first = wave(x, 100.0);
        let params = RiseParams {
            rel_height: 0.35,
            min_distance_ms: 100.0,
        };
        let rises = detect_rise_points(&first, &params);
        assert_eq!(rises.kind, FiducialKind::Rise);
        assert_eq!(rises.indices, vec![10, 70]);
    }

    #[test]
    fn test_taller_later_peak_suppresses_earlier() {
        let mut x = vec![0.0; 50];
        x[10] = 0.9;
        x[15] = 1.0;
        let rises = detect_rise_points(
            &wave(x, 1000.0),
            &RiseParams {
                rel_height: 0.1,
                min_distance_ms: 10.0,
            },
        );
        assert_eq!(rises.indices, vec![15]);
    }

    #[test]
    fn test_rise_points_on_empty_or_flat_signal() {
        let params = RiseParams {
            rel_height: 0.4,
            min_distance_ms: 280.0,
        };
        assert!(detect_rise_points(&wave(vec![], 100.0), &params).is_empty());
        assert!(detect_rise_points(&wave(vec![1.0; 20], 100.0), &params).is_empty());
    }

    #[test]
    fn test_valley_gate_and_first_tie() {
        let mut sd = vec![0.0; 30];
        sd[5] = -2.0;
        sd[7] = -2.0;
        sd[12] = -5.0; // outside a 10-sample gate from anchor 2
        let second = wave(sd, 1000.0);
        let valleys = detect_curvature_valleys(&second, &[2, 29, 40], 10.0);
        // Anchor 29 keeps a one-sample window, anchor 40 is past the end.
        assert_eq!(valleys.indices, vec![5, 29]);
        assert_eq!(valleys.kind, FiducialKind::Valley);
    }

    #[test]
    fn test_valleys_ignore_anchors_in_filter_warmup() {
        let mut fd = vec![0.0; 100];
        fd[5] = 1.0; // start-up transient
        fd[60] = 1.0;
        let mut sd = vec![0.0; 100];
        sd[8] = -1.0;
        sd[65] = -1.0;
        let (first, second) = (wave(fd, 1000.0), wave(sd, 1000.0));
        let params = ValleyParams {
            rise: RiseParams {
                rel_height: 0.35,
                min_distance_ms: 10.0,
            },
            gate_ms: 20.0,
            refine: None,
        };

        let (rises, valleys) = detect_valleys(&first, &second, &params, 0);
        assert_eq!(rises.indices, vec![5, 60]);
        assert_eq!(valleys.indices, vec![8, 65]);

        let (rises, valleys) = detect_valleys(&first, &second, &params, 20);
        assert_eq!(rises.indices, vec![60]);
        let points: Vec<FiducialPoint> = valleys.points().collect();
        assert_eq!(
            points,
            vec![FiducialPoint {
                index: 65,
                kind: FiducialKind::Valley
            }]
        );
        assert_eq!(points[0].kind.label(), "valley");
    }

    #[test]
    fn test_refine_prefers_centre_when_ambiguous() {
        let mut sd = vec![0.0; 101];
        sd[20] = -1.0;
        sd[50] = -1.0;
        sd[80] = -1.0;
        let second = wave(sd, 1000.0);
        let params = RefineParams {
            sigma_ms: 10.0,
            half_window_ms: 50.0,
        };
        assert_eq!(refine_valley(&second, 50, &params), 50);
    }

    #[test]
    fn test_refine_tiny_window_keeps_centre() {
        let second = wave(vec![0.0, -1.0, -3.0], 1000.0);
        let params = RefineParams {
            sigma_ms: 40.0,
            half_window_ms: 120.0,
        };
        assert_eq!(refine_valley(&second, 0, &params), 0);
    }

    #[test]
    fn test_refined_valleys_stay_strictly_increasing() {
        let mut sd = vec![0.0; 200];
        sd[100] = -10.0;
        sd[150] = -1.0;
        let second = wave(sd, 1000.0);
        let coarse = FiducialSeries {
            kind: FiducialKind::Valley,
            indices: vec![90, 95, 150],
        };
        let params = RefineParams {
            sigma_ms: 40.0,
            half_window_ms: 20.0,
        };
        let refined = refine_valleys(&second, &coarse, &params);
        assert_eq!(refined.indices, vec![100, 150]);
        assert!(refined.indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_params_validation() {
        let bad = RiseParams {
            rel_height: 1.5,
            min_distance_ms: 300.0,
        };
        assert!(bad.validate().is_err());
        let valley = ValleyParams {
            rise: RiseParams {
                rel_height: 0.35,
                min_distance_ms: 300.0,
            },
            gate_ms: 0.0,
            refine: None,
        };
        assert!(valley.validate().is_err());
    }
}

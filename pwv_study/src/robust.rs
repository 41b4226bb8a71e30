//! Robust reduction of per-beat lags: median, MAD outlier rejection and a
//! kernel density mode.

use std::collections::BTreeSet;

use ordered_float::OrderedFloat;
use serde::Serialize;

const MAD_SCALE: f64 = 1.4826;
const MAD_EPS: f64 = 1e-12;
const KDE_GRID: usize = 256;
pub const DEFAULT_MAD_THRESHOLD: f64 = 3.5;

/// Median of the finite values; the two middle values are averaged for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<OrderedFloat<f64>> = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .map(OrderedFloat)
        .collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable();
    let n = sorted.len();
    let mid = n / 2;
    Some(if n % 2 == 1 {
        sorted[mid].0
    } else {
        0.5 * (sorted[mid - 1].0 + sorted[mid].0)
    })
}

/// Keep-mask for values within `threshold` scaled MADs of the median.
/// Non-finite values are never kept.
pub fn mad_filter(values: &[f64], threshold: f64) -> Vec<bool> {
    let Some(med) = median(values) else {
        return vec![false; values.len()];
    };
    let deviations: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - med).abs())
        .collect();
    let mad = median(&deviations).unwrap_or(0.0);
    let scale = MAD_SCALE * (mad + MAD_EPS);
    values
        .iter()
        .map(|&v| v.is_finite() && (v - med).abs() / scale < threshold)
        .collect()
}

/// Peak of a Gaussian KDE (Scott bandwidth) sampled on a 256-point grid
/// spanning the data. Falls back to the median with fewer than three distinct
/// values or a degenerate bandwidth.
pub fn kde_mode(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let distinct: BTreeSet<OrderedFloat<f64>> = finite.iter().copied().map(OrderedFloat).collect();
    let Some(bandwidth) = scott_bandwidth(&finite).filter(|_| distinct.len() >= 3) else {
        return median(&finite);
    };

    let lo = distinct.first().map(|v| v.0)?;
    let hi = distinct.last().map(|v| v.0)?;
    let step = (hi - lo) / (KDE_GRID - 1) as f64;
    let mut best = (lo, f64::NEG_INFINITY);
    for g in 0..KDE_GRID {
        let x = lo + step * g as f64;
        let density: f64 = finite
            .iter()
            .map(|&v| {
                let z = (x - v) / bandwidth;
                (-0.5 * z * z).exp()
            })
            .sum();
        if density > best.1 {
            best = (x, density);
        }
    }
    Some(best.0)
}

fn scott_bandwidth(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let bw = var.sqrt() * (n as f64).powf(-0.2);
    (bw.is_finite() && bw > 0.0).then_some(bw)
}

/// Lag statistics for one set of paired fiducials.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct LagSummary {
    pub lag_median: Option<f64>,
    pub lag_median_robust: Option<f64>,
    pub lag_mode: Option<f64>,
    pub n_pairs: usize,
    pub n_pairs_robust: usize,
}

impl LagSummary {
    /// Robust median when any lag survived the filter, otherwise the raw median.
    pub fn preferred_lag(&self) -> Option<f64> {
        self.lag_median_robust.or(self.lag_median)
    }
}

/// Raw median, MAD-filtered median and density mode of the same lag set.
/// The mode is computed over the unfiltered lags.
pub fn reduce_lags(lags: &[f64], threshold: f64) -> LagSummary {
    let keep = mad_filter(lags, threshold);
    let robust_lags: Vec<f64> = lags
        .iter()
        .zip(&keep)
        .filter_map(|(&l, &k)| k.then_some(l))
        .collect();
    LagSummary {
        lag_median: median(lags),
        lag_median_robust: median(&robust_lags),
        lag_mode: kde_mode(lags),
        n_pairs: lags.len(),
        n_pairs_robust: robust_lags.len(),
    }
}

/// Mean of the defined entries.
pub fn mean_defined(values: &[Option<f64>]) -> Option<f64> {
    let defined: Vec<f64> = values
        .iter()
        .flatten()
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    if defined.is_empty() {
        return None;
    }
    Some(defined.iter().sum::<f64>() / defined.len() as f64)
}

/// Median of the defined entries.
pub fn median_defined(values: &[Option<f64>]) -> Option<f64> {
    let defined: Vec<f64> = values.iter().flatten().copied().collect();
    median(&defined)
}

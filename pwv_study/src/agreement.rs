//! Bland-Altman agreement between estimated and reference values.

use serde::Serialize;

const LOA_Z: f64 = 1.96;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BlandAltman {
    pub n: usize,
    /// Mean of `estimate - reference`.
    pub bias: f64,
    /// Sample standard deviation of the differences (0 for a single pair).
    pub sd: f64,
    pub lower_loa: f64,
    pub upper_loa: f64,
}

/// Agreement statistics over `(estimate, reference)` pairs. Pairs with an
/// undefined or non-finite member are skipped; `None` when nothing is left.
pub fn bland_altman(pairs: &[(Option<f64>, Option<f64>)]) -> Option<BlandAltman> {
    let diffs: Vec<f64> = pairs
        .iter()
        .filter_map(|&(est, reference)| match (est, reference) {
            (Some(e), Some(r)) if e.is_finite() && r.is_finite() => Some(e - r),
            _ => None,
        })
        .collect();
    let n = diffs.len();
    if n == 0 {
        return None;
    }
    let bias = diffs.iter().sum::<f64>() / n as f64;
    let sd = if n > 1 {
        (diffs.iter().map(|d| (d - bias).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    } else {
        0.0
    };
    Some(BlandAltman {
        n,
        bias,
        sd,
        lower_loa: bias - LOA_Z * sd,
        upper_loa: bias + LOA_Z * sd,
    })
}

/// Means and differences for plotting, with the same skipping rule.
pub fn bland_altman_points(pairs: &[(Option<f64>, Option<f64>)]) -> Vec<(f64, f64)> {
    pairs
        .iter()
        .filter_map(|&(est, reference)| match (est, reference) {
            (Some(e), Some(r)) if e.is_finite() && r.is_finite() => {
                Some((0.5 * (e + r), e - r))
            }
            _ => None,
        })
        .collect()
}

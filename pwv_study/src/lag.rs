//! Causal pairing of proximal and distal fiducials, and lag-to-velocity conversion.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct FiducialPair {
    pub proximal: usize,
    pub distal: usize,
    pub lag_s: f64,
}

/// One forward pass over both increasing sequences. Each proximal index is
/// matched to the first unused distal index at or after it; the pass stops
/// when the distal side runs out. Distal indices are used at most once and
/// every lag is non-negative.
pub fn pair_fiducials(proximal: &[usize], distal: &[usize], fs: f64) -> Vec<FiducialPair> {
    let mut pairs = Vec::with_capacity(proximal.len().min(distal.len()));
    let mut cursor = 0;
    for &p in proximal {
        while cursor < distal.len() && distal[cursor] < p {
            cursor += 1;
        }
        let Some(&d) = distal.get(cursor) else {
            break;
        };
        pairs.push(FiducialPair {
            proximal: p,
            distal: d,
            lag_s: (d - p) as f64 / fs,
        });
        cursor += 1;
    }
    pairs
}

/// `distance / lag`, defined only for a finite positive lag and distance.
pub fn velocity_from_lag(distance_m: f64, lag_s: Option<f64>) -> Option<f64> {
    let lag = lag_s?;
    if !lag.is_finite() || lag <= 0.0 || !distance_m.is_finite() || distance_m <= 0.0 {
        return None;
    }
    Some(distance_m / lag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pairing_example() {
        let pairs = pair_fiducials(&[100, 500, 900], &[180, 560, 995], 1000.0);
        let lags: Vec<f64> = pairs.iter().map(|p| p.lag_s).collect();
        assert_eq!(pairs.len(), 3);
        assert_relative_eq!(lags[0], 0.08);
        assert_relative_eq!(lags[1], 0.06);
        assert_relative_eq!(lags[2], 0.095);
    }

    #[test]
    fn test_pairing_is_causal_and_unique() {
        let proximal = [10, 20, 30, 400, 410, 800];
        let distal = [5, 25, 26, 405, 900];
        let pairs = pair_fiducials(&proximal, &distal, 100.0);
        assert!(pairs.len() <= proximal.len().min(distal.len()));
        let mut used: Vec<usize> = pairs.iter().map(|p| p.distal).collect();
        for pair in &pairs {
            assert!(pair.distal >= pair.proximal);
            assert!(pair.lag_s >= 0.0);
        }
        let n = used.len();
        used.dedup();
        assert_eq!(used.len(), n);
        assert_eq!(
            pairs.iter().map(|p| (p.proximal, p.distal)).collect::<Vec<_>>(),
            // 30 takes 405, which leaves 400 with 900 and nothing for 410 or 800.
            vec![(10, 25), (20, 26), (30, 405), (400, 900)]
        );
    }

    #[test]
    fn test_pairing_empty_inputs() {
        assert!(pair_fiducials(&[], &[1, 2], 100.0).is_empty());
        assert!(pair_fiducials(&[1, 2], &[], 100.0).is_empty());
        // Distal events all precede the proximal ones.
        assert!(pair_fiducials(&[50], &[10, 20], 100.0).is_empty());
    }

    #[test]
    fn test_velocity_edge_cases() {
        assert_relative_eq!(velocity_from_lag(0.8, Some(0.08)).unwrap(), 10.0, epsilon = 1e-9);
        assert_eq!(velocity_from_lag(0.8, Some(-0.01)), None);
        assert_eq!(velocity_from_lag(0.8, Some(0.0)), None);
        assert_eq!(velocity_from_lag(0.8, None), None);
        assert_eq!(velocity_from_lag(0.8, Some(f64::NAN)), None);
        assert_eq!(velocity_from_lag(0.0, Some(0.08)), None);
    }
}

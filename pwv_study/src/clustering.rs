//! Seeded k-means over beat feature vectors and majority-cluster selection.
//!
//! Every call builds its own RNG from the seed it is given, so results are
//! reproducible no matter how many selections run in parallel.

use ndarray::{Array2, ArrayView1, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::fiducials::positive;
use crate::{BeatFeatures, PwvError};

const MAX_ITER: usize = 300;
const REL_TOL: f64 = 1e-4;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterParams {
    pub k: usize,
    pub seed: u64,
    pub n_init: usize,
    /// Feature window width around each rise anchor.
    pub win_ms: f64,
    /// How close a valley must be to a stable anchor to be kept.
    pub proximity_ms: f64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            k: 2,
            seed: 0,
            n_init: 10,
            win_ms: 300.0,
            proximity_ms: 150.0,
        }
    }
}

impl ClusterParams {
    pub fn validate(&self) -> Result<(), PwvError> {
        if self.k == 0 {
            return Err(PwvError::InvalidParameter("k must be at least 1".into()));
        }
        if self.n_init == 0 {
            return Err(PwvError::InvalidParameter(
                "n_init must be at least 1".into(),
            ));
        }
        positive("win_ms", self.win_ms)?;
        positive("proximity_ms", self.proximity_ms)
    }
}

#[derive(Clone, Debug)]
pub struct KMeansFit {
    pub labels: Vec<usize>,
    pub centroids: Array2<f64>,
    pub inertia: f64,
}

impl KMeansFit {
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.centroids.nrows()];
        for &label in &self.labels {
            sizes[label] += 1;
        }
        sizes
    }

    /// Largest cluster; the lowest label wins a tie.
    pub fn majority_label(&self) -> Option<usize> {
        let sizes = self.cluster_sizes();
        let mut best: Option<(usize, usize)> = None;
        for (label, &size) in sizes.iter().enumerate() {
            if best.map_or(true, |(_, s)| size > s) {
                best = Some((label, size));
            }
        }
        best.map(|(label, _)| label)
    }
}

/// Lloyd's k-means with k-means++ seeding and `n_init` restarts; the restart
/// with the lowest inertia wins. `k` is clamped to the number of rows.
pub fn kmeans(data: &Array2<f64>, k: usize, n_init: usize, seed: u64) -> Option<KMeansFit> {
    let n = data.nrows();
    if n == 0 || k == 0 {
        return None;
    }
    let k = k.min(n);
    let tol = REL_TOL * mean_feature_variance(data);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut best: Option<KMeansFit> = None;
    for _ in 0..n_init.max(1) {
        let fit = lloyd(data, init_plus_plus(data, k, &mut rng), tol);
        if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
            best = Some(fit);
        }
    }
    best
}

/// Anchors of the majority cluster in their original order. Zero feature
/// rows give an empty selection for any `k`.
pub fn select_stable_beats(
    features: &BeatFeatures,
    k: usize,
    n_init: usize,
    seed: u64,
) -> Vec<usize> {
    let Some(fit) = kmeans(&features.matrix, k, n_init, seed) else {
        return Vec::new();
    };
    let Some(majority) = fit.majority_label() else {
        return Vec::new();
    };
    features
        .anchors
        .iter()
        .zip(&fit.labels)
        .filter_map(|(&anchor, &label)| (label == majority).then_some(anchor))
        .collect()
}

fn mean_feature_variance(data: &Array2<f64>) -> f64 {
    if data.nrows() == 0 || data.ncols() == 0 {
        return 0.0;
    }
    data.var_axis(Axis(0), 0.0).mean().unwrap_or(0.0)
}

fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn init_plus_plus(data: &Array2<f64>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let n = data.nrows();
    let mut centroids = Array2::zeros((k, data.ncols()));
    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));

    let mut closest: Vec<f64> = data
        .rows()
        .into_iter()
        .map(|row| sq_dist(row, centroids.row(0)))
        .collect();

    for c in 1..k {
        let total: f64 = closest.iter().sum();
        let pick = if total > 0.0 && total.is_finite() {
            let target = rng.gen::<f64>() * total;
            let mut acc = 0.0;
            let mut chosen = n - 1;
            for (i, d) in closest.iter().enumerate() {
                acc += d;
                if acc > target {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            rng.gen_range(0..n)
        };
        centroids.row_mut(c).assign(&data.row(pick));
        for (i, row) in data.rows().into_iter().enumerate() {
            let d = sq_dist(row, centroids.row(c));
            if d < closest[i] {
                closest[i] = d;
            }
        }
    }
    centroids
}

fn assign(data: &Array2<f64>, centroids: &Array2<f64>) -> (Vec<usize>, Vec<f64>) {
    let mut labels = Vec::with_capacity(data.nrows());
    let mut dists = Vec::with_capacity(data.nrows());
    for row in data.rows() {
        let mut best = (0usize, f64::INFINITY);
        for (c, centroid) in centroids.rows().into_iter().enumerate() {
            let d = sq_dist(row, centroid);
            if d < best.1 {
                best = (c, d);
            }
        }
        labels.push(best.0);
        dists.push(best.1);
    }
    (labels, dists)
}

fn lloyd(data: &Array2<f64>, mut centroids: Array2<f64>, tol: f64) -> KMeansFit {
    let k = centroids.nrows();
    let (mut labels, mut dists) = assign(data, &centroids);

    for _ in 0..MAX_ITER {
        let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
        let mut counts = vec![0usize; k];
        for (row, &label) in data.rows().into_iter().zip(&labels) {
            let mut target = sums.row_mut(label);
            target += &row;
            counts[label] += 1;
        }

        let mut updated = centroids.clone();
        for c in 0..k {
            if counts[c] > 0 {
                let mean = sums.row(c).mapv(|v| v / counts[c] as f64);
                updated.row_mut(c).assign(&mean);
            } else {
                // Empty cluster: move it onto the point worst served by its centre.
                let far = dists
                    .iter()
                    .enumerate()
                    .fold((0usize, f64::NEG_INFINITY), |acc, (i, &d)| {
                        if d > acc.1 {
                            (i, d)
                        } else {
                            acc
                        }
                    })
                    .0;
                updated.row_mut(c).assign(&data.row(far));
                dists[far] = 0.0;
            }
        }

        let shift: f64 = updated
            .rows()
            .into_iter()
            .zip(centroids.rows())
            .map(|(a, b)| sq_dist(a, b))
            .sum();
        centroids = updated;
        let (next_labels, next_dists) = assign(data, &centroids);
        let stable = next_labels == labels;
        labels = next_labels;
        dists = next_dists;
        if stable || shift <= tol {
            break;
        }
    }

    KMeansFit {
        inertia: dists.iter().sum(),
        labels,
        centroids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn features(matrix: Array2<f64>, anchors: Vec<usize>) -> BeatFeatures {
        BeatFeatures { matrix, anchors }
    }

    #[test]
    fn test_empty_features_select_nothing() {
        let empty = features(Array2::zeros((0, 4)), Vec::new());
        for k in [0, 1, 2, 7] {
            assert!(select_stable_beats(&empty, k, 10, 0).is_empty());
        }
    }

    #[test]
    fn test_majority_cluster_is_returned_in_order() {
        let matrix = array![
            [1.0, 0.10, -0.02, 300.0],
            [5.0, 0.90, -0.30, 300.0],
            [1.1, 0.11, -0.02, 300.0],
            [0.9, 0.09, -0.01, 300.0],
            [5.2, 0.95, -0.35, 300.0],
            [1.0, 0.10, -0.03, 300.0],
        ];
        let anchors = vec![100, 900, 1700, 2500, 3300, 4100];
        let stable = select_stable_beats(&features(matrix, anchors), 2, 10, 0);
        assert_eq!(stable, vec![100, 1700, 2500, 4100]);
    }

    #[test]
    fn test_k_is_clamped_to_row_count() {
        let matrix = array![[1.0, 0.0, 0.0, 10.0], [2.0, 0.0, 0.0, 10.0]];
        let fit = kmeans(&matrix, 5, 3, 42).unwrap();
        assert_eq!(fit.centroids.nrows(), 2);
        assert_eq!(fit.labels.len(), 2);
        assert!(fit.inertia.abs() < 1e-12);
    }

    #[test]
    fn test_same_seed_same_labels() {
        let matrix = array![
            [0.0, 0.0, 0.0, 1.0],
            [0.1, 0.0, 0.0, 1.0],
            [3.0, 1.0, 0.0, 1.0],
            [3.1, 1.0, 0.0, 1.0],
            [6.0, 2.0, 0.0, 1.0],
        ];
        let a = kmeans(&matrix, 3, 4, 7).unwrap();
        let b = kmeans(&matrix, 3, 4, 7).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.inertia.to_bits(), b.inertia.to_bits());
    }

    #[test]
    fn test_identical_rows_form_one_cluster() {
        let matrix = Array2::from_elem((4, 4), 1.0);
        let fit = kmeans(&matrix, 2, 2, 0).unwrap();
        assert!(fit.inertia.abs() < 1e-12);
        let anchors = vec![1, 2, 3, 4];
        let stable = select_stable_beats(&features(matrix, anchors), 2, 2, 0);
        assert!(!stable.is_empty());
    }

    #[test]
    fn test_params_validation() {
        assert!(ClusterParams::default().validate().is_ok());
        let bad = ClusterParams {
            k: 0,
            ..ClusterParams::default()
        };
        assert!(bad.validate().is_err());
    }
}

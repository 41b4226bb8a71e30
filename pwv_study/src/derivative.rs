//! Finite-difference derivatives scaled to per-second units.

use crate::Waveform;

/// First and second derivative of one filtered channel.
#[derive(Clone, Debug)]
pub struct Derivatives {
    pub first: Waveform,
    pub second: Waveform,
}

impl Derivatives {
    pub fn of(waveform: &Waveform) -> Self {
        let first = first_derivative(waveform);
        let second = first_derivative(&first);
        Self { first, second }
    }
}

/// Central differences in the interior, one-sided differences at both ends.
/// Inputs shorter than two samples have a zero gradient.
pub(crate) fn gradient(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mut out = Vec::with_capacity(n);
    out.push(x[1] - x[0]);
    for i in 1..n - 1 {
        out.push((x[i + 1] - x[i - 1]) / 2.0);
    }
    out.push(x[n - 1] - x[n - 2]);
    out
}

pub fn first_derivative(waveform: &Waveform) -> Waveform {
    let fs = waveform.fs();
    let grad = gradient(waveform.as_slice())
        .into_iter()
        .map(|g| g * fs)
        .collect();
    waveform.with_samples(grad)
}

pub fn second_derivative(waveform: &Waveform) -> Waveform {
    first_derivative(&first_derivative(waveform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gradient_edges_are_one_sided() {
        let g = gradient(&[1.0, 2.0, 4.0, 7.0]);
        assert_eq!(g, vec![1.0, 1.5, 2.5, 3.0]);
        assert_eq!(gradient(&[3.0]), vec![0.0]);
        assert!(gradient(&[]).is_empty());
    }

    #[test]
    fn test_derivatives_of_quadratic() {
        let fs = 100.0;
        let samples: Vec<f64> = (0..50).map(|i| (i as f64 / fs).powi(2)).collect();
        let w = Waveform::new(samples, fs).unwrap();
        let d = Derivatives::of(&w);
        // d/dt t^2 = 2t, d2/dt2 = 2 away from the boundaries.
        assert_relative_eq!(d.first.as_slice()[20], 0.4, epsilon = 1e-9);
        assert_relative_eq!(d.second.as_slice()[25], 2.0, epsilon = 1e-6);
        assert_eq!(second_derivative(&w), d.second);
    }
}

//! Signal quality diagnostics. These are reported next to pipeline results and
//! never feed back into the estimate.

use num_complex::Complex64;
use rustfft::FftPlanner;
use serde::Serialize;

use crate::{ms_to_samples, Waveform};

const MAX_SEGMENT: usize = 2048;
const MIN_SAMPLES: usize = 4;
const PSD_FLOOR: f64 = 1e-18;
const CARDIAC_BAND_HZ: (f64, f64) = (0.5, 5.0);

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
pub struct QualityIndices {
    /// Cardiac-band power over the power outside it.
    pub snr_proxy: f64,
    /// Shannon entropy (nats) of the normalised power spectrum.
    pub spectral_entropy: f64,
}

/// One-sided Welch PSD: periodic Hann window, half-overlapping segments of at
/// most 2048 samples, mean removed per segment, density scaling.
pub fn welch_psd(x: &[f64], fs: f64) -> (Vec<f64>, Vec<f64>) {
    let n = x.len();
    let seg = n.min(MAX_SEGMENT);
    if seg == 0 {
        return (Vec::new(), Vec::new());
    }
    let step = seg - seg / 2;
    let segments = (n - seg) / step + 1;
    let window: Vec<f64> = (0..seg)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / seg as f64).cos())
        .collect();
    let window_power: f64 = window.iter().map(|w| w * w).sum();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(seg);
    let bins = seg / 2 + 1;
    let mut acc = vec![0.0; bins];
    let mut buf = vec![Complex64::new(0.0, 0.0); seg];
    for s in 0..segments {
        let chunk = &x[s * step..s * step + seg];
        let mean = chunk.iter().sum::<f64>() / seg as f64;
        for ((slot, &v), &w) in buf.iter_mut().zip(chunk).zip(&window) {
            *slot = Complex64::new((v - mean) * w, 0.0);
        }
        fft.process(&mut buf);
        for (a, c) in acc.iter_mut().zip(&buf) {
            *a += c.norm_sqr();
        }
    }

    let scale = 1.0 / (fs * window_power * segments as f64);
    let last = bins - 1;
    let psd = acc
        .iter()
        .enumerate()
        .map(|(k, &p)| {
            // DC and (for even lengths) Nyquist have no mirrored negative bin.
            let one_sided = if k == 0 || (seg % 2 == 0 && k == last) {
                1.0
            } else {
                2.0
            };
            p * scale * one_sided
        })
        .collect();
    let freqs = (0..bins).map(|k| k as f64 * fs / seg as f64).collect();
    (freqs, psd)
}

fn trapezoid(y: &[f64], x: &[f64]) -> f64 {
    y.windows(2)
        .zip(x.windows(2))
        .map(|(yy, xx)| 0.5 * (yy[0] + yy[1]) * (xx[1] - xx[0]))
        .sum()
}

pub fn signal_quality_indices(waveform: &Waveform) -> Option<QualityIndices> {
    let x = waveform.as_slice();
    if x.len() < MIN_SAMPLES || x.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let (freqs, mut psd) = welch_psd(x, waveform.fs());
    psd.iter_mut().for_each(|p| *p += PSD_FLOOR);

    let (lo, hi) = CARDIAC_BAND_HZ;
    let band: Vec<usize> = (0..freqs.len())
        .filter(|&k| freqs[k] >= lo && freqs[k] <= hi)
        .collect();
    let band_power = match (band.first(), band.last()) {
        (Some(&a), Some(&b)) => trapezoid(&psd[a..=b], &freqs[a..=b]),
        _ => 0.0,
    };
    let total = trapezoid(&psd, &freqs);
    let rest = (total - band_power).max(PSD_FLOOR);

    let sum: f64 = psd.iter().sum();
    let spectral_entropy = -psd
        .iter()
        .map(|p| {
            let q = p / sum;
            q * (q + PSD_FLOOR).ln()
        })
        .sum::<f64>();

    Some(QualityIndices {
        snr_proxy: band_power / rest,
        spectral_entropy,
    })
}

/// Fraction of rise anchors with at least one valley in `[anchor, anchor + gate)`.
/// Undefined without anchors.
pub fn gate_hit_ratio(valleys: &[usize], anchors: &[usize], fs: f64, gate_ms: f64) -> Option<f64> {
    if anchors.is_empty() {
        return None;
    }
    let gate = ms_to_samples(gate_ms, fs);
    let hits = anchors
        .iter()
        .filter(|&&a| {
            let end = a.saturating_add(gate);
            valleys.iter().any(|&v| v >= a && v < end)
        })
        .count();
    Some(hits as f64 / anchors.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn sine(freq: f64, fs: f64, seconds: f64) -> Waveform {
        let n = (fs * seconds) as usize;
        let samples = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin())
            .collect();
        Waveform::new(samples, fs).unwrap()
    }

    fn white_noise(fs: f64, n: usize, seed: u64) -> Waveform {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let samples = (0..n).map(|_| normal.sample(&mut rng)).collect();
        Waveform::new(samples, fs).unwrap()
    }

    #[test]
    fn test_sine_in_band_beats_white_noise() {
        let clean = signal_quality_indices(&sine(1.25, 100.0, 40.0)).unwrap();
        let noise = signal_quality_indices(&white_noise(100.0, 4000, 3)).unwrap();
        assert!(clean.snr_proxy > 10.0, "clean {:?}", clean);
        assert!(noise.snr_proxy < 0.5, "noise {:?}", noise);
        assert!(noise.spectral_entropy > clean.spectral_entropy);
    }

    #[test]
    fn test_welch_parseval_for_white_noise() {
        let w = white_noise(200.0, 8192, 11);
        let (freqs, psd) = welch_psd(w.as_slice(), w.fs());
        assert_eq!(freqs.len(), MAX_SEGMENT / 2 + 1);
        assert!((freqs[1] - 200.0 / MAX_SEGMENT as f64).abs() < 1e-12);
        // Integrated density recovers the unit variance.
        let power = trapezoid(&psd, &freqs);
        assert!((power - 1.0).abs() < 0.1, "power {power}");
    }

    #[test]
    fn test_too_short_is_undefined() {
        let w = Waveform::new(vec![1.0, 2.0], 100.0).unwrap();
        assert!(signal_quality_indices(&w).is_none());
    }

    #[test]
    fn test_gate_hit_ratio() {
        // gate 100 ms at 100 Hz = 10 samples.
        let ratio = gate_hit_ratio(&[105, 230, 400], &[100, 200, 300, 395], 100.0, 100.0).unwrap();
        assert!((ratio - 0.5).abs() < 1e-12);
        assert_eq!(gate_hit_ratio(&[1, 2], &[], 100.0, 100.0), None);
    }
}

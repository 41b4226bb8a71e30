//! The four estimation strategies built from the shared stages, their
//! catalogue entries and the per-run result types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::clustering::{select_stable_beats, ClusterParams};
use crate::derivative::Derivatives;
use crate::features::beat_features;
use crate::fiducials::{detect_rise_points, detect_valleys, positive, RefineParams, RiseParams};
use crate::fiducials::{FiducialSeries, ValleyParams};
use crate::lag::{pair_fiducials, velocity_from_lag, FiducialPair};
use crate::preprocess::{lowpass_fir, FilterParams};
use crate::robust::{median, reduce_lags, LagSummary};
use crate::{PwvError, Waveform};

const FS_TOLERANCE: f64 = 1e-9;

/// Settings shared by every pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    pub filter: FilterParams,
    /// MAD outlier threshold applied to per-beat lags.
    pub mad_threshold: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            filter: FilterParams::default(),
            mad_threshold: 3.0,
        }
    }
}

impl Params {
    pub fn validate(&self, fs: f64) -> Result<(), PwvError> {
        self.filter.validate(fs)?;
        positive("mad_threshold", self.mad_threshold)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineKind {
    WindowAligned,
    FeatureLag,
    HybridMedian,
    ClusterGuided,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::WindowAligned,
        PipelineKind::FeatureLag,
        PipelineKind::HybridMedian,
        PipelineKind::ClusterGuided,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PipelineKind::WindowAligned => "WindowAligned",
            PipelineKind::FeatureLag => "FeatureLag",
            PipelineKind::HybridMedian => "HybridMedian",
            PipelineKind::ClusterGuided => "ClusterGuided",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "id", content = "params")]
pub enum PipelineConfig {
    #[serde(rename = "pwv.window_aligned.v1")]
    WindowAligned(ValleyParams),
    #[serde(rename = "pwv.feature_lag.v1")]
    FeatureLag(RiseParams),
    #[serde(rename = "pwv.hybrid_median.v1")]
    HybridMedian {
        window: ValleyParams,
        feature: RiseParams,
    },
    #[serde(rename = "pwv.cluster_guided.v1")]
    ClusterGuided {
        valley: ValleyParams,
        cluster: ClusterParams,
    },
}

fn default_valley_params() -> ValleyParams {
    ValleyParams {
        rise: RiseParams {
            rel_height: 0.35,
            min_distance_ms: 300.0,
        },
        gate_ms: 180.0,
        refine: Some(RefineParams::default()),
    }
}

fn default_rise_params() -> RiseParams {
    RiseParams {
        rel_height: 0.40,
        min_distance_ms: 280.0,
    }
}

impl PipelineConfig {
    pub fn id(&self) -> &'static str {
        match self {
            PipelineConfig::WindowAligned(_) => "pwv.window_aligned.v1",
            PipelineConfig::FeatureLag(_) => "pwv.feature_lag.v1",
            PipelineConfig::HybridMedian { .. } => "pwv.hybrid_median.v1",
            PipelineConfig::ClusterGuided { .. } => "pwv.cluster_guided.v1",
        }
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            PipelineConfig::WindowAligned(_) => PipelineKind::WindowAligned,
            PipelineConfig::FeatureLag(_) => PipelineKind::FeatureLag,
            PipelineConfig::HybridMedian { .. } => PipelineKind::HybridMedian,
            PipelineConfig::ClusterGuided { .. } => PipelineKind::ClusterGuided,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineConfig::WindowAligned(_) => "Window-aligned curvature valleys",
            PipelineConfig::FeatureLag(_) => "Upstroke feature lag",
            PipelineConfig::HybridMedian { .. } => "Hybrid median consensus",
            PipelineConfig::ClusterGuided { .. } => "Cluster-guided valleys",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PipelineConfig::WindowAligned(_) => {
                "Second-derivative valley gated after each upstroke, Gaussian-refined, paired causally."
            }
            PipelineConfig::FeatureLag(_) => "Pair first-derivative upstroke peaks directly.",
            PipelineConfig::HybridMedian { .. } => {
                "Median of the robust medians and density modes of WindowAligned and FeatureLag."
            }
            PipelineConfig::ClusterGuided { .. } => {
                "WindowAligned valleys restricted to beats in the majority k-means morphology cluster."
            }
        }
    }

    pub fn default_for_kind(kind: PipelineKind) -> Self {
        match kind {
            PipelineKind::WindowAligned => PipelineConfig::WindowAligned(default_valley_params()),
            PipelineKind::FeatureLag => PipelineConfig::FeatureLag(default_rise_params()),
            PipelineKind::HybridMedian => PipelineConfig::HybridMedian {
                window: default_valley_params(),
                feature: default_rise_params(),
            },
            PipelineKind::ClusterGuided => PipelineConfig::ClusterGuided {
                valley: default_valley_params(),
                cluster: ClusterParams::default(),
            },
        }
    }

    pub fn default_for_id(id: &str) -> Option<Self> {
        PipelineKind::ALL
            .into_iter()
            .map(Self::default_for_kind)
            .find(|cfg| cfg.id() == id.trim())
    }

    pub fn validate(&self) -> Result<(), PwvError> {
        match self {
            PipelineConfig::WindowAligned(valley) => valley.validate(),
            PipelineConfig::FeatureLag(rise) => rise.validate(),
            PipelineConfig::HybridMedian { window, feature } => {
                window.validate()?;
                feature.validate()
            }
            PipelineConfig::ClusterGuided { valley, cluster } => {
                valley.validate()?;
                cluster.validate()
            }
        }
    }

    pub fn params_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn params_hash_sha256(&self) -> Result<String, PwvError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| PwvError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub id: String,
    pub kind: PipelineKind,
    pub name: String,
    pub description: String,
    pub default_params: JsonValue,
}

pub fn list_pipelines() -> Vec<PipelineInfo> {
    PipelineKind::ALL
        .into_iter()
        .map(PipelineConfig::default_for_kind)
        .map(|cfg| PipelineInfo {
            id: cfg.id().to_string(),
            kind: cfg.kind(),
            name: cfg.name().to_string(),
            description: cfg.description().to_string(),
            default_params: cfg.params_json(),
        })
        .collect()
}

/// Summary lags in seconds and velocity in m/s; `None` where undefined.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PipelineResult {
    pub pipeline: PipelineKind,
    pub lag_median: Option<f64>,
    pub lag_median_robust: Option<f64>,
    pub lag_mode: Option<f64>,
    pub velocity: Option<f64>,
    pub n_pairs: usize,
    pub n_pairs_robust: usize,
}

impl PipelineResult {
    fn from_summary(pipeline: PipelineKind, summary: &LagSummary, distance_m: f64) -> Self {
        Self {
            pipeline,
            lag_median: summary.lag_median,
            lag_median_robust: summary.lag_median_robust,
            lag_mode: summary.lag_mode,
            velocity: velocity_from_lag(distance_m, summary.preferred_lag()),
            n_pairs: summary.n_pairs,
            n_pairs_robust: summary.n_pairs_robust,
        }
    }

    /// The lag the velocity was computed from.
    pub fn reported_lag(&self) -> Option<f64> {
        self.lag_median_robust.or(self.lag_median)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BeatRecord {
    pub pipeline: PipelineKind,
    /// Set when the row was merged into a combined pipeline's table.
    pub combo: Option<PipelineKind>,
    pub proximal_index: usize,
    pub distal_index: usize,
    pub lag_s: f64,
}

pub type BeatTable = Vec<BeatRecord>;

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOutput {
    pub result: PipelineResult,
    pub beats: Option<BeatTable>,
}

/// One filtered channel and its derivatives.
struct Channel {
    filtered: Waveform,
    derivs: Derivatives,
    /// First sample past the filter warm-up; fiducials before it are dropped.
    settle: usize,
}

impl Channel {
    fn prepare(raw: &Waveform, filter: &FilterParams) -> Result<Self, PwvError> {
        let filtered = lowpass_fir(raw, filter)?;
        let derivs = Derivatives::of(&filtered);
        Ok(Self {
            filtered,
            derivs,
            settle: filter.warmup_samples(),
        })
    }

    fn rises(&self, params: &RiseParams) -> FiducialSeries {
        detect_rise_points(&self.derivs.first, params).skip_before(self.settle)
    }

    fn valleys(&self, params: &ValleyParams) -> (FiducialSeries, FiducialSeries) {
        detect_valleys(&self.derivs.first, &self.derivs.second, params, self.settle)
    }
}

/// Paired fiducials and their reduced lags for one single-stage pipeline.
struct Estimate {
    kind: PipelineKind,
    pairs: Vec<FiducialPair>,
    summary: LagSummary,
}

impl Estimate {
    fn new(kind: PipelineKind, proximal: &[usize], distal: &[usize], fs: f64, mad: f64) -> Self {
        let pairs = pair_fiducials(proximal, distal, fs);
        let lags: Vec<f64> = pairs.iter().map(|p| p.lag_s).collect();
        let summary = reduce_lags(&lags, mad);
        debug!(
            pipeline = kind.label(),
            proximal = proximal.len(),
            distal = distal.len(),
            pairs = summary.n_pairs,
            robust = summary.n_pairs_robust,
            "paired fiducials"
        );
        Self {
            kind,
            pairs,
            summary,
        }
    }

    fn beats(&self, combo: Option<PipelineKind>) -> BeatTable {
        self.pairs
            .iter()
            .map(|p| BeatRecord {
                pipeline: self.kind,
                combo,
                proximal_index: p.proximal,
                distal_index: p.distal,
                lag_s: p.lag_s,
            })
            .collect()
    }

    fn into_output(self, distance_m: f64, export_beats: bool) -> PipelineOutput {
        PipelineOutput {
            result: PipelineResult::from_summary(self.kind, &self.summary, distance_m),
            beats: export_beats.then(|| self.beats(None)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Pipeline {
    fs: f64,
    params: Params,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(fs: f64, params: Params, config: PipelineConfig) -> Result<Self, PwvError> {
        positive("fs", fs)?;
        params.validate(fs)?;
        config.validate()?;
        Ok(Self { fs, params, config })
    }

    pub fn with_defaults(fs: f64, kind: PipelineKind) -> Result<Self, PwvError> {
        Self::new(fs, Params::default(), PipelineConfig::default_for_kind(kind))
    }

    pub fn fs(&self) -> f64 {
        self.fs
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn kind(&self) -> PipelineKind {
        self.config.kind()
    }

    pub fn run(
        &self,
        proximal: &Waveform,
        distal: &Waveform,
        distance_m: f64,
        export_beats: bool,
    ) -> Result<PipelineOutput, PwvError> {
        for w in [proximal, distal] {
            if (w.fs() - self.fs).abs() > FS_TOLERANCE * self.fs {
                return Err(PwvError::SampleRateMismatch {
                    expected: self.fs,
                    actual: w.fs(),
                });
            }
        }
        let prox = Channel::prepare(proximal, &self.params.filter)?;
        let dist = Channel::prepare(distal, &self.params.filter)?;

        let output = match &self.config {
            PipelineConfig::WindowAligned(valley) => self
                .window_aligned(&prox, &dist, valley)
                .into_output(distance_m, export_beats),
            PipelineConfig::FeatureLag(rise) => self
                .feature_lag(&prox, &dist, rise)
                .into_output(distance_m, export_beats),
            PipelineConfig::HybridMedian { window, feature } => {
                let a = self.window_aligned(&prox, &dist, window);
                let b = self.feature_lag(&prox, &dist, feature);
                hybrid_median(&a, &b, distance_m, export_beats)
            }
            PipelineConfig::ClusterGuided { valley, cluster } => self
                .cluster_guided(&prox, &dist, valley, cluster)
                .into_output(distance_m, export_beats),
        };
        debug!(
            pipeline = self.kind().label(),
            lag = ?output.result.reported_lag(),
            velocity = ?output.result.velocity,
            "pipeline finished"
        );
        Ok(output)
    }

    fn window_aligned(&self, prox: &Channel, dist: &Channel, params: &ValleyParams) -> Estimate {
        let (_, vp) = prox.valleys(params);
        let (_, vd) = dist.valleys(params);
        Estimate::new(
            PipelineKind::WindowAligned,
            &vp.indices,
            &vd.indices,
            self.fs,
            self.params.mad_threshold,
        )
    }

    fn feature_lag(&self, prox: &Channel, dist: &Channel, params: &RiseParams) -> Estimate {
        let rp = prox.rises(params);
        let rd = dist.rises(params);
        Estimate::new(
            PipelineKind::FeatureLag,
            &rp.indices,
            &rd.indices,
            self.fs,
            self.params.mad_threshold,
        )
    }

    fn cluster_guided(
        &self,
        prox: &Channel,
        dist: &Channel,
        valley: &ValleyParams,
        cluster: &ClusterParams,
    ) -> Estimate {
        let vp = stable_valleys(prox, valley, cluster);
        let vd = stable_valleys(dist, valley, cluster);
        Estimate::new(
            PipelineKind::ClusterGuided,
            &vp,
            &vd,
            self.fs,
            self.params.mad_threshold,
        )
    }
}

/// Valleys lying within the proximity window of a majority-cluster rise anchor.
fn stable_valleys(channel: &Channel, valley: &ValleyParams, cluster: &ClusterParams) -> Vec<usize> {
    let fs = channel.filtered.fs();
    let (rises, valleys) = channel.valleys(valley);
    let features = beat_features(&channel.filtered, &rises.indices, cluster.win_ms);
    let stable = select_stable_beats(&features, cluster.k, cluster.n_init, cluster.seed);
    let reach = (cluster.proximity_ms * fs / 1000.0).floor() as usize;
    debug!(
        rises = rises.len(),
        featured = features.len(),
        stable = stable.len(),
        "stable beat selection"
    );
    valleys
        .indices
        .into_iter()
        .filter(|&v| stable.iter().any(|&s| v.abs_diff(s) <= reach))
        .collect()
}

fn hybrid_median(
    window: &Estimate,
    feature: &Estimate,
    distance_m: f64,
    export_beats: bool,
) -> PipelineOutput {
    let candidates: Vec<f64> = [
        window.summary.lag_median_robust,
        feature.summary.lag_median_robust,
        window.summary.lag_mode,
        feature.summary.lag_mode,
    ]
    .into_iter()
    .flatten()
    .collect();
    let consensus = median(&candidates);
    let n_pairs = window
        .summary
        .n_pairs_robust
        .max(feature.summary.n_pairs_robust);

    let result = PipelineResult {
        pipeline: PipelineKind::HybridMedian,
        lag_median: consensus,
        lag_median_robust: None,
        lag_mode: None,
        velocity: velocity_from_lag(distance_m, consensus),
        n_pairs,
        n_pairs_robust: n_pairs,
    };
    let beats = export_beats.then(|| {
        let combo = Some(PipelineKind::HybridMedian);
        let mut rows = window.beats(combo);
        rows.extend(feature.beats(combo));
        rows
    });
    PipelineOutput { result, beats }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{synthesize_pair, SyntheticConfig, SyntheticPair};
    use approx::assert_relative_eq;

    fn reference_pair() -> SyntheticPair {
        synthesize_pair(&SyntheticConfig::default(), 0.08).unwrap()
    }

    fn run(kind: PipelineKind, pair: &SyntheticPair, export: bool) -> PipelineOutput {
        Pipeline::with_defaults(1000.0, kind)
            .unwrap()
            .run(&pair.proximal, &pair.distal, 0.8, export)
            .unwrap()
    }

    #[test]
    fn test_window_aligned_recovers_injected_lag() {
        let pair = reference_pair();
        let out = run(PipelineKind::WindowAligned, &pair, false);
        let lag = out.result.lag_median_robust.expect("robust lag");
        assert!((lag - 0.08).abs() <= 0.005, "lag {lag}");
        assert_relative_eq!(out.result.velocity.unwrap(), 10.0, epsilon = 0.7);
        assert!(out.result.n_pairs >= 8, "{:?}", out.result);
        assert!(out.beats.is_none());
    }

    #[test]
    fn test_window_aligned_recovery_across_seeds_and_noise() {
        for seed in 1..=5 {
            for noise_snr_db in [15.0, 30.0] {
                let cfg = SyntheticConfig {
                    seed,
                    noise_snr_db,
                    ..SyntheticConfig::default()
                };
                let pair = synthesize_pair(&cfg, 0.08).unwrap();
                let out = run(PipelineKind::WindowAligned, &pair, true);
                let lag = out.result.lag_median_robust.expect("robust lag");
                assert!(
                    (lag - 0.08).abs() <= 0.005,
                    "seed {seed}, snr {noise_snr_db}: lag {lag}"
                );
                // Nothing is paired out of the filter start-up transient.
                let beats = out.beats.unwrap();
                assert!(beats.iter().all(|b| b.proximal_index >= 128));
            }
        }
    }

    #[test]
    fn test_cluster_guided_uses_a_subset_of_pairs() {
        let pair = reference_pair();
        let window = run(PipelineKind::WindowAligned, &pair, false);
        let cluster = run(PipelineKind::ClusterGuided, &pair, false);
        assert!(cluster.result.n_pairs_robust <= window.result.n_pairs);
        assert!(cluster.result.n_pairs <= window.result.n_pairs);
    }

    #[test]
    fn test_feature_lag_recovers_injected_lag() {
        let pair = reference_pair();
        let out = run(PipelineKind::FeatureLag, &pair, true);
        let lag = out.result.reported_lag().unwrap();
        assert!((lag - 0.08).abs() <= 0.005, "lag {lag}");
        let beats = out.beats.unwrap();
        assert_eq!(beats.len(), out.result.n_pairs);
        assert!(beats
            .iter()
            .all(|b| b.distal_index >= b.proximal_index && b.combo.is_none()));
    }

    #[test]
    fn test_hybrid_median_combines_sub_pipelines() {
        let pair = reference_pair();
        let out = run(PipelineKind::HybridMedian, &pair, true);
        let window = run(PipelineKind::WindowAligned, &pair, true);
        let feature = run(PipelineKind::FeatureLag, &pair, true);

        let candidates: Vec<f64> = [
            window.result.lag_median_robust,
            feature.result.lag_median_robust,
            window.result.lag_mode,
            feature.result.lag_mode,
        ]
        .into_iter()
        .flatten()
        .collect();
        assert_eq!(out.result.lag_median, median(&candidates));
        assert_eq!(out.result.lag_median_robust, None);
        assert_eq!(out.result.lag_mode, None);
        assert_eq!(
            out.result.n_pairs,
            window
                .result
                .n_pairs_robust
                .max(feature.result.n_pairs_robust)
        );

        let beats = out.beats.unwrap();
        let n_window = window.beats.unwrap().len();
        assert_eq!(beats.len(), n_window + feature.beats.unwrap().len());
        assert!(beats
            .iter()
            .all(|b| b.combo == Some(PipelineKind::HybridMedian)));
        assert_eq!(beats[0].pipeline, PipelineKind::WindowAligned);
        assert_eq!(beats[n_window].pipeline, PipelineKind::FeatureLag);
    }

    #[test]
    fn test_runs_are_reproducible() {
        let pair = reference_pair();
        for kind in PipelineKind::ALL {
            let a = run(kind, &pair, true);
            let b = run(kind, &pair, true);
            assert_eq!(a, b, "{kind}");
        }

        let moving = SyntheticConfig {
            motion_steps: 3,
            seed: 4,
            ..SyntheticConfig::default()
        };
        let pair = synthesize_pair(&moving, 0.08).unwrap();
        for kind in PipelineKind::ALL {
            let a = run(kind, &pair, true);
            let b = run(kind, &pair, true);
            assert_eq!(a, b, "{kind} with motion steps");
        }
    }

    #[test]
    fn test_sample_rate_mismatch_is_rejected() {
        let pipeline = Pipeline::with_defaults(1000.0, PipelineKind::FeatureLag).unwrap();
        let a = Waveform::new(vec![0.0; 100], 1000.0).unwrap();
        let b = Waveform::new(vec![0.0; 100], 500.0).unwrap();
        assert!(matches!(
            pipeline.run(&a, &b, 0.8, false),
            Err(PwvError::SampleRateMismatch { .. })
        ));
    }

    #[test]
    fn test_silent_input_is_undefined_not_an_error() {
        let flat = Waveform::new(vec![0.0; 2000], 1000.0).unwrap();
        for kind in PipelineKind::ALL {
            let out = Pipeline::with_defaults(1000.0, kind)
                .unwrap()
                .run(&flat, &flat, 0.8, true)
                .unwrap();
            assert_eq!(out.result.velocity, None, "{kind}");
            assert_eq!(out.result.n_pairs, 0, "{kind}");
        }
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let params = Params {
            filter: FilterParams {
                cutoff_hz: 600.0,
                taps: 129,
            },
            ..Params::default()
        };
        let cfg = PipelineConfig::default_for_kind(PipelineKind::WindowAligned);
        assert!(matches!(
            Pipeline::new(1000.0, params, cfg),
            Err(PwvError::InvalidParameter(_))
        ));

        let cfg = PipelineConfig::FeatureLag(RiseParams {
            rel_height: 1.5,
            min_distance_ms: 280.0,
        });
        assert!(Pipeline::new(1000.0, Params::default(), cfg).is_err());
    }

    #[test]
    fn test_catalogue_ids_round_trip() {
        let infos = list_pipelines();
        assert_eq!(infos.len(), 4);
        let mut hashes = Vec::new();
        for info in &infos {
            let cfg = PipelineConfig::default_for_id(&info.id).unwrap();
            assert_eq!(cfg.kind(), info.kind);
            assert_eq!(info.default_params["id"], info.id.as_str());
            let back: PipelineConfig = serde_json::from_value(info.default_params.clone()).unwrap();
            assert_eq!(back, cfg);
            hashes.push(cfg.params_hash_sha256().unwrap());
        }
        hashes.sort();
        hashes.dedup();
        assert_eq!(hashes.len(), 4);
        assert_eq!(hashes[0].len(), 64);
        assert!(PipelineConfig::default_for_id("pwv.unknown.v1").is_none());
    }
}

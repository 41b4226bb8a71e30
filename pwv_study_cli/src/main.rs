mod plot;

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use pwv_study::{
    bland_altman, bland_altman_points, detect_valleys, gate_hit_ratio, lowpass_fir, mean_defined,
    median_defined, signal_quality_indices, synthesize_pair, velocity_from_lag, BeatTable,
    BlandAltman, Derivatives, FiducialPoint, Params, Pipeline, PipelineConfig, PipelineKind,
    PipelineOutput, PipelineResult, SyntheticConfig, Waveform,
};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::plot::{render_chart_guard, AgreementSeries, ChartKind, PointSeries};

#[derive(Parser, Debug)]
#[command(author, version, about = "Pulse wave velocity study CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate PWV for one recording (CSV) or one synthetic pair
    Run(RunArgs),
    /// Sweep synthetic conditions and score every pipeline against the injected lag
    Sweep(SweepArgs),
    /// Report signal quality and detector gate hits for both channels
    Diagnose(DiagnoseArgs),
    /// Print the pipeline catalogue as JSON
    Pipelines(PipelinesArgs),
}

#[derive(Args, Debug, Clone)]
struct SignalArgs {
    /// Two-column CSV with `proximal,distal` headers; synthetic pair when omitted
    #[arg(long, value_hint = ValueHint::FilePath)]
    input: Option<PathBuf>,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 1000.0)]
    fs: f64,

    /// Synthetic recording length in seconds
    #[arg(long, default_value_t = 12.0)]
    seconds: f64,

    /// Synthetic heart rate (bpm)
    #[arg(long, default_value_t = 70.0)]
    hr: f64,

    /// Synthetic relative heart-rate variability
    #[arg(long, default_value_t = 0.02)]
    hrv: f64,

    /// Synthetic additive noise SNR (dB)
    #[arg(long, default_value_t = 15.0)]
    noise_snr_db: f64,

    /// Synthetic motion-artifact baseline steps
    #[arg(long, default_value_t = 0)]
    motion_steps: usize,

    /// Synthetic RNG seed
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Synthetic distal delay (ms)
    #[arg(long, default_value_t = 80.0)]
    lag_ms: f64,
}

#[derive(Args, Debug, Clone)]
struct ParamArgs {
    /// JSON file overriding the shared pipeline parameters
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Low-pass cutoff (Hz)
    #[arg(long)]
    cutoff_hz: Option<f64>,

    /// Low-pass FIR length
    #[arg(long)]
    taps: Option<usize>,

    /// MAD outlier threshold on per-beat lags
    #[arg(long)]
    mad_threshold: Option<f64>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    signal: SignalArgs,

    #[command(flatten)]
    params: ParamArgs,

    /// Sensor separation (m)
    #[arg(long, default_value_t = 0.8)]
    distance: f64,

    /// Pipelines to run (comma separated); all when omitted
    #[arg(long, value_enum, value_delimiter = ',')]
    pipelines: Vec<PipelineOpt>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "pwv_results.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Per-beat CSV path
    #[arg(long, value_hint = ValueHint::FilePath)]
    beats: Option<PathBuf>,

    /// Per-beat lag scatter PNG (defaults next to the output CSV)
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Per-beat lag scatter SVG
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Disable plot generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct SweepArgs {
    #[command(flatten)]
    params: ParamArgs,

    /// Heart rates (bpm, comma separated)
    #[arg(long, default_value = "60,75,90")]
    hr: String,

    /// Noise SNR values (dB, comma separated)
    #[arg(long, default_value = "10,15,25")]
    noise_snr_db: String,

    /// Motion step counts (comma separated)
    #[arg(long, default_value = "0,2")]
    motion_steps: String,

    /// Injected lags (ms, comma separated)
    #[arg(long, default_value = "60,80,120")]
    lag_ms: String,

    /// Seeds (comma separated)
    #[arg(long, default_value = "1,2,3")]
    seeds: String,

    /// Recording length in seconds
    #[arg(long, default_value_t = 12.0)]
    seconds: f64,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 1000.0)]
    fs: f64,

    /// Relative heart-rate variability
    #[arg(long, default_value_t = 0.02)]
    hrv: f64,

    /// Sensor separation (m)
    #[arg(long, default_value_t = 0.8)]
    distance: f64,

    /// Pipelines to run (comma separated); all when omitted
    #[arg(long, value_enum, value_delimiter = ',')]
    pipelines: Vec<PipelineOpt>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "pwv_sweep.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// JSON summary path (defaults next to the output CSV)
    #[arg(long, value_hint = ValueHint::FilePath)]
    summary: Option<PathBuf>,

    /// Directory for plots (defaults to the output CSV's directory)
    #[arg(long, value_hint = ValueHint::DirPath)]
    plot_dir: Option<PathBuf>,

    /// Also write SVG versions of the plots
    #[arg(long, action = ArgAction::SetTrue)]
    svg: bool,

    /// Disable plot generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    #[command(flatten)]
    signal: SignalArgs,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Also write every detected rise point and valley as CSV (channel,kind,index)
    #[arg(long, value_hint = ValueHint::FilePath)]
    fiducials: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct PipelinesArgs {
    /// Output JSON path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PipelineOpt {
    WindowAligned,
    FeatureLag,
    HybridMedian,
    ClusterGuided,
}

impl From<PipelineOpt> for PipelineKind {
    fn from(value: PipelineOpt) -> Self {
        match value {
            PipelineOpt::WindowAligned => PipelineKind::WindowAligned,
            PipelineOpt::FeatureLag => PipelineKind::FeatureLag,
            PipelineOpt::HybridMedian => PipelineKind::HybridMedian,
            PipelineOpt::ClusterGuided => PipelineKind::ClusterGuided,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Run(args) => args.verbose,
        Command::Sweep(args) => args.verbose,
        Command::Diagnose(args) => args.verbose,
        Command::Pipelines(_) => false,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Sweep(args) => handle_sweep(args),
        Command::Diagnose(args) => handle_diagnose(args),
        Command::Pipelines(args) => handle_pipelines(args),
    }
}

/// A proximal/distal pair ready for the pipelines.
struct Recording {
    proximal: Waveform,
    distal: Waveform,
    true_lag_s: Option<f64>,
    source: String,
}

fn load_recording(args: &SignalArgs) -> Result<Recording> {
    match args.input.as_ref() {
        Some(path) => {
            let (proximal, distal) = read_channel_csv(path)?;
            Ok(Recording {
                proximal: Waveform::new(proximal, args.fs)?,
                distal: Waveform::new(distal, args.fs)?,
                true_lag_s: None,
                source: path.display().to_string(),
            })
        }
        None => {
            let cfg = SyntheticConfig {
                seconds: args.seconds,
                fs: args.fs,
                hr_bpm: args.hr,
                hrv: args.hrv,
                noise_snr_db: args.noise_snr_db,
                motion_steps: args.motion_steps,
                seed: args.seed,
            };
            let pair = synthesize_pair(&cfg, args.lag_ms / 1000.0)
                .context("failed to synthesize PPG pair")?;
            Ok(Recording {
                proximal: pair.proximal,
                distal: pair.distal,
                true_lag_s: Some(pair.true_lag_s),
                source: format!("synthetic(seed={})", args.seed),
            })
        }
    }
}

fn read_channel_csv(path: &Path) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("{} has no '{}' column", path.display(), name))
    };
    let (p_col, d_col) = (column("proximal")?, column("distal")?);

    let mut proximal = Vec::new();
    let mut distal = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("bad CSV row {} in {}", row + 2, path.display()))?;
        let parse = |col: usize| -> Result<f64> {
            let field = record.get(col).unwrap_or("").trim();
            field
                .parse::<f64>()
                .with_context(|| format!("row {}: '{}' is not a number", row + 2, field))
        };
        proximal.push(parse(p_col)?);
        distal.push(parse(d_col)?);
    }
    if proximal.is_empty() {
        return Err(anyhow!("{} contains no samples", path.display()));
    }
    Ok((proximal, distal))
}

fn resolve_params(args: &ParamArgs) -> Result<Params> {
    let mut params = match args.config.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<Params>(&text)
                .with_context(|| format!("{} is not a valid parameter file", path.display()))?
        }
        None => Params::default(),
    };
    if let Some(cutoff) = args.cutoff_hz {
        params.filter.cutoff_hz = cutoff;
    }
    if let Some(taps) = args.taps {
        params.filter.taps = taps;
    }
    if let Some(thr) = args.mad_threshold {
        params.mad_threshold = thr;
    }
    Ok(params)
}

fn selected_kinds(opts: &[PipelineOpt]) -> Vec<PipelineKind> {
    if opts.is_empty() {
        return PipelineKind::ALL.to_vec();
    }
    let mut kinds: Vec<PipelineKind> = opts.iter().map(|&o| o.into()).collect();
    kinds.sort();
    kinds.dedup();
    kinds
}

fn build_pipelines(fs: f64, params: &Params, kinds: &[PipelineKind]) -> Result<Vec<Pipeline>> {
    kinds
        .iter()
        .map(|&kind| {
            Pipeline::new(fs, params.clone(), PipelineConfig::default_for_kind(kind))
                .with_context(|| format!("invalid configuration for {kind}"))
        })
        .collect()
}

fn handle_run(args: RunArgs) -> Result<()> {
    let params = resolve_params(&args.params)?;
    let kinds = selected_kinds(&args.pipelines);
    let pipelines = build_pipelines(args.signal.fs, &params, &kinds)?;

    let t_load = Instant::now();
    let recording = load_recording(&args.signal)?;
    if args.profile || args.verbose {
        info!(
            "Load stage: {:.1} ms ({} samples, {})",
            t_load.elapsed().as_secs_f64() * 1000.0,
            recording.proximal.len(),
            recording.source
        );
    }

    let export_beats = args.beats.is_some() || !args.no_plot;
    let mut outputs: Vec<(PipelineConfig, PipelineOutput)> = Vec::with_capacity(pipelines.len());
    for pipeline in &pipelines {
        let t_run = Instant::now();
        let out = pipeline.run(
            &recording.proximal,
            &recording.distal,
            args.distance,
            export_beats,
        )?;
        if args.profile || args.verbose {
            info!(
                "{} stage: {:.1} ms",
                pipeline.kind(),
                t_run.elapsed().as_secs_f64() * 1000.0
            );
        }
        log_result(&out.result);
        outputs.push((pipeline.config().clone(), out));
    }

    let rows: Vec<RunRow> = outputs
        .iter()
        .map(|(cfg, out)| -> Result<RunRow> {
            Ok(RunRow {
                id: cfg.id(),
                params_hash: cfg.params_hash_sha256()?,
                result: out.result.clone(),
                true_lag_s: recording.true_lag_s,
            })
        })
        .collect::<Result<_>>()?;
    write_csv_to(&args.output, |w| write_run_rows(&rows, w))?;
    if args.output.as_os_str() != "-" {
        info!("Wrote results CSV: {}", args.output.display());
    }

    let beats: BeatTable = outputs
        .iter()
        .filter_map(|(_, out)| out.beats.as_ref())
        .flatten()
        .cloned()
        .collect();
    if let Some(path) = args.beats.as_ref() {
        write_csv_to(path, |w| write_beat_rows(&beats, recording.proximal.fs(), w))?;
        info!("Wrote per-beat CSV: {} ({} rows)", path.display(), beats.len());
    }

    if !args.no_plot {
        let series = beat_series(&beats, recording.proximal.fs());
        let mut targets: Vec<(PathBuf, ChartKind)> = Vec::new();
        match args.png.as_ref() {
            Some(path) => targets.push((path.clone(), ChartKind::Png)),
            None if args.output.as_os_str() != "-" => {
                targets.push((sibling_path(&args.output, "beats", ChartKind::Png), ChartKind::Png))
            }
            None => {}
        }
        if let Some(path) = args.svg.as_ref() {
            targets.push((path.clone(), ChartKind::Svg));
        }
        let t_plot = Instant::now();
        for (path, kind) in targets {
            match render_chart_guard(|| plot::render_beat_scatter(&path, kind, &series)) {
                Ok(()) => info!("Wrote plot: {}", path.display()),
                Err(err) => warn!(
                    "Skipping {} render ({}): {}",
                    kind.extension(),
                    path.display(),
                    err
                ),
            }
        }
        if args.profile || args.verbose {
            info!(
                "Plot stage: {:.1} ms",
                t_plot.elapsed().as_secs_f64() * 1000.0
            );
        }
    }

    Ok(())
}

fn log_result(result: &PipelineResult) {
    info!(
        "{}: lag {} s, velocity {} m/s ({} pairs, {} robust)",
        result.pipeline,
        fmt_or(result.reported_lag(), 4, "n/a"),
        fmt_or(result.velocity, 2, "n/a"),
        result.n_pairs,
        result.n_pairs_robust
    );
}

fn beat_series(beats: &BeatTable, fs: f64) -> Vec<PointSeries> {
    let mut grouped: BTreeMap<PipelineKind, Vec<(f64, f64)>> = BTreeMap::new();
    for beat in beats {
        // Hybrid rows repeat the sub-pipeline rows.
        if beat.combo.is_some() {
            continue;
        }
        grouped
            .entry(beat.pipeline)
            .or_default()
            .push((beat.proximal_index as f64 / fs, beat.lag_s * 1000.0));
    }
    grouped
        .into_iter()
        .map(|(kind, points)| PointSeries { kind, points })
        .collect()
}

fn sibling_path(base: &Path, suffix: &str, kind: ChartKind) -> PathBuf {
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("pwv");
    base.with_file_name(format!("{}_{}.{}", stem, suffix, kind.extension()))
}

struct RunRow {
    id: &'static str,
    params_hash: String,
    result: PipelineResult,
    true_lag_s: Option<f64>,
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.*}", precision, v),
        _ => String::new(),
    }
}

fn fmt_or(value: Option<f64>, precision: usize, fallback: &str) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.*}", precision, v),
        _ => fallback.to_string(),
    }
}

fn write_csv_to<F>(path: &Path, write_rows: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<Box<dyn Write>>) -> Result<()>,
{
    let sink: Box<dyn Write> = if path.as_os_str() == "-" {
        Box::new(io::stdout().lock())
    } else {
        Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )
    };
    let mut writer = csv::Writer::from_writer(sink);
    write_rows(&mut writer)?;
    writer.flush()?;
    Ok(())
}

fn write_run_rows<W: Write>(rows: &[RunRow], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "pipeline",
        "id",
        "params_hash",
        "lag_median_s",
        "lag_median_robust_s",
        "lag_mode_s",
        "velocity_m_per_s",
        "n_pairs",
        "n_pairs_robust",
        "true_lag_s",
    ])?;
    for row in rows {
        let r = &row.result;
        writer.write_record([
            r.pipeline.label().to_string(),
            row.id.to_string(),
            row.params_hash.clone(),
            fmt_opt(r.lag_median, 6),
            fmt_opt(r.lag_median_robust, 6),
            fmt_opt(r.lag_mode, 6),
            fmt_opt(r.velocity, 4),
            r.n_pairs.to_string(),
            r.n_pairs_robust.to_string(),
            fmt_opt(row.true_lag_s, 6),
        ])?;
    }
    Ok(())
}

fn write_beat_rows<W: Write>(
    beats: &BeatTable,
    fs: f64,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "pipeline",
        "combo",
        "proximal_index",
        "distal_index",
        "proximal_time_s",
        "lag_s",
    ])?;
    for beat in beats {
        writer.write_record([
            beat.pipeline.label().to_string(),
            beat.combo.map(|c| c.label().to_string()).unwrap_or_default(),
            beat.proximal_index.to_string(),
            beat.distal_index.to_string(),
            format!("{:.4}", beat.proximal_index as f64 / fs),
            format!("{:.6}", beat.lag_s),
        ])?;
    }
    Ok(())
}

fn parse_list<T>(input: &str, what: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let mut out = Vec::new();
    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = trimmed
            .parse::<T>()
            .with_context(|| format!("invalid {} '{}'", what, trimmed))?;
        out.push(value);
    }
    if out.is_empty() {
        return Err(anyhow!("{} list is empty", what));
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug)]
struct SweepCase {
    hr_bpm: f64,
    noise_snr_db: f64,
    motion_steps: usize,
    lag_ms: f64,
    seed: u64,
}

#[derive(Clone, Debug)]
struct SweepRow {
    case: SweepCase,
    true_lag_s: f64,
    result: PipelineResult,
}

impl SweepRow {
    fn lag_error_s(&self) -> Option<f64> {
        self.result.reported_lag().map(|l| l - self.true_lag_s)
    }

    fn true_velocity(&self, distance_m: f64) -> Option<f64> {
        velocity_from_lag(distance_m, Some(self.true_lag_s))
    }
}

fn sweep_grid(args: &SweepArgs) -> Result<Vec<SweepCase>> {
    let hrs: Vec<f64> = parse_list(&args.hr, "heart rate")?;
    let snrs: Vec<f64> = parse_list(&args.noise_snr_db, "noise SNR")?;
    let motions: Vec<usize> = parse_list(&args.motion_steps, "motion step count")?;
    let lags: Vec<f64> = parse_list(&args.lag_ms, "lag")?;
    let seeds: Vec<u64> = parse_list(&args.seeds, "seed")?;

    let mut cases = Vec::new();
    for &hr_bpm in &hrs {
        for &noise_snr_db in &snrs {
            for &motion_steps in &motions {
                for &lag_ms in &lags {
                    for &seed in &seeds {
                        cases.push(SweepCase {
                            hr_bpm,
                            noise_snr_db,
                            motion_steps,
                            lag_ms,
                            seed,
                        });
                    }
                }
            }
        }
    }
    Ok(cases)
}

fn run_case(
    case: &SweepCase,
    args: &SweepArgs,
    pipelines: &[Pipeline],
) -> Result<Vec<SweepRow>> {
    let cfg = SyntheticConfig {
        seconds: args.seconds,
        fs: args.fs,
        hr_bpm: case.hr_bpm,
        hrv: args.hrv,
        noise_snr_db: case.noise_snr_db,
        motion_steps: case.motion_steps,
        seed: case.seed,
    };
    let pair = synthesize_pair(&cfg, case.lag_ms / 1000.0)
        .with_context(|| format!("failed to synthesize case {:?}", case))?;
    pipelines
        .iter()
        .map(|pipeline| -> Result<SweepRow> {
            let out = pipeline.run(&pair.proximal, &pair.distal, args.distance, false)?;
            debug!(
                ?case,
                pipeline = %pipeline.kind(),
                velocity = ?out.result.velocity,
                "case done"
            );
            Ok(SweepRow {
                case: *case,
                true_lag_s: pair.true_lag_s,
                result: out.result,
            })
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct PipelineSummary {
    id: String,
    params: JsonValue,
    params_hash: String,
    cases: usize,
    /// Fraction of cases with a defined velocity.
    coverage: f64,
    mae_lag_ms: Option<f64>,
    median_abs_lag_error_ms: Option<f64>,
    mae_velocity_m_per_s: Option<f64>,
    bland_altman_velocity: Option<BlandAltman>,
}

#[derive(Debug, Serialize)]
struct SweepSummary {
    generated_at: String,
    distance_m: f64,
    fs: f64,
    seconds: f64,
    cases: usize,
    params: Params,
    pipelines: BTreeMap<String, PipelineSummary>,
}

fn velocity_pairs(rows: &[&SweepRow], distance_m: f64) -> Vec<(Option<f64>, Option<f64>)> {
    rows.iter()
        .map(|r| (r.result.velocity, r.true_velocity(distance_m)))
        .collect()
}

fn summarize_pipeline(
    pipeline: &Pipeline,
    rows: &[&SweepRow],
    distance_m: f64,
) -> Result<PipelineSummary> {
    let cfg = pipeline.config();
    let defined = rows.iter().filter(|r| r.result.velocity.is_some()).count();
    let lag_errors: Vec<Option<f64>> = rows
        .iter()
        .map(|r| r.lag_error_s().map(|e| e.abs() * 1000.0))
        .collect();
    let velocity_errors: Vec<Option<f64>> = rows
        .iter()
        .map(|r| match (r.result.velocity, r.true_velocity(distance_m)) {
            (Some(est), Some(truth)) => Some((est - truth).abs()),
            _ => None,
        })
        .collect();
    Ok(PipelineSummary {
        id: cfg.id().to_string(),
        params: cfg.params_json(),
        params_hash: cfg.params_hash_sha256()?,
        cases: rows.len(),
        coverage: if rows.is_empty() {
            0.0
        } else {
            defined as f64 / rows.len() as f64
        },
        mae_lag_ms: mean_defined(&lag_errors),
        median_abs_lag_error_ms: median_defined(&lag_errors),
        mae_velocity_m_per_s: mean_defined(&velocity_errors),
        bland_altman_velocity: bland_altman(&velocity_pairs(rows, distance_m)),
    })
}

/// Mean absolute lag error (ms) per SNR level.
fn stability_points(rows: &[&SweepRow]) -> Vec<(f64, f64)> {
    let mut by_snr: BTreeMap<i64, (f64, Vec<Option<f64>>)> = BTreeMap::new();
    for row in rows {
        // Keyed on millidecibels so float SNR values group exactly.
        let key = (row.case.noise_snr_db * 1000.0).round() as i64;
        by_snr
            .entry(key)
            .or_insert_with(|| (row.case.noise_snr_db, Vec::new()))
            .1
            .push(row.lag_error_s().map(|e| e.abs() * 1000.0));
    }
    by_snr
        .into_values()
        .filter_map(|(snr, errors)| mean_defined(&errors).map(|mae| (snr, mae)))
        .collect()
}

fn handle_sweep(args: SweepArgs) -> Result<()> {
    let params = resolve_params(&args.params)?;
    let kinds = selected_kinds(&args.pipelines);
    let pipelines = build_pipelines(args.fs, &params, &kinds)?;
    let cases = sweep_grid(&args)?;
    info!(
        "Sweeping {} cases x {} pipelines",
        cases.len(),
        pipelines.len()
    );

    let t_sweep = Instant::now();
    let rows: Vec<SweepRow> = cases
        .par_iter()
        .map(|case| run_case(case, &args, &pipelines))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();
    if args.profile || args.verbose {
        info!(
            "Sweep stage: {:.1} ms ({} rows)",
            t_sweep.elapsed().as_secs_f64() * 1000.0,
            rows.len()
        );
    }

    write_csv_to(&args.output, |w| write_sweep_rows(&rows, args.distance, w))?;
    if args.output.as_os_str() != "-" {
        info!("Wrote sweep CSV: {}", args.output.display());
    }

    let by_kind = |kind: PipelineKind| -> Vec<&SweepRow> {
        rows.iter().filter(|r| r.result.pipeline == kind).collect()
    };
    let mut summaries = BTreeMap::new();
    for pipeline in &pipelines {
        let summary = summarize_pipeline(pipeline, &by_kind(pipeline.kind()), args.distance)?;
        info!(
            "{}: coverage {:.0}%, MAE lag {} ms",
            pipeline.kind(),
            summary.coverage * 100.0,
            fmt_or(summary.mae_lag_ms, 2, "n/a")
        );
        summaries.insert(pipeline.kind().label().to_string(), summary);
    }
    let summary = SweepSummary {
        generated_at: Utc::now().to_rfc3339(),
        distance_m: args.distance,
        fs: args.fs,
        seconds: args.seconds,
        cases: cases.len(),
        params: params.clone(),
        pipelines: summaries,
    };
    let summary_path = match args.summary.as_ref() {
        Some(path) => Some(path.clone()),
        None if args.output.as_os_str() != "-" => Some(args.output.with_extension("json")),
        None => None,
    };
    match summary_path {
        Some(path) => {
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            serde_json::to_writer_pretty(file, &summary)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Wrote sweep summary: {}", path.display());
        }
        None => {
            let text = serde_json::to_string_pretty(&summary)?;
            info!("Sweep summary:\n{}", text);
        }
    }

    if !args.no_plot {
        let t_plot = Instant::now();
        let dir = match args.plot_dir.as_ref() {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                dir.clone()
            }
            None => args
                .output
                .parent()
                .filter(|p| !p.as_os_str().is_empty() && args.output.as_os_str() != "-")
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let agreement: Vec<AgreementSeries> = kinds
            .iter()
            .map(|&kind| {
                let pairs = velocity_pairs(&by_kind(kind), args.distance);
                AgreementSeries {
                    kind,
                    points: bland_altman_points(&pairs),
                    stats: bland_altman(&pairs),
                }
            })
            .collect();
        let stability: Vec<PointSeries> = kinds
            .iter()
            .map(|&kind| PointSeries {
                kind,
                points: stability_points(&by_kind(kind)),
            })
            .collect();

        let mut chart_kinds = vec![ChartKind::Png];
        if args.svg {
            chart_kinds.push(ChartKind::Svg);
        }
        for chart in chart_kinds {
            let ext = chart.extension();
            let report = |path: &Path, outcome: Result<(), String>| match outcome {
                Ok(()) => info!("Wrote plot: {}", path.display()),
                Err(err) => warn!("Skipping {} render ({}): {}", ext, path.display(), err),
            };
            let path = dir.join(format!("bland_altman.{ext}"));
            report(
                &path,
                render_chart_guard(|| plot::render_bland_altman(&path, chart, &agreement)),
            );
            let path = dir.join(format!("stability.{ext}"));
            report(
                &path,
                render_chart_guard(|| plot::render_stability_curve(&path, chart, &stability)),
            );
            let path = dir.join(format!("pipeline_flow.{ext}"));
            report(
                &path,
                render_chart_guard(|| plot::render_flow_diagram(&path, chart, &kinds)),
            );
        }
        if args.profile || args.verbose {
            info!(
                "Plot stage: {:.1} ms",
                t_plot.elapsed().as_secs_f64() * 1000.0
            );
        }
    }

    Ok(())
}

fn write_sweep_rows<W: Write>(
    rows: &[SweepRow],
    distance_m: f64,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "pipeline",
        "hr_bpm",
        "noise_snr_db",
        "motion_steps",
        "seed",
        "lag_ms",
        "true_lag_s",
        "lag_median_s",
        "lag_median_robust_s",
        "lag_mode_s",
        "velocity_m_per_s",
        "true_velocity_m_per_s",
        "n_pairs",
        "n_pairs_robust",
        "lag_error_s",
        "velocity_error_m_per_s",
    ])?;
    for row in rows {
        let r = &row.result;
        let truth = row.true_velocity(distance_m);
        let velocity_error = match (r.velocity, truth) {
            (Some(est), Some(t)) => Some(est - t),
            _ => None,
        };
        writer.write_record([
            r.pipeline.label().to_string(),
            format!("{}", row.case.hr_bpm),
            format!("{}", row.case.noise_snr_db),
            row.case.motion_steps.to_string(),
            row.case.seed.to_string(),
            format!("{}", row.case.lag_ms),
            format!("{:.6}", row.true_lag_s),
            fmt_opt(r.lag_median, 6),
            fmt_opt(r.lag_median_robust, 6),
            fmt_opt(r.lag_mode, 6),
            fmt_opt(r.velocity, 4),
            fmt_opt(truth, 4),
            r.n_pairs.to_string(),
            r.n_pairs_robust.to_string(),
            fmt_opt(row.lag_error_s(), 6),
            fmt_opt(velocity_error, 4),
        ])?;
    }
    Ok(())
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let recording = load_recording(&args.signal)?;
    let valley_params = match PipelineConfig::default_for_kind(PipelineKind::WindowAligned) {
        PipelineConfig::WindowAligned(valley) => valley,
        other => return Err(anyhow!("unexpected default config {}", other.id())),
    };
    let params = Params::default();
    let settle = params.filter.warmup_samples();

    let mut report = String::new();
    let mut fiducials: Vec<(&str, FiducialPoint)> = Vec::new();
    report.push_str(&format!("source: {}\n", recording.source));
    report.push_str(&format!(
        "samples: {} @ {} Hz ({:.2} s)\n",
        recording.proximal.len(),
        recording.proximal.fs(),
        recording.proximal.duration_s()
    ));
    if let Some(lag) = recording.true_lag_s {
        report.push_str(&format!("injected lag: {:.4} s\n", lag));
    }

    for (name, channel) in [("proximal", &recording.proximal), ("distal", &recording.distal)] {
        report.push_str(&format!("\n[{name}]\n"));
        match signal_quality_indices(channel) {
            Some(q) => {
                report.push_str(&format!("  snr_proxy: {:.4}\n", q.snr_proxy));
                report.push_str(&format!("  spectral_entropy: {:.4}\n", q.spectral_entropy));
            }
            None => report.push_str("  quality indices: undefined (too few samples)\n"),
        }

        let filtered = lowpass_fir(channel, &params.filter)
            .with_context(|| format!("failed to filter {name} channel"))?;
        let derivs = Derivatives::of(&filtered);
        let (rises, valleys) =
            detect_valleys(&derivs.first, &derivs.second, &valley_params, settle);
        report.push_str(&format!("  rise points: {}\n", rises.len()));
        report.push_str(&format!("  valleys: {}\n", valleys.len()));
        fiducials.extend(rises.points().chain(valleys.points()).map(|p| (name, p)));
        let ratio = gate_hit_ratio(
            &valleys.indices,
            &rises.indices,
            channel.fs(),
            valley_params.gate_ms,
        );
        report.push_str(&format!(
            "  gate_hit_ratio: {}\n",
            fmt_or(ratio, 3, "undefined")
        ));
    }

    if args.output.as_os_str() == "-" {
        io::stdout()
            .write_all(report.as_bytes())
            .context("failed to write report to stdout")?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Diagnostic report written: {}", args.output.display());
    }
    if let Some(path) = args.fiducials.as_ref() {
        write_csv_to(path, |w| write_fiducial_rows(&fiducials, w))?;
        if path.as_os_str() != "-" {
            info!("Wrote fiducials CSV: {}", path.display());
        }
    }
    Ok(())
}

fn write_fiducial_rows<W: Write>(
    fiducials: &[(&str, FiducialPoint)],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record(["channel", "kind", "index"])?;
    for (channel, point) in fiducials {
        writer.write_record([
            channel.to_string(),
            point.kind.label().to_string(),
            point.index.to_string(),
        ])?;
    }
    Ok(())
}

fn handle_pipelines(args: PipelinesArgs) -> Result<()> {
    let catalogue = pwv_study::list_pipelines();
    let text = serde_json::to_string_pretty(&catalogue)?;
    if args.output.as_os_str() == "-" {
        println!("{text}");
    } else {
        fs::write(&args.output, text)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Wrote pipeline catalogue: {}", args.output.display());
    }
    Ok(())
}

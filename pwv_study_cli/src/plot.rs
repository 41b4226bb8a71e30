use std::panic;
use std::path::Path;

use anyhow::Result;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};
use pwv_study::{BlandAltman, PipelineKind};

#[derive(Clone, Copy, Debug)]
pub enum ChartKind {
    Png,
    Svg,
}

impl ChartKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ChartKind::Png => "png",
            ChartKind::Svg => "svg",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PointSeries {
    pub kind: PipelineKind,
    pub points: Vec<(f64, f64)>,
}

#[derive(Clone, Debug)]
pub struct AgreementSeries {
    pub kind: PipelineKind,
    /// (mean, difference) pairs.
    pub points: Vec<(f64, f64)>,
    pub stats: Option<BlandAltman>,
}

const CHART_SIZE: (u32, u32) = (1280, 760);

/// Run a render closure, turning both errors and backend panics (missing
/// fonts, unwritable paths) into a message the caller can log and skip.
pub fn render_chart_guard<F>(render: F) -> Result<(), String>
where
    F: FnOnce() -> Result<()>,
{
    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
        .map_err(|e| format!("plotting error: {e}"))
}

pub fn pipeline_color(kind: PipelineKind) -> RGBColor {
    match kind {
        PipelineKind::WindowAligned => RGBColor(31, 119, 180),
        PipelineKind::FeatureLag => RGBColor(255, 127, 14),
        PipelineKind::HybridMedian => RGBColor(44, 160, 44),
        PipelineKind::ClusterGuided => RGBColor(214, 39, 40),
    }
}

fn axis_font() -> FontDesc<'static> {
    FontDesc::new(FontFamily::SansSerif, 18.0, FontStyle::Normal)
}

fn padded_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.08).max(1e-3);
    (lo - pad, hi + pad)
}

/// Per-beat lag over recording time, one colour per pipeline.
pub fn render_beat_scatter(path: &Path, kind: ChartKind, series: &[PointSeries]) -> Result<()> {
    if series.iter().all(|s| s.points.is_empty()) {
        return Ok(());
    }
    match kind {
        ChartKind::Png => draw_scatter(
            BitMapBackend::new(path, CHART_SIZE).into_drawing_area(),
            series,
            "Per-beat lag",
            "time (s)",
            "lag (ms)",
        ),
        ChartKind::Svg => draw_scatter(
            SVGBackend::new(path, CHART_SIZE).into_drawing_area(),
            series,
            "Per-beat lag",
            "time (s)",
            "lag (ms)",
        ),
    }
}

/// Lag error against a swept variable, one line per pipeline.
pub fn render_stability_curve(path: &Path, kind: ChartKind, series: &[PointSeries]) -> Result<()> {
    if series.iter().all(|s| s.points.is_empty()) {
        return Ok(());
    }
    match kind {
        ChartKind::Png => draw_lines(
            BitMapBackend::new(path, CHART_SIZE).into_drawing_area(),
            series,
            "Stability",
            "noise SNR (dB)",
            "mean |lag error| (ms)",
        ),
        ChartKind::Svg => draw_lines(
            SVGBackend::new(path, CHART_SIZE).into_drawing_area(),
            series,
            "Stability",
            "noise SNR (dB)",
            "mean |lag error| (ms)",
        ),
    }
}

pub fn render_bland_altman(path: &Path, kind: ChartKind, series: &[AgreementSeries]) -> Result<()> {
    if series.iter().all(|s| s.points.is_empty()) {
        return Ok(());
    }
    match kind {
        ChartKind::Png => draw_bland_altman(
            BitMapBackend::new(path, CHART_SIZE).into_drawing_area(),
            series,
        ),
        ChartKind::Svg => {
            draw_bland_altman(SVGBackend::new(path, CHART_SIZE).into_drawing_area(), series)
        }
    }
}

pub fn render_flow_diagram(path: &Path, kind: ChartKind, kinds: &[PipelineKind]) -> Result<()> {
    match kind {
        ChartKind::Png => draw_flow(
            BitMapBackend::new(path, (1400, 520)).into_drawing_area(),
            kinds,
        ),
        ChartKind::Svg => draw_flow(SVGBackend::new(path, (1400, 520)).into_drawing_area(), kinds),
    }
}

fn draw_scatter<DB>(
    area: DrawingArea<DB, Shift>,
    series: &[PointSeries],
    caption: &str,
    x_desc: &str,
    y_desc: &str,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    area.fill(&WHITE)?;
    let (x0, x1) = padded_range(series.iter().flat_map(|s| s.points.iter().map(|p| p.0)));
    let (y0, y1) = padded_range(series.iter().flat_map(|s| s.points.iter().map(|p| p.1)));
    let mut chart = ChartBuilder::on(&area)
        .caption(caption, axis_font())
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 45)
        .build_cartesian_2d(x0..x1, y0..y1)?;
    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .x_desc(x_desc)
        .y_desc(y_desc)
        .label_style(axis_font().color(&BLACK.mix(0.85)))
        .draw()?;

    for s in series {
        let color = pipeline_color(s.kind);
        chart
            .draw_series(
                s.points
                    .iter()
                    .map(move |&(x, y)| Circle::new((x, y), 3, color.filled())),
            )?
            .label(s.kind.label())
            .legend(move |(x, y)| Circle::new((x + 10, y), 4, color.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .position(SeriesLabelPosition::UpperRight)
        .draw()?;
    area.present()?;
    Ok(())
}

fn draw_lines<DB>(
    area: DrawingArea<DB, Shift>,
    series: &[PointSeries],
    caption: &str,
    x_desc: &str,
    y_desc: &str,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    area.fill(&WHITE)?;
    let (x0, x1) = padded_range(series.iter().flat_map(|s| s.points.iter().map(|p| p.0)));
    let (_, y1) = padded_range(series.iter().flat_map(|s| s.points.iter().map(|p| p.1)));
    let mut chart = ChartBuilder::on(&area)
        .caption(caption, axis_font())
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 45)
        .build_cartesian_2d(x0..x1, 0.0..y1.max(1.0))?;
    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .x_desc(x_desc)
        .y_desc(y_desc)
        .label_style(axis_font().color(&BLACK.mix(0.85)))
        .draw()?;

    for s in series {
        let color = pipeline_color(s.kind);
        let style = ShapeStyle {
            color: color.to_rgba(),
            filled: false,
            stroke_width: 2,
        };
        chart
            .draw_series(LineSeries::new(s.points.iter().copied(), style))?
            .label(s.kind.label())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], color));
        chart.draw_series(
            s.points
                .iter()
                .map(move |&(x, y)| Circle::new((x, y), 4, color.filled())),
        )?;
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .position(SeriesLabelPosition::UpperRight)
        .draw()?;
    area.present()?;
    Ok(())
}

fn draw_bland_altman<DB>(area: DrawingArea<DB, Shift>, series: &[AgreementSeries]) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    area.fill(&WHITE)?;
    let (x0, x1) = padded_range(series.iter().flat_map(|s| s.points.iter().map(|p| p.0)));
    let limits = series
        .iter()
        .filter_map(|s| s.stats.as_ref())
        .flat_map(|b| [b.lower_loa, b.upper_loa]);
    let (y0, y1) = padded_range(
        series
            .iter()
            .flat_map(|s| s.points.iter().map(|p| p.1))
            .chain(limits),
    );
    let mut chart = ChartBuilder::on(&area)
        .caption("Bland-Altman: estimated vs true velocity", axis_font())
        .margin(25)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 45)
        .build_cartesian_2d(x0..x1, y0..y1)?;
    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .x_desc("mean of estimate and truth (m/s)")
        .y_desc("estimate - truth (m/s)")
        .label_style(axis_font().color(&BLACK.mix(0.85)))
        .draw()?;

    for s in series {
        let color = pipeline_color(s.kind);
        chart
            .draw_series(
                s.points
                    .iter()
                    .map(move |&(x, y)| Circle::new((x, y), 3, color.mix(0.7).filled())),
            )?
            .label(s.kind.label())
            .legend(move |(x, y)| Circle::new((x + 10, y), 4, color.filled()));
        if let Some(stats) = s.stats.as_ref() {
            let bias = ShapeStyle {
                color: color.to_rgba(),
                filled: false,
                stroke_width: 2,
            };
            let loa = ShapeStyle {
                color: color.mix(0.5),
                filled: false,
                stroke_width: 1,
            };
            chart.draw_series(LineSeries::new([(x0, stats.bias), (x1, stats.bias)], bias))?;
            for y in [stats.lower_loa, stats.upper_loa] {
                chart.draw_series(LineSeries::new([(x0, y), (x1, y)], loa))?;
            }
        }
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.7))
        .border_style(&BLACK.mix(0.3))
        .position(SeriesLabelPosition::UpperRight)
        .draw()?;
    area.present()?;
    Ok(())
}

const FLOW_STAGES: [&str; 9] = [
    "Low-pass FIR",
    "Derivatives",
    "Rise points",
    "Valleys + refine",
    "Beat k-means",
    "Causal pairing",
    "MAD / median / mode",
    "Consensus",
    "Velocity",
];

/// Indices into `FLOW_STAGES` a pipeline passes through.
pub fn stages_for(kind: PipelineKind) -> &'static [usize] {
    match kind {
        PipelineKind::WindowAligned => &[0, 1, 2, 3, 5, 6, 8],
        PipelineKind::FeatureLag => &[0, 1, 2, 5, 6, 8],
        PipelineKind::HybridMedian => &[0, 1, 2, 3, 5, 6, 7, 8],
        PipelineKind::ClusterGuided => &[0, 1, 2, 3, 4, 5, 6, 8],
    }
}

fn draw_flow<DB>(area: DrawingArea<DB, Shift>, kinds: &[PipelineKind]) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    area.fill(&WHITE)?;
    let label_font = FontDesc::new(FontFamily::SansSerif, 15.0, FontStyle::Normal);
    let left = 190;
    let box_w = 118;
    let gap = 16;
    let top = 30;
    let box_h = 48;

    for (i, stage) in FLOW_STAGES.iter().enumerate() {
        let x = left + i as i32 * (box_w + gap);
        area.draw(&Rectangle::new(
            [(x, top), (x + box_w, top + box_h)],
            RGBColor(235, 235, 245).filled(),
        ))?;
        area.draw(&Rectangle::new(
            [(x, top), (x + box_w, top + box_h)],
            BLACK.mix(0.6).stroke_width(1),
        ))?;
        area.draw(&Text::new(
            stage.to_string(),
            (x + 6, top + box_h / 2 - 7),
            label_font.clone().color(&BLACK),
        ))?;
        if i + 1 < FLOW_STAGES.len() {
            let y = top + box_h / 2;
            area.draw(&PathElement::new(
                vec![(x + box_w, y), (x + box_w + gap, y)],
                BLACK.stroke_width(2),
            ))?;
        }
    }

    for (row, &kind) in kinds.iter().enumerate() {
        let y = top + box_h + 50 + row as i32 * 60;
        let color = pipeline_color(kind);
        area.draw(&Text::new(
            kind.label().to_string(),
            (20, y - 8),
            label_font.clone().color(&color),
        ))?;
        let centers: Vec<(i32, i32)> = stages_for(kind)
            .iter()
            .map(|&s| (left + s as i32 * (box_w + gap) + box_w / 2, y))
            .collect();
        area.draw(&PathElement::new(centers.clone(), color.stroke_width(3)))?;
        for c in centers {
            area.draw(&Circle::new(c, 8, color.filled()))?;
        }
    }

    area.present()?;
    Ok(())
}

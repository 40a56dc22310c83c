use camino::{Utf8Path, Utf8PathBuf};
use plotters::prelude::*;
use tracing::info;

use crate::error::PipelineError;
use crate::report::MakeValue;

pub const CHART_FILE_NAME: &str = "top_makes_prices.svg";
const CHART_SIZE: (u32, u32) = (1200, 600);

fn render_error(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Render(err.to_string())
}

/// Writes a bar chart of mean sale price per make into `reports_dir`.
pub fn render_top_makes(
    makes: &[MakeValue],
    reports_dir: &Utf8Path,
) -> Result<Utf8PathBuf, PipelineError> {
    if makes.is_empty() {
        return Err(PipelineError::EmptyResult("no makes to chart".to_string()));
    }
    std::fs::create_dir_all(reports_dir)
        .map_err(|err| PipelineError::Filesystem(format!("{reports_dir}: {err}")))?;
    let path = reports_dir.join(CHART_FILE_NAME);

    let ceiling = makes
        .iter()
        .map(|entry| entry.value)
        .fold(0.0_f64, f64::max)
        .max(1.0)
        * 1.1;
    let label = |value: &SegmentValue<usize>| match value {
        SegmentValue::CenterOf(index) => makes
            .get(*index)
            .map(|entry| entry.make.clone())
            .unwrap_or_default(),
        _ => String::new(),
    };

    {
        let root = SVGBackend::new(path.as_std_path(), CHART_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(render_error)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(
                "Top 10 Most Expensive Car Makes (Average Sale Price)",
                ("sans-serif", 24),
            )
            .margin(16)
            .x_label_area_size(60)
            .y_label_area_size(90)
            .build_cartesian_2d((0..makes.len()).into_segmented(), 0.0..ceiling)
            .map_err(render_error)?;
        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(makes.len())
            .x_label_formatter(&label)
            .x_desc("Make")
            .y_desc("Price (USD)")
            .draw()
            .map_err(render_error)?;
        chart
            .draw_series(
                Histogram::vertical(&chart)
                    .style(RGBColor(68, 1, 84).filled())
                    .margin(8)
                    .data(makes.iter().enumerate().map(|(index, entry)| (index, entry.value))),
            )
            .map_err(render_error)?;
        root.present().map_err(render_error)?;
    }

    info!(path = %path, "chart saved");
    Ok(path)
}

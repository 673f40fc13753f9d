//! Export of aggregated views, trend series and dispersion statistics.
//!
//! Supports CSV and JSON, with optional gzip when written to disk. Undefined
//! rates serialize as an empty CSV cell or JSON `null`, never as 0.

use csv::WriterBuilder;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::analyzers::filter::QuarterSelection;
use crate::analyzers::types::{
    AggregatedView, DispersionStats, GroupKey, Grouping, Period, TrendSeries,
};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("unknown export format '{other}'")),
        }
    }
}

/// One exported group. Carries the counts so rates can be recomputed offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub grouping: Grouping,
    pub key: String,
    pub label: String,
    /// `all` or the selected quarter, e.g. `2024-Q1`.
    pub quarter: String,
    pub fleet_size: u64,
    pub ev_electric_count: u64,
    pub ev_gas_count: u64,
    pub members: usize,
    pub weighted_rate: Option<f64>,
}

impl ViewRow {
    pub fn new(view: &AggregatedView, quarter: &QuarterSelection) -> Self {
        Self {
            grouping: view.key.grouping(),
            key: view.key.code().to_string(),
            label: view.label.clone(),
            quarter: quarter.to_string(),
            fleet_size: view.fleet_size,
            ev_electric_count: view.ev_electric_count,
            ev_gas_count: view.ev_gas_count,
            members: view.members,
            weighted_rate: view.weighted_rate,
        }
    }

    pub fn into_view(self) -> AggregatedView {
        AggregatedView {
            key: GroupKey::from_parts(self.grouping, &self.key),
            label: self.label,
            fleet_size: self.fleet_size,
            ev_electric_count: self.ev_electric_count,
            ev_gas_count: self.ev_gas_count,
            members: self.members,
            weighted_rate: self.weighted_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendRow {
    pub key: String,
    pub period: Period,
    pub label: String,
    pub fleet_size: u64,
    pub ev_electric_count: u64,
    pub weighted_rate: Option<f64>,
    pub delta: Option<f64>,
}

/// Flat form of [`DispersionStats`] without the Lorenz points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispersionRow {
    pub period: Period,
    pub grouping: Grouping,
    pub groups: usize,
    pub mean_rate: Option<f64>,
    pub stddev_rate: Option<f64>,
    pub coefficient_of_variation: Option<f64>,
    pub min_rate: Option<f64>,
    pub median_rate: Option<f64>,
    pub max_rate: Option<f64>,
    pub gini: Option<f64>,
    pub top10_ev_share: Option<f64>,
}

impl From<&DispersionStats> for DispersionRow {
    fn from(d: &DispersionStats) -> Self {
        Self {
            period: d.period,
            grouping: d.grouping,
            groups: d.groups,
            mean_rate: d.mean_rate,
            stddev_rate: d.stddev_rate,
            coefficient_of_variation: d.coefficient_of_variation,
            min_rate: d.min_rate,
            median_rate: d.median_rate,
            max_rate: d.max_rate,
            gini: d.gini,
            top10_ev_share: d.top10_ev_share,
        }
    }
}

/// Serializes flat rows as CSV (with header) or a JSON array.
pub fn export_rows<T: Serialize>(rows: &[T], format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => serde_json::to_vec_pretty(rows).map_err(PipelineError::ExportJson),
        ExportFormat::Csv => {
            let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
            for row in rows {
                writer.serialize(row).map_err(PipelineError::ExportCsv)?;
            }
            writer.flush().map_err(PipelineError::ExportIo)?;
            writer
                .into_inner()
                .map_err(|e| PipelineError::ExportIo(e.into_error()))
        }
    }
}

/// Exports exactly the given views, one row each, in the given order.
pub fn export_views(
    views: &[AggregatedView],
    quarter: &QuarterSelection,
    format: ExportFormat,
) -> Result<Vec<u8>> {
    let rows: Vec<ViewRow> = views.iter().map(|v| ViewRow::new(v, quarter)).collect();
    debug!(rows = rows.len(), ?format, "Exporting views");
    export_rows(&rows, format)
}

pub fn export_trend(series: &TrendSeries, format: ExportFormat) -> Result<Vec<u8>> {
    let rows: Vec<TrendRow> = series
        .points
        .iter()
        .map(|p| TrendRow {
            key: series.key.to_string(),
            period: p.period,
            label: p.period.label(),
            fleet_size: p.fleet_size,
            ev_electric_count: p.ev_electric_count,
            weighted_rate: p.weighted_rate,
            delta: p.delta,
        })
        .collect();
    export_rows(&rows, format)
}

/// JSON keeps the Lorenz curve; CSV holds one summary row per quarter.
pub fn export_dispersion(stats: &[DispersionStats], format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => export_rows(stats, format),
        ExportFormat::Csv => {
            let rows: Vec<DispersionRow> = stats.iter().map(DispersionRow::from).collect();
            export_rows(&rows, format)
        }
    }
}

/// Reads a CSV produced by [`export_views`] back into views.
pub fn read_views(bytes: &[u8]) -> Result<Vec<AggregatedView>> {
    read_rows::<ViewRow>(bytes).map(|rows| rows.into_iter().map(ViewRow::into_view).collect())
}

fn read_rows<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    let mut rdr = csv::Reader::from_reader(bytes);
    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        rows.push(result.map_err(PipelineError::ExportCsv)?);
    }
    Ok(rows)
}

/// Writes an export to `path`, gzip-compressed when `gzip` is set.
pub fn write_export(path: &Path, bytes: &[u8], gzip: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(PipelineError::ExportIo)?;
        }
    }
    let body = if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).map_err(PipelineError::ExportIo)?;
        encoder.finish().map_err(PipelineError::ExportIo)?
    } else {
        bytes.to_vec()
    };
    std::fs::write(path, &body).map_err(PipelineError::ExportIo)?;
    info!(path = %path.display(), bytes = body.len(), gzip, "Export written");
    Ok(())
}

//! Row filtering and derivation of typed fields.
//!
//! [`clean`] is a pure function from raw rows to the canonical
//! [`CleanRecord`] set. Every dropped row is accounted for in the returned
//! [`CleanReport`].

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;

use crate::analyzers::types::Period;
use crate::config::{PipelineConfig, RateBounds};
use crate::error::MalformedReason;
use crate::loader::RawRecord;

/// Placeholder labels that stand for a missing value rather than a place.
const EMPTY_PLACEHOLDERS: [&str; 3] = ["NA", "NAN", "NONE"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanRecord {
    pub municipality_code: String,
    pub municipality_label: String,
    pub department: String,
    pub report_date: NaiveDate,
    pub year: i32,
    pub quarter: u8,
    pub fleet_size: u64,
    pub ev_electric_count: u64,
    pub ev_gas_count: u64,
    /// Bounded per-row rate; `None` when the fleet is empty.
    pub adoption_rate: Option<f64>,
}

impl CleanRecord {
    pub fn period(&self) -> Period {
        Period {
            year: self.year,
            quarter: self.quarter,
        }
    }
}

/// Audit trail of one cleaning pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanReport {
    pub input_rows: usize,
    pub kept_rows: usize,
    /// Rows whose label is a non-municipal sentinel.
    pub sentinel_dropped: usize,
    pub malformed: BTreeMap<MalformedReason, usize>,
    /// Kept rows whose rate had to be clamped (counts are left as published).
    pub clamped_rates: usize,
    /// Kept rows with an empty fleet, hence an undefined rate.
    pub undefined_rates: usize,
}

impl CleanReport {
    pub fn malformed_total(&self) -> usize {
        self.malformed.values().sum()
    }

    pub fn dropped_total(&self) -> usize {
        self.sentinel_dropped + self.malformed_total()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanOutput {
    pub records: Vec<CleanRecord>,
    pub report: CleanReport,
}

/// What the cleaner needs from [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct CleanerSettings {
    /// Sentinels in normalised form.
    sentinels: BTreeSet<String>,
    bounds: RateBounds,
}

impl CleanerSettings {
    pub fn new<'a>(labels: impl IntoIterator<Item = &'a str>, bounds: RateBounds) -> Self {
        Self {
            sentinels: labels.into_iter().map(normalize_label).collect(),
            bounds,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.sentinel_labels.iter().map(String::as_str),
            config.rate_bounds,
        )
    }

    pub fn is_sentinel(&self, label: &str) -> bool {
        self.sentinels.contains(&normalize_label(label))
    }
}

/// Upper-case, accent-free form with separators collapsed to single spaces.
///
/// `"Non-identifiée"` and `"NON IDENTIFIEE"` normalise to the same string.
pub fn normalize_label(label: &str) -> String {
    let stripped: String = label
        .nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();
    stripped
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Department code of an INSEE commune code: three characters overseas
/// (`97x`, `98x`), two otherwise (including Corsica's `2A`/`2B`).
pub fn department_code(municipality_code: &str) -> String {
    let code = municipality_code.trim();
    let len = if code.starts_with("97") || code.starts_with("98") {
        3
    } else {
        2
    };
    code.chars().take(len).collect()
}

/// Filters raw rows and derives year, quarter and the bounded rate.
///
/// Output order follows input order, but callers must not rely on it.
pub fn clean(raw: &[RawRecord], settings: &CleanerSettings) -> CleanOutput {
    let mut report = CleanReport {
        input_rows: raw.len(),
        ..Default::default()
    };
    let mut records = Vec::with_capacity(raw.len());

    for row in raw {
        match clean_row(row, settings) {
            Ok(Some(record)) => {
                if record.adoption_rate.is_none() {
                    report.undefined_rates += 1;
                } else if exceeds_bounds(&record, settings.bounds) {
                    report.clamped_rates += 1;
                }
                records.push(record);
            }
            Ok(None) => report.sentinel_dropped += 1,
            Err(reason) => {
                debug!(code = %row.municipality_code, %reason, "Dropping malformed row");
                *report.malformed.entry(reason).or_default() += 1;
            }
        }
    }

    report.kept_rows = records.len();
    info!(
        input = report.input_rows,
        kept = report.kept_rows,
        sentinel = report.sentinel_dropped,
        malformed = report.malformed_total(),
        clamped = report.clamped_rates,
        "Cleaning pass complete"
    );
    for (reason, count) in &report.malformed {
        info!(%reason, count, "Malformed rows dropped");
    }

    CleanOutput { records, report }
}

/// `Ok(None)` for sentinel rows, `Err` for malformed ones.
fn clean_row(
    row: &RawRecord,
    settings: &CleanerSettings,
) -> Result<Option<CleanRecord>, MalformedReason> {
    let label = row.municipality_label.trim();
    let normalized = normalize_label(label);
    if normalized.is_empty() || EMPTY_PLACEHOLDERS.contains(&normalized.as_str()) {
        return Err(MalformedReason::MissingLabel);
    }
    if settings.sentinels.contains(&normalized) {
        return Ok(None);
    }

    let (Some(fleet), Some(electric)) = (row.fleet_size, row.ev_electric_count) else {
        return Err(MalformedReason::MissingCount);
    };
    if fleet < 0 || electric < 0 || row.ev_gas_count < 0 {
        return Err(MalformedReason::NegativeCount);
    }
    let report_date = row.report_date.ok_or(MalformedReason::MissingDate)?;

    let period = Period::from_date(report_date);
    let fleet_size = fleet as u64;
    let ev_electric_count = electric as u64;

    Ok(Some(CleanRecord {
        municipality_code: row.municipality_code.trim().to_string(),
        municipality_label: label.to_string(),
        department: department_code(&row.municipality_code),
        report_date,
        year: period.year,
        quarter: period.quarter,
        fleet_size,
        ev_electric_count,
        ev_gas_count: row.ev_gas_count as u64,
        adoption_rate: settings.bounds.rate(ev_electric_count, fleet_size),
    }))
}

fn exceeds_bounds(record: &CleanRecord, bounds: RateBounds) -> bool {
    let unclamped = record.ev_electric_count as f64 / record.fleet_size as f64 * 100.0;
    unclamped < bounds.min || unclamped > bounds.max
}

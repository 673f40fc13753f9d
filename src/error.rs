//! Error taxonomy for the ingestion and aggregation pipeline.
//!
//! Fatal failures are [`PipelineError`] values. Recoverable row problems are
//! not errors: they are counted per [`MalformedReason`] in the cleaner's
//! report so that dropped rows can always be audited.

use serde::Serialize;

/// Fatal pipeline failure. The message always names the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Neither the remote endpoint nor the local cache could be read.
    #[error("loader: source unavailable ({source_locator}): {reason}")]
    SourceUnavailable {
        source_locator: String,
        reason: String,
    },

    /// One or more required columns are absent from the input header.
    #[error("loader: schema mismatch, missing column(s): {}", missing.join(", "))]
    SchemaMismatch { missing: Vec<String> },

    #[error("loader: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("loader: malformed table: {0}")]
    Csv(#[from] csv::Error),

    #[error("loader: HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("config: {0}")]
    InvalidConfig(String),

    #[error("export: csv: {0}")]
    ExportCsv(csv::Error),

    #[error("export: json: {0}")]
    ExportJson(serde_json::Error),

    #[error("export: I/O error: {0}")]
    ExportIo(std::io::Error),

    /// A quarter label that could not be parsed.
    #[error("filter: invalid period '{0}' (expected e.g. 2024-Q1 or T1 2024)")]
    InvalidPeriod(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Why a raw row was dropped as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedReason {
    /// Empty label or a `NA`/`NaN`/`None` placeholder.
    MissingLabel,
    /// `DATE_ARRETE` missing or unparseable.
    MissingDate,
    /// Fleet or electric count missing or unparseable.
    MissingCount,
    /// Any count below zero.
    NegativeCount,
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MalformedReason::MissingLabel => "missing_label",
            MalformedReason::MissingDate => "missing_date",
            MalformedReason::MissingCount => "missing_count",
            MalformedReason::NegativeCount => "negative_count",
        };
        f.write_str(s)
    }
}

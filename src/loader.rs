//! Raw dataset loading.
//!
//! Resolves a source locator (local path or `http(s)://` URL), maintains the
//! optional offline cache, decodes the bytes and maps the delimited table into
//! [`RawRecord`]s. Only structural problems are reported here; semantic
//! validation belongs to the cleaner.

use chrono::NaiveDate;
use csv::{ReaderBuilder, Trim};
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fetch::{BasicClient, HttpClient, fetch_bytes};

pub const COL_CODE: &str = "CODGEO";
pub const COL_LABEL: &str = "LIBGEO";
pub const COL_DATE: &str = "DATE_ARRETE";
pub const COL_FLEET: &str = "NB_VP";
pub const COL_EV_ELECTRIC: &str = "NB_VP_RECHARGEABLES_EL";
pub const COL_EV_GAS: &str = "NB_VP_RECHARGEABLES_GAZ";

pub const REQUIRED_COLUMNS: [&str; 6] = [
    COL_CODE,
    COL_LABEL,
    COL_DATE,
    COL_FLEET,
    COL_EV_ELECTRIC,
    COL_EV_GAS,
];

/// One input line, typed only as far as the cells parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub municipality_code: String,
    pub municipality_label: String,
    pub report_date: Option<NaiveDate>,
    pub fleet_size: Option<i64>,
    pub ev_electric_count: Option<i64>,
    /// Alternative-fuel count, carried through untouched. Empty cells read as 0.
    pub ev_gas_count: i64,
}

/// Where the bytes of a dataset actually came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    Local,
    Remote,
    Cache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Local(PathBuf),
    Remote(String),
}

impl Source {
    pub fn parse(locator: &str) -> Self {
        let locator = locator.trim();
        if locator.starts_with("http://") || locator.starts_with("https://") {
            Source::Remote(locator.to_string())
        } else {
            Source::Local(PathBuf::from(locator))
        }
    }
}

/// Every raw record of one input snapshot.
#[derive(Debug, Clone)]
pub struct RawDataset {
    /// SHA-256 (hex) of the decoded input bytes.
    pub digest: String,
    pub origin: SourceOrigin,
    pub records: Vec<RawRecord>,
}

/// Loads the dataset named by `config.source`, using the configured cache as fallback.
pub async fn load(config: &PipelineConfig) -> Result<RawDataset> {
    let client = BasicClient::new(Duration::from_secs(config.request_timeout_secs))?;
    load_with(&client, &config.source, config.cache_path.as_deref()).await
}

/// Loads `locator` through `client`.
///
/// Remote sources refresh `cache` once the fetched body parses, and fall back
/// to it when the fetch fails or the body does not parse.
///
/// # Errors
///
/// [`PipelineError::SourceUnavailable`] when no copy of the data can be read,
/// [`PipelineError::SchemaMismatch`] when required columns are missing.
#[tracing::instrument(skip(client))]
pub async fn load_with<C: HttpClient>(
    client: &C,
    locator: &str,
    cache: Option<&Path>,
) -> Result<RawDataset> {
    let dataset = match Source::parse(locator) {
        Source::Local(path) => {
            let bytes = std::fs::read(&path).map_err(|e| PipelineError::SourceUnavailable {
                source_locator: locator.to_string(),
                reason: format!("cannot read {}: {e}", path.display()),
            })?;
            parse_dataset(&bytes, SourceOrigin::Local)?
        }
        Source::Remote(url) => match fetch_bytes(client, &url).await {
            // The cache only ever holds bytes that parsed.
            Ok(bytes) => match parse_dataset(&bytes, SourceOrigin::Remote) {
                Ok(dataset) => {
                    if let Some(cache) = cache {
                        if let Err(e) = write_cache(cache, &bytes) {
                            warn!(
                                cache = %cache.display(),
                                error = %e,
                                "Failed to refresh offline cache"
                            );
                        }
                    }
                    dataset
                }
                Err(parse_err) => {
                    warn!(error = %parse_err, "Remote body is unusable, trying offline cache");
                    match cache {
                        Some(cache) => load_cache(locator, cache, &parse_err)?,
                        None => return Err(parse_err),
                    }
                }
            },
            Err(remote_err) => {
                warn!(error = %remote_err, "Remote fetch failed, trying offline cache");
                let Some(cache) = cache else {
                    return Err(PipelineError::SourceUnavailable {
                        source_locator: locator.to_string(),
                        reason: format!("remote: {remote_err}; cache: not configured"),
                    });
                };
                load_cache(locator, cache, &remote_err)?
            }
        },
    };

    info!(
        origin = ?dataset.origin,
        rows = dataset.records.len(),
        digest = %dataset.digest,
        "Raw dataset loaded"
    );
    Ok(dataset)
}

fn load_cache(locator: &str, cache: &Path, remote_err: &PipelineError) -> Result<RawDataset> {
    let bytes = std::fs::read(cache).map_err(|e| PipelineError::SourceUnavailable {
        source_locator: locator.to_string(),
        reason: format!("remote: {remote_err}; cache {}: {e}", cache.display()),
    })?;
    parse_dataset(&bytes, SourceOrigin::Cache)
}

/// Decodes and parses an in-memory copy of the dataset.
pub fn parse_dataset(bytes: &[u8], origin: SourceOrigin) -> Result<RawDataset> {
    let raw = decompress(bytes)?;
    let digest = format!("{:x}", Sha256::digest(&raw));
    let records = parse_records(&decode_text(raw))?;
    Ok(RawDataset {
        digest,
        origin,
        records,
    })
}

/// Writes the cache through a temp file so readers never see a partial copy.
fn write_cache(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("partial");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    debug!(cache = %path.display(), bytes = bytes.len(), "Offline cache refreshed");
    Ok(())
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        MultiGzDecoder::new(bytes).read_to_end(&mut out)?;
        debug!(compressed = bytes.len(), decompressed = out.len(), "Gzip input inflated");
        Ok(out)
    } else {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 when valid, Latin-1 otherwise. A leading BOM is dropped.
fn decode_text(bytes: Vec<u8>) -> String {
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            debug!("Input is not UTF-8, decoding as Latin-1");
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };
    match text.strip_prefix('\u{feff}') {
        Some(stripped) => stripped.to_string(),
        None => text,
    }
}

fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or_default();
    let semicolons = header.matches(';').count();
    let commas = header.matches(',').count();
    if semicolons >= commas && semicolons > 0 {
        b';'
    } else {
        b','
    }
}

/// Maps a delimited table onto [`RawRecord`]s. Column order is free.
pub fn parse_records(text: &str) -> Result<Vec<RawRecord>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let positions: HashMap<String, usize> = rdr
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim().to_uppercase(), i))
        .collect();

    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| !positions.contains_key(**c))
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::SchemaMismatch { missing });
    }
    let idx = |name: &str| positions[name];
    let (code, label, date, fleet, el, gas) = (
        idx(COL_CODE),
        idx(COL_LABEL),
        idx(COL_DATE),
        idx(COL_FLEET),
        idx(COL_EV_ELECTRIC),
        idx(COL_EV_GAS),
    );

    let mut records = Vec::new();
    for row in rdr.records() {
        let row = row?;
        let cell = |i: usize| row.get(i).unwrap_or_default();
        records.push(RawRecord {
            municipality_code: normalize_code(cell(code)),
            municipality_label: cell(label).to_string(),
            report_date: parse_date(cell(date)),
            fleet_size: parse_count(cell(fleet)),
            ev_electric_count: parse_count(cell(el)),
            ev_gas_count: parse_count(cell(gas)).unwrap_or(0),
        });
    }
    Ok(records)
}

/// Restores the leading zero spreadsheets strip from 4-digit INSEE codes.
fn normalize_code(code: &str) -> String {
    if code.len() == 4 && code.bytes().all(|b| b.is_ascii_digit()) {
        format!("0{code}")
    } else {
        code.to_string()
    }
}

fn parse_date(cell: &str) -> Option<NaiveDate> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];
    let cell = cell.trim();
    FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(cell, f).ok())
        .or_else(|| {
            // datetimes such as 2024-03-31T00:00:00 or 2024-03-31 00:00:00
            let head = cell.get(..10)?;
            let rest = &cell[10..];
            if rest.starts_with(['T', ' ']) {
                NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
            } else {
                None
            }
        })
}

fn parse_count(cell: &str) -> Option<i64> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    if let Ok(n) = cell.parse::<i64>() {
        return Some(n);
    }
    let f = cell.parse::<f64>().ok()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

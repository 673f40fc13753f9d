//! Pipeline configuration.
//!
//! Stored as a JSON object on disk, every field optional:
//! ```json
//! {
//!   "source": "data/voitures-par-commune-par-energie.csv",
//!   "cache_path": "data/cache/voitures.csv",
//!   "sentinel_labels": ["Forains", "ND", "Non identifié"],
//!   "rate_bounds": { "min": 0.0, "max": 100.0 },
//!   "min_fleet_threshold": 100,
//!   "threshold_scope": "ranking_only",
//!   "request_timeout_secs": 60
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::analyzers::filter::ThresholdScope;
use crate::error::{PipelineError, Result};

pub const DEFAULT_SOURCE: &str = "data/voitures-par-commune-par-energie.csv";

/// Labels that mark non-municipal aggregates in the published dataset.
pub const DEFAULT_SENTINEL_LABELS: &[&str] = &[
    "Forain",
    "Forains",
    "ND",
    "Paris ND",
    "Non identifié",
    "Non identifiée",
    "Non identifiés",
    "Non identifiées",
    "Non défini",
    "Non définie",
    "Non définis",
    "Non définies",
    "Non renseigné",
    "Non renseignée",
    "Non renseignés",
    "Non renseignées",
    "Inconnu",
    "Inconnus",
    "Sans libellé",
    "Sans libellés",
    "Sans objet",
];

/// Closed interval a computed rate is clamped into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for RateBounds {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 100.0,
        }
    }
}

impl RateBounds {
    pub fn clamp(&self, rate: f64) -> f64 {
        rate.clamp(self.min, self.max)
    }

    /// `100 * part / total`, clamped. `None` when `total` is zero.
    ///
    /// The division always runs on the true counts; clamping only bounds
    /// the resulting ratio and never touches the counts themselves.
    pub fn rate(&self, part: u64, total: u64) -> Option<f64> {
        if total == 0 {
            return None;
        }
        Some(self.clamp(part as f64 / total as f64 * 100.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Local path or `http(s)://` URL of the raw dataset.
    pub source: String,
    /// Offline copy refreshed on every successful remote fetch.
    pub cache_path: Option<PathBuf>,
    pub sentinel_labels: BTreeSet<String>,
    pub rate_bounds: RateBounds,
    /// Default minimum fleet size for rankings and drilldowns.
    pub min_fleet_threshold: u64,
    pub threshold_scope: ThresholdScope,
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            cache_path: None,
            sentinel_labels: DEFAULT_SENTINEL_LABELS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rate_bounds: RateBounds::default(),
            min_fleet_threshold: 100,
            threshold_scope: ThresholdScope::RankingOnly,
            request_timeout_secs: 60,
        }
    }
}

impl PipelineConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::InvalidConfig(format!("cannot read {path}: {e}")))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|e| PipelineError::InvalidConfig(format!("cannot parse {path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `EV_SOURCE` and `EV_CACHE_PATH` if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(source) = std::env::var("EV_SOURCE") {
            self.source = source;
        }
        if let Ok(cache) = std::env::var("EV_CACHE_PATH") {
            self.cache_path = Some(PathBuf::from(cache));
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let RateBounds { min, max } = self.rate_bounds;
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(PipelineError::InvalidConfig(format!(
                "rate_bounds must satisfy min <= max, got ({min}, {max})"
            )));
        }
        if self.source.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "source must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    #[test]
    fn test_rate_zero_total_is_undefined() {
        assert_eq!(RateBounds::default().rate(5, 0), None);
        assert_eq!(RateBounds::default().rate(0, 0), None);
    }

    #[test]
    fn test_rate_true_zero_is_defined() {
        assert_eq!(RateBounds::default().rate(0, 10), Some(0.0));
    }

    #[test]
    fn test_rate_is_clamped() {
        assert_eq!(RateBounds::default().rate(12, 10), Some(100.0));
    }

    #[test]
    fn test_clamp_idempotent() {
        let bounds = RateBounds::default();
        for x in [-50.0, -0.0, 0.0, 3.5, 99.999, 100.0, 100.5, 1e9, f64::MIN] {
            let once = bounds.clamp(x);
            assert_eq!(bounds.clamp(once), once);
            assert!((0.0..=100.0).contains(&once));
        }
    }

    #[test]
    fn test_defaults_include_forains() {
        let config = PipelineConfig::default();
        assert!(config.sentinel_labels.contains("Forains"));
        assert_eq!(config.threshold_scope, ThresholdScope::RankingOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let path = temp_path("ev_adoption_test_config.json");
        fs::write(
            &path,
            r#"{ "min_fleet_threshold": 500, "rate_bounds": {"min": 0.0, "max": 50.0} }"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.min_fleet_threshold, 500);
        assert_eq!(config.rate_bounds.max, 50.0);
        assert_eq!(config.source, DEFAULT_SOURCE);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_rejects_inverted_bounds() {
        let path = temp_path("ev_adoption_test_config_bad.json");
        fs::write(&path, r#"{ "rate_bounds": {"min": 10.0, "max": 1.0} }"#).unwrap();

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(err.to_string().starts_with("config:"));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_malformed_json_is_config_error() {
        let path = temp_path("ev_adoption_test_config_malformed.json");
        fs::write(&path, r#"{ "min_fleet_threshold": "#).unwrap();

        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
        assert!(err.to_string().starts_with("config:"));

        fs::remove_file(&path).unwrap();
    }
}

//! Record selection shared by the aggregation and trend stages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::analyzers::types::Period;
use crate::cleaner::CleanRecord;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuarterSelection {
    #[default]
    All,
    Single(Period),
}

impl QuarterSelection {
    pub fn matches(&self, period: Period) -> bool {
        match self {
            QuarterSelection::All => true,
            QuarterSelection::Single(p) => *p == period,
        }
    }
}

impl fmt::Display for QuarterSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarterSelection::All => f.write_str("all"),
            QuarterSelection::Single(p) => write!(f, "{p}"),
        }
    }
}

impl FromStr for QuarterSelection {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(QuarterSelection::All)
        } else {
            Ok(QuarterSelection::Single(s.parse()?))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DepartmentSelection {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl DepartmentSelection {
    /// An empty list means every department.
    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = codes
            .into_iter()
            .map(|c| c.as_ref().trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        if set.is_empty() {
            DepartmentSelection::All
        } else {
            DepartmentSelection::Only(set)
        }
    }

    pub fn matches(&self, department: &str) -> bool {
        match self {
            DepartmentSelection::All => true,
            DepartmentSelection::Only(set) => set.contains(department),
        }
    }
}

/// Where the minimum fleet size applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdScope {
    /// Small groups leave rankings and drilldowns but still count in totals.
    #[default]
    RankingOnly,
    /// Rows below the threshold are removed before any aggregation.
    Everywhere,
}

impl FromStr for ThresholdScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "ranking_only" | "ranking" => Ok(ThresholdScope::RankingOnly),
            "everywhere" | "all" => Ok(ThresholdScope::Everywhere),
            other => Err(format!("unknown threshold scope '{other}'")),
        }
    }
}

/// `97x` and `98x` departments (DROM and COM).
pub fn is_overseas(department: &str) -> bool {
    department.starts_with("97") || department.starts_with("98")
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterSpec {
    pub quarter: QuarterSelection,
    pub departments: DepartmentSelection,
    pub exclude_overseas: bool,
    pub min_fleet_size: u64,
    pub threshold_scope: ThresholdScope,
}

impl FilterSpec {
    pub fn with_quarter(mut self, quarter: QuarterSelection) -> Self {
        self.quarter = quarter;
        self
    }

    /// Geographic part of the filter only.
    pub fn matches_geography(&self, record: &CleanRecord) -> bool {
        self.departments.matches(&record.department)
            && !(self.exclude_overseas && is_overseas(&record.department))
    }

    /// Whether `record` takes part in aggregation under this filter.
    pub fn matches(&self, record: &CleanRecord) -> bool {
        self.quarter.matches(record.period())
            && self.matches_geography(record)
            && self.passes_row_threshold(record)
    }

    /// Row-level threshold, only active with [`ThresholdScope::Everywhere`].
    pub fn passes_row_threshold(&self, record: &CleanRecord) -> bool {
        match self.threshold_scope {
            ThresholdScope::RankingOnly => true,
            ThresholdScope::Everywhere => record.fleet_size >= self.min_fleet_size,
        }
    }

    pub fn select<'a>(&self, records: &'a [CleanRecord]) -> Vec<&'a CleanRecord> {
        records.iter().filter(|r| self.matches(r)).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn record(
        code: &str,
        label: &str,
        period: (i32, u8),
        fleet: u64,
        ev: u64,
    ) -> CleanRecord {
        let (year, quarter) = period;
        let month = u32::from(quarter) * 3;
        let report_date = NaiveDate::from_ymd_opt(year, month, 28).unwrap();
        CleanRecord {
            municipality_code: code.to_string(),
            municipality_label: label.to_string(),
            department: crate::cleaner::department_code(code),
            report_date,
            year,
            quarter,
            fleet_size: fleet,
            ev_electric_count: ev,
            ev_gas_count: 0,
            adoption_rate: crate::config::RateBounds::default().rate(ev, fleet),
        }
    }

    #[test]
    fn test_quarter_selection_parse() {
        assert_eq!("all".parse::<QuarterSelection>().unwrap(), QuarterSelection::All);
        assert_eq!(
            "T2 2024".parse::<QuarterSelection>().unwrap(),
            QuarterSelection::Single(Period::new(2024, 2).unwrap())
        );
    }

    #[test]
    fn test_department_selection_empty_is_all() {
        assert_eq!(DepartmentSelection::from_codes(Vec::<String>::new()), DepartmentSelection::All);
        let only = DepartmentSelection::from_codes(["2a", " 75 "]);
        assert!(only.matches("2A"));
        assert!(only.matches("75"));
        assert!(!only.matches("69"));
    }

    #[test]
    fn test_overseas_toggle() {
        let filter = FilterSpec {
            exclude_overseas: true,
            ..Default::default()
        };
        assert!(!filter.matches(&record("97411", "Saint-Denis", (2024, 1), 100, 1)));
        assert!(filter.matches(&record("75056", "Paris", (2024, 1), 100, 1)));
    }

    #[test]
    fn test_threshold_scope() {
        let small = record("01001", "A", (2024, 1), 50, 1);
        let ranking_only = FilterSpec {
            min_fleet_size: 100,
            ..Default::default()
        };
        assert!(ranking_only.matches(&small));

        let everywhere = FilterSpec {
            threshold_scope: ThresholdScope::Everywhere,
            ..ranking_only
        };
        assert!(!everywhere.matches(&small));
    }

    #[test]
    fn test_quarter_filter() {
        let filter = FilterSpec::default()
            .with_quarter(QuarterSelection::Single(Period::new(2024, 1).unwrap()));
        assert!(filter.matches(&record("01001", "A", (2024, 1), 10, 1)));
        assert!(!filter.matches(&record("01001", "A", (2024, 2), 10, 1)));
    }

    #[test]
    fn test_overseas_codes() {
        assert!(is_overseas("971"));
        assert!(is_overseas("988"));
        assert!(!is_overseas("75"));
        assert!(!is_overseas("2A"));
    }
}

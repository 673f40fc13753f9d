//! Data types shared by the aggregation, trend and export stages.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// A calendar quarter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub year: i32,
    /// 1..=4
    pub quarter: u8,
}

impl Period {
    pub fn new(year: i32, quarter: u8) -> Option<Self> {
        (1..=4).contains(&quarter).then_some(Self { year, quarter })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            quarter: (1 + (date.month0() / 3)) as u8,
        }
    }

    pub fn previous(&self) -> Self {
        if self.quarter == 1 {
            Self {
                year: self.year - 1,
                quarter: 4,
            }
        } else {
            Self {
                year: self.year,
                quarter: self.quarter - 1,
            }
        }
    }

    /// Dashboard label, e.g. `T3 2024`.
    pub fn label(&self) -> String {
        format!("T{} {}", self.quarter, self.year)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-Q{}", self.year, self.quarter)
    }
}

impl FromStr for Period {
    type Err = PipelineError;

    /// Accepts `2024-Q1`, `2024Q1`, `2024 Q1`, `T1 2024` and `Q1 2024`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::InvalidPeriod(s.to_string());
        let upper = s.trim().to_uppercase();

        let (year, quarter) = if let Some(rest) = upper
            .strip_prefix('T')
            .or_else(|| upper.strip_prefix('Q'))
        {
            let (q, y) = rest.split_once(' ').ok_or_else(invalid)?;
            (y.trim(), q.trim())
        } else {
            let idx = upper.find('Q').ok_or_else(invalid)?;
            let year = upper[..idx].trim_end_matches(['-', ' ']);
            (year, &upper[idx + 1..])
        };

        let year: i32 = year.parse().map_err(|_| invalid())?;
        let quarter: u8 = quarter.parse().map_err(|_| invalid())?;
        Period::new(year, quarter).ok_or_else(invalid)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Geographic level a view is partitioned by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    Commune,
    Department,
    National,
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Grouping::Commune => "commune",
            Grouping::Department => "department",
            Grouping::National => "national",
        })
    }
}

impl FromStr for Grouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "commune" | "communes" => Ok(Grouping::Commune),
            "department" | "departement" | "dep" => Ok(Grouping::Department),
            "national" | "nation" | "france" => Ok(Grouping::National),
            other => Err(format!("unknown grouping '{other}'")),
        }
    }
}

/// Identifier of one group. Ordering is by grouping, then code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKey {
    Commune(String),
    Department(String),
    National,
}

impl GroupKey {
    pub fn grouping(&self) -> Grouping {
        match self {
            GroupKey::Commune(_) => Grouping::Commune,
            GroupKey::Department(_) => Grouping::Department,
            GroupKey::National => Grouping::National,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            GroupKey::Commune(code) | GroupKey::Department(code) => code,
            GroupKey::National => "national",
        }
    }

    pub fn from_parts(grouping: Grouping, code: &str) -> Self {
        match grouping {
            Grouping::Commune => GroupKey::Commune(code.to_string()),
            Grouping::Department => GroupKey::Department(code.to_string()),
            Grouping::National => GroupKey::National,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.grouping(), self.code())
    }
}

impl FromStr for GroupKey {
    type Err = String;

    /// `national`, `department:75`, `commune:75056`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            Some((grouping, code)) => {
                let grouping: Grouping = grouping.parse()?;
                if grouping != Grouping::National && code.trim().is_empty() {
                    return Err(format!("missing code in group key '{s}'"));
                }
                Ok(GroupKey::from_parts(grouping, &code.trim().to_uppercase()))
            }
            None if s.eq_ignore_ascii_case("national") => Ok(GroupKey::National),
            None => Err(format!(
                "group key '{s}' must look like national, department:<code> or commune:<code>"
            )),
        }
    }
}

/// Weighted adoption figures for one group under the active filters.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedView {
    pub key: GroupKey,
    pub label: String,
    pub fleet_size: u64,
    pub ev_electric_count: u64,
    pub ev_gas_count: u64,
    /// Number of clean rows folded into this view.
    pub members: usize,
    /// `100 * sum(ev) / sum(fleet)`; `None` means "no data", never 0.
    pub weighted_rate: Option<f64>,
}

impl AggregatedView {
    pub fn has_data(&self) -> bool {
        self.weighted_rate.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub period: Period,
    pub fleet_size: u64,
    pub ev_electric_count: u64,
    pub weighted_rate: Option<f64>,
    /// Change in percentage points vs the immediately preceding quarter.
    pub delta: Option<f64>,
}

/// Chronological series for one group.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendSeries {
    pub key: GroupKey,
    pub points: Vec<TrendPoint>,
}

/// Start-to-end reading of a [`TrendSeries`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub start: Period,
    pub end: Period,
    pub rate_change: Option<f64>,
    pub ev_change: i64,
    pub ev_change_pct: Option<f64>,
    pub fleet_change: i64,
    pub fleet_change_pct: Option<f64>,
    /// Compound annual growth of the EV count, in percent.
    pub ev_cagr_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LorenzPoint {
    /// Cumulative share of the fleet, 0..=1.
    pub fleet_share: f64,
    /// Cumulative share of electric vehicles, 0..=1.
    pub ev_share: f64,
}

/// How unevenly adoption is spread across groups within one quarter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispersionStats {
    pub period: Period,
    pub grouping: Grouping,
    /// Groups with a defined rate.
    pub groups: usize,
    pub mean_rate: Option<f64>,
    pub stddev_rate: Option<f64>,
    pub coefficient_of_variation: Option<f64>,
    pub min_rate: Option<f64>,
    pub median_rate: Option<f64>,
    pub max_rate: Option<f64>,
    pub lorenz: Vec<LorenzPoint>,
    /// Gini coefficient from the Lorenz curve; `None` below two groups.
    pub gini: Option<f64>,
    /// Share (percent) of electric vehicles held by the ten best-equipped groups.
    pub top10_ev_share: Option<f64>,
}

/// Rate change of one group between two consecutive quarters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mover {
    pub key: String,
    pub label: String,
    pub rate: f64,
    pub previous_rate: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Movers {
    pub gains: Vec<Mover>,
    pub losses: Vec<Mover>,
}

/// Headline figures for one quarter, compared with the preceding one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiSummary {
    pub period: Period,
    pub fleet_size: u64,
    pub ev_electric_count: u64,
    pub weighted_rate: Option<f64>,
    pub communes: usize,
    pub previous_period: Period,
    pub fleet_delta: Option<i64>,
    pub ev_delta: Option<i64>,
    pub rate_delta: Option<f64>,
    pub communes_delta: Option<i64>,
}

/// One department in the prioritisation matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorityEntry {
    pub department: String,
    pub fleet_size: u64,
    pub ev_electric_count: u64,
    pub weighted_rate: f64,
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PriorityMatrix {
    pub entries: Vec<PriorityEntry>,
    pub median_rate: Option<f64>,
    pub fleet_p75: Option<f64>,
    /// Large fleets with a rate at or below the median.
    pub targets: Vec<PriorityEntry>,
}

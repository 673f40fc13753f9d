use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::analyzers::filter::{FilterSpec, QuarterSelection};
use crate::analyzers::types::{AggregatedView, GroupKey, Grouping, KpiSummary, Period};
use crate::cleaner::CleanRecord;
use crate::config::RateBounds;

pub const NATIONAL_LABEL: &str = "France";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Top,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankMetric {
    #[default]
    Rate,
    EvCount,
}

impl std::str::FromStr for RankMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rate" | "taux" => Ok(RankMetric::Rate),
            "ev" | "ev_count" | "count" => Ok(RankMetric::EvCount),
            other => Err(format!("unknown ranking metric '{other}'")),
        }
    }
}

/// Running sums for one group. Counts are the true published counts.
#[derive(Debug, Default)]
struct GroupTotals {
    fleet_size: u64,
    ev_electric_count: u64,
    ev_gas_count: u64,
    members: usize,
    /// Most recent label seen, ties broken by the label itself.
    latest_label: Option<(Period, String)>,
}

impl GroupTotals {
    fn add(&mut self, record: &CleanRecord) {
        self.fleet_size += record.fleet_size;
        self.ev_electric_count += record.ev_electric_count;
        self.ev_gas_count += record.ev_gas_count;
        self.members += 1;

        let candidate = (record.period(), record.municipality_label.as_str());
        let newer = match &self.latest_label {
            None => true,
            Some((period, label)) => candidate > (*period, label.as_str()),
        };
        if newer {
            self.latest_label = Some((record.period(), record.municipality_label.clone()));
        }
    }

    fn into_view(self, key: GroupKey, bounds: RateBounds) -> AggregatedView {
        let label = match &key {
            GroupKey::Commune(_) => self
                .latest_label
                .map(|(_, label)| label)
                .unwrap_or_default(),
            GroupKey::Department(code) => code.clone(),
            GroupKey::National => NATIONAL_LABEL.to_string(),
        };
        AggregatedView {
            weighted_rate: bounds.rate(self.ev_electric_count, self.fleet_size),
            key,
            label,
            fleet_size: self.fleet_size,
            ev_electric_count: self.ev_electric_count,
            ev_gas_count: self.ev_gas_count,
            members: self.members,
        }
    }
}

fn key_for(record: &CleanRecord, grouping: Grouping) -> GroupKey {
    match grouping {
        Grouping::Commune => GroupKey::Commune(record.municipality_code.clone()),
        Grouping::Department => GroupKey::Department(record.department.clone()),
        Grouping::National => GroupKey::National,
    }
}

/// Folds already-selected records into one view per group, sorted by key.
///
/// The national grouping always yields exactly one view, marked "no data"
/// when nothing was selected.
pub fn fold_views<'a>(
    records: impl IntoIterator<Item = &'a CleanRecord>,
    grouping: Grouping,
    bounds: RateBounds,
) -> Vec<AggregatedView> {
    let mut groups: BTreeMap<GroupKey, GroupTotals> = BTreeMap::new();
    if grouping == Grouping::National {
        groups.insert(GroupKey::National, GroupTotals::default());
    }
    for record in records {
        groups.entry(key_for(record, grouping)).or_default().add(record);
    }
    groups
        .into_iter()
        .map(|(key, totals)| totals.into_view(key, bounds))
        .collect()
}

/// Full listing of weighted rates per group for the records `filter` selects.
///
/// Rates come from summed counts, never from averaging per-row rates.
/// Groups with an empty total fleet are kept with `weighted_rate: None`.
pub fn aggregate(
    records: &[CleanRecord],
    filter: &FilterSpec,
    grouping: Grouping,
    bounds: RateBounds,
) -> Vec<AggregatedView> {
    fold_views(
        records.iter().filter(|r| filter.matches(r)),
        grouping,
        bounds,
    )
}

/// The first `n` views by `metric`. Views without data or with a total fleet
/// below `min_fleet` never rank. Ties resolve by group key, ascending.
pub fn rank(
    views: &[AggregatedView],
    order: Order,
    metric: RankMetric,
    n: usize,
    min_fleet: u64,
) -> Vec<&AggregatedView> {
    let mut eligible: Vec<&AggregatedView> = views
        .iter()
        .filter(|v| v.has_data() && v.fleet_size >= min_fleet)
        .collect();

    eligible.sort_by(|a, b| {
        let by_metric = match metric {
            RankMetric::Rate => {
                let (ra, rb) = (a.weighted_rate.unwrap_or(0.0), b.weighted_rate.unwrap_or(0.0));
                ra.total_cmp(&rb)
            }
            RankMetric::EvCount => a.ev_electric_count.cmp(&b.ev_electric_count),
        };
        let by_metric = match order {
            Order::Top => by_metric.reverse(),
            Order::Bottom => by_metric,
        };
        by_metric.then_with(|| a.key.cmp(&b.key))
    });

    eligible.truncate(n);
    eligible
}

/// Communes of one department, best rate first, "no data" communes last.
/// Communes below the filter's minimum fleet size are left out.
pub fn drilldown(
    records: &[CleanRecord],
    department: &str,
    filter: &FilterSpec,
    bounds: RateBounds,
) -> Vec<AggregatedView> {
    let department = department.trim().to_uppercase();
    let mut views = fold_views(
        records
            .iter()
            .filter(|r| r.department == department && filter.matches(r)),
        Grouping::Commune,
        bounds,
    );
    views.retain(|v| v.fleet_size >= filter.min_fleet_size);
    views.sort_by(|a, b| match (a.weighted_rate, b.weighted_rate) {
        (Some(ra), Some(rb)) => rb.total_cmp(&ra).then_with(|| a.key.cmp(&b.key)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.key.cmp(&b.key),
    });
    views
}

pub fn available_periods(records: &[CleanRecord]) -> Vec<Period> {
    records
        .iter()
        .map(CleanRecord::period)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn available_departments(records: &[CleanRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.department.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// National headline figures for the selected quarter (the latest one when
/// the selection is `All`), with deltas against the preceding quarter.
///
/// Returns `None` when no record matches the geographic filters.
pub fn summary(
    records: &[CleanRecord],
    filter: &FilterSpec,
    bounds: RateBounds,
) -> Option<KpiSummary> {
    let period = match filter.quarter {
        QuarterSelection::Single(p) => p,
        QuarterSelection::All => records
            .iter()
            .filter(|r| filter.matches_geography(r))
            .map(CleanRecord::period)
            .max()?,
    };
    let previous_period = period.previous();

    let totals_for = |p: Period| {
        let scoped = filter.clone().with_quarter(QuarterSelection::Single(p));
        let selected = scoped.select(records);
        let communes = selected
            .iter()
            .map(|r| r.municipality_code.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let view = fold_views(selected, Grouping::National, bounds)
            .into_iter()
            .next()
            .unwrap_or_else(|| GroupTotals::default().into_view(GroupKey::National, bounds));
        (view, communes)
    };

    let (current, communes) = totals_for(period);
    let (previous, previous_communes) = totals_for(previous_period);
    let has_previous = previous.members > 0;

    let diff = |a: u64, b: u64| a as i64 - b as i64;
    Some(KpiSummary {
        period,
        fleet_size: current.fleet_size,
        ev_electric_count: current.ev_electric_count,
        weighted_rate: current.weighted_rate,
        communes,
        previous_period,
        fleet_delta: has_previous.then(|| diff(current.fleet_size, previous.fleet_size)),
        ev_delta: has_previous
            .then(|| diff(current.ev_electric_count, previous.ev_electric_count)),
        rate_delta: match (current.weighted_rate, previous.weighted_rate) {
            (Some(c), Some(p)) => Some(c - p),
            _ => None,
        },
        communes_delta: has_previous.then(|| communes as i64 - previous_communes as i64),
    })
}

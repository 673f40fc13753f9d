//! Time series per group and cross-group dispersion within a quarter.

use std::collections::{BTreeMap, BTreeSet};

use crate::analyzers::aggregate::fold_views;
use crate::analyzers::filter::{FilterSpec, QuarterSelection};
use crate::analyzers::types::{
    AggregatedView, DispersionStats, GroupKey, Grouping, LorenzPoint, Mover, Movers, Period,
    TrendPoint, TrendSeries, TrendSummary,
};
use crate::analyzers::utility::{mean, median, stddev};
use crate::cleaner::CleanRecord;
use crate::config::RateBounds;

fn belongs_to(record: &CleanRecord, key: &GroupKey) -> bool {
    match key {
        GroupKey::Commune(code) => record.municipality_code == *code,
        GroupKey::Department(code) => record.department == *code,
        GroupKey::National => true,
    }
}

/// Quarter-by-quarter weighted rate of one group.
///
/// The quarter selection of `filter` is ignored; every other criterion
/// applies. Only quarters in which the group has rows appear. `delta` is set
/// when the immediately preceding quarter is present and both rates are
/// defined.
pub fn trends(
    records: &[CleanRecord],
    key: &GroupKey,
    filter: &FilterSpec,
    bounds: RateBounds,
) -> TrendSeries {
    let filter = filter.clone().with_quarter(QuarterSelection::All);

    let mut by_period: BTreeMap<Period, Vec<&CleanRecord>> = BTreeMap::new();
    for record in records
        .iter()
        .filter(|r| belongs_to(r, key) && filter.matches(r))
    {
        by_period.entry(record.period()).or_default().push(record);
    }

    let mut points: Vec<TrendPoint> = Vec::with_capacity(by_period.len());
    for (period, members) in by_period {
        let fleet_size: u64 = members.iter().map(|r| r.fleet_size).sum();
        let ev_electric_count: u64 = members.iter().map(|r| r.ev_electric_count).sum();
        let weighted_rate = bounds.rate(ev_electric_count, fleet_size);

        let delta = points
            .last()
            .filter(|prev| prev.period == period.previous())
            .and_then(|prev| Some(weighted_rate? - prev.weighted_rate?));

        points.push(TrendPoint {
            period,
            fleet_size,
            ev_electric_count,
            weighted_rate,
            delta,
        });
    }

    TrendSeries {
        key: key.clone(),
        points,
    }
}

fn quarter_index(p: Period) -> i64 {
    i64::from(p.year) * 4 + i64::from(p.quarter) - 1
}

fn pct_change(start: u64, end: u64) -> Option<f64> {
    (start > 0).then(|| (end as f64 / start as f64 - 1.0) * 100.0)
}

impl TrendSeries {
    /// Start-to-end reading of the series; `None` below two points.
    pub fn summary(&self) -> Option<TrendSummary> {
        if self.points.len() < 2 {
            return None;
        }
        let first = self.points.first()?;
        let last = self.points.last()?;

        let years = (quarter_index(last.period) - quarter_index(first.period)) as f64 / 4.0;
        let ev_cagr_pct = (first.ev_electric_count > 0 && years > 0.0).then(|| {
            ((last.ev_electric_count as f64 / first.ev_electric_count as f64).powf(1.0 / years)
                - 1.0)
                * 100.0
        });

        Some(TrendSummary {
            start: first.period,
            end: last.period,
            rate_change: match (first.weighted_rate, last.weighted_rate) {
                (Some(a), Some(b)) => Some(b - a),
                _ => None,
            },
            ev_change: last.ev_electric_count as i64 - first.ev_electric_count as i64,
            ev_change_pct: pct_change(first.ev_electric_count, last.ev_electric_count),
            fleet_change: last.fleet_size as i64 - first.fleet_size as i64,
            fleet_change_pct: pct_change(first.fleet_size, last.fleet_size),
            ev_cagr_pct,
        })
    }
}

fn views_for(
    records: &[CleanRecord],
    period: Period,
    grouping: Grouping,
    filter: &FilterSpec,
    bounds: RateBounds,
) -> Vec<AggregatedView> {
    let scoped = filter.clone().with_quarter(QuarterSelection::Single(period));
    fold_views(scoped.select(records), grouping, bounds)
        .into_iter()
        .filter(|v| v.has_data() && v.fleet_size >= filter.min_fleet_size)
        .collect()
}

/// Largest rate increases and decreases between `period` and the quarter
/// before it. Groups need a defined rate and the minimum fleet in both
/// quarters. Ties resolve by group key.
pub fn movers(
    records: &[CleanRecord],
    period: Period,
    grouping: Grouping,
    filter: &FilterSpec,
    bounds: RateBounds,
    n: usize,
) -> Movers {
    let previous: BTreeMap<GroupKey, f64> =
        views_for(records, period.previous(), grouping, filter, bounds)
            .into_iter()
            .filter_map(|v| Some((v.key, v.weighted_rate?)))
            .collect();

    let changes: Vec<Mover> = views_for(records, period, grouping, filter, bounds)
        .into_iter()
        .filter_map(|v| {
            let rate = v.weighted_rate?;
            let previous_rate = *previous.get(&v.key)?;
            Some(Mover {
                key: v.key.code().to_string(),
                label: v.label,
                rate,
                previous_rate,
                delta: rate - previous_rate,
            })
        })
        .collect();

    let mut gains: Vec<Mover> = changes.iter().filter(|m| m.delta > 0.0).cloned().collect();
    gains.sort_by(|a, b| b.delta.total_cmp(&a.delta).then_with(|| a.key.cmp(&b.key)));
    gains.truncate(n);

    let mut losses: Vec<Mover> = changes.into_iter().filter(|m| m.delta < 0.0).collect();
    losses.sort_by(|a, b| a.delta.total_cmp(&b.delta).then_with(|| a.key.cmp(&b.key)));
    losses.truncate(n);

    Movers { gains, losses }
}

/// Spread of weighted rates across groups in one quarter.
///
/// Groups without data or below the minimum fleet are skipped. The Lorenz
/// curve orders groups by ascending rate and plots the cumulative share of
/// electric vehicles against the cumulative share of the fleet.
pub fn dispersion(
    records: &[CleanRecord],
    period: Period,
    grouping: Grouping,
    filter: &FilterSpec,
    bounds: RateBounds,
) -> DispersionStats {
    let mut views = views_for(records, period, grouping, filter, bounds);
    let rates: Vec<f64> = views.iter().filter_map(|v| v.weighted_rate).collect();

    let mean_rate = mean(&rates);
    let stddev_rate = mean_rate.and_then(|m| stddev(&rates, m));
    let coefficient_of_variation = match (mean_rate, stddev_rate) {
        (Some(m), Some(sd)) if m > 0.0 => Some(sd / m),
        _ => None,
    };

    let total_fleet: u64 = views.iter().map(|v| v.fleet_size).sum();
    let total_ev: u64 = views.iter().map(|v| v.ev_electric_count).sum();

    views.sort_by(|a, b| {
        a.weighted_rate
            .unwrap_or(0.0)
            .total_cmp(&b.weighted_rate.unwrap_or(0.0))
            .then_with(|| a.key.cmp(&b.key))
    });
    let lorenz = lorenz_curve(&views, total_fleet, total_ev);
    let gini = if views.len() < 2 || lorenz.is_empty() {
        None
    } else {
        Some(gini_from_lorenz(&lorenz))
    };

    views.sort_by(|a, b| {
        b.ev_electric_count
            .cmp(&a.ev_electric_count)
            .then_with(|| a.key.cmp(&b.key))
    });
    let top10_ev_share = (total_ev > 0).then(|| {
        let top: u64 = views.iter().take(10).map(|v| v.ev_electric_count).sum();
        top as f64 / total_ev as f64 * 100.0
    });

    DispersionStats {
        period,
        grouping,
        groups: rates.len(),
        mean_rate,
        stddev_rate,
        coefficient_of_variation,
        min_rate: rates.iter().copied().reduce(f64::min),
        median_rate: median(&rates),
        max_rate: rates.iter().copied().reduce(f64::max),
        lorenz,
        gini,
        top10_ev_share,
    }
}

/// [`dispersion`] for every quarter present under the geographic filters.
pub fn dispersion_series(
    records: &[CleanRecord],
    grouping: Grouping,
    filter: &FilterSpec,
    bounds: RateBounds,
) -> Vec<DispersionStats> {
    let periods: BTreeSet<Period> = records
        .iter()
        .filter(|r| filter.matches_geography(r))
        .map(CleanRecord::period)
        .collect();
    periods
        .into_iter()
        .map(|p| dispersion(records, p, grouping, filter, bounds))
        .collect()
}

/// Starts at the origin. Empty when either total is zero.
fn lorenz_curve(sorted: &[AggregatedView], total_fleet: u64, total_ev: u64) -> Vec<LorenzPoint> {
    if total_fleet == 0 || total_ev == 0 {
        return Vec::new();
    }
    let mut points = Vec::with_capacity(sorted.len() + 1);
    points.push(LorenzPoint {
        fleet_share: 0.0,
        ev_share: 0.0,
    });
    let (mut fleet, mut ev) = (0u64, 0u64);
    for view in sorted {
        fleet += view.fleet_size;
        ev += view.ev_electric_count;
        points.push(LorenzPoint {
            fleet_share: fleet as f64 / total_fleet as f64,
            ev_share: ev as f64 / total_ev as f64,
        });
    }
    points
}

/// `1 - sum((x_k - x_{k-1}) * (y_k + y_{k-1}))`, trapezoid rule.
fn gini_from_lorenz(points: &[LorenzPoint]) -> f64 {
    let area: f64 = points
        .windows(2)
        .map(|w| (w[1].fleet_share - w[0].fleet_share) * (w[1].ev_share + w[0].ev_share))
        .sum();
    1.0 - area
}

//! Department prioritisation: large fleets that still lag in adoption.

use std::collections::BTreeMap;

use crate::analyzers::aggregate::fold_views;
use crate::analyzers::filter::{FilterSpec, QuarterSelection};
use crate::analyzers::types::{Grouping, Period, PriorityEntry, PriorityMatrix};
use crate::analyzers::utility::{median, quantile};
use crate::cleaner::CleanRecord;
use crate::config::RateBounds;

pub const DEFAULT_TARGETS: usize = 5;

/// Builds the fleet-versus-rate matrix for `period`.
///
/// Targets are departments whose rate is at or below the median rate and
/// whose fleet is at or above the 75th percentile, largest fleet first, then
/// lowest rate.
pub fn priorities(
    records: &[CleanRecord],
    period: Period,
    filter: &FilterSpec,
    bounds: RateBounds,
    n: usize,
) -> PriorityMatrix {
    let select = |p: Period| {
        let scoped = filter.clone().with_quarter(QuarterSelection::Single(p));
        fold_views(scoped.select(records), Grouping::Department, bounds)
    };

    let previous: BTreeMap<String, f64> = select(period.previous())
        .into_iter()
        .filter_map(|v| Some((v.key.code().to_string(), v.weighted_rate?)))
        .collect();

    let entries: Vec<PriorityEntry> = select(period)
        .into_iter()
        .filter(|v| v.fleet_size >= filter.min_fleet_size)
        .filter_map(|v| {
            let rate = v.weighted_rate?;
            let department = v.key.code().to_string();
            Some(PriorityEntry {
                delta: previous.get(&department).map(|prev| rate - prev),
                department,
                fleet_size: v.fleet_size,
                ev_electric_count: v.ev_electric_count,
                weighted_rate: rate,
            })
        })
        .collect();

    let rates: Vec<f64> = entries.iter().map(|e| e.weighted_rate).collect();
    let fleets: Vec<f64> = entries.iter().map(|e| e.fleet_size as f64).collect();
    let median_rate = median(&rates);
    let fleet_p75 = quantile(&fleets, 0.75);

    let mut targets: Vec<PriorityEntry> = match (median_rate, fleet_p75) {
        (Some(m), Some(p75)) => entries
            .iter()
            .filter(|e| e.weighted_rate <= m && e.fleet_size as f64 >= p75)
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    targets.sort_by(|a, b| {
        b.fleet_size
            .cmp(&a.fleet_size)
            .then_with(|| a.weighted_rate.total_cmp(&b.weighted_rate))
            .then_with(|| a.department.cmp(&b.department))
    });
    targets.truncate(n);

    PriorityMatrix {
        entries,
        median_rate,
        fleet_p75,
        targets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::filter::tests::record;

    #[test]
    fn test_targets_are_large_and_lagging() {
        let records = vec![
            // big and lagging
            record("13055", "Marseille", (2024, 2), 10_000, 200),
            record("13055", "Marseille", (2024, 1), 10_000, 150),
            // big and leading
            record("75056", "Paris", (2024, 2), 12_000, 1800),
            // small and lagging
            record("48095", "Mende", (2024, 2), 500, 5),
            // small and leading
            record("92012", "Boulogne", (2024, 2), 800, 80),
            record("33063", "Bordeaux", (2024, 2), 600, 60),
        ];
        let period = Period::new(2024, 2).unwrap();
        let matrix = priorities(
            &records,
            period,
            &FilterSpec::default(),
            RateBounds::default(),
            DEFAULT_TARGETS,
        );

        assert_eq!(matrix.entries.len(), 5);
        assert!((matrix.median_rate.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(matrix.fleet_p75, Some(10_000.0));
        assert_eq!(matrix.targets.len(), 1);
        assert_eq!(matrix.targets[0].department, "13");
        assert!((matrix.targets[0].delta.unwrap() - 0.5).abs() < 1e-12);
        assert!(matrix.entries.iter().find(|e| e.department == "75").unwrap().delta.is_none());
    }

    #[test]
    fn test_empty_period_has_no_targets() {
        let matrix = priorities(
            &[],
            Period::new(2024, 1).unwrap(),
            &FilterSpec::default(),
            RateBounds::default(),
            DEFAULT_TARGETS,
        );
        assert!(matrix.entries.is_empty());
        assert!(matrix.targets.is_empty());
        assert_eq!(matrix.median_rate, None);
    }
}

// 📈 Gap-Bounded Interpolator - linear fill of short interior gaps
//
// Between two observed years y1 < y2, interior years are filled only when
// y2 - y1 <= max_gap. Observed values are never overwritten and nothing is
// extrapolated before the first or after the last observation.

use crate::diagnostics::StageReport;
use crate::fiscal::{RealPanel, RealSeries};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub value: f64,
    pub interpolated: bool,
}

pub type FilledSeries = BTreeMap<i32, SeriesPoint>;
pub type FilledPanel = BTreeMap<String, FilledSeries>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillStats {
    pub filled_years: usize,
    pub gaps_too_large: usize,
    pub years_left_missing: usize,
}

pub struct GapBoundedInterpolator {
    max_gap: i32,
}

impl GapBoundedInterpolator {
    pub fn new(max_gap: i32) -> Self {
        GapBoundedInterpolator { max_gap }
    }

    pub fn fill_series(&self, series: &RealSeries) -> (FilledSeries, FillStats) {
        let mut stats = FillStats::default();
        let mut filled: FilledSeries = series
            .iter()
            .map(|(year, value)| {
                (
                    *year,
                    SeriesPoint {
                        value: *value,
                        interpolated: false,
                    },
                )
            })
            .collect();

        // BTreeMap keys are already sorted by year
        let observed: Vec<(i32, f64)> = series.iter().map(|(y, v)| (*y, *v)).collect();
        for pair in observed.windows(2) {
            let (y1, v1) = pair[0];
            let (y2, v2) = pair[1];
            let gap = y2 - y1;
            if gap <= 1 {
                continue;
            }
            if gap > self.max_gap {
                stats.gaps_too_large += 1;
                stats.years_left_missing += (gap - 1) as usize;
                continue;
            }

            let slope = (v2 - v1) / gap as f64;
            for year in (y1 + 1)..y2 {
                filled.entry(year).or_insert(SeriesPoint {
                    value: v1 + slope * (year - y1) as f64,
                    interpolated: true,
                });
                stats.filled_years += 1;
            }
        }

        (filled, stats)
    }

    pub fn interpolate(&self, panel: &RealPanel) -> (FilledPanel, StageReport) {
        let observed: usize = panel.values().map(BTreeMap::len).sum();
        let mut report = StageReport::new("interpolation", observed);
        let mut result = FilledPanel::new();

        for (entity_id, series) in panel {
            let (filled, stats) = self.fill_series(series);
            report.record_n("interpolated", stats.filled_years);
            report.record_n("gap_too_large", stats.gaps_too_large);
            report.record_n("years_left_missing", stats.years_left_missing);
            result.insert(entity_id.clone(), filled);
        }

        let points: usize = result.values().map(BTreeMap::len).sum();
        (result, report.finish(points))
    }
}

// ============================================================================
// TESTS
// ============================================================================

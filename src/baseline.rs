// ✅ Baseline Quality Tagger - complete spending history across baseline years
//
// An entity passes a baseline set iff it has a non-missing, non-negative
// value in EVERY year of the set. Zero is a valid value. Negative values are
// data errors: they count as missing and are reported, never fatal.

use crate::config::BaselineSet;
use crate::diagnostics::StageReport;
use crate::records::{EntityPanel, EntitySeries};
use std::collections::BTreeMap;

/// Entity id -> flag
pub type FlagMap = BTreeMap<String, bool>;

// ============================================================================
// BASELINE FLAGS
// ============================================================================

/// One named flag per baseline set, all computed from the same series
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineFlags {
    /// Set names in configuration order (drives output column order)
    names: Vec<String>,
    flags: BTreeMap<String, FlagMap>,
}

impl BaselineFlags {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn flags_for(&self, set: &str) -> Option<&FlagMap> {
        self.flags.get(set)
    }

    pub fn get(&self, set: &str, entity_id: &str) -> Option<bool> {
        self.flags.get(set).and_then(|m| m.get(entity_id)).copied()
    }

    /// Number of entities passing a set
    pub fn passing(&self, set: &str) -> usize {
        self.flags
            .get(set)
            .map_or(0, |m| m.values().filter(|f| **f).count())
    }

    fn insert(&mut self, set: &str, flags: FlagMap) {
        self.names.push(set.to_string());
        self.flags.insert(set.to_string(), flags);
    }
}

// ============================================================================
// TAGGER
// ============================================================================

pub struct BaselineQualityTagger {
    sets: Vec<BaselineSet>,
}

impl BaselineQualityTagger {
    pub fn new(sets: Vec<BaselineSet>) -> Self {
        BaselineQualityTagger { sets }
    }

    /// Evaluate every baseline set in one pass over the series
    pub fn tag(&self, panel: &EntityPanel) -> (BaselineFlags, StageReport) {
        let mut report = StageReport::new("baseline", panel.len());

        for series in panel.values() {
            for (year, obs) in &series.observations {
                if obs.nominal_value.map_or(false, |v| v < 0.0) {
                    tracing::debug!(entity = %series.entity_id, year, "negative value treated as missing");
                    report.record("negative_value");
                }
            }
        }

        let mut result = BaselineFlags::default();
        for set in &self.sets {
            let flags: FlagMap = panel
                .iter()
                .map(|(id, series)| (id.clone(), has_complete_baseline(series, set)))
                .collect();

            let failing = flags.values().filter(|f| !**f).count();
            report.record_n(&format!("incomplete:{}", set.name), failing);
            result.insert(&set.name, flags);
        }

        if report.count("negative_value") > 0 {
            tracing::warn!(
                count = report.count("negative_value"),
                "negative finance values counted as missing"
            );
        }

        let tagged = panel.len();
        (result, report.finish(tagged))
    }
}

/// True iff the series has a valid value in every year of the set
pub fn has_complete_baseline(series: &EntitySeries, set: &BaselineSet) -> bool {
    set.years
        .iter()
        .all(|year| series.value(*year).map_or(false, |v| v.is_finite() && v >= 0.0))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn set(name: &str, years: &[i32]) -> BaselineSet {
        BaselineSet {
            name: name.to_string(),
            years: years.iter().copied().collect(),
        }
    }

    fn panel() -> EntityPanel {
        let mut panel = EntityPanel::new();
        let complete = EntitySeries::new("A1", "06")
            .with_value(1972, Some(10.0))
            .with_value(1977, Some(0.0))
            .with_value(1982, Some(12.0));
        let gap = EntitySeries::new("A2", "06")
            .with_value(1972, Some(10.0))
            .with_value(1982, Some(12.0));
        let negative = EntitySeries::new("A3", "06")
            .with_value(1972, Some(10.0))
            .with_value(1977, Some(-4.0))
            .with_value(1982, Some(12.0));
        let missing = EntitySeries::new("A4", "06")
            .with_value(1972, Some(10.0))
            .with_value(1977, None)
            .with_value(1982, Some(12.0));

        for series in [complete, gap, negative, missing] {
            panel.insert(series.entity_id.clone(), series);
        }
        panel
    }

    #[test]
    fn test_complete_history_required() {
        let tagger = BaselineQualityTagger::new(vec![set("early", &[1972, 1977, 1982])]);
        let (flags, report) = tagger.tag(&panel());

        // Zero is a valid value
        assert_eq!(flags.get("early", "A1"), Some(true));
        assert_eq!(flags.get("early", "A2"), Some(false));
        // Negative counts as missing
        assert_eq!(flags.get("early", "A3"), Some(false));
        assert_eq!(flags.get("early", "A4"), Some(false));

        assert_eq!(flags.passing("early"), 1);
        assert_eq!(report.count("negative_value"), 1);
        assert_eq!(report.count("incomplete:early"), 3);
        assert_eq!(report.rows_out, 4);
    }

    #[test]
    fn test_multiple_sets_in_one_pass() {
        let tagger = BaselineQualityTagger::new(vec![
            set("strict", &[1972, 1977, 1982]),
            set("loose", &[1972, 1982]),
        ]);
        let (flags, _) = tagger.tag(&panel());

        assert_eq!(flags.names(), &["strict".to_string(), "loose".to_string()]);
        assert_eq!(flags.passing("strict"), 1);
        assert_eq!(flags.passing("loose"), 4);
        assert_eq!(flags.get("loose", "A3"), Some(true));
        assert_eq!(flags.get("missing", "A1"), None);
    }

    #[test]
    fn test_unobserved_entity_not_flagged() {
        let tagger = BaselineQualityTagger::new(vec![set("early", &[1972])]);
        let (flags, _) = tagger.tag(&panel());

        assert_eq!(flags.get("early", "A99"), None);
        assert_eq!(flags.flags_for("early").map(|m| m.len()), Some(4));
    }
}

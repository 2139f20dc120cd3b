// ⚖️ Weighted Aggregator - unit records -> population-weighted region-years
//
// Every region is classified by coverage before any arithmetic happens.
// Population not covered by mapped units is allocated by the residual policy
// configured for the region type, and the allocated weights must add up to
// the region's reported total population.

use crate::assignment::{by_unit, Assignments};
use crate::config::{ResidualConfig, ResidualPolicy};
use crate::diagnostics::StageReport;
use crate::error::{PipelineError, Result};
use crate::interpolation::FilledPanel;
use crate::propagation::MembershipGraph;
use crate::records::{EntityPanel, RegionRow};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// COVERAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    /// Mapped units only
    FullyCovered,
    /// No units, exactly one residual area
    SingleUncovered,
    /// No units, several residual areas
    MultipleUncovered,
    /// Units plus at least one residual area
    Mixed,
}

impl Coverage {
    /// `None` when the region has no contributors at all
    pub fn classify(units: usize, residual_areas: usize) -> Option<Self> {
        match (units, residual_areas) {
            (0, 0) => None,
            (_, 0) => Some(Coverage::FullyCovered),
            (0, 1) => Some(Coverage::SingleUncovered),
            (0, _) => Some(Coverage::MultipleUncovered),
            _ => Some(Coverage::Mixed),
        }
    }

    pub fn has_residual(&self) -> bool {
        !matches!(self, Coverage::FullyCovered)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Coverage::FullyCovered => "fully_covered",
            Coverage::SingleUncovered => "single_uncovered",
            Coverage::MultipleUncovered => "multiple_uncovered",
            Coverage::Mixed => "mixed",
        }
    }
}

// ============================================================================
// CONTRIBUTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
    pub value: f64,
    pub weight: f64,
    pub interpolated: bool,
}

/// Population-weighted mean; `None` if there is no positive weight
pub fn weighted_mean(contributions: &[Contribution]) -> Option<f64> {
    let total: f64 = contributions.iter().map(|c| c.weight).sum();
    if total.is_nan() || total <= 0.0 {
        return None;
    }
    let sum: f64 = contributions.iter().map(|c| c.value * c.weight).sum();
    Some(sum / total)
}

fn within_bounds(value: f64, contributions: &[Contribution]) -> bool {
    let weighted = contributions.iter().filter(|c| c.weight > 0.0);
    let min = weighted.clone().map(|c| c.value).fold(f64::INFINITY, f64::min);
    let max = weighted.map(|c| c.value).fold(f64::NEG_INFINITY, f64::max);
    let slack = 1e-9 * max.abs().max(min.abs()).max(1.0);
    value >= min - slack && value <= max + slack
}

/// One mapped unit: its full population and the entity serving each category
#[derive(Debug, Clone, PartialEq)]
struct UnitRecord<'a> {
    unit_id: &'a str,
    weight: f64,
    entities: Vec<&'a str>,
}

// ============================================================================
// OUTPUT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionYear {
    pub region_id: String,
    pub jurisdiction_id: String,
    pub year: i32,
    pub real_value: f64,
    pub population: f64,
    pub is_interpolated: bool,
    pub coverage: Coverage,
}

/// Everything the aggregator reads, borrowed from earlier stages
pub struct AggregationInputs<'a> {
    pub assignments: &'a Assignments,
    pub graph: &'a MembershipGraph,
    pub regions: &'a [RegionRow],
    pub values: &'a FilledPanel,
    pub entities: &'a EntityPanel,
}

// ============================================================================
// AGGREGATOR
// ============================================================================

pub struct WeightedAggregator {
    residual: ResidualConfig,
    population_tolerance: f64,
}

impl WeightedAggregator {
    pub fn new(residual: ResidualConfig, population_tolerance: f64) -> Self {
        WeightedAggregator {
            residual,
            population_tolerance,
        }
    }

    pub fn aggregate(&self, inputs: &AggregationInputs<'_>) -> Result<(Vec<RegionYear>, StageReport)> {
        let mut report = StageReport::new("aggregation", inputs.regions.len());
        let mut rows = Vec::new();

        let units_by_id: BTreeMap<&str, UnitRecord> = by_unit(inputs.assignments)
            .into_iter()
            .map(|(unit_id, assigned)| {
                let weight = assigned
                    .iter()
                    .map(|a| a.unit_population)
                    .fold(0.0, f64::max);
                let entities = assigned.into_iter().map(|a| a.entity_id.as_str()).collect();
                (unit_id, UnitRecord { unit_id, weight, entities })
            })
            .collect();

        let mut regions: Vec<&RegionRow> = inputs.regions.iter().collect();
        regions.sort_by(|a, b| a.region_id.cmp(&b.region_id));
        regions.dedup_by(|a, b| a.region_id == b.region_id);

        for region in regions {
            let units: Vec<&UnitRecord> = inputs
                .graph
                .units_of(&region.region_id)
                .filter_map(|u| units_by_id.get(u))
                .collect();
            let residuals: Vec<&str> = inputs.graph.residuals_of(&region.region_id).collect();

            let coverage = match Coverage::classify(units.len(), residuals.len()) {
                Some(coverage) => coverage,
                None => {
                    report.record("region_without_contributors");
                    continue;
                }
            };
            report.record(&format!("coverage:{}", coverage.code()));

            let policy = self.residual.policy_for(&region.region_type);
            if coverage.has_residual() && policy == ResidualPolicy::Exclude {
                tracing::debug!(region = %region.region_id, "region with residual area excluded by policy");
                report.record("residual_excluded");
                continue;
            }

            // Over-covered regions surface as a conservation violation below
            let covered: f64 = units.iter().map(|u| u.weight).sum();
            let residual_population = if coverage.has_residual() {
                (region.total_population - covered).max(0.0)
            } else {
                0.0
            };

            for year in contributor_years(&units, &residuals, inputs.values) {
                let mut contributions = match unit_contributions(&units, year, inputs.values) {
                    Some(contributions) => contributions,
                    None => {
                        report.record("missing_contributor_value");
                        continue;
                    }
                };

                if coverage.has_residual() {
                    let residual = match policy {
                        ResidualPolicy::PopulationShare => {
                            let (shares, fell_back) = population_shares(
                                &residuals,
                                year,
                                residual_population,
                                inputs.values,
                                inputs.entities,
                            );
                            if fell_back {
                                report.record("population_share_fallback");
                            }
                            shares
                        }
                        _ => equal_share(&residuals, year, residual_population, inputs.values),
                    };
                    match residual {
                        Some(residual) => contributions.extend(residual),
                        None => {
                            report.record("missing_contributor_value");
                            continue;
                        }
                    }
                }

                let allocated: f64 = contributions.iter().map(|c| c.weight).sum();
                self.check_conservation(region, year, allocated)?;

                let real_value = match weighted_mean(&contributions) {
                    Some(value) => value,
                    None => {
                        report.record("zero_weight");
                        continue;
                    }
                };
                if !within_bounds(real_value, &contributions) {
                    tracing::warn!(
                        region = %region.region_id,
                        year,
                        real_value,
                        "weighted mean outside contributor range"
                    );
                    report.record("mean_out_of_bounds");
                    continue;
                }

                rows.push(RegionYear {
                    region_id: region.region_id.clone(),
                    jurisdiction_id: region.jurisdiction_id.clone(),
                    year,
                    real_value,
                    population: allocated,
                    is_interpolated: contributions.iter().any(|c| c.interpolated),
                    coverage,
                });
            }
        }

        let produced = rows.len();
        Ok((rows, report.finish(produced)))
    }

    fn check_conservation(&self, region: &RegionRow, year: i32, allocated: f64) -> Result<()> {
        let expected = region.total_population;
        if (allocated - expected).abs() > self.slack(expected) {
            tracing::error!(
                region = %region.region_id,
                year,
                allocated,
                expected,
                "population conservation violated"
            );
            return Err(PipelineError::ResidualAllocationViolation {
                region_id: region.region_id.clone(),
                year,
                allocated,
                expected,
            });
        }
        Ok(())
    }

    fn slack(&self, expected: f64) -> f64 {
        self.population_tolerance * expected.abs().max(1.0)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn contributor_years(units: &[&UnitRecord], residuals: &[&str], values: &FilledPanel) -> BTreeSet<i32> {
    units
        .iter()
        .flat_map(|u| u.entities.iter().copied())
        .chain(residuals.iter().copied())
        .filter_map(|entity_id| values.get(entity_id))
        .flat_map(|series| series.keys().copied())
        .collect()
}

/// Unit value = sum over the unit's categories; `None` if any entity lacks the year
fn unit_contributions(units: &[&UnitRecord], year: i32, values: &FilledPanel) -> Option<Vec<Contribution>> {
    units
        .iter()
        .map(|unit| {
            let mut value = 0.0;
            let mut interpolated = false;
            for entity_id in &unit.entities {
                let point = values.get(*entity_id)?.get(&year)?;
                value += point.value;
                interpolated |= point.interpolated;
            }
            tracing::trace!(unit = unit.unit_id, year, value, "unit record");
            Some(Contribution {
                value,
                weight: unit.weight,
                interpolated,
            })
        })
        .collect()
}

/// Residual areas averaged with equal weight; the whole residual population
/// sits on that average. A single area contributes its own value directly.
fn equal_share(
    residuals: &[&str],
    year: i32,
    residual_population: f64,
    values: &FilledPanel,
) -> Option<Vec<Contribution>> {
    let points = residuals
        .iter()
        .map(|entity_id| values.get(*entity_id)?.get(&year).copied())
        .collect::<Option<Vec<_>>>()?;
    let mean = points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64;

    Some(vec![Contribution {
        value: mean,
        weight: residual_population,
        interpolated: points.iter().any(|p| p.interpolated),
    }])
}

/// Residual population split by each area's own reported population for the
/// year. Falls back to an equal split unless every area reports one.
fn population_shares(
    residuals: &[&str],
    year: i32,
    residual_population: f64,
    values: &FilledPanel,
    entities: &EntityPanel,
) -> (Option<Vec<Contribution>>, bool) {
    let points = match residuals
        .iter()
        .map(|entity_id| values.get(*entity_id)?.get(&year).copied())
        .collect::<Option<Vec<_>>>()
    {
        Some(points) => points,
        None => return (None, false),
    };

    let reported: Option<Vec<f64>> = residuals
        .iter()
        .map(|entity_id| {
            entities
                .get(*entity_id)?
                .observations
                .get(&year)?
                .population
                .filter(|p| p.is_finite() && *p > 0.0)
        })
        .collect();

    let (shares, fell_back) = match reported {
        Some(populations) => {
            let total: f64 = populations.iter().sum();
            (populations.iter().map(|p| p / total).collect::<Vec<_>>(), false)
        }
        None => (vec![1.0 / residuals.len() as f64; residuals.len()], true),
    };

    let contributions = points
        .iter()
        .zip(shares)
        .map(|(point, share)| Contribution {
            value: point.value,
            weight: residual_population * share,
            interpolated: point.interpolated,
        })
        .collect();
    (Some(contributions), fell_back)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::Assignment;
    use crate::interpolation::SeriesPoint;
    use crate::records::{EntitySeries, Observation, ResidualArea, UnitMembership};

    struct Fixture {
        assignments: Assignments,
        graph: MembershipGraph,
        regions: Vec<RegionRow>,
        values: FilledPanel,
        entities: EntityPanel,
    }

    impl Fixture {
        /// units: (unit, dominant entity, unit population); residuals: entity ids
        fn new(total: f64, units: &[(&str, &str, f64)], residuals: &[&str]) -> Self {
            let assignments: Assignments = units
                .iter()
                .map(|(unit, entity, population)| {
                    (
                        (unit.to_string(), "unified".to_string()),
                        Assignment {
                            unit_id: unit.to_string(),
                            service_category: "unified".to_string(),
                            entity_id: entity.to_string(),
                            allocated_population: *population,
                            unit_population: *population,
                        },
                    )
                })
                .collect();
            let memberships: Vec<UnitMembership> = units
                .iter()
                .map(|(unit, _, _)| UnitMembership {
                    unit_id: unit.to_string(),
                    region_id: "R".to_string(),
                })
                .collect();
            let regions = vec![RegionRow {
                region_id: "R".to_string(),
                jurisdiction_id: "06".to_string(),
                region_type: "county".to_string(),
                total_population: total,
            }];
            let residual_areas: Vec<ResidualArea> = residuals
                .iter()
                .map(|entity| ResidualArea {
                    region_id: "R".to_string(),
                    entity_id: entity.to_string(),
                })
                .collect();
            let (graph, _, _) =
                MembershipGraph::build(&assignments, &memberships, &regions, &residual_areas);

            Fixture {
                assignments,
                graph,
                regions,
                values: FilledPanel::new(),
                entities: EntityPanel::new(),
            }
        }

        /// The dominant entity holds only `share` of the unit's population
        fn winner_share(mut self, unit: &str, share: f64) -> Self {
            for assignment in self.assignments.values_mut().filter(|a| a.unit_id == unit) {
                assignment.allocated_population = share;
            }
            self
        }

        fn value(mut self, entity: &str, year: i32, value: f64, interpolated: bool) -> Self {
            self.values
                .entry(entity.to_string())
                .or_default()
                .insert(year, SeriesPoint { value, interpolated });
            self
        }

        fn population(mut self, entity: &str, year: i32, population: f64) -> Self {
            self.entities
                .entry(entity.to_string())
                .or_insert_with(|| EntitySeries::new(entity, "06"))
                .observations
                .insert(
                    year,
                    Observation {
                        nominal_value: Some(1.0),
                        population: Some(population),
                    },
                );
            self
        }

        fn run(&self, policy: ResidualPolicy) -> Result<(Vec<RegionYear>, StageReport)> {
            let aggregator = WeightedAggregator::new(
                ResidualConfig {
                    default_policy: policy,
                    policies: BTreeMap::new(),
                },
                1e-6,
            );
            aggregator.aggregate(&AggregationInputs {
                assignments: &self.assignments,
                graph: &self.graph,
                regions: &self.regions,
                values: &self.values,
                entities: &self.entities,
            })
        }
    }

    #[test]
    fn test_classify_coverage() {
        assert_eq!(Coverage::classify(0, 0), None);
        assert_eq!(Coverage::classify(3, 0), Some(Coverage::FullyCovered));
        assert_eq!(Coverage::classify(0, 1), Some(Coverage::SingleUncovered));
        assert_eq!(Coverage::classify(0, 2), Some(Coverage::MultipleUncovered));
        assert_eq!(Coverage::classify(2, 1), Some(Coverage::Mixed));
    }

    #[test]
    fn test_equal_weights_average_to_midpoint() {
        let fixture = Fixture::new(200.0, &[("U1", "E1", 100.0), ("U2", "E2", 100.0)], &[])
            .value("E1", 2000, 10.0, false)
            .value("E2", 2000, 20.0, false);

        let (rows, _) = fixture.run(ResidualPolicy::EqualShare).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].real_value, 15.0);
        assert_eq!(rows[0].population, 200.0);
        assert_eq!(rows[0].coverage, Coverage::FullyCovered);
        assert!(!rows[0].is_interpolated);
    }

    #[test]
    fn test_unequal_weights_stay_bounded() {
        let fixture = Fixture::new(400.0, &[("U1", "E1", 300.0), ("U2", "E2", 100.0)], &[])
            .value("E1", 2000, 10.0, false)
            .value("E2", 2000, 30.0, true);

        let (rows, _) = fixture.run(ResidualPolicy::EqualShare).unwrap();

        assert_eq!(rows[0].real_value, 15.0);
        assert!(rows[0].real_value >= 10.0 && rows[0].real_value <= 30.0);
        assert!(rows[0].is_interpolated);
    }

    #[test]
    fn test_missing_contributor_omits_region_year() {
        let fixture = Fixture::new(200.0, &[("U1", "E1", 100.0), ("U2", "E2", 100.0)], &[])
            .value("E1", 2000, 10.0, false)
            .value("E2", 2000, 20.0, false)
            .value("E1", 2001, 11.0, false);

        let (rows, report) = fixture.run(ResidualPolicy::EqualShare).unwrap();

        assert_eq!(rows.iter().map(|r| r.year).collect::<Vec<_>>(), vec![2000]);
        assert_eq!(report.count("missing_contributor_value"), 1);
    }

    #[test]
    fn test_split_unit_weighted_by_unit_population() {
        // E1 serves 600 of U1's 1000; the unit still weighs 1000
        let fixture = Fixture::new(1500.0, &[("U1", "E1", 1000.0), ("U2", "E2", 500.0)], &[])
            .winner_share("U1", 600.0)
            .value("E1", 2000, 10.0, false)
            .value("E2", 2000, 40.0, false);

        let (rows, _) = fixture.run(ResidualPolicy::EqualShare).unwrap();

        assert_eq!(rows[0].coverage, Coverage::FullyCovered);
        assert_eq!(rows[0].population, 1500.0);
        assert_eq!(rows[0].real_value, 20.0);
    }

    #[test]
    fn test_mixed_residual_uses_full_unit_population() {
        // covered 1000 (not the 600 share); residual 500 at 40
        let fixture = Fixture::new(1500.0, &[("U1", "E1", 1000.0)], &["E9"])
            .winner_share("U1", 600.0)
            .value("E1", 2000, 10.0, false)
            .value("E9", 2000, 40.0, false);

        let (rows, _) = fixture.run(ResidualPolicy::EqualShare).unwrap();

        assert_eq!(rows[0].coverage, Coverage::Mixed);
        assert_eq!(rows[0].population, 1500.0);
        assert_eq!(rows[0].real_value, 20.0);
    }

    #[test]
    fn test_within_bounds_rejects_mean_outside_range() {
        let contributions = [
            Contribution { value: 10.0, weight: 1.0, interpolated: false },
            Contribution { value: 30.0, weight: 3.0, interpolated: false },
            Contribution { value: 99.0, weight: 0.0, interpolated: false },
        ];
        assert!(within_bounds(25.0, &contributions));
        assert!(within_bounds(30.0, &contributions));
        assert!(!within_bounds(31.0, &contributions));
        assert!(!within_bounds(9.0, &contributions));
    }

    #[test]
    fn test_single_uncovered_uses_area_value() {
        let fixture = Fixture::new(500.0, &[], &["E9"]).value("E9", 2000, 42.0, false);

        let (rows, _) = fixture.run(ResidualPolicy::EqualShare).unwrap();

        assert_eq!(rows[0].coverage, Coverage::SingleUncovered);
        assert_eq!(rows[0].real_value, 42.0);
        assert_eq!(rows[0].population, 500.0);
    }

    #[test]
    fn test_mixed_equal_share_allocates_residual_to_average() {
        // covered 300 at 10; residual 100 on mean(20, 40) = 30
        let fixture = Fixture::new(400.0, &[("U1", "E1", 300.0)], &["E8", "E9"])
            .value("E1", 2000, 10.0, false)
            .value("E8", 2000, 20.0, false)
            .value("E9", 2000, 40.0, false);

        let (rows, report) = fixture.run(ResidualPolicy::EqualShare).unwrap();

        assert_eq!(rows[0].coverage, Coverage::Mixed);
        assert_eq!(rows[0].real_value, 15.0);
        assert_eq!(rows[0].population, 400.0);
        assert_eq!(report.count("coverage:mixed"), 1);
    }

    #[test]
    fn test_population_share_splits_by_reported_population() {
        // residual 400 split 3:1 -> 300 at 20, 100 at 40
        let fixture = Fixture::new(400.0, &[], &["E8", "E9"])
            .value("E8", 2000, 20.0, false)
            .value("E9", 2000, 40.0, false)
            .population("E8", 2000, 30.0)
            .population("E9", 2000, 10.0);

        let (rows, report) = fixture.run(ResidualPolicy::PopulationShare).unwrap();

        assert_eq!(rows[0].coverage, Coverage::MultipleUncovered);
        assert_eq!(rows[0].real_value, 25.0);
        assert_eq!(rows[0].population, 400.0);
        assert_eq!(report.count("population_share_fallback"), 0);
    }

    #[test]
    fn test_population_share_falls_back_to_equal_split() {
        let fixture = Fixture::new(400.0, &[], &["E8", "E9"])
            .value("E8", 2000, 20.0, false)
            .value("E9", 2000, 40.0, false)
            .population("E8", 2000, 30.0);

        let (rows, report) = fixture.run(ResidualPolicy::PopulationShare).unwrap();

        assert_eq!(rows[0].real_value, 30.0);
        assert_eq!(report.count("population_share_fallback"), 1);
    }

    #[test]
    fn test_exclude_policy_drops_residual_regions() {
        let fixture = Fixture::new(400.0, &[("U1", "E1", 300.0)], &["E9"])
            .value("E1", 2000, 10.0, false)
            .value("E9", 2000, 20.0, false);

        let (rows, report) = fixture.run(ResidualPolicy::Exclude).unwrap();

        assert!(rows.is_empty());
        assert_eq!(report.count("residual_excluded"), 1);
    }

    #[test]
    fn test_exclude_policy_keeps_fully_covered_regions() {
        let fixture = Fixture::new(100.0, &[("U1", "E1", 100.0)], &[]).value("E1", 2000, 10.0, false);

        let (rows, _) = fixture.run(ResidualPolicy::Exclude).unwrap();

        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_conservation_violation_is_fatal() {
        let fixture = Fixture::new(500.0, &[("U1", "E1", 100.0), ("U2", "E2", 100.0)], &[])
            .value("E1", 2000, 10.0, false)
            .value("E2", 2000, 20.0, false);

        let err = fixture.run(ResidualPolicy::EqualShare).unwrap_err();

        match err {
            PipelineError::ResidualAllocationViolation {
                region_id,
                year,
                allocated,
                expected,
            } => {
                assert_eq!(region_id, "R");
                assert_eq!(year, 2000);
                assert_eq!(allocated, 200.0);
                assert_eq!(expected, 500.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_covered_population_above_total_is_fatal() {
        let fixture = Fixture::new(100.0, &[("U1", "E1", 300.0)], &["E9"])
            .value("E1", 2000, 10.0, false)
            .value("E9", 2000, 20.0, false);

        assert!(matches!(
            fixture.run(ResidualPolicy::EqualShare),
            Err(PipelineError::ResidualAllocationViolation { .. })
        ));
    }

    #[test]
    fn test_region_without_contributors_is_counted() {
        let fixture = Fixture::new(100.0, &[], &[]);

        let (rows, report) = fixture.run(ResidualPolicy::EqualShare).unwrap();

        assert!(rows.is_empty());
        assert_eq!(report.count("region_without_contributors"), 1);
    }

    #[test]
    fn test_weighted_mean_needs_positive_weight() {
        let zero = Contribution { value: 5.0, weight: 0.0, interpolated: false };
        assert_eq!(weighted_mean(&[zero]), None);
        assert_eq!(weighted_mean(&[]), None);
    }
}

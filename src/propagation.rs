// 🔺 Quality Propagator - entity -> unit -> region with one AND reduction
//
// The membership graph is built once from the assignments and reused for
// every named flag. A unit without an assigned entity is simply not in the
// graph. A region is usable only if every member is.

use crate::assignment::Assignments;
use crate::baseline::{BaselineFlags, FlagMap};
use crate::diagnostics::{JoinAudit, StageReport};
use crate::records::{RegionRow, ResidualArea, UnitMembership};
use std::collections::{BTreeMap, BTreeSet};

/// Conservative reduction shared by every level of the hierarchy.
/// `None` when there is nothing to reduce.
pub fn reduce_all<I: IntoIterator<Item = bool>>(flags: I) -> Option<bool> {
    let mut any = false;
    for flag in flags {
        if !flag {
            return Some(false);
        }
        any = true;
    }
    any.then_some(true)
}

// ============================================================================
// MEMBERSHIP GRAPH
// ============================================================================

/// Directed acyclic membership: entity -> unit -> region, entity -> region (residual)
#[derive(Debug, Clone, Default)]
pub struct MembershipGraph {
    unit_entities: BTreeMap<String, BTreeSet<String>>,
    region_units: BTreeMap<String, BTreeSet<String>>,
    region_residuals: BTreeMap<String, BTreeSet<String>>,
    regions: BTreeSet<String>,
}

impl MembershipGraph {
    pub fn build(
        assignments: &Assignments,
        units: &[UnitMembership],
        regions: &[RegionRow],
        residual_areas: &[ResidualArea],
    ) -> (Self, StageReport, JoinAudit) {
        let mut report = StageReport::new("membership", assignments.len());
        let mut audit = JoinAudit::new("units_to_regions");
        let mut graph = MembershipGraph {
            regions: regions.iter().map(|r| r.region_id.clone()).collect(),
            ..Default::default()
        };

        let mut unit_region: BTreeMap<&str, &str> = BTreeMap::new();
        for membership in units {
            match unit_region.get(membership.unit_id.as_str()) {
                Some(existing) if *existing != membership.region_id => {
                    report.record("conflicting_membership");
                }
                Some(_) => {}
                None => {
                    unit_region.insert(&membership.unit_id, &membership.region_id);
                }
            }
        }

        for assignment in assignments.values() {
            graph
                .unit_entities
                .entry(assignment.unit_id.clone())
                .or_default()
                .insert(assignment.entity_id.clone());
        }

        for unit_id in graph.unit_entities.keys() {
            match unit_region.get(unit_id.as_str()) {
                Some(region_id) if graph.regions.contains(*region_id) => {
                    audit.matched();
                    graph
                        .region_units
                        .entry(region_id.to_string())
                        .or_default()
                        .insert(unit_id.clone());
                }
                _ => {
                    audit.unmatched();
                    report.record("unit_without_region");
                }
            }
        }

        for residual in residual_areas {
            if !graph.regions.contains(&residual.region_id) {
                report.record("residual_unknown_region");
                continue;
            }
            graph
                .region_residuals
                .entry(residual.region_id.clone())
                .or_default()
                .insert(residual.entity_id.clone());
        }

        let placed: usize = graph.region_units.values().map(BTreeSet::len).sum();
        (graph, report.finish(placed), audit)
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(String::as_str)
    }

    /// Units of a region that have an assigned entity
    pub fn units_of(&self, region_id: &str) -> impl Iterator<Item = &str> {
        self.region_units
            .get(region_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn residuals_of(&self, region_id: &str) -> impl Iterator<Item = &str> {
        self.region_residuals
            .get(region_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn entities_of(&self, unit_id: &str) -> impl Iterator<Item = &str> {
        self.unit_entities
            .get(unit_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

// ============================================================================
// PROPAGATION
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagatedFlags {
    pub units: BTreeMap<String, bool>,
    pub regions: BTreeMap<String, bool>,
}

/// Set name -> propagated flags
pub type RegionFlags = BTreeMap<String, PropagatedFlags>;

pub struct QualityPropagator<'g> {
    graph: &'g MembershipGraph,
}

impl<'g> QualityPropagator<'g> {
    pub fn new(graph: &'g MembershipGraph) -> Self {
        QualityPropagator { graph }
    }

    /// Propagate one flag; entities without a flag count as failing
    pub fn propagate(&self, entity_flags: &FlagMap) -> (PropagatedFlags, usize) {
        let entity_flag = |id: &str| entity_flags.get(id).copied().unwrap_or(false);
        let mut result = PropagatedFlags::default();
        let mut empty_regions = 0;

        for (unit_id, entities) in &self.graph.unit_entities {
            let flag = reduce_all(entities.iter().map(|e| entity_flag(e.as_str()))).unwrap_or(false);
            result.units.insert(unit_id.clone(), flag);
        }

        for region_id in self.graph.regions() {
            let members = self
                .graph
                .units_of(region_id)
                .map(|u| result.units.get(u).copied().unwrap_or(false))
                .chain(self.graph.residuals_of(region_id).map(entity_flag));

            let flag = match reduce_all(members) {
                Some(flag) => flag,
                None => {
                    tracing::warn!(region = %region_id, "region has no contributing members, flag set to false");
                    empty_regions += 1;
                    false
                }
            };
            result.regions.insert(region_id.to_string(), flag);
        }

        (result, empty_regions)
    }

    /// Propagate every baseline set without rebuilding the graph
    pub fn propagate_all(&self, flags: &BaselineFlags) -> (RegionFlags, StageReport) {
        let mut report = StageReport::new("propagation", self.graph.regions.len());
        let mut all = RegionFlags::new();

        for name in flags.names() {
            let empty = FlagMap::new();
            let entity_flags = flags.flags_for(name).unwrap_or(&empty);
            let (propagated, empty_regions) = self.propagate(entity_flags);

            let failing = propagated.regions.values().filter(|f| !**f).count();
            report.record_n(&format!("region_disqualified:{name}"), failing);
            if empty_regions > 0 {
                report.record_n("region_without_members", empty_regions);
            }
            all.insert(name.clone(), propagated);
        }

        let flagged = self.graph.regions.len();
        (all, report.finish(flagged))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::Assignment;

    fn assignments(pairs: &[(&str, &str)]) -> Assignments {
        pairs
            .iter()
            .map(|(unit, entity)| {
                (
                    (unit.to_string(), "unified".to_string()),
                    Assignment {
                        unit_id: unit.to_string(),
                        service_category: "unified".to_string(),
                        entity_id: entity.to_string(),
                        allocated_population: 100.0,
                        unit_population: 100.0,
                    },
                )
            })
            .collect()
    }

    fn memberships(pairs: &[(&str, &str)]) -> Vec<UnitMembership> {
        pairs
            .iter()
            .map(|(unit, region)| UnitMembership {
                unit_id: unit.to_string(),
                region_id: region.to_string(),
            })
            .collect()
    }

    fn region(id: &str) -> RegionRow {
        RegionRow {
            region_id: id.to_string(),
            jurisdiction_id: "06".to_string(),
            region_type: "county".to_string(),
            total_population: 300.0,
        }
    }

    fn flags(pairs: &[(&str, bool)]) -> FlagMap {
        pairs.iter().map(|(id, f)| (id.to_string(), *f)).collect()
    }

    #[test]
    fn test_reduce_all() {
        assert_eq!(reduce_all([true, true]), Some(true));
        assert_eq!(reduce_all([true, false, true]), Some(false));
        assert_eq!(reduce_all(Vec::<bool>::new()), None);
    }

    #[test]
    fn test_one_bad_unit_disqualifies_region() {
        let a = assignments(&[("U1", "E1"), ("U2", "E2"), ("U3", "E3")]);
        let m = memberships(&[("U1", "R"), ("U2", "R"), ("U3", "R")]);
        let (graph, _, audit) = MembershipGraph::build(&a, &m, &[region("R")], &[]);
        assert_eq!(audit.unmatched, 0);

        let propagator = QualityPropagator::new(&graph);
        let (result, _) = propagator.propagate(&flags(&[("E1", true), ("E2", true), ("E3", false)]));

        assert_eq!(result.units["U1"], true);
        assert_eq!(result.units["U3"], false);
        assert_eq!(result.regions["R"], false);

        let (result, _) = propagator.propagate(&flags(&[("E1", true), ("E2", true), ("E3", true)]));
        assert_eq!(result.regions["R"], true);
    }

    #[test]
    fn test_unit_served_in_two_categories() {
        let mut a = assignments(&[("U1", "E1")]);
        a.insert(
            ("U1".to_string(), "secondary".to_string()),
            Assignment {
                unit_id: "U1".to_string(),
                service_category: "secondary".to_string(),
                entity_id: "E2".to_string(),
                allocated_population: 100.0,
                unit_population: 100.0,
            },
        );
        let (graph, _, _) =
            MembershipGraph::build(&a, &memberships(&[("U1", "R")]), &[region("R")], &[]);

        let (result, _) = QualityPropagator::new(&graph)
            .propagate(&flags(&[("E1", true), ("E2", false)]));

        assert_eq!(result.units["U1"], false);
    }

    #[test]
    fn test_residual_entities_are_members() {
        let a = assignments(&[("U1", "E1")]);
        let residual = [ResidualArea {
            region_id: "R".to_string(),
            entity_id: "E9".to_string(),
        }];
        let (graph, _, _) =
            MembershipGraph::build(&a, &memberships(&[("U1", "R")]), &[region("R")], &residual);

        let (result, _) = QualityPropagator::new(&graph)
            .propagate(&flags(&[("E1", true), ("E9", false)]));

        assert_eq!(result.regions["R"], false);
    }

    #[test]
    fn test_empty_region_is_false_and_counted() {
        let (graph, _, _) =
            MembershipGraph::build(&Assignments::new(), &[], &[region("EMPTY")], &[]);

        let (result, empty) = QualityPropagator::new(&graph).propagate(&FlagMap::new());

        assert_eq!(result.regions["EMPTY"], false);
        assert_eq!(empty, 1);
    }

    #[test]
    fn test_units_without_region_are_unmatched() {
        let a = assignments(&[("U1", "E1"), ("U2", "E2")]);
        let m = memberships(&[("U1", "R"), ("U2", "NOWHERE")]);
        let (graph, report, audit) = MembershipGraph::build(&a, &m, &[region("R")], &[]);

        assert_eq!(audit.unmatched, 1);
        assert_eq!(audit.total, 2);
        assert_eq!(report.count("unit_without_region"), 1);
        assert_eq!(graph.units_of("R").collect::<Vec<_>>(), vec!["U1"]);
    }

    #[test]
    fn test_propagate_all_sets() {
        use crate::baseline::BaselineQualityTagger;
        use crate::config::BaselineSet;
        use crate::records::{EntityPanel, EntitySeries};

        let mut panel = EntityPanel::new();
        panel.insert(
            "E1".to_string(),
            EntitySeries::new("E1", "06").with_value(1972, Some(1.0)),
        );
        panel.insert(
            "E2".to_string(),
            EntitySeries::new("E2", "06")
                .with_value(1972, Some(1.0))
                .with_value(1977, Some(1.0)),
        );

        let tagger = BaselineQualityTagger::new(vec![
            BaselineSet { name: "short".into(), years: [1972].into_iter().collect() },
            BaselineSet { name: "long".into(), years: [1972, 1977].into_iter().collect() },
        ]);
        let (baseline, _) = tagger.tag(&panel);

        let a = assignments(&[("U1", "E1"), ("U2", "E2")]);
        let m = memberships(&[("U1", "R"), ("U2", "R")]);
        let (graph, _, _) = MembershipGraph::build(&a, &m, &[region("R")], &[]);

        let (all, report) = QualityPropagator::new(&graph).propagate_all(&baseline);

        assert_eq!(all["short"].regions["R"], true);
        assert_eq!(all["long"].regions["R"], false);
        assert_eq!(report.count("region_disqualified:long"), 1);
        assert_eq!(report.count("region_disqualified:short"), 0);
    }
}

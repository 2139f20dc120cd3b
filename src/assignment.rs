// 🗺️ Geographic Dominant Assigner - one entity per (unit, service category)
//
// Excluded codes are dropped before assignment. The dominant candidate is the
// one with the largest allocated population among every remaining candidate;
// ties go to the lowest entity id so that repeated runs give the same answer
// regardless of row order. A dominant entity outside the trusted crosswalk
// drops the unit rather than promoting a minority entity.

use crate::config::ExclusionRule;
use crate::crosswalk::Crosswalk;
use crate::diagnostics::{JoinAudit, StageReport};
use crate::records::ServiceRow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// ASSIGNMENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub unit_id: String,
    pub service_category: String,
    pub entity_id: String,
    pub allocated_population: f64,

    /// Population of the unit for this category, summed over all candidates
    pub unit_population: f64,
}

/// (unit_id, service_category) -> dominant entity
pub type Assignments = BTreeMap<(String, String), Assignment>;

/// Group assignments by unit (a unit may be served in several categories)
pub fn by_unit(assignments: &Assignments) -> BTreeMap<&str, Vec<&Assignment>> {
    let mut units: BTreeMap<&str, Vec<&Assignment>> = BTreeMap::new();
    for assignment in assignments.values() {
        units
            .entry(assignment.unit_id.as_str())
            .or_default()
            .push(assignment);
    }
    units
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    entity_id: String,
    population: f64,
}

impl Candidate {
    /// Larger population wins; equal population goes to the lower id
    fn beats(&self, other: &Candidate) -> bool {
        self.population > other.population
            || (self.population == other.population && self.entity_id < other.entity_id)
    }
}

// ============================================================================
// ASSIGNER
// ============================================================================

pub struct GeographicDominantAssigner {
    exclusions: Vec<ExclusionRule>,
}

impl GeographicDominantAssigner {
    pub fn new(exclusions: Vec<ExclusionRule>) -> Self {
        GeographicDominantAssigner { exclusions }
    }

    /// First exclusion rule matching a service row, if any
    pub fn excluded_by(&self, row: &ServiceRow) -> Option<&ExclusionRule> {
        self.exclusions
            .iter()
            .find(|rule| rule.matches(&row.unit_id, &row.entity_id))
    }

    pub fn assign(
        &self,
        rows: &[ServiceRow],
        crosswalk: &Crosswalk,
    ) -> (Assignments, StageReport, JoinAudit) {
        let mut report = StageReport::new("assignment", rows.len());
        let mut audit = JoinAudit::new("service_to_crosswalk");

        let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
        // (unit, category) -> entity -> (allocated population, trusted)
        let mut candidates: BTreeMap<(String, String), BTreeMap<String, (f64, bool)>> = BTreeMap::new();

        for row in rows {
            if let Some(rule) = self.excluded_by(row) {
                report.record(&format!("excluded:{}", rule.name));
                continue;
            }

            let key = (row.unit_id.clone(), row.service_category.clone());
            seen.insert(key.clone());

            // Join against the trusted crosswalk; ambiguity is not "unmatched"
            let trusted = crosswalk.is_trusted_a(&row.entity_id);
            if trusted {
                audit.matched();
            } else if crosswalk.is_known_a(&row.entity_id) {
                audit.matched();
                report.record("cardinality_excluded");
            } else {
                audit.unmatched();
                report.record("unmatched_entity");
            }

            let population = match row.allocated_population {
                Some(p) if p.is_finite() && p > 0.0 => p,
                _ => {
                    report.record("invalid_population");
                    continue;
                }
            };

            let unit = candidates.entry(key).or_default();
            if let Some((existing, _)) = unit.get_mut(&row.entity_id) {
                report.record("duplicate_candidate");
                *existing += population;
            } else {
                unit.insert(row.entity_id.clone(), (population, trusted));
            }
        }

        let mut assignments = Assignments::new();
        for ((unit_id, category), pool) in &candidates {
            let unit_population: f64 = pool.values().map(|(p, _)| p).sum();

            let mut best: Option<(Candidate, bool)> = None;
            for (entity_id, (population, trusted)) in pool {
                let candidate = Candidate {
                    entity_id: entity_id.clone(),
                    population: *population,
                };
                if best.as_ref().map_or(true, |(b, _)| candidate.beats(b)) {
                    best = Some((candidate, *trusted));
                }
            }

            match best {
                Some((winner, true)) => {
                    assignments.insert(
                        (unit_id.clone(), category.clone()),
                        Assignment {
                            unit_id: unit_id.clone(),
                            service_category: category.clone(),
                            entity_id: winner.entity_id,
                            allocated_population: winner.population,
                            unit_population,
                        },
                    );
                }
                Some((winner, false)) => {
                    tracing::debug!(
                        unit = %unit_id,
                        category = %category,
                        entity = %winner.entity_id,
                        "dominant entity not in trusted crosswalk"
                    );
                    report.record("dominant_not_trusted");
                }
                None => {}
            }
        }

        let without_candidates = seen
            .iter()
            .filter(|key| !candidates.contains_key(*key))
            .count();
        report.record_n("unit_without_candidates", without_candidates);

        let assigned = assignments.len();
        (assignments, report.finish(assigned), audit)
    }
}

// ============================================================================
// TESTS
// ============================================================================

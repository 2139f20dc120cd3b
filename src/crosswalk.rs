// 🔗 Cardinality Classifier - trusted A <-> B identifier crosswalk
//
// Bipartite degree count over every observed (A, B) pair. A pair is trusted
// only when its A maps to exactly one B over the whole observation period
// AND that B maps to exactly one A. Everything else is excluded, counted,
// and never treated as an error.

use crate::diagnostics::StageReport;
use crate::error::{PipelineError, Result};
use crate::records::{EntityPanel, EntityRecord, EntitySeries, Observation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// CARDINALITY CLASS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Cardinality {
    OneToOne,
    /// One A maps to several B
    OneToMany,
    /// Several A map to one B
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    pub fn from_degrees(degree_a: usize, degree_b: usize) -> Self {
        match (degree_a == 1, degree_b == 1) {
            (true, true) => Cardinality::OneToOne,
            (false, true) => Cardinality::OneToMany,
            (true, false) => Cardinality::ManyToOne,
            (false, false) => Cardinality::ManyToMany,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::OneToOne => "1:1",
            Cardinality::OneToMany => "1:M",
            Cardinality::ManyToOne => "M:1",
            Cardinality::ManyToMany => "M:M",
        }
    }

    /// Reason code used in diagnostics
    pub fn code(&self) -> &'static str {
        match self {
            Cardinality::OneToOne => "one_to_one",
            Cardinality::OneToMany => "one_to_many",
            Cardinality::ManyToOne => "many_to_one",
            Cardinality::ManyToMany => "many_to_many",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosswalkEntry {
    pub entity_id_a: String,
    pub entity_id_b: String,
    pub class: Cardinality,
}

// ============================================================================
// CROSSWALK
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosswalkSummary {
    pub distinct_pairs: usize,
    pub one_to_one: usize,
    pub one_to_many: usize,
    pub many_to_one: usize,
    pub many_to_many: usize,
    /// Share of distinct pairs surviving as 1:1
    pub retention_rate: f64,
}

/// Every classified pair, plus the trusted partial bijection
#[derive(Debug, Clone, Default)]
pub struct Crosswalk {
    classes: BTreeMap<(String, String), Cardinality>,
    trusted_by_a: BTreeMap<String, String>,
    trusted_by_b: BTreeMap<String, String>,
    known_a: BTreeSet<String>,
}

impl Crosswalk {
    /// Trusted 1:1 entries, ordered by A
    pub fn trusted(&self) -> Vec<CrosswalkEntry> {
        self.trusted_by_a
            .iter()
            .map(|(a, b)| CrosswalkEntry {
                entity_id_a: a.clone(),
                entity_id_b: b.clone(),
                class: Cardinality::OneToOne,
            })
            .collect()
    }

    /// Every observed pair with its class, ordered by (A, B)
    pub fn entries(&self) -> Vec<CrosswalkEntry> {
        self.classes
            .iter()
            .map(|((a, b), class)| CrosswalkEntry {
                entity_id_a: a.clone(),
                entity_id_b: b.clone(),
                class: *class,
            })
            .collect()
    }

    pub fn trusted_len(&self) -> usize {
        self.trusted_by_a.len()
    }

    pub fn trusted_b(&self, entity_id_a: &str) -> Option<&str> {
        self.trusted_by_a.get(entity_id_a).map(String::as_str)
    }

    pub fn trusted_a(&self, entity_id_b: &str) -> Option<&str> {
        self.trusted_by_b.get(entity_id_b).map(String::as_str)
    }

    pub fn is_trusted_a(&self, entity_id_a: &str) -> bool {
        self.trusted_by_a.contains_key(entity_id_a)
    }

    /// A was observed at all (trusted or ambiguous)
    pub fn is_known_a(&self, entity_id_a: &str) -> bool {
        self.known_a.contains(entity_id_a)
    }

    pub fn class_of(&self, entity_id_a: &str, entity_id_b: &str) -> Option<Cardinality> {
        self.classes
            .get(&(entity_id_a.to_string(), entity_id_b.to_string()))
            .copied()
    }

    pub fn summary(&self) -> CrosswalkSummary {
        let mut counts: BTreeMap<Cardinality, usize> = BTreeMap::new();
        for class in self.classes.values() {
            *counts.entry(*class).or_insert(0) += 1;
        }
        let get = |c: Cardinality| counts.get(&c).copied().unwrap_or(0);

        let distinct_pairs = self.classes.len();
        let one_to_one = get(Cardinality::OneToOne);

        CrosswalkSummary {
            distinct_pairs,
            one_to_one,
            one_to_many: get(Cardinality::OneToMany),
            many_to_one: get(Cardinality::ManyToOne),
            many_to_many: get(Cardinality::ManyToMany),
            retention_rate: if distinct_pairs == 0 {
                0.0
            } else {
                one_to_one as f64 / distinct_pairs as f64
            },
        }
    }

    /// Keep only records on trusted pairs, reshaped into per-entity series keyed by A
    pub fn filter_records(&self, records: &[EntityRecord]) -> (EntityPanel, StageReport) {
        let mut report = StageReport::new("crosswalk_filter", records.len());
        let mut panel = EntityPanel::new();
        let mut kept = 0;

        for record in records {
            if record.entity_id_a.is_empty() || record.entity_id_b.is_empty() {
                report.record("missing_key");
                continue;
            }

            if self.trusted_b(&record.entity_id_a) != Some(record.entity_id_b.as_str()) {
                let reason = self
                    .class_of(&record.entity_id_a, &record.entity_id_b)
                    .map_or("unclassified", |c| c.code());
                report.record(&format!("excluded_{reason}"));
                continue;
            }

            let series = panel
                .entry(record.entity_id_a.clone())
                .or_insert_with(|| EntitySeries::new(&record.entity_id_a, &record.jurisdiction_id));

            if series.jurisdiction_id != record.jurisdiction_id {
                report.record("jurisdiction_conflict");
            }

            if series.observations.contains_key(&record.year) {
                report.record("duplicate_entity_year");
                continue;
            }

            series.observations.insert(
                record.year,
                Observation {
                    nominal_value: record.nominal_value,
                    population: record.population,
                },
            );
            kept += 1;
        }

        (panel, report.finish(kept))
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

pub struct CardinalityClassifier;

impl CardinalityClassifier {
    pub fn new() -> Self {
        CardinalityClassifier
    }

    /// Classify every observed (A, B) pair across all years
    pub fn classify(&self, records: &[EntityRecord]) -> Result<(Crosswalk, StageReport)> {
        if records.is_empty() {
            return Err(PipelineError::structural(
                "entity_records",
                "identifier mapping table is empty",
            ));
        }
        if records.iter().all(|r| r.entity_id_a.is_empty()) {
            return Err(PipelineError::structural(
                "entity_records",
                "key column entity_id_a is entirely missing",
            ));
        }
        if records.iter().all(|r| r.entity_id_b.is_empty()) {
            return Err(PipelineError::structural(
                "entity_records",
                "key column entity_id_b is entirely missing",
            ));
        }

        let mut report = StageReport::new("crosswalk", records.len());

        // Bipartite adjacency in both directions
        let mut a_to_b: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut b_to_a: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for record in records {
            let (a, b) = (record.entity_id_a.as_str(), record.entity_id_b.as_str());
            if a.is_empty() || b.is_empty() {
                report.record("missing_key");
                continue;
            }
            a_to_b.entry(a).or_default().insert(b);
            b_to_a.entry(b).or_default().insert(a);
        }

        let mut crosswalk = Crosswalk::default();

        for (a, bs) in &a_to_b {
            crosswalk.known_a.insert(a.to_string());
            for b in bs {
                let degree_b = b_to_a.get(b).map_or(0, BTreeSet::len);
                let class = Cardinality::from_degrees(bs.len(), degree_b);
                report.record(class.code());

                crosswalk
                    .classes
                    .insert((a.to_string(), b.to_string()), class);

                if class == Cardinality::OneToOne {
                    crosswalk.trusted_by_a.insert(a.to_string(), b.to_string());
                    crosswalk.trusted_by_b.insert(b.to_string(), a.to_string());
                }
            }
        }

        let summary = crosswalk.summary();
        tracing::info!(
            distinct_pairs = summary.distinct_pairs,
            one_to_one = summary.one_to_one,
            retention_rate = summary.retention_rate,
            "crosswalk classified"
        );

        let trusted = crosswalk.trusted_len();
        Ok((crosswalk, report.finish(trusted)))
    }
}

impl Default for CardinalityClassifier {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

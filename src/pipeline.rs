// 🏭 Panel Pipeline - stage orchestration, panel assembly, digest
//
// Stages run in a fixed order against one immutable configuration. Every
// join audit is checked as soon as its stage finishes, so an over-tolerance
// join aborts before anything downstream runs. Nothing here touches disk.

use crate::aggregation::{AggregationInputs, RegionYear, WeightedAggregator};
use crate::assignment::GeographicDominantAssigner;
use crate::baseline::BaselineQualityTagger;
use crate::config::PipelineConfig;
use crate::crosswalk::{CardinalityClassifier, CrosswalkSummary};
use crate::diagnostics::{diagnostic_rows, DiagnosticRow, JoinAudit, StageReport};
use crate::error::{PipelineError, Result};
use crate::fiscal::{FiscalPeriodNormalizer, MonthlyIndex};
use crate::interpolation::GapBoundedInterpolator;
use crate::propagation::{MembershipGraph, QualityPropagator, RegionFlags};
use crate::records::InputTables;
use crate::treatment::ReformLookup;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fixed leading columns of the panel; `flag_<set>` columns follow
pub const PANEL_COLUMNS: &[&str] = &[
    "region_id",
    "year",
    "real_value",
    "population",
    "quality_flag",
    "is_interpolated",
    "reform_year",
    "reform_type",
];

// ============================================================================
// PANEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelRow {
    pub region_id: String,
    pub year: i32,
    pub real_value: f64,
    pub population: f64,
    pub quality_flag: bool,
    pub is_interpolated: bool,
    pub reform_year: Option<i32>,
    pub reform_type: Option<String>,

    /// One flag per baseline set, in `Panel::flag_names` order
    pub flags: Vec<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Panel {
    pub flag_names: Vec<String>,
    pub rows: Vec<PanelRow>,
}

impl Panel {
    pub fn headers(&self) -> Vec<String> {
        PANEL_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.flag_names.iter().map(|name| format!("flag_{name}")))
            .collect()
    }

    /// Canonical CSV rendering; the digest is taken over exactly these bytes
    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(self.headers())?;

        for row in &self.rows {
            let mut record = vec![
                row.region_id.clone(),
                row.year.to_string(),
                row.real_value.to_string(),
                row.population.to_string(),
                row.quality_flag.to_string(),
                row.is_interpolated.to_string(),
                row.reform_year.map(|y| y.to_string()).unwrap_or_default(),
                row.reform_type.clone().unwrap_or_default(),
            ];
            record.extend(row.flags.iter().map(bool::to_string));
            wtr.write_record(&record)?;
        }

        wtr.into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))
    }
}

/// Hex SHA-256 of the canonical panel bytes
pub fn panel_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic run id: identical inputs give an identical id
pub fn run_id(digest: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, digest.as_bytes())
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub panel_digest: String,
    pub panel_rows: usize,
    pub crosswalk: CrosswalkSummary,
    pub stages: Vec<StageReport>,
    pub joins: Vec<JoinAudit>,
}

impl PipelineReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn diagnostic_rows(&self) -> Vec<DiagnosticRow> {
        diagnostic_rows(&self.stages, &self.joins)
    }
}

/// Result of a successful run, ready to persist
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub panel: Panel,
    pub panel_csv: Vec<u8>,
    pub report: PipelineReport,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline<'c> {
    config: &'c PipelineConfig,
    stages: Vec<StageReport>,
    joins: Vec<JoinAudit>,
}

impl<'c> Pipeline<'c> {
    pub fn new(config: &'c PipelineConfig) -> Self {
        Pipeline {
            config,
            stages: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// Run every stage once over the loaded tables
    pub fn run(mut self, tables: &InputTables) -> Result<PipelineOutput> {
        let config = self.config;

        // 1. Crosswalk
        let (crosswalk, report) = CardinalityClassifier::new().classify(&tables.entity_records)?;
        self.stages.push(report);
        let summary = crosswalk.summary();
        tracing::info!(
            retention_rate = summary.retention_rate,
            trusted = summary.one_to_one,
            distinct = summary.distinct_pairs,
            "crosswalk built"
        );
        let (entities, report) = crosswalk.filter_records(&tables.entity_records);
        self.stages.push(report);

        // 2. Baseline flags
        let (baseline, report) = BaselineQualityTagger::new(config.baseline.sets.clone()).tag(&entities);
        self.stages.push(report);

        // 3. Geographic assignment
        let (assignments, report, audit) =
            GeographicDominantAssigner::new(config.exclusions.clone()).assign(&tables.service, &crosswalk);
        self.stages.push(report);
        self.audit(audit)?;

        // 4. Flag propagation
        let (graph, report, audit) = MembershipGraph::build(
            &assignments,
            &tables.units,
            &tables.regions,
            &tables.residual_areas,
        );
        self.stages.push(report);
        self.audit(audit)?;
        let (region_flags, report) = QualityPropagator::new(&graph).propagate_all(&baseline);
        self.stages.push(report);

        // 5. Real dollars
        let (index, report) = MonthlyIndex::from_rows(&tables.price_index)?;
        self.stages.push(report);
        let normalizer = FiscalPeriodNormalizer::new(&config.fiscal, &tables.fiscal_calendar, index)?;
        let (real, report, audit) = normalizer.normalize(&entities);
        self.stages.push(report);
        self.audit(audit)?;

        // 6. Interpolation
        let (filled, report) = GapBoundedInterpolator::new(config.interpolation.max_gap).interpolate(&real);
        self.stages.push(report);

        // 7. Aggregation
        let aggregator = WeightedAggregator::new(config.residual.clone(), config.tolerance.population);
        let (region_years, report) = aggregator.aggregate(&AggregationInputs {
            assignments: &assignments,
            graph: &graph,
            regions: &tables.regions,
            values: &filled,
            entities: &entities,
        })?;
        self.stages.push(report);

        // 8. Treatment
        let (reforms, report) = ReformLookup::from_rows(&tables.reforms);
        self.stages.push(report);

        let panel = assemble_panel(config, &region_years, &region_flags, &reforms);
        let panel_csv = panel.to_csv_bytes()?;
        let digest = panel_digest(&panel_csv);
        let run_id = run_id(&digest);
        tracing::info!(rows = panel.rows.len(), digest = %digest, run_id = %run_id, "panel assembled");

        Ok(PipelineOutput {
            report: PipelineReport {
                run_id: run_id.to_string(),
                panel_digest: digest,
                panel_rows: panel.rows.len(),
                crosswalk: summary,
                stages: self.stages,
                joins: self.joins,
            },
            panel,
            panel_csv,
        })
    }

    fn audit(&mut self, audit: JoinAudit) -> Result<()> {
        audit.check(self.config.tolerance.unmatched)?;
        self.joins.push(audit);
        Ok(())
    }
}

/// Attach flags and treatment columns to aggregated region-years
pub fn assemble_panel(
    config: &PipelineConfig,
    region_years: &[RegionYear],
    region_flags: &RegionFlags,
    reforms: &ReformLookup,
) -> Panel {
    let flag_names: Vec<String> = config.baseline.sets.iter().map(|s| s.name.clone()).collect();
    let primary = config.primary_flag();
    let region_flag = |set: &str, region_id: &str| {
        region_flags
            .get(set)
            .and_then(|p| p.regions.get(region_id))
            .copied()
            .unwrap_or(false)
    };

    let rows = region_years
        .iter()
        .map(|ry| {
            let reform = reforms.get(&ry.jurisdiction_id);
            PanelRow {
                region_id: ry.region_id.clone(),
                year: ry.year,
                real_value: ry.real_value,
                population: ry.population,
                quality_flag: region_flag(primary, &ry.region_id),
                is_interpolated: ry.is_interpolated,
                reform_year: reform.map(|r| r.reform_year),
                reform_type: reform.map(|r| r.reform_type.clone()),
                flags: flag_names.iter().map(|name| region_flag(name, &ry.region_id)).collect(),
            }
        })
        .collect();

    Panel { flag_names, rows }
}

// ============================================================================
// TESTS
// ============================================================================

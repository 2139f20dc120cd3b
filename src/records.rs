// 📥 Input Tables - typed rows + CSV loading with structural checks
//
// Every table is read with its header checked up front: a missing required
// column is a structural error, never a silently empty field. Unparseable
// numeric cells ("NA", ".") load as missing.

use crate::config::InputPaths;
use crate::error::{PipelineError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

// ============================================================================
// ROW TYPES
// ============================================================================

/// One reporting entity's finance observation for one year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id_a: String,
    pub entity_id_b: String,
    pub jurisdiction_id: String,
    pub year: i32,

    /// Intensive measure (per capita); missing is distinct from zero
    #[serde(deserialize_with = "csv::invalid_option")]
    pub nominal_value: Option<f64>,

    #[serde(deserialize_with = "csv::invalid_option")]
    pub population: Option<f64>,
}

/// Geography-to-entity service link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRow {
    pub unit_id: String,
    pub entity_id: String,
    pub service_category: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub allocated_population: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMembership {
    pub unit_id: String,
    pub region_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRow {
    pub region_id: String,
    pub jurisdiction_id: String,
    pub region_type: String,
    /// Fixed-vintage total population
    pub total_population: f64,
}

/// Entity reporting for territory of a region not covered by any mapped unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidualArea {
    pub region_id: String,
    pub entity_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceIndexRow {
    /// `YYYY-MM`
    pub month: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub index_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalCalendarRow {
    pub jurisdiction_id: String,
    pub fiscal_start_month: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReformRow {
    pub jurisdiction_id: String,
    pub reform_year: i32,
    pub reform_type: String,
}

// ============================================================================
// REQUIRED COLUMNS
// ============================================================================

pub const ENTITY_COLUMNS: &[&str] = &[
    "entity_id_a",
    "entity_id_b",
    "jurisdiction_id",
    "year",
    "nominal_value",
    "population",
];
pub const SERVICE_COLUMNS: &[&str] = &[
    "unit_id",
    "entity_id",
    "service_category",
    "allocated_population",
];
pub const UNIT_COLUMNS: &[&str] = &["unit_id", "region_id"];
pub const REGION_COLUMNS: &[&str] = &[
    "region_id",
    "jurisdiction_id",
    "region_type",
    "total_population",
];
pub const RESIDUAL_COLUMNS: &[&str] = &["region_id", "entity_id"];
pub const PRICE_INDEX_COLUMNS: &[&str] = &["month", "index_value"];
pub const FISCAL_CALENDAR_COLUMNS: &[&str] = &["jurisdiction_id", "fiscal_start_month"];
pub const REFORM_COLUMNS: &[&str] = &["jurisdiction_id", "reform_year", "reform_type"];

// ============================================================================
// LOADING
// ============================================================================

/// Read a table from any reader, checking the header first
pub fn read_table<T, R>(reader: R, table: &str, required: &[&str]) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    R: Read,
{
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::structural(
            table,
            format!("missing required column(s): {}", missing.join(", ")),
        ));
    }

    let mut rows = Vec::new();
    for (index, result) in rdr.deserialize().enumerate() {
        // +2: header line, 1-based
        let row: T = result.map_err(|e| {
            PipelineError::structural(table, format!("line {}: {e}", index + 2))
        })?;
        rows.push(row);
    }

    Ok(rows)
}

/// Read a table from disk; a missing file is structural
pub fn load_table<T: DeserializeOwned>(path: &Path, table: &str, required: &[&str]) -> Result<Vec<T>> {
    let file = File::open(path).map_err(|e| {
        PipelineError::structural(table, format!("cannot open {}: {e}", path.display()))
    })?;
    read_table(file, table, required)
}

/// All input tables of one pipeline run
#[derive(Debug, Clone, Default)]
pub struct InputTables {
    pub entity_records: Vec<EntityRecord>,
    pub service: Vec<ServiceRow>,
    pub units: Vec<UnitMembership>,
    pub regions: Vec<RegionRow>,
    pub residual_areas: Vec<ResidualArea>,
    pub price_index: Vec<PriceIndexRow>,
    pub fiscal_calendar: Vec<FiscalCalendarRow>,
    pub reforms: Vec<ReformRow>,
}

impl InputTables {
    pub fn load(paths: &InputPaths) -> Result<Self> {
        let residual_areas = match &paths.residual_areas {
            Some(path) => load_table(path, "residual_areas", RESIDUAL_COLUMNS)?,
            None => Vec::new(),
        };
        let reforms = match &paths.reforms {
            Some(path) => load_table(path, "reforms", REFORM_COLUMNS)?,
            None => Vec::new(),
        };

        let tables = InputTables {
            entity_records: load_table(&paths.entity_records, "entity_records", ENTITY_COLUMNS)?,
            service: load_table(&paths.service, "service", SERVICE_COLUMNS)?,
            units: load_table(&paths.units, "units", UNIT_COLUMNS)?,
            regions: load_table(&paths.regions, "regions", REGION_COLUMNS)?,
            residual_areas,
            price_index: load_table(&paths.price_index, "price_index", PRICE_INDEX_COLUMNS)?,
            fiscal_calendar: load_table(
                &paths.fiscal_calendar,
                "fiscal_calendar",
                FISCAL_CALENDAR_COLUMNS,
            )?,
            reforms,
        };

        tracing::info!(
            entity_records = tables.entity_records.len(),
            service = tables.service.len(),
            units = tables.units.len(),
            regions = tables.regions.len(),
            residual_areas = tables.residual_areas.len(),
            price_months = tables.price_index.len(),
            "input tables loaded"
        );

        Ok(tables)
    }
}

// ============================================================================
// ENTITY SERIES (post-crosswalk view of entity records)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub nominal_value: Option<f64>,
    pub population: Option<f64>,
}

/// Time series of one trusted entity, keyed by `entity_id_a`
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySeries {
    pub entity_id: String,
    pub jurisdiction_id: String,
    pub observations: BTreeMap<i32, Observation>,
}

impl EntitySeries {
    pub fn new(entity_id: impl Into<String>, jurisdiction_id: impl Into<String>) -> Self {
        EntitySeries {
            entity_id: entity_id.into(),
            jurisdiction_id: jurisdiction_id.into(),
            observations: BTreeMap::new(),
        }
    }

    /// Builder used heavily in tests
    pub fn with_value(mut self, year: i32, value: Option<f64>) -> Self {
        self.observations.insert(
            year,
            Observation {
                nominal_value: value,
                population: None,
            },
        );
        self
    }

    pub fn value(&self, year: i32) -> Option<f64> {
        self.observations.get(&year).and_then(|o| o.nominal_value)
    }
}

/// Entity series keyed by entity id; ordered for reproducibility
pub type EntityPanel = BTreeMap<String, EntitySeries>;

// ============================================================================
// TESTS
// ============================================================================

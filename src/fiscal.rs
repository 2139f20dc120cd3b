// 💵 Fiscal Period Normalizer - jurisdiction fiscal years -> fixed-base real dollars
//
// Fiscal year Y for a jurisdiction starting in month s covers months s..=12
// of Y-1 and 1..s of Y (s = 1 is the calendar year). The index is averaged
// over exactly 12 valid months; a short window is an omission, never a
// partial average.
//
//   factor(Y) = base_average / average(Y)
//
// base_average is the jurisdiction's own fiscal-year average at the base
// year, so a base-year value converts to itself.

use crate::config::FiscalConfig;
use crate::diagnostics::{JoinAudit, StageReport};
use crate::error::{PipelineError, Result};
use crate::records::{EntityPanel, FiscalCalendarRow, PriceIndexRow};
use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};

/// Year -> real value
pub type RealSeries = BTreeMap<i32, f64>;

/// Entity id -> real series
pub type RealPanel = BTreeMap<String, RealSeries>;

// ============================================================================
// MONTHLY INDEX
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MonthlyIndex {
    /// (year, month) -> index value; only valid months are stored
    values: BTreeMap<(i32, u32), f64>,
}

impl MonthlyIndex {
    pub fn from_rows(rows: &[PriceIndexRow]) -> Result<(Self, StageReport)> {
        if rows.is_empty() {
            return Err(PipelineError::structural("price_index", "no monthly index rows"));
        }

        let mut report = StageReport::new("price_index", rows.len());
        let mut index = MonthlyIndex::default();
        let mut seen = BTreeSet::new();

        for row in rows {
            let key = parse_month(&row.month)?;
            if !seen.insert(key) {
                return Err(PipelineError::structural(
                    "price_index",
                    format!("duplicate month {}", row.month),
                ));
            }

            match row.index_value {
                Some(v) if v.is_finite() && v > 0.0 => {
                    index.values.insert(key, v);
                }
                _ => report.record("invalid_index_value"),
            }
        }

        let valid = index.values.len();
        Ok((index, report.finish(valid)))
    }

    pub fn get(&self, year: i32, month: u32) -> Option<f64> {
        self.values.get(&(year, month)).copied()
    }

    /// Average over the 12-month fiscal window ending in `fiscal_year`
    pub fn fiscal_average(&self, fiscal_year: i32, start_month: u32) -> Option<f64> {
        let mut sum = 0.0;
        for (year, month) in fiscal_window(fiscal_year, start_month) {
            sum += self.get(year, month)?;
        }
        Some(sum / 12.0)
    }
}

/// Parse `YYYY-MM`
fn parse_month(month: &str) -> Result<(i32, u32)> {
    let date = NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").map_err(|e| {
        PipelineError::structural("price_index", format!("bad month '{month}': {e}"))
    })?;
    Ok((date.year(), date.month()))
}

/// The 12 (year, month) pairs of a fiscal year, in calendar order
pub fn fiscal_window(fiscal_year: i32, start_month: u32) -> Vec<(i32, u32)> {
    if start_month <= 1 {
        return (1..=12).map(|m| (fiscal_year, m)).collect();
    }

    (start_month..=12)
        .map(|m| (fiscal_year - 1, m))
        .chain((1..start_month).map(|m| (fiscal_year, m)))
        .collect()
}

// ============================================================================
// NORMALIZER
// ============================================================================

/// Why a jurisdiction-year could not be converted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionGap {
    NoCalendar,
    InsufficientWindow,
    InsufficientBaseWindow,
}

impl ConversionGap {
    pub fn code(&self) -> &'static str {
        match self {
            ConversionGap::NoCalendar => "no_fiscal_calendar",
            ConversionGap::InsufficientWindow => "insufficient_fiscal_window",
            ConversionGap::InsufficientBaseWindow => "insufficient_base_window",
        }
    }
}

pub struct FiscalPeriodNormalizer {
    base_year: i32,
    default_start_month: Option<u32>,
    calendar: BTreeMap<String, u32>,
    index: MonthlyIndex,
}

impl FiscalPeriodNormalizer {
    pub fn new(
        config: &FiscalConfig,
        calendar_rows: &[FiscalCalendarRow],
        index: MonthlyIndex,
    ) -> Result<Self> {
        let mut calendar = BTreeMap::new();
        for row in calendar_rows {
            if !(1..=12).contains(&row.fiscal_start_month) {
                return Err(PipelineError::structural(
                    "fiscal_calendar",
                    format!(
                        "jurisdiction {}: start month {} out of range",
                        row.jurisdiction_id, row.fiscal_start_month
                    ),
                ));
            }
            if let Some(previous) = calendar.insert(row.jurisdiction_id.clone(), row.fiscal_start_month) {
                if previous != row.fiscal_start_month {
                    return Err(PipelineError::structural(
                        "fiscal_calendar",
                        format!("jurisdiction {} has conflicting start months", row.jurisdiction_id),
                    ));
                }
            }
        }

        Ok(FiscalPeriodNormalizer {
            base_year: config.base_year,
            default_start_month: config.default_start_month,
            calendar,
            index,
        })
    }

    pub fn start_month(&self, jurisdiction_id: &str) -> Option<u32> {
        self.calendar
            .get(jurisdiction_id)
            .copied()
            .or(self.default_start_month)
    }

    /// Conversion factor for one jurisdiction-year
    pub fn factor(&self, jurisdiction_id: &str, year: i32) -> std::result::Result<f64, ConversionGap> {
        let start = self
            .start_month(jurisdiction_id)
            .ok_or(ConversionGap::NoCalendar)?;
        let base = self
            .index
            .fiscal_average(self.base_year, start)
            .ok_or(ConversionGap::InsufficientBaseWindow)?;
        let average = self
            .index
            .fiscal_average(year, start)
            .ok_or(ConversionGap::InsufficientWindow)?;
        Ok(base / average)
    }

    pub fn to_real(&self, jurisdiction_id: &str, year: i32, nominal: f64) -> std::result::Result<f64, ConversionGap> {
        Ok(nominal * self.factor(jurisdiction_id, year)?)
    }

    /// Convert every observed value; failures are omitted and counted
    pub fn normalize(&self, panel: &EntityPanel) -> (RealPanel, StageReport, JoinAudit) {
        let observed = panel
            .values()
            .flat_map(|s| s.observations.values())
            .filter(|o| o.nominal_value.is_some())
            .count();
        let mut report = StageReport::new("fiscal", observed);
        let mut audit = JoinAudit::new("entities_to_fiscal_calendar");
        let mut real = RealPanel::new();
        let mut converted = 0;

        for (entity_id, series) in panel {
            if self.start_month(&series.jurisdiction_id).is_some() {
                audit.matched();
            } else {
                audit.unmatched();
            }

            let mut values = RealSeries::new();
            for (year, obs) in &series.observations {
                let Some(nominal) = obs.nominal_value else {
                    continue;
                };
                if !nominal.is_finite() || nominal < 0.0 {
                    report.record("invalid_value_dropped");
                    continue;
                }

                match self.to_real(&series.jurisdiction_id, *year, nominal) {
                    Ok(value) => {
                        values.insert(*year, value);
                        converted += 1;
                    }
                    Err(gap) => report.record(gap.code()),
                }
            }

            if !values.is_empty() {
                real.insert(entity_id.clone(), values);
            }
        }

        (real, report.finish(converted), audit)
    }
}

// ============================================================================
// TESTS
// ============================================================================

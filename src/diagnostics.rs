// 📋 Stage Diagnostics - row counts and reason-coded tallies
//
// Every stage reports rows in/out plus a count per reason code. Joins are
// audited separately: an unmatched share above tolerance aborts the run.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// STAGE REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub rows_in: usize,
    pub rows_out: usize,

    /// Reason code -> count (ordered so the report is reproducible)
    pub reasons: BTreeMap<String, usize>,
}

impl StageReport {
    pub fn new(stage: &str, rows_in: usize) -> Self {
        StageReport {
            stage: stage.to_string(),
            rows_in,
            rows_out: 0,
            reasons: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, reason: &str) {
        self.record_n(reason, 1);
    }

    pub fn record_n(&mut self, reason: &str, n: usize) {
        if n > 0 {
            *self.reasons.entry(reason.to_string()).or_insert(0) += n;
        }
    }

    pub fn count(&self, reason: &str) -> usize {
        self.reasons.get(reason).copied().unwrap_or(0)
    }

    /// Close the report and log it
    pub fn finish(mut self, rows_out: usize) -> Self {
        self.rows_out = rows_out;
        tracing::info!(
            stage = %self.stage,
            rows_in = self.rows_in,
            rows_out = self.rows_out,
            "{}",
            self.summary()
        );
        for (reason, count) in &self.reasons {
            tracing::debug!(stage = %self.stage, reason = %reason, count, "diagnostic");
        }
        self
    }

    pub fn summary(&self) -> String {
        let reasons = self
            .reasons
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{}: {} -> {} rows [{}]",
            self.stage, self.rows_in, self.rows_out, reasons
        )
    }
}

// ============================================================================
// JOIN AUDIT
// ============================================================================

/// Keys present on one side of a merge but absent on the other
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAudit {
    pub join: String,
    pub total: usize,
    pub unmatched: usize,
}

impl JoinAudit {
    pub fn new(join: &str) -> Self {
        JoinAudit {
            join: join.to_string(),
            total: 0,
            unmatched: 0,
        }
    }

    pub fn matched(&mut self) {
        self.total += 1;
    }

    pub fn unmatched(&mut self) {
        self.total += 1;
        self.unmatched += 1;
    }

    pub fn unmatched_share(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.unmatched as f64 / self.total as f64
        }
    }

    /// Escalate to a fatal error when the unmatched share exceeds `tolerance`
    pub fn check(&self, tolerance: f64) -> Result<()> {
        if self.unmatched > 0 {
            tracing::warn!(
                join = %self.join,
                unmatched = self.unmatched,
                total = self.total,
                "unmatched join keys"
            );
        }

        if self.unmatched_share() > tolerance {
            return Err(PipelineError::UnmatchedJoin {
                join: self.join.clone(),
                unmatched: self.unmatched,
                total: self.total,
                tolerance,
            });
        }

        Ok(())
    }
}

// ============================================================================
// FLAT DIAGNOSTIC TABLE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRow {
    pub stage: String,
    pub reason: String,
    pub count: usize,
}

/// Flatten stage reports and join audits into (stage, reason, count) rows
pub fn diagnostic_rows(stages: &[StageReport], joins: &[JoinAudit]) -> Vec<DiagnosticRow> {
    let mut rows = Vec::new();

    for stage in stages {
        rows.push(DiagnosticRow {
            stage: stage.stage.clone(),
            reason: "rows_in".to_string(),
            count: stage.rows_in,
        });
        rows.push(DiagnosticRow {
            stage: stage.stage.clone(),
            reason: "rows_out".to_string(),
            count: stage.rows_out,
        });
        for (reason, count) in &stage.reasons {
            rows.push(DiagnosticRow {
                stage: stage.stage.clone(),
                reason: reason.clone(),
                count: *count,
            });
        }
    }

    for join in joins {
        rows.push(DiagnosticRow {
            stage: format!("join:{}", join.join),
            reason: "total".to_string(),
            count: join.total,
        });
        rows.push(DiagnosticRow {
            stage: format!("join:{}", join.join),
            reason: "unmatched".to_string(),
            count: join.unmatched,
        });
    }

    rows
}

// ============================================================================
// TESTS
// ============================================================================

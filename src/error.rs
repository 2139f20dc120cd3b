// 🚨 Pipeline Errors - Fatal conditions only
//
// Ambiguous mappings, missing baseline years, short fiscal windows and
// over-long gaps are NOT errors. They are reason codes in the diagnostics.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing table, missing column, or an input that cannot be used at all.
    #[error("structural error in {table}: {message}")]
    Structural { table: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unmatched share of a join exceeded the configured tolerance.
    #[error(
        "join '{join}': {unmatched} of {total} records unmatched ({:.1}%), tolerance {:.1}%",
        share(*unmatched, *total) * 100.0,
        tolerance * 100.0
    )]
    UnmatchedJoin {
        join: String,
        unmatched: usize,
        total: usize,
        tolerance: f64,
    },

    /// Allocated population of a region does not add up to its reported total.
    #[error(
        "region {region_id} ({year}): allocated population {allocated:.3} != reported total {expected:.3}"
    )]
    ResidualAllocationViolation {
        region_id: String,
        year: i32,
        allocated: f64,
        expected: f64,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl PipelineError {
    pub fn structural(table: &str, message: impl Into<String>) -> Self {
        PipelineError::Structural {
            table: table.to_string(),
            message: message.into(),
        }
    }
}

fn share(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmatched_join_message() {
        let err = PipelineError::UnmatchedJoin {
            join: "service_to_crosswalk".to_string(),
            unmatched: 3,
            total: 10,
            tolerance: 0.05,
        };

        let msg = err.to_string();
        assert!(msg.contains("service_to_crosswalk"));
        assert!(msg.contains("30.0%"));
        assert!(msg.contains("5.0%"));
    }

    #[test]
    fn test_structural_helper() {
        let err = PipelineError::structural("price_index", "no rows");
        assert_eq!(err.to_string(), "structural error in price_index: no rows");
    }
}

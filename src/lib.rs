// Fiscal Panel - Core Library
// Crosswalk, assignment, flag propagation and aggregation stages for a
// region-year local finance panel. Used by the CLI and by integration tests.

pub mod error;
pub mod config;
pub mod records;
pub mod diagnostics;
pub mod crosswalk;      // Stage 1: A <-> B identifier crosswalk
pub mod baseline;       // Stage 2: baseline completeness flags
pub mod assignment;     // Stage 3: dominant entity per unit
pub mod propagation;    // Stage 4: entity -> unit -> region flags
pub mod fiscal;         // Stage 5: fiscal-year real dollars
pub mod interpolation;  // Stage 6: gap-bounded fill
pub mod aggregation;    // Stage 7: population-weighted regions
pub mod treatment;      // Stage 8: reform lookup
pub mod pipeline;
pub mod store;

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use config::{
    BaselineSet, CodeMatcher, ExclusionField, ExclusionRule, PipelineConfig, ResidualPolicy,
};
pub use records::{
    EntityPanel, EntityRecord, EntitySeries, InputTables, RegionRow, ServiceRow, UnitMembership,
};
pub use diagnostics::{DiagnosticRow, JoinAudit, StageReport};
pub use crosswalk::{Cardinality, CardinalityClassifier, Crosswalk, CrosswalkSummary};
pub use baseline::{BaselineFlags, BaselineQualityTagger};
pub use assignment::{Assignment, Assignments, GeographicDominantAssigner};
pub use propagation::{MembershipGraph, QualityPropagator, RegionFlags};
pub use fiscal::{FiscalPeriodNormalizer, MonthlyIndex};
pub use interpolation::{GapBoundedInterpolator, SeriesPoint};
pub use aggregation::{Coverage, RegionYear, WeightedAggregator};
pub use treatment::{Reform, ReformLookup};
pub use pipeline::{Panel, PanelRow, Pipeline, PipelineOutput, PipelineReport};
pub use store::write_outputs;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

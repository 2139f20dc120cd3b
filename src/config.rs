// ⚙️ Pipeline Configuration - one immutable object threaded through every stage
//
// Loaded once from TOML, validated, then passed by reference. No stage reads
// process state, so two configurations can run side by side in one process.

use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub inputs: InputPaths,

    #[serde(default)]
    pub output: OutputConfig,

    pub baseline: BaselineConfig,

    #[serde(default)]
    pub interpolation: InterpolationConfig,

    pub fiscal: FiscalConfig,

    /// Codes dropped before geographic assignment
    #[serde(default)]
    pub exclusions: Vec<ExclusionRule>,

    #[serde(default)]
    pub residual: ResidualConfig,

    #[serde(default)]
    pub tolerance: ToleranceConfig,
}

// ============================================================================
// INPUTS / OUTPUTS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputPaths {
    pub entity_records: PathBuf,
    pub service: PathBuf,
    pub units: PathBuf,
    pub regions: PathBuf,
    pub residual_areas: Option<PathBuf>,
    pub price_index: PathBuf,
    pub fiscal_calendar: PathBuf,
    pub reforms: Option<PathBuf>,
}

impl Default for InputPaths {
    fn default() -> Self {
        InputPaths {
            entity_records: PathBuf::from("entity_records.csv"),
            service: PathBuf::from("service.csv"),
            units: PathBuf::from("units.csv"),
            regions: PathBuf::from("regions.csv"),
            residual_areas: None,
            price_index: PathBuf::from("price_index.csv"),
            fiscal_calendar: PathBuf::from("fiscal_calendar.csv"),
            reforms: None,
        }
    }
}

impl InputPaths {
    /// Make every relative path relative to `base`
    fn resolve(&mut self, base: &Path) {
        for path in [
            &mut self.entity_records,
            &mut self.service,
            &mut self.units,
            &mut self.regions,
            &mut self.price_index,
            &mut self.fiscal_calendar,
        ] {
            rebase(path, base);
        }
        for path in [&mut self.residual_areas, &mut self.reforms].into_iter().flatten() {
            rebase(path, base);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub panel_csv: PathBuf,
    pub diagnostics_json: PathBuf,
    /// Optional SQLite database holding the canonical panel
    pub sqlite: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            panel_csv: PathBuf::from("panel.csv"),
            diagnostics_json: PathBuf::from("diagnostics.json"),
            sqlite: None,
        }
    }
}

impl OutputConfig {
    fn resolve(&mut self, base: &Path) {
        rebase(&mut self.panel_csv, base);
        rebase(&mut self.diagnostics_json, base);
        if let Some(path) = self.sqlite.as_mut() {
            rebase(path, base);
        }
    }
}

fn rebase(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

// ============================================================================
// BASELINE SETS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BaselineConfig {
    pub sets: Vec<BaselineSet>,

    /// Set reported as `quality_flag`; defaults to the first set
    #[serde(default)]
    pub primary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BaselineSet {
    pub name: String,
    pub years: BTreeSet<i32>,
}

// ============================================================================
// INTERPOLATION / FISCAL
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct InterpolationConfig {
    #[serde(default = "default_max_gap")]
    pub max_gap: i32,
}

fn default_max_gap() -> i32 {
    3
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        InterpolationConfig {
            max_gap: default_max_gap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FiscalConfig {
    /// Fiscal year whose price level the real values are expressed in
    pub base_year: i32,

    /// Start month for jurisdictions missing from the fiscal calendar
    #[serde(default)]
    pub default_start_month: Option<u32>,
}

// ============================================================================
// EXCLUSION RULES
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionField {
    #[default]
    Unit,
    Entity,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodeMatcher {
    /// Specific codes (administrative placeholders, non-geographic codes)
    Exact { codes: Vec<String> },
    Prefix { prefix: String },
    /// Revision and sliver markers are usually trailing characters
    Suffix { suffix: String },
    Contains { text: String },
    /// Reserved numeric range over a slice of the code
    Range {
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        width: Option<usize>,
        min: u64,
        max: u64,
    },
}

impl CodeMatcher {
    pub fn matches(&self, code: &str) -> bool {
        match self {
            CodeMatcher::Exact { codes } => codes.iter().any(|c| c == code),
            CodeMatcher::Prefix { prefix } => code.starts_with(prefix.as_str()),
            CodeMatcher::Suffix { suffix } => code.ends_with(suffix.as_str()),
            CodeMatcher::Contains { text } => code.contains(text.as_str()),
            CodeMatcher::Range {
                offset,
                width,
                min,
                max,
            } => {
                let end = match width {
                    Some(w) => offset + w,
                    None => code.len(),
                };
                code.get(*offset..end)
                    .filter(|slice| !slice.is_empty() && slice.bytes().all(|b| b.is_ascii_digit()))
                    .and_then(|slice| slice.parse::<u64>().ok())
                    .map_or(false, |value| value >= *min && value <= *max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExclusionRule {
    /// Reason code reported in diagnostics
    pub name: String,

    #[serde(default)]
    pub field: ExclusionField,

    #[serde(flatten)]
    pub matcher: CodeMatcher,
}

impl ExclusionRule {
    pub fn matches(&self, unit_id: &str, entity_id: &str) -> bool {
        match self.field {
            ExclusionField::Unit => self.matcher.matches(unit_id),
            ExclusionField::Entity => self.matcher.matches(entity_id),
        }
    }
}

// ============================================================================
// RESIDUAL AREAS
// ============================================================================

/// How population not covered by mapped units is allocated.
///
/// The historical sources describe several variants; none is canonical, so
/// the choice is made per region type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualPolicy {
    /// Regions with any uncovered area are left out of the panel
    Exclude,
    /// Residual values averaged with equal weight, whole residual population on the average
    #[default]
    EqualShare,
    /// Residual population split by each residual area's own reported population
    PopulationShare,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResidualConfig {
    #[serde(default)]
    pub default_policy: ResidualPolicy,

    /// Overrides keyed by region type
    #[serde(default)]
    pub policies: BTreeMap<String, ResidualPolicy>,
}

impl ResidualConfig {
    pub fn policy_for(&self, region_type: &str) -> ResidualPolicy {
        self.policies
            .get(region_type)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

// ============================================================================
// TOLERANCES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToleranceConfig {
    /// Relative tolerance of the population conservation check
    pub population: f64,

    /// Highest unmatched share a join may have before the run aborts
    pub unmatched: f64,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        ToleranceConfig {
            population: 1e-6,
            unmatched: 0.05,
        }
    }
}

// ============================================================================
// LOADING & VALIDATION
// ============================================================================

impl PipelineConfig {
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from file; relative input/output paths resolve against the file's directory
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.inputs.resolve(base);
        config.output.resolve(base);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.baseline.sets.is_empty() {
            return Err(PipelineError::Config(
                "at least one baseline set is required".into(),
            ));
        }

        let mut names = BTreeSet::new();
        for set in &self.baseline.sets {
            if set.name.is_empty() {
                return Err(PipelineError::Config("baseline set with empty name".into()));
            }
            if set.years.is_empty() {
                return Err(PipelineError::Config(format!(
                    "baseline set '{}' has no years",
                    set.name
                )));
            }
            if !names.insert(set.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate baseline set '{}'",
                    set.name
                )));
            }
        }

        if let Some(primary) = &self.baseline.primary {
            if !names.contains(primary.as_str()) {
                return Err(PipelineError::Config(format!(
                    "primary baseline set '{primary}' is not defined"
                )));
            }
        }

        if self.interpolation.max_gap < 1 {
            return Err(PipelineError::Config(format!(
                "interpolation max_gap must be >= 1, got {}",
                self.interpolation.max_gap
            )));
        }

        if let Some(month) = self.fiscal.default_start_month {
            if !(1..=12).contains(&month) {
                return Err(PipelineError::Config(format!(
                    "default_start_month must be 1-12, got {month}"
                )));
            }
        }

        for rule in &self.exclusions {
            if rule.name.is_empty() {
                return Err(PipelineError::Config("exclusion rule with empty name".into()));
            }
            if let CodeMatcher::Range { min, max, .. } = rule.matcher {
                if min > max {
                    return Err(PipelineError::Config(format!(
                        "exclusion rule '{}': min {min} > max {max}",
                        rule.name
                    )));
                }
            }
        }

        for (label, value) in [
            ("population", self.tolerance.population),
            ("unmatched", self.tolerance.unmatched),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Config(format!(
                    "tolerance.{label} must be within [0, 1], got {value}"
                )));
            }
        }

        Ok(())
    }

    /// Name of the baseline set reported as `quality_flag`
    pub fn primary_flag(&self) -> &str {
        self.baseline
            .primary
            .as_deref()
            .unwrap_or_else(|| self.baseline.sets[0].name.as_str())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[baseline]
sets = [{ name = "early", years = [1967, 1972, 1977, 1982] }]

[fiscal]
base_year = 2000
"#;

    #[test]
    fn test_parse_minimal_defaults() {
        let config = PipelineConfig::from_toml(MINIMAL).unwrap();

        assert_eq!(config.interpolation.max_gap, 3);
        assert_eq!(config.primary_flag(), "early");
        assert_eq!(config.residual.policy_for("county"), ResidualPolicy::EqualShare);
        assert_eq!(config.tolerance.unmatched, 0.05);
        assert_eq!(config.inputs.service, PathBuf::from("service.csv"));
        assert!(config.exclusions.is_empty());
    }

    #[test]
    fn test_parse_exclusions_and_policies() {
        let toml = r#"
[baseline]
sets = [
    { name = "early", years = [1972, 1977] },
    { name = "late", years = [1982, 1987] },
]
primary = "late"

[fiscal]
base_year = 2000
default_start_month = 7

[[exclusions]]
name = "placeholder"
kind = "exact"
codes = ["99999"]

[[exclusions]]
name = "sliver"
kind = "suffix"
suffix = "R"

[[exclusions]]
name = "reserved_block"
field = "entity"
kind = "range"
offset = 2
width = 3
min = 900
max = 999

[residual]
default_policy = "exclude"
policies = { county = "population_share" }
"#;
        let config = PipelineConfig::from_toml(toml).unwrap();

        assert_eq!(config.primary_flag(), "late");
        assert_eq!(config.exclusions.len(), 3);
        assert_eq!(config.exclusions[2].field, ExclusionField::Entity);
        assert_eq!(config.residual.policy_for("county"), ResidualPolicy::PopulationShare);
        assert_eq!(config.residual.policy_for("city"), ResidualPolicy::Exclude);

        assert!(config.exclusions[0].matches("99999", "x"));
        assert!(config.exclusions[1].matches("1234R", "x"));
        assert!(config.exclusions[2].matches("u1", "06950AB"));
        assert!(!config.exclusions[2].matches("u1", "06100AB"));
    }

    #[test]
    fn test_range_matcher_ignores_non_numeric() {
        let matcher = CodeMatcher::Range {
            offset: 0,
            width: Some(2),
            min: 60,
            max: 79,
        };

        assert!(matcher.matches("72001"));
        assert!(!matcher.matches("AB001"));
        assert!(!matcher.matches("7"));
        assert!(!matcher.matches("01001"));
    }

    #[test]
    fn test_reject_unknown_primary() {
        let toml = r#"
[baseline]
sets = [{ name = "early", years = [1972] }]
primary = "missing"

[fiscal]
base_year = 2000
"#;
        let err = PipelineConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_reject_bad_values() {
        let cases = [
            "[baseline]\nsets = []\n[fiscal]\nbase_year = 2000\n",
            "[baseline]\nsets = [{ name = \"a\", years = [] }]\n[fiscal]\nbase_year = 2000\n",
            "[baseline]\nsets = [{ name = \"a\", years = [1] }]\n[interpolation]\nmax_gap = 0\n[fiscal]\nbase_year = 2000\n",
            "[baseline]\nsets = [{ name = \"a\", years = [1] }]\n[fiscal]\nbase_year = 2000\ndefault_start_month = 13\n",
            "[baseline]\nsets = [{ name = \"a\", years = [1] }]\n[fiscal]\nbase_year = 2000\n[tolerance]\nunmatched = 1.5\n",
        ];

        for case in cases {
            assert!(
                matches!(PipelineConfig::from_toml(case), Err(PipelineError::Config(_))),
                "expected config error for:\n{case}"
            );
        }
    }

    #[test]
    fn test_from_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();

        assert_eq!(config.inputs.entity_records, dir.path().join("entity_records.csv"));
        assert_eq!(config.output.panel_csv, dir.path().join("panel.csv"));
    }
}

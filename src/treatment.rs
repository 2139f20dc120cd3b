// 🏛️ Treatment Join - reform timing and type per jurisdiction
//
// Plain lookup. Jurisdictions without a reform are never-treated and get
// null reform columns. Several reforms for one jurisdiction resolve to the
// earliest year, ties broken by type.

use crate::diagnostics::StageReport;
use crate::records::ReformRow;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Reform {
    pub reform_year: i32,
    pub reform_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReformLookup {
    by_jurisdiction: BTreeMap<String, Reform>,
}

impl ReformLookup {
    pub fn from_rows(rows: &[ReformRow]) -> (Self, StageReport) {
        let mut report = StageReport::new("treatment", rows.len());
        let mut by_jurisdiction: BTreeMap<String, Reform> = BTreeMap::new();

        for row in rows {
            let reform = Reform {
                reform_year: row.reform_year,
                reform_type: row.reform_type.clone(),
            };
            match by_jurisdiction.get_mut(&row.jurisdiction_id) {
                Some(existing) => {
                    report.record("duplicate_reform");
                    if reform < *existing {
                        *existing = reform;
                    }
                }
                None => {
                    by_jurisdiction.insert(row.jurisdiction_id.clone(), reform);
                }
            }
        }

        let kept = by_jurisdiction.len();
        (ReformLookup { by_jurisdiction }, report.finish(kept))
    }

    pub fn get(&self, jurisdiction_id: &str) -> Option<&Reform> {
        self.by_jurisdiction.get(jurisdiction_id)
    }

    pub fn len(&self) -> usize {
        self.by_jurisdiction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_jurisdiction.is_empty()
    }
}

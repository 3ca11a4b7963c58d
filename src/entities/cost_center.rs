// 🏢 Cost-Center Row - reference mapping from a key to a cost-center code

use crate::keys::{normalize_text, CanonicalKey, KeyParts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostCenterRow {
    pub project: String,
    pub action: String,
    pub unit: String,
    pub year: i32,

    /// CODCCUSTO in the source structure
    pub code: String,

    /// Remaining reference columns (unit/project/action dates), carried into
    /// the enriched output
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl CostCenterRow {
    pub fn new(project: &str, action: &str, unit: &str, year: i32, code: &str) -> Self {
        CostCenterRow {
            project: normalize_text(Some(project)),
            action: normalize_text(Some(action)),
            unit: normalize_text(Some(unit)),
            year,
            code: code.trim().to_string(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, column: &str, value: &str) -> Self {
        self.extra.insert(column.to_string(), value.to_string());
        self
    }

    pub fn key(&self) -> CanonicalKey {
        CanonicalKey::from_parts(&self.project, &self.action, &self.unit, self.year)
    }

    pub fn parts(&self) -> KeyParts {
        KeyParts {
            project: self.project.clone(),
            action: self.action.clone(),
            unit: self.unit.clone(),
            year: self.year,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_center_key() {
        let row = CostCenterRow::new("projeto x", " acao y", "unidade z ", 2025, " 1.02.003 ");
        assert_eq!(row.key().as_str(), "PROJETO X|ACAO Y|UNIDADE Z|2025");
        assert_eq!(row.code, "1.02.003");
    }
}

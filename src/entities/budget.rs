// 📋 Budget Row - one planned/executed line of the national budget plan
//
// The key components can be rewritten by a correction; `original_key` and
// `snapshot_year` keep what the source actually produced.

use crate::keys::{normalize_text, CanonicalKey, KeyParts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRow {
    // ========================================================================
    // KEY COMPONENTS (normalized, may be corrected)
    // ========================================================================
    pub project: String,
    pub action: String,
    pub unit: String,
    pub year: i32,

    // ========================================================================
    // VALUES
    // ========================================================================
    pub month: Option<u32>,
    pub value: f64,

    // ========================================================================
    // PROVENANCE
    // ========================================================================
    /// Year as extracted, before any correction touched it
    pub snapshot_year: i32,

    /// Key as extracted, before any correction touched it
    pub original_key: CanonicalKey,

    /// Source columns that are not part of the key (descriptions, nature codes)
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl BudgetRow {
    pub fn new(project: &str, action: &str, unit: &str, year: i32, month: Option<u32>, value: f64) -> Self {
        let project = normalize_text(Some(project));
        let action = normalize_text(Some(action));
        let unit = normalize_text(Some(unit));
        let original_key = CanonicalKey::from_parts(&project, &action, &unit, year);

        BudgetRow {
            project,
            action,
            unit,
            year,
            month,
            value,
            snapshot_year: year,
            original_key,
            extra: BTreeMap::new(),
        }
    }

    /// Builder pattern: attach a pass-through column
    pub fn with_extra(mut self, column: &str, value: &str) -> Self {
        self.extra.insert(column.to_string(), value.to_string());
        self
    }

    /// Current canonical key (reflects applied corrections)
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

    /// Rewrite the key components; provenance fields stay untouched
    pub fn apply_parts(&mut self, parts: &KeyParts) {
        self.project = normalize_text(Some(&parts.project));
        self.action = normalize_text(Some(&parts.action));
        self.unit = normalize_text(Some(&parts.unit));
        self.year = parts.year;
    }

    pub fn is_corrected(&self) -> bool {
        self.key() != self.original_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_row_key_and_provenance() {
        let row = BudgetRow::new(" Projeto X", "Acao Y", "SP - Unidade Z", 2024, Some(3), 1500.0);

        assert_eq!(row.key().as_str(), "PROJETO X|ACAO Y|SP - UNIDADE Z|2024");
        assert_eq!(row.original_key, row.key());
        assert_eq!(row.snapshot_year, 2024);
        assert!(!row.is_corrected());
    }

    #[test]
    fn test_apply_parts_keeps_original_key() {
        let mut row = BudgetRow::new("P", "A", "SP - U", 2024, None, 10.0);
        let target = CanonicalKey::from_raw("P|A|U|2025").parts().unwrap();

        row.apply_parts(&target);

        assert_eq!(row.key().as_str(), "P|A|U|2025");
        assert_eq!(row.original_key.as_str(), "P|A|SP - U|2024");
        assert_eq!(row.snapshot_year, 2024);
        assert!(row.is_corrected());
    }
}

// ⚖️ Reconciliation Engine - Enrich budget rows with cost-center codes
//
// Left join of the (corrected) budget rows onto the cost-center reference,
// keyed by CanonicalKey:
//
//   every budget row in  =  exactly one enriched row out
//
// Rows whose key has no reference counterpart keep a null code and their
// ORIGINAL key goes into the residual set handed to the Resolver.

use crate::entities::{BudgetRow, CostCenterRow};
use crate::keys::CanonicalKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};

// ============================================================================
// ENRICHED ROW
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRow {
    pub budget: BudgetRow,

    /// CODCCUSTO of the matching reference row, None when unmatched
    pub cost_center_code: Option<String>,

    /// Pass-through columns of the matching reference row
    #[serde(default)]
    pub reference_extra: BTreeMap<String, String>,
}

impl EnrichedRow {
    pub fn is_matched(&self) -> bool {
        self.cost_center_code.is_some()
    }

    /// Budget pass-through columns plus reference ones (reference wins on clash)
    pub fn merged_extra(&self) -> BTreeMap<String, String> {
        let mut merged = self.budget.extra.clone();
        merged.extend(self.reference_extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Hash for duplicate detection across runs.
    /// NOTE: this is for DEDUPLICATION, two identical source lines collapse.
    pub fn idempotency_hash(&self) -> String {
        let budget = &self.budget;
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{:?}|{}|{}",
            budget.original_key,
            budget.key(),
            budget.snapshot_year,
            budget.month,
            budget.value,
            self.cost_center_code.as_deref().unwrap_or_default()
        ));
        for (column, value) in &budget.extra {
            hasher.update(format!("|{}={}", column, value));
        }
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    /// Every budget row found its cost center
    FullyMatched { matched_rows: usize },

    /// Some rows still carry a broken key
    PartiallyMatched {
        matched_rows: usize,
        unmatched_rows: usize,
        distinct_keys: usize,
    },
}

impl ReconciliationResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, ReconciliationResult::FullyMatched { .. })
    }

    pub fn unmatched_rows(&self) -> usize {
        match self {
            ReconciliationResult::FullyMatched { .. } => 0,
            ReconciliationResult::PartiallyMatched { unmatched_rows, .. } => *unmatched_rows,
        }
    }
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Same length and order as the budget input
    pub rows: Vec<EnrichedRow>,

    /// Distinct original keys of unmatched rows
    pub residual_keys: BTreeSet<CanonicalKey>,

    pub result: ReconciliationResult,
    pub reference_rows: usize,
    pub reference_unique: usize,
    pub reconciled_at: chrono::DateTime<chrono::Utc>,
}

impl ReconciliationReport {
    pub fn is_complete(&self) -> bool {
        self.result.is_complete()
    }

    pub fn matched_rows(&self) -> impl Iterator<Item = &EnrichedRow> {
        self.rows.iter().filter(|row| row.is_matched())
    }

    pub fn summary(&self) -> String {
        format!(
            "Enrichment: {} budget rows, {} matched, {} unmatched ({} distinct keys), reference {} rows / {} unique keys",
            self.rows.len(),
            self.rows.len() - self.result.unmatched_rows(),
            self.result.unmatched_rows(),
            self.residual_keys.len(),
            self.reference_rows,
            self.reference_unique
        )
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

#[derive(Default)]
pub struct ReconciliationEngine;

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine
    }

    /// Left join budget rows onto the reference. Duplicate reference keys
    /// keep their first occurrence.
    pub fn enrich(&self, budget: Vec<BudgetRow>, reference: &[CostCenterRow]) -> ReconciliationReport {
        let lookup = Self::reference_index(reference);

        let mut residual_keys = BTreeSet::new();
        let mut unmatched_rows = 0;

        let rows: Vec<EnrichedRow> = budget
            .into_iter()
            .map(|row| match lookup.get(&row.key()) {
                Some(cc) => EnrichedRow {
                    cost_center_code: Some(cc.code.clone()),
                    reference_extra: cc.extra.clone(),
                    budget: row,
                },
                None => {
                    unmatched_rows += 1;
                    residual_keys.insert(row.original_key.clone());
                    EnrichedRow {
                        budget: row,
                        cost_center_code: None,
                        reference_extra: BTreeMap::new(),
                    }
                }
            })
            .collect();

        let matched_rows = rows.len() - unmatched_rows;
        let result = if unmatched_rows == 0 {
            info!("All {} budget rows matched a cost center", matched_rows);
            ReconciliationResult::FullyMatched { matched_rows }
        } else {
            warn!(
                "{} budget rows did not match a cost center ({} distinct keys)",
                unmatched_rows,
                residual_keys.len()
            );
            ReconciliationResult::PartiallyMatched {
                matched_rows,
                unmatched_rows,
                distinct_keys: residual_keys.len(),
            }
        };

        ReconciliationReport {
            rows,
            residual_keys,
            result,
            reference_rows: reference.len(),
            reference_unique: lookup.len(),
            reconciled_at: chrono::Utc::now(),
        }
    }

    fn reference_index(reference: &[CostCenterRow]) -> HashMap<CanonicalKey, &CostCenterRow> {
        let mut lookup = HashMap::with_capacity(reference.len());
        for row in reference {
            lookup.entry(row.key()).or_insert(row);
        }

        if lookup.len() < reference.len() {
            info!(
                "Cost-center reference: {} rows, {} unique keys (duplicates keep first)",
                reference.len(),
                lookup.len()
            );
        }
        lookup
    }
}

// ============================================================================
// TESTS
// ============================================================================

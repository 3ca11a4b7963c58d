// Entity Models
// Rows of the two hierarchies being reconciled:
// - BudgetRow: national budget plan (planned/executed values)
// - CostCenterRow: cost-center structure (reference)
//
// Both derive the same CanonicalKey; rows are re-extracted every run.

pub mod budget;
pub mod cost_center;

pub use budget::BudgetRow;
pub use cost_center::CostCenterRow;

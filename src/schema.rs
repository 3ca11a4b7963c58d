// 📐 Shape Layer - Column schema + key normalization
//
// Turns raw extracted tables into typed rows carrying a CanonicalKey.
// OLAP exports name their columns after member captions; those are renamed
// to the short names through a static lookup table before the column check.

use crate::db::RawTable;
use crate::entities::{BudgetRow, CostCenterRow};
use crate::error::{ReconcileError, Result};
use crate::keys::{normalize_text, parse_year};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use tracing::{debug, info};

// ============================================================================
// COLUMN NAMES
// ============================================================================

pub const COL_PROJECT: &str = "PROJETO";
pub const COL_ACTION: &str = "ACAO";
pub const COL_UNIT: &str = "UNIDADE";
pub const COL_YEAR: &str = "ANO";
pub const COL_MONTH: &str = "MES";
pub const COL_VALUE: &str = "Valor_Ajustado";
pub const COL_COST_CENTER: &str = "CODCCUSTO";
pub const COL_ACTION_DATE: &str = "DTACAO";

/// Columns every source must provide once renamed
pub const KEY_COLUMNS: [&str; 4] = [COL_PROJECT, COL_ACTION, COL_UNIT, COL_YEAR];

/// OLAP member captions → short column names
pub const OLAP_CAPTIONS: &[(&str, &str)] = &[
    ("[Iniciativa].[Iniciativas].[Iniciativa].[MEMBER_CAPTION]", COL_PROJECT),
    ("[Ação].[Ação].[Nome de Ação].[MEMBER_CAPTION]", COL_ACTION),
    (
        "[Unidade Organizacional de Ação].[Unidade Organizacional de Ação].[Nome de Unidade Organizacional de Ação].[MEMBER_CAPTION]",
        COL_UNIT,
    ),
    ("[Tempo].[Ano].[Número Ano].[MEMBER_CAPTION]", COL_YEAR),
    ("[Tempo].[Mês].[Número Mês].[MEMBER_CAPTION]", COL_MONTH),
    ("[PPA].[PPA com Fotografia].[Descrição de PPA com Fotografia].[MEMBER_CAPTION]", "Descricao_PPA"),
    (
        "[Natureza Orçamentária].[Código Estruturado 4 nível].[Código Estruturado 4 nível].[MEMBER_CAPTION]",
        "Codigo_Natureza_Orcamentaria",
    ),
    (
        "[Natureza Orçamentária].[Descrição de Natureza 4 nível].[Descrição de Natureza 4 nível].[MEMBER_CAPTION]",
        "Descricao_Natureza_Orcamentaria",
    ),
    ("[Measures].[ValorAjustado]", COL_VALUE),
];

// ============================================================================
// COLUMN CHECKS
// ============================================================================

pub fn has_olap_captions(table: &RawTable) -> bool {
    table
        .columns
        .iter()
        .any(|column| OLAP_CAPTIONS.iter().any(|(caption, _)| caption == column))
}

/// Fail fast on the first required column that is absent
pub fn require_columns(table: &RawTable, required: &[&str]) -> Result<()> {
    for column in required {
        if !table.has_column(column) {
            return Err(ReconcileError::MissingColumn {
                column: column.to_string(),
                available: table.columns.clone(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// CELL PARSING
// ============================================================================

/// Parse a monetary cell. Handles "1234.56", "1234,56" and "1.234,56";
/// anything else is 0.0.
pub fn parse_decimal(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let cleaned = if trimmed.contains(',') && trimmed.contains('.') {
        trimmed.replace('.', "").replace(',', ".")
    } else {
        trimmed.replace(',', ".")
    };

    cleaned.parse::<f64>().unwrap_or_else(|_| {
        debug!("Unparsable value '{}', using 0.0", raw);
        0.0
    })
}

/// Month cell → 1..=12, anything else is absent
pub fn parse_month(raw: Option<&str>) -> Option<u32> {
    match parse_year(raw) {
        m @ 1..=12 => Some(m as u32),
        _ => None,
    }
}

/// Year of a date/datetime cell (ISO or dd/mm/yyyy). 0 when unparsable.
pub fn year_from_date(raw: Option<&str>) -> i32 {
    let value = match raw.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return 0,
    };

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return dt.year();
        }
    }

    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return date.year();
        }
    }

    0
}

// ============================================================================
// NORMALIZATION
// ============================================================================

fn cell<'a>(table: &RawTable, row: &'a [String], column: &str) -> Option<&'a str> {
    table
        .column_index(column)
        .and_then(|idx| row.get(idx))
        .map(String::as_str)
}

/// Raw budget-plan table → BudgetRows
///
/// Renames OLAP captions when present, then requires PROJETO/ACAO/UNIDADE/ANO.
/// MES and Valor_Ajustado are optional; every other column is carried in
/// `extra`.
pub fn normalize_budget(raw: &RawTable) -> Result<Vec<BudgetRow>> {
    let mut table = raw.clone();
    if has_olap_captions(&table) {
        let renamed = table.rename_columns(OLAP_CAPTIONS);
        debug!("Budget source carries OLAP captions, renamed {} columns", renamed);
    }

    require_columns(&table, &KEY_COLUMNS)?;

    let passthrough: Vec<&String> = table
        .columns
        .iter()
        .filter(|c| !KEY_COLUMNS.contains(&c.as_str()) && *c != COL_MONTH && *c != COL_VALUE)
        .collect();

    let rows: Vec<BudgetRow> = table
        .rows
        .iter()
        .map(|row| {
            let mut budget = BudgetRow::new(
                &normalize_text(cell(&table, row, COL_PROJECT)),
                &normalize_text(cell(&table, row, COL_ACTION)),
                &normalize_text(cell(&table, row, COL_UNIT)),
                parse_year(cell(&table, row, COL_YEAR)),
                parse_month(cell(&table, row, COL_MONTH)),
                cell(&table, row, COL_VALUE).map(parse_decimal).unwrap_or(0.0),
            );
            for column in &passthrough {
                if let Some(value) = cell(&table, row, column) {
                    budget.extra.insert(column.to_string(), value.to_string());
                }
            }
            budget
        })
        .collect();

    info!("Normalized {} budget rows from '{}'", rows.len(), raw.name);
    Ok(rows)
}

/// Raw cost-center structure → CostCenterRows
///
/// ANO is derived from DTACAO when the source has no year column.
pub fn normalize_cost_centers(raw: &RawTable) -> Result<Vec<CostCenterRow>> {
    let year_from_action_date = !raw.has_column(COL_YEAR);
    if year_from_action_date {
        debug!("Cost-center source has no {} column, deriving it from {}", COL_YEAR, COL_ACTION_DATE);
        require_columns(raw, &[COL_ACTION_DATE])?;
    }

    require_columns(raw, &[COL_PROJECT, COL_ACTION, COL_UNIT, COL_COST_CENTER])?;

    let passthrough: Vec<&String> = raw
        .columns
        .iter()
        .filter(|c| !KEY_COLUMNS.contains(&c.as_str()) && *c != COL_COST_CENTER)
        .collect();

    let rows: Vec<CostCenterRow> = raw
        .rows
        .iter()
        .map(|row| {
            let year = if year_from_action_date {
                year_from_date(cell(raw, row, COL_ACTION_DATE))
            } else {
                parse_year(cell(raw, row, COL_YEAR))
            };

            let mut reference = CostCenterRow::new(
                &normalize_text(cell(raw, row, COL_PROJECT)),
                &normalize_text(cell(raw, row, COL_ACTION)),
                &normalize_text(cell(raw, row, COL_UNIT)),
                year,
                cell(raw, row, COL_COST_CENTER).unwrap_or_default(),
            );
            for column in &passthrough {
                if let Some(value) = cell(raw, row, column) {
                    reference.extra.insert(column.to_string(), value.to_string());
                }
            }
            reference
        })
        .collect();

    info!("Normalized {} cost-center rows from '{}'", rows.len(), raw.name);
    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================

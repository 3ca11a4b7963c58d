// 🚚 Pipeline - extract → normalize → correct → enrich → resolve → persist
//
// Plus the maintenance operations behind the CLI subcommands:
// migrate (JSON map → SQL table), rebuild (map from a previous output), stats.

use crate::cache::{CacheOrigin, SourceCache, COST_CENTER_CACHE_TABLE};
use crate::config::{AppConfig, StoreBackend};
use crate::corrections::{
    apply_corrections, migrate_json_to_sql, orphaned_corrections, rebuild_from_pairs,
    CorrectionStore, JsonCorrectionStore, SqlCorrectionStore,
};
use crate::db::{
    get_enriched_key_pairs, last_persist_event, load_csv, replace_enriched_rows, setup_database, verify_count,
    Event, ENRICHED_TABLE,
};
use crate::error::{ReconcileError, Result};
use crate::keys::CanonicalKey;
use crate::reconciliation::{EnrichedRow, ReconciliationEngine};
use crate::resolver::{InteractiveResolver, LineSource, SessionSummary};
use crate::schema::{normalize_budget, normalize_cost_centers};
use crate::suggest::CandidateSuggester;
use rusqlite::Connection;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Column order of the CSV export
pub const EXPORT_COLUMNS: [&str; 13] = [
    "ANO",
    "MES",
    "PROJETO",
    "ACAO",
    "UNIDADE",
    "CODCCUSTO",
    "Valor_Ajustado",
    "Descricao_PPA",
    "Codigo_Natureza_Orcamentaria",
    "Descricao_Natureza_Orcamentaria",
    "DTUNIDADE",
    "DTPROJETO",
    "DTACAO",
];

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Walk the operator through unmatched keys
    pub interactive: bool,
    /// Ignore the source cache and re-extract
    pub refresh_cache: bool,
    pub csv_out: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub cache_origin: CacheOrigin,
    pub budget_rows: usize,
    pub corrected_rows: usize,
    pub matched_rows: usize,
    pub unmatched_rows: usize,
    pub residual_keys: Vec<CanonicalKey>,
    /// Rows in the output table after this run
    pub persisted_rows: usize,
    /// Rows the previous run did not have
    pub inserted_rows: usize,
    /// Rows of the previous run that were replaced or dropped
    pub retired_rows: usize,
    pub exported_rows: Option<usize>,
    pub session: Option<SessionSummary>,
}

/// Correction map backend selected by the configuration
pub fn open_store(config: &AppConfig) -> Result<Box<dyn CorrectionStore>> {
    match config.corrections.backend {
        StoreBackend::Json => Ok(Box::new(JsonCorrectionStore::new(config.json_map_path()))),
        StoreBackend::Sqlite => Ok(Box::new(SqlCorrectionStore::open(&config.sql_map_path())?)),
    }
}

fn extract_sources(config: &AppConfig) -> Result<(crate::db::RawTable, crate::db::RawTable)> {
    let delimiter = config.delimiter_byte()?;
    let budget = load_csv(&config.budget_csv_path(), "orcado", delimiter)?;
    let cost_centers = load_csv(&config.cost_center_csv_path(), "cc", delimiter)?;
    Ok((budget, cost_centers))
}

// ============================================================================
// RUN
// ============================================================================

pub fn run_pipeline(
    config: &AppConfig,
    options: &PipelineOptions,
    input: &mut dyn LineSource,
    out: &mut dyn Write,
) -> Result<PipelineOutcome> {
    // 1. Extract (or read the cache)
    let cache = SourceCache::new(config.cache_db_path());
    let (raw_budget, raw_cost_centers, cache_origin) =
        cache.obtain(options.refresh_cache, || extract_sources(config))?;

    for table in [&raw_budget, &raw_cost_centers] {
        if table.is_empty() {
            error!("Source '{}' is empty, aborting before writing anything", table.name);
            return Err(ReconcileError::EmptySource(table.name.clone()));
        }
    }

    // 2. Normalize
    let mut budget = normalize_budget(&raw_budget)?;
    let cost_centers = normalize_cost_centers(&raw_cost_centers)?;
    let budget_rows = budget.len();

    // 3. Apply known corrections
    let store = open_store(config)?;
    let corrections = store.load_or_empty()?;
    info!("{} known corrections loaded from '{}'", corrections.len(), store.location());

    let reference_keys: HashSet<CanonicalKey> = cost_centers.iter().map(|row| row.key()).collect();
    for (broken, correct) in orphaned_corrections(&corrections, &reference_keys) {
        warn!("Correction '{}' -> '{}' points to a key missing from the reference", broken, correct);
    }
    let corrected_rows = apply_corrections(&mut budget, &corrections);

    // 4. Enrich
    let report = ReconciliationEngine::new().enrich(budget, &cost_centers);
    info!("{}", report.summary());

    // 5. Unmatched keys
    let mut session = None;
    if !report.residual_keys.is_empty() {
        if options.interactive {
            let suggester = CandidateSuggester::new(&cost_centers)
                .with_unit_prefix(&config.matching.unit_prefix)
                .with_fuzzy_limit(config.matching.fuzzy_limit);
            let summary =
                InteractiveResolver::new(store.as_ref(), &suggester).run(&report.residual_keys, input, out)?;
            if summary.accepted > 0 {
                info!("{} new corrections will be applied on the next run", summary.accepted);
            }
            session = Some(summary);
        } else {
            for key in &report.residual_keys {
                warn!("Unmatched key: {}", key);
            }
            info!("Run with --interactive-mode to correct the remaining keys");
        }
    }

    // 6. Persist matched rows (replaces the previous run's output)
    let output_path = config.output_db_path();
    ensure_parent(&output_path)?;
    let conn = Connection::open(&output_path)?;
    setup_database(&conn)?;
    let persisted = replace_enriched_rows(&conn, &report.rows)?;
    info!("'{}' now holds {} rows", ENRICHED_TABLE, verify_count(&conn)?);

    let exported_rows = match &options.csv_out {
        Some(path) => Some(export_csv(path, &report.rows)?),
        None => None,
    };

    Ok(PipelineOutcome {
        cache_origin,
        budget_rows,
        corrected_rows,
        matched_rows: budget_rows - report.result.unmatched_rows(),
        unmatched_rows: report.result.unmatched_rows(),
        residual_keys: report.residual_keys.into_iter().collect(),
        persisted_rows: persisted.written,
        inserted_rows: persisted.added,
        retired_rows: persisted.retired,
        exported_rows,
        session,
    })
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// ============================================================================
// CSV EXPORT
// ============================================================================

/// Brazilian number format: two decimals, comma separator
fn format_value(value: f64) -> String {
    format!("{:.2}", value).replace('.', ",")
}

/// Write matched rows as `;`-separated CSV. Returns the number of rows.
pub fn export_csv(path: &Path, rows: &[EnrichedRow]) -> Result<usize> {
    ensure_parent(path)?;
    let mut writer = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;
    writer.write_record(EXPORT_COLUMNS)?;

    let mut written = 0;
    for row in rows.iter().filter(|row| row.is_matched()) {
        let budget = &row.budget;
        let extra = row.merged_extra();
        let record: Vec<String> = EXPORT_COLUMNS
            .iter()
            .map(|column| match *column {
                "ANO" => budget.snapshot_year.to_string(),
                "MES" => budget.month.map(|m| m.to_string()).unwrap_or_default(),
                "PROJETO" => budget.project.clone(),
                "ACAO" => budget.action.clone(),
                "UNIDADE" => budget.unit.clone(),
                "CODCCUSTO" => row.cost_center_code.clone().unwrap_or_default(),
                "Valor_Ajustado" => format_value(budget.value),
                other => extra.get(other).cloned().unwrap_or_default(),
            })
            .collect();
        writer.write_record(&record)?;
        written += 1;
    }
    writer.flush()?;

    info!("Exported {} rows to '{}'", written, path.display());
    Ok(written)
}

// ============================================================================
// MAINTENANCE
// ============================================================================

/// Replace the SQL correction table with the JSON map
pub fn migrate_corrections(config: &AppConfig, from: Option<&Path>) -> Result<usize> {
    let json_path = from.map(Path::to_path_buf).unwrap_or_else(|| config.json_map_path());
    let json = JsonCorrectionStore::new(json_path);
    let sql = SqlCorrectionStore::open(&config.sql_map_path())?;
    migrate_json_to_sql(&json, &sql)
}

/// Rebuild the configured correction map from the enriched output table,
/// replacing its current contents
pub fn rebuild_corrections(config: &AppConfig) -> Result<usize> {
    let output_path = config.output_db_path();
    if !output_path.exists() {
        return Err(ReconcileError::Config(format!(
            "output database '{}' not found, run the pipeline first",
            output_path.display()
        )));
    }

    let conn = Connection::open(&output_path)?;
    let pairs = get_enriched_key_pairs(&conn)?;
    info!("{} rows read from '{}'", pairs.len(), ENRICHED_TABLE);

    let map = rebuild_from_pairs(pairs);
    if map.is_empty() {
        warn!("No corrected keys in '{}', nothing to rebuild", ENRICHED_TABLE);
        return Ok(0);
    }

    match config.corrections.backend {
        StoreBackend::Json => JsonCorrectionStore::new(config.json_map_path()).save(&map)?,
        StoreBackend::Sqlite => {
            SqlCorrectionStore::open(&config.sql_map_path())?.replace_all(&map)?;
        }
    }

    info!("Correction map rebuilt with {} entries", map.len());
    Ok(map.len())
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub backend: String,
    pub corrections: usize,
    /// None when no reference snapshot is cached
    pub orphaned: Option<usize>,
    pub cache_present: bool,
    pub enriched_rows: Option<i64>,
    /// Audit entry of the latest pipeline run
    pub last_run: Option<Event>,
}

pub fn collect_stats(config: &AppConfig) -> Result<Stats> {
    let store = open_store(config)?;
    let map = store.load_or_empty()?;

    let cache = SourceCache::new(config.cache_db_path());
    let orphaned = match cache.exists().then(|| cache.load(COST_CENTER_CACHE_TABLE)) {
        Some(Ok(raw)) => {
            let reference: HashSet<CanonicalKey> =
                normalize_cost_centers(&raw)?.iter().map(|row| row.key()).collect();
            Some(orphaned_corrections(&map, &reference).len())
        }
        Some(Err(e)) => {
            warn!("Cache '{}' unreadable: {}", cache.path().display(), e);
            None
        }
        None => None,
    };

    let output_path = config.output_db_path();
    let (enriched_rows, last_run) = if output_path.exists() {
        let conn = Connection::open(&output_path)?;
        setup_database(&conn)?;
        (Some(verify_count(&conn)?), last_persist_event(&conn)?)
    } else {
        (None, None)
    };

    Ok(Stats {
        backend: config.corrections.backend.to_string(),
        corrections: map.len(),
        orphaned,
        cache_present: cache.exists(),
        enriched_rows,
        last_run,
    })
}

// ============================================================================
// TESTS
// ============================================================================

// 🗄️ Storage layer - CSV source loading + SQLite output tables
//
// Raw sources are read as untyped tables (column name → text cell) so that
// the key normalizer can deal with source-specific column names.
// The enriched table always mirrors the latest run, so re-corrected keys or
// revised values never leave a stale copy behind.

use crate::error::Result;
use crate::keys::CanonicalKey;
use crate::reconciliation::EnrichedRow;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Final table holding budget rows enriched with their cost-center code
pub const ENRICHED_TABLE: &str = "orcado_enriquecido_com_cc";

// ============================================================================
// RAW TABLE
// ============================================================================

/// An extracted source before normalization: ordered columns plus text cells
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(name: &str, columns: Vec<String>) -> Self {
        RawTable {
            name: name.to_string(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row, padding or truncating it to the column count
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.columns.len(), String::new());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    /// Rename columns through a lookup table, returns how many were renamed
    pub fn rename_columns(&mut self, renames: &[(&str, &str)]) -> usize {
        let mut renamed = 0;
        for column in self.columns.iter_mut() {
            if let Some((_, short)) = renames.iter().find(|(long, _)| long == column) {
                *column = short.to_string();
                renamed += 1;
            }
        }
        renamed
    }
}

// ============================================================================
// CSV LOADING
// ============================================================================

/// Guess the delimiter from the header line: `;` exports (pt-BR Excel) or `,`
pub fn sniff_delimiter(header_line: &str) -> u8 {
    let semicolons = header_line.matches(';').count();
    let commas = header_line.matches(',').count();
    if semicolons >= commas && semicolons > 0 {
        b';'
    } else {
        b','
    }
}

/// Load a delimited export into a RawTable.
/// `delimiter = None` sniffs it from the header line.
pub fn load_csv(csv_path: &Path, name: &str, delimiter: Option<u8>) -> Result<RawTable> {
    let content = fs::read_to_string(csv_path)?;
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content);

    let delimiter = delimiter
        .unwrap_or_else(|| sniff_delimiter(content.lines().next().unwrap_or_default()));

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(content.as_bytes());

    let columns: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut table = RawTable::new(name, columns);
    for record in rdr.records() {
        let record = record?;
        table.push_row(record.iter().map(str::to_string).collect());
    }

    debug!(
        "Loaded {} rows x {} columns from '{}'",
        table.len(),
        table.columns.len(),
        csv_path.display()
    );

    Ok(table)
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {ENRICHED_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                idempotency_hash TEXT UNIQUE NOT NULL,
                ANO INTEGER NOT NULL,
                MES INTEGER,
                PROJETO TEXT NOT NULL,
                ACAO TEXT NOT NULL,
                UNIDADE TEXT NOT NULL,
                CODCCUSTO TEXT NOT NULL,
                Valor_Ajustado REAL NOT NULL,
                CHAVE_CONCAT TEXT NOT NULL,
                CHAVE_CONCAT_original TEXT NOT NULL,
                extra TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )"
        ),
        [],
    )?;

    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_enriched_key ON {ENRICHED_TABLE}(CHAVE_CONCAT)"),
        [],
    )?;

    setup_events_table(conn)?;

    Ok(())
}

/// Audit trail table, shared by the output database and the SQL correction map
pub fn setup_events_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// EVENTS
// ============================================================================

/// Event for the audit trail ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// ENRICHED OUTPUT
// ============================================================================

/// What one run did to the output table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistSummary {
    /// Rows now in the table
    pub written: usize,
    /// Rows absent from the previous run's output
    pub added: usize,
    /// Rows of the previous run's output that are gone (key re-corrected,
    /// code or value revised, row now unmatched)
    pub retired: usize,
}

/// Replace the table with this run's matched rows (one transaction).
/// Unmatched rows (no cost-center code) are never written; identical source
/// lines collapse on the idempotency hash.
pub fn replace_enriched_rows(conn: &Connection, rows: &[EnrichedRow]) -> Result<PersistSummary> {
    let tx = conn.unchecked_transaction()?;

    let previous: HashSet<String> = {
        let mut stmt = tx.prepare(&format!("SELECT idempotency_hash FROM {ENRICHED_TABLE}"))?;
        let hashes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<String>, _>>()?;
        hashes
    };
    tx.execute(&format!("DELETE FROM {ENRICHED_TABLE}"), [])?;

    let mut current = HashSet::new();
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT OR IGNORE INTO {ENRICHED_TABLE} (
                idempotency_hash, ANO, MES, PROJETO, ACAO, UNIDADE, CODCCUSTO,
                Valor_Ajustado, CHAVE_CONCAT, CHAVE_CONCAT_original, extra
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ))?;

        for row in rows {
            let code = match &row.cost_center_code {
                Some(code) => code,
                None => continue,
            };

            let budget = &row.budget;
            let hash = row.idempotency_hash();
            let extra_json = serde_json::to_string(&row.merged_extra())?;

            stmt.execute(params![
                hash,
                budget.snapshot_year,
                budget.month,
                budget.project,
                budget.action,
                budget.unit,
                code,
                budget.value,
                budget.key().as_str(),
                budget.original_key.as_str(),
                extra_json,
            ])?;
            current.insert(hash);
        }
    }

    let summary = PersistSummary {
        written: current.len(),
        added: current.difference(&previous).count(),
        retired: previous.difference(&current).count(),
    };

    let event = Event::new(
        "enriched_rows_replaced",
        "table",
        ENRICHED_TABLE,
        serde_json::to_value(summary)?,
        "pipeline",
    );
    insert_event(&tx, &event)?;
    tx.commit()?;

    info!(
        "'{}' replaced: {} rows ({} new, {} retired)",
        ENRICHED_TABLE, summary.written, summary.added, summary.retired
    );

    Ok(summary)
}

/// Most recent `enriched_rows_replaced` event, if the pipeline ever ran
pub fn last_persist_event(conn: &Connection) -> Result<Option<Event>> {
    let events = get_events_for_entity(conn, "table", ENRICHED_TABLE)?;
    Ok(events.into_iter().next())
}

/// (original key, corrected key) pairs of every persisted enriched row
pub fn get_enriched_key_pairs(conn: &Connection) -> Result<Vec<(CanonicalKey, CanonicalKey)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT CHAVE_CONCAT_original, CHAVE_CONCAT FROM {ENRICHED_TABLE} ORDER BY id"
    ))?;

    let pairs = stmt
        .query_map([], |row| {
            let original: String = row.get(0)?;
            let corrected: String = row.get(1)?;
            Ok((CanonicalKey::from_raw(original), CanonicalKey::from_raw(corrected)))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(pairs)
}

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {ENRICHED_TABLE}"),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// TESTS
// ============================================================================

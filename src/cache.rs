// 💾 Source Cache - raw extracts kept in a local SQLite file
//
// First run: extract from the sources, store both raw tables here.
// Later runs: read the tables back instead of re-extracting.
// Unreadable cache: delete the file, extract again, rebuild it.

use crate::db::RawTable;
use crate::error::{ReconcileError, Result};
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const BUDGET_CACHE_TABLE: &str = "orcado_nacional_raw";
pub const COST_CENTER_CACHE_TABLE: &str = "cc_estrutura_raw";

/// Where the raw tables of a run came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOrigin {
    Cache,
    Extracted,
    /// Cache existed but could not be read; it was deleted and rebuilt
    Rebuilt,
}

pub struct SourceCache {
    path: PathBuf,
}

impl SourceCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SourceCache { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Connection::open(&self.path)?)
    }

    fn setup(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS raw_tables (
                name TEXT PRIMARY KEY NOT NULL,
                columns TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                stored_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS raw_rows (
                table_name TEXT NOT NULL,
                position INTEGER NOT NULL,
                cells TEXT NOT NULL,
                PRIMARY KEY (table_name, position)
            )",
            [],
        )?;
        Ok(())
    }

    /// Replace the cached copy of every given table
    pub fn store(&self, tables: &[&RawTable]) -> Result<()> {
        let conn = self.open()?;
        Self::setup(&conn)?;

        let tx = conn.unchecked_transaction()?;
        for table in tables {
            tx.execute("DELETE FROM raw_rows WHERE table_name = ?1", params![table.name])?;
            tx.execute(
                "INSERT OR REPLACE INTO raw_tables (name, columns, row_count, stored_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    table.name,
                    serde_json::to_string(&table.columns)?,
                    table.len() as i64,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;

            let mut stmt =
                tx.prepare("INSERT INTO raw_rows (table_name, position, cells) VALUES (?1, ?2, ?3)")?;
            for (position, row) in table.rows.iter().enumerate() {
                stmt.execute(params![table.name, position as i64, serde_json::to_string(row)?])?;
            }
        }
        tx.commit()?;

        info!("Raw data cached in '{}'", self.path.display());
        Ok(())
    }

    /// Read one cached table. A missing table or a row count that does not
    /// match the header is an error, so a half-written cache gets rebuilt.
    pub fn load(&self, name: &str) -> Result<RawTable> {
        let conn = self.open()?;

        let (columns_json, row_count): (String, i64) = conn.query_row(
            "SELECT columns, row_count FROM raw_tables WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let columns: Vec<String> = serde_json::from_str(&columns_json)?;

        let mut table = RawTable::new(name, columns);
        let mut stmt = conn.prepare("SELECT cells FROM raw_rows WHERE table_name = ?1 ORDER BY position")?;
        let cells = stmt.query_map(params![name], |row| row.get::<_, String>(0))?;
        for json in cells {
            table.push_row(serde_json::from_str(&json?)?);
        }

        if table.len() as i64 != row_count {
            return Err(ReconcileError::InconsistentCache(format!(
                "table '{}' has {} rows, header says {}",
                name,
                table.len(),
                row_count
            )));
        }

        Ok(table)
    }

    /// Delete the cache file. Returns whether there was one.
    pub fn invalidate(&self) -> Result<bool> {
        if !self.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)?;
        warn!("Cache '{}' deleted", self.path.display());
        Ok(true)
    }

    fn load_pair(&self) -> Result<(RawTable, RawTable)> {
        Ok((self.load(BUDGET_CACHE_TABLE)?, self.load(COST_CENTER_CACHE_TABLE)?))
    }

    fn extract_and_store<F>(&self, extract: F) -> Result<(RawTable, RawTable)>
    where
        F: FnOnce() -> Result<(RawTable, RawTable)>,
    {
        let (mut budget, mut cost_centers) = extract()?;
        budget.name = BUDGET_CACHE_TABLE.to_string();
        cost_centers.name = COST_CENTER_CACHE_TABLE.to_string();

        self.store(&[&budget, &cost_centers])?;
        Ok((budget, cost_centers))
    }

    /// Budget and cost-center raw tables, from the cache when possible.
    /// `refresh` ignores an existing cache and re-extracts.
    pub fn obtain<F>(&self, refresh: bool, extract: F) -> Result<(RawTable, RawTable, CacheOrigin)>
    where
        F: FnOnce() -> Result<(RawTable, RawTable)>,
    {
        if refresh {
            self.invalidate()?;
        }

        if !self.exists() {
            warn!("Cache '{}' not found, extracting from sources", self.path.display());
            let (budget, cost_centers) = self.extract_and_store(extract)?;
            return Ok((budget, cost_centers, CacheOrigin::Extracted));
        }

        info!("Loading raw data from cache '{}'", self.path.display());
        match self.load_pair() {
            Ok((budget, cost_centers)) => Ok((budget, cost_centers, CacheOrigin::Cache)),
            Err(e) => {
                error!("Cannot read cache '{}': {}", self.path.display(), e);
                self.invalidate()?;
                let (budget, cost_centers) = self.extract_and_store(extract)?;
                Ok((budget, cost_centers, CacheOrigin::Rebuilt))
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

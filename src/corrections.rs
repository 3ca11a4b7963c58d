// 🩹 Correction Map Store - broken key → correct key, reused across runs
//
// Two backends behind one trait:
// - JsonCorrectionStore: whole-file overwrite, pretty-printed, keys sorted
// - SqlCorrectionStore: table MapaCorrecoesChaves, one upsert per entry
//
// The store is the only mutation surface for corrections. It does not
// re-validate CorrectKeys against the reference on load; see
// `orphaned_corrections` for that report.

use crate::db::{insert_event, setup_events_table, Event};
use crate::entities::BudgetRow;
use crate::error::{ReconcileError, Result};
use crate::keys::CanonicalKey;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const CORRECTION_TABLE: &str = "MapaCorrecoesChaves";

/// Sorted so JSON output and listings are stable
pub type CorrectionMap = BTreeMap<CanonicalKey, CanonicalKey>;

// ============================================================================
// STORE TRAIT
// ============================================================================

pub trait CorrectionStore {
    /// Where the map lives, for log messages
    fn location(&self) -> String;

    /// Full map. Empty when nothing was persisted yet.
    fn load(&self) -> Result<CorrectionMap>;

    /// Persist every entry of `map`
    fn save(&self, map: &CorrectionMap) -> Result<()>;

    /// Persist a single accepted correction (last write wins)
    fn upsert(&self, broken: &CanonicalKey, correct: &CanonicalKey) -> Result<()>;

    /// `load` with a corrupted backing store collapsed to an empty map.
    /// Any other failure still propagates.
    fn load_or_empty(&self) -> Result<CorrectionMap> {
        match self.load() {
            Err(ReconcileError::CorruptedCorrectionMap { location, reason }) => {
                warn!(
                    "Correction map at '{}' is corrupted ({}); continuing with no corrections",
                    location, reason
                );
                Ok(CorrectionMap::new())
            }
            other => other,
        }
    }
}

// ============================================================================
// JSON BACKEND
// ============================================================================

pub struct JsonCorrectionStore {
    path: PathBuf,
}

impl JsonCorrectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonCorrectionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CorrectionStore for JsonCorrectionStore {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<CorrectionMap> {
        if !self.path.exists() {
            return Ok(CorrectionMap::new());
        }

        let data = fs::read_to_string(&self.path)?;
        serde_json::from_str(&data).map_err(|e| ReconcileError::CorruptedCorrectionMap {
            location: self.location(),
            reason: e.to_string(),
        })
    }

    fn save(&self, map: &CorrectionMap) -> Result<()> {
        if let Err(ReconcileError::CorruptedCorrectionMap { reason, .. }) = self.load() {
            self.quarantine(&reason)?;
        }
        self.write_map(map)
    }

    fn upsert(&self, broken: &CanonicalKey, correct: &CanonicalKey) -> Result<()> {
        let mut map = match self.load() {
            Err(ReconcileError::CorruptedCorrectionMap { reason, .. }) => {
                self.quarantine(&reason)?;
                CorrectionMap::new()
            }
            other => other?,
        };
        map.insert(broken.clone(), correct.clone());
        self.write_map(&map)
    }
}

impl JsonCorrectionStore {
    fn write_map(&self, map: &CorrectionMap) -> Result<()> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        map.serialize(&mut ser)?;
        buf.push(b'\n');

        write_atomic(&self.path, &buf)?;
        info!("Correction map saved to '{}' ({} entries)", self.location(), map.len());
        Ok(())
    }

    /// Move an undecodable map aside (`<path>.corrupt`, then `.corrupt.1`, ...)
    /// so the next write cannot destroy it
    fn quarantine(&self, reason: &str) -> Result<PathBuf> {
        let mut target = self.path.as_os_str().to_owned();
        target.push(".corrupt");
        let base = PathBuf::from(target);

        let mut target = base.clone();
        let mut n = 0;
        while target.exists() {
            n += 1;
            let mut next = base.as_os_str().to_owned();
            next.push(format!(".{}", n));
            target = PathBuf::from(next);
        }

        fs::rename(&self.path, &target)?;
        error!(
            "Correction map '{}' is corrupted ({}); moved to '{}' before writing",
            self.location(),
            reason,
            target.display()
        );
        Ok(target)
    }
}

/// Write to a sibling temp file, then rename over the target
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================================================
// SQL BACKEND
// ============================================================================

pub struct SqlCorrectionStore {
    conn: Connection,
    label: String,
}

impl SqlCorrectionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, &db_path.display().to_string())
    }

    pub fn from_connection(conn: Connection, label: &str) -> Result<Self> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {CORRECTION_TABLE} (
                    ChaveQuebrada TEXT PRIMARY KEY NOT NULL,
                    ChaveCorreta TEXT NOT NULL
                )"
            ),
            [],
        )?;
        setup_events_table(&conn)?;

        Ok(SqlCorrectionStore {
            conn,
            label: label.to_string(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn upsert_row(conn: &Connection, broken: &CanonicalKey, correct: &CanonicalKey) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {CORRECTION_TABLE} (ChaveQuebrada, ChaveCorreta)
                 VALUES (?1, ?2)
                 ON CONFLICT(ChaveQuebrada) DO UPDATE SET
                     ChaveCorreta = excluded.ChaveCorreta"
            ),
            params![broken.as_str(), correct.as_str()],
        )?;
        Ok(())
    }

    /// Current target of one broken key
    pub fn get(&self, broken: &CanonicalKey) -> Result<Option<CanonicalKey>> {
        let correct: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT ChaveCorreta FROM {CORRECTION_TABLE} WHERE ChaveQuebrada = ?1"),
                params![broken.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(correct.map(CanonicalKey::from_raw))
    }

    /// Drop every stored correction and insert `map` instead (one transaction)
    pub fn replace_all(&self, map: &CorrectionMap) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(&format!("DELETE FROM {CORRECTION_TABLE}"), [])?;
        for (broken, correct) in map {
            Self::upsert_row(&tx, broken, correct)?;
        }
        tx.commit()?;

        warn!("Table '{}' replaced with {} corrections", CORRECTION_TABLE, map.len());
        Ok(map.len())
    }
}

impl CorrectionStore for SqlCorrectionStore {
    fn location(&self) -> String {
        format!("{}#{}", self.label, CORRECTION_TABLE)
    }

    fn load(&self) -> Result<CorrectionMap> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT ChaveQuebrada, ChaveCorreta FROM {CORRECTION_TABLE}"
        ))?;

        let map = stmt
            .query_map([], |row| {
                let broken: String = row.get(0)?;
                let correct: String = row.get(1)?;
                Ok((CanonicalKey::from_raw(broken), CanonicalKey::from_raw(correct)))
            })?
            .collect::<std::result::Result<CorrectionMap, _>>()?;

        Ok(map)
    }

    fn save(&self, map: &CorrectionMap) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (broken, correct) in map {
            Self::upsert_row(&tx, broken, correct)?;
        }
        tx.commit()?;

        info!("Upserted {} corrections into '{}'", map.len(), self.location());
        Ok(())
    }

    fn upsert(&self, broken: &CanonicalKey, correct: &CanonicalKey) -> Result<()> {
        Self::upsert_row(&self.conn, broken, correct)?;

        let event = Event::new(
            "correction_saved",
            "correction",
            broken.as_str(),
            serde_json::json!({ "correct": correct.as_str() }),
            "resolver",
        );
        insert_event(&self.conn, &event)?;

        Ok(())
    }
}

// ============================================================================
// APPLYING / AUDITING CORRECTIONS
// ============================================================================

/// Rewrite the key of every budget row whose key is a known broken key.
/// Returns the number of rows rewritten. `original_key` is preserved.
pub fn apply_corrections(rows: &mut [BudgetRow], map: &CorrectionMap) -> usize {
    if map.is_empty() {
        return 0;
    }

    let mut corrected = 0;
    for row in rows.iter_mut() {
        let target = match map.get(&row.key()) {
            Some(target) => target,
            None => continue,
        };

        match target.parts() {
            Ok(parts) => {
                row.apply_parts(&parts);
                corrected += 1;
            }
            Err(e) => {
                error!("Cannot apply correction for '{}': {}", row.key(), e);
            }
        }
    }

    if corrected > 0 {
        info!(
            "Applied {} known corrections to {} budget rows",
            map.len(),
            corrected
        );
    }

    corrected
}

/// Entries whose CorrectKey no longer exists in the reference
pub fn orphaned_corrections<'a>(
    map: &'a CorrectionMap,
    reference_keys: &HashSet<CanonicalKey>,
) -> Vec<(&'a CanonicalKey, &'a CanonicalKey)> {
    map.iter()
        .filter(|(_, correct)| !reference_keys.contains(*correct))
        .collect()
}

/// Rebuild a map from (original key, corrected key) pairs of a previous
/// enriched output. Pairs where nothing changed are dropped.
pub fn rebuild_from_pairs<I>(pairs: I) -> CorrectionMap
where
    I: IntoIterator<Item = (CanonicalKey, CanonicalKey)>,
{
    pairs
        .into_iter()
        .filter(|(original, corrected)| original != corrected)
        .collect()
}

/// Replace the SQL table with the JSON map. A corrupted JSON file is an error
/// here: migrating an empty map would wipe the table.
pub fn migrate_json_to_sql(json: &JsonCorrectionStore, sql: &SqlCorrectionStore) -> Result<usize> {
    if !json.path().exists() {
        return Err(ReconcileError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("correction map '{}' not found", json.location()),
        )));
    }

    let map = json.load()?;
    if map.is_empty() {
        warn!("Correction map '{}' is empty, nothing to migrate", json.location());
        return Ok(0);
    }

    info!("Migrating {} corrections from '{}'", map.len(), json.location());
    sql.replace_all(&map)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::get_events_for_entity;

    fn key(s: &str) -> CanonicalKey {
        CanonicalKey::from_raw(s)
    }

    fn sample_map() -> CorrectionMap {
        let mut map = CorrectionMap::new();
        map.insert(key("P|A|SP - U|2024"), key("P|A|U|2025"));
        map.insert(key("Q|B|V|2023"), key("Q|B2|V|2025"));
        map
    }

    fn sql_store() -> SqlCorrectionStore {
        SqlCorrectionStore::from_connection(Connection::open_in_memory().unwrap(), ":memory:").unwrap()
    }

    #[test]
    fn test_json_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCorrectionStore::new(dir.path().join("mapa_correcoes.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_save_is_sorted_and_pretty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dados").join("mapa_correcoes.json");
        let store = JsonCorrectionStore::new(&path);

        let mut map = CorrectionMap::new();
        map.insert(key("Z|Ação|U|2024"), key("Z|Ação|U|2025"));
        map.insert(key("A|B|C|2024"), key("A|B|C|2025"));
        store.save(&map).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let first = text.find("A|B|C|2024").unwrap();
        let second = text.find("Z|Ação|U|2024").unwrap();
        assert!(first < second, "keys must be sorted");
        assert!(text.contains("\n    \"A|B|C|2024\": \"A|B|C|2025\""));
        assert!(text.contains("Ação"), "non-ASCII must not be escaped");
    }

    #[test]
    fn test_json_round_trip_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCorrectionStore::new(dir.path().join("mapa.json"));
        store.save(&sample_map()).unwrap();

        let loaded = store.load().unwrap();
        store.save(&loaded).unwrap();

        assert_eq!(store.load().unwrap(), sample_map());
    }

    #[test]
    fn test_json_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapa.json");
        fs::write(&path, "{ not json").unwrap();
        let store = JsonCorrectionStore::new(&path);

        assert!(matches!(
            store.load(),
            Err(ReconcileError::CorruptedCorrectionMap { .. })
        ));
        assert!(store.load_or_empty().unwrap().is_empty());
    }

    #[test]
    fn test_json_upsert_keeps_corrupted_map_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapa.json");
        let truncated = "{\n    \"P|A|U|2024\": \"P|A|U|2025\",\n    \"Q|B|V|20";
        fs::write(&path, truncated).unwrap();
        let store = JsonCorrectionStore::new(&path);

        store.upsert(&key("X|Y|Z|2024"), &key("X|Y|Z|2025")).unwrap();

        let aside = dir.path().join("mapa.json.corrupt");
        assert_eq!(fs::read_to_string(&aside).unwrap(), truncated);
        assert_eq!(store.load().unwrap().len(), 1);

        // A second corruption does not overwrite the first backup
        fs::write(&path, "{ broken again").unwrap();
        store.save(&sample_map()).unwrap();

        assert_eq!(fs::read_to_string(&aside).unwrap(), truncated);
        assert_eq!(
            fs::read_to_string(dir.path().join("mapa.json.corrupt.1")).unwrap(),
            "{ broken again"
        );
        assert_eq!(store.load().unwrap(), sample_map());
    }

    #[test]
    fn test_json_upsert_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCorrectionStore::new(dir.path().join("mapa.json"));

        store.upsert(&key("P|A|U|2024"), &key("P|A|U|2025")).unwrap();
        store.upsert(&key("P|A|U|2024"), &key("P|A|U2|2025")).unwrap();

        let map = store.load().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&key("P|A|U|2024")], key("P|A|U2|2025"));
    }

    #[test]
    fn test_sql_round_trip_is_noop() {
        let store = sql_store();
        assert!(store.load().unwrap().is_empty());

        store.save(&sample_map()).unwrap();
        let loaded = store.load().unwrap();
        store.save(&loaded).unwrap();

        assert_eq!(store.load().unwrap(), sample_map());
    }

    #[test]
    fn test_sql_upsert_merges_and_logs_event() {
        let store = sql_store();

        store.upsert(&key("P|A|U|2024"), &key("P|A|U|2025")).unwrap();
        store.upsert(&key("P|A|U|2024"), &key("P|A|U2|2025")).unwrap();

        assert_eq!(store.load().unwrap().len(), 1);
        assert_eq!(store.get(&key("P|A|U|2024")).unwrap(), Some(key("P|A|U2|2025")));

        let events = get_events_for_entity(store.connection(), "correction", "P|A|U|2024").unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_sql_save_keeps_entries_not_in_map() {
        let store = sql_store();
        store.upsert(&key("OLD|A|U|2020"), &key("OLD|A|U|2021")).unwrap();

        store.save(&sample_map()).unwrap();

        assert_eq!(store.load().unwrap().len(), 3);
    }

    #[test]
    fn test_migrate_json_to_sql_replaces_table() {
        let dir = tempfile::tempdir().unwrap();
        let json = JsonCorrectionStore::new(dir.path().join("mapa.json"));
        json.save(&sample_map()).unwrap();

        let sql = sql_store();
        sql.upsert(&key("STALE|A|U|2020"), &key("STALE|A|U|2021")).unwrap();

        assert_eq!(migrate_json_to_sql(&json, &sql).unwrap(), 2);
        assert_eq!(sql.load().unwrap(), sample_map());
    }

    #[test]
    fn test_apply_corrections_rewrites_keys() {
        let mut rows = vec![
            BudgetRow::new("P", "A", "SP - U", 2024, None, 10.0),
            BudgetRow::new("X", "Y", "Z", 2025, None, 20.0),
        ];

        let corrected = apply_corrections(&mut rows, &sample_map());

        assert_eq!(corrected, 1);
        assert_eq!(rows[0].key().as_str(), "P|A|U|2025");
        assert_eq!(rows[0].original_key.as_str(), "P|A|SP - U|2024");
        assert!(!rows[1].is_corrected());
    }

    #[test]
    fn test_apply_corrections_skips_malformed_targets() {
        let mut rows = vec![BudgetRow::new("P", "A", "U", 2024, None, 10.0)];
        let mut map = CorrectionMap::new();
        map.insert(key("P|A|U|2024"), key("broken target"));

        assert_eq!(apply_corrections(&mut rows, &map), 0);
        assert_eq!(rows[0].key().as_str(), "P|A|U|2024");
    }

    #[test]
    fn test_orphaned_corrections() {
        let map = sample_map();
        let reference: HashSet<CanonicalKey> = [key("P|A|U|2025")].into_iter().collect();

        let orphans = orphaned_corrections(&map, &reference);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].1, &key("Q|B2|V|2025"));
    }

    #[test]
    fn test_rebuild_from_pairs_drops_unchanged() {
        let map = rebuild_from_pairs(vec![
            (key("P|A|U|2024"), key("P|A|U|2025")),
            (key("P|A|U|2024"), key("P|A|U|2025")),
            (key("X|Y|Z|2025"), key("X|Y|Z|2025")),
        ]);
        assert_eq!(map.len(), 1);
    }
}

//! Run configuration
//!
//! Resolution order, highest first:
//! 1. Environment (`BUDGET_RECONCILE_DATA_DIR`, `BUDGET_RECONCILE_BACKEND`)
//! 2. TOML file passed with `--config`
//! 3. Compiled defaults
//!
//! Relative paths are resolved against `data_dir`.

use crate::error::{ReconcileError, Result};
use crate::suggest::{DEFAULT_FUZZY_LIMIT, DEFAULT_UNIT_PREFIX};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_DATA_DIR: &str = "BUDGET_RECONCILE_DATA_DIR";
pub const ENV_BACKEND: &str = "BUDGET_RECONCILE_BACKEND";

/// Which correction map backend a run reads and writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(StoreBackend::Json),
            "sqlite" | "sql" => Ok(StoreBackend::Sqlite),
            other => Err(ReconcileError::Config(format!(
                "unknown correction backend '{}' (expected json or sqlite)",
                other
            ))),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Json => f.write_str("json"),
            StoreBackend::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Correction map location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionsConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// JSON map file
    #[serde(default = "default_json_path")]
    pub json_path: PathBuf,

    /// SQLite file holding the MapaCorrecoesChaves table
    #[serde(default = "default_sql_path")]
    pub sql_path: PathBuf,
}

impl Default for CorrectionsConfig {
    fn default() -> Self {
        CorrectionsConfig {
            backend: StoreBackend::default(),
            json_path: default_json_path(),
            sql_path: default_sql_path(),
        }
    }
}

/// Candidate suggester tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Unit prefix tolerated on either side of an exact match
    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,

    /// How many fuzzy candidates are listed
    #[serde(default = "default_fuzzy_limit")]
    pub fuzzy_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            unit_prefix: default_unit_prefix(),
            fuzzy_limit: default_fuzzy_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Budget plan export (CSV)
    #[serde(default = "default_budget_csv")]
    pub budget_csv: PathBuf,

    /// Cost-center structure export (CSV)
    #[serde(default = "default_cost_center_csv")]
    pub cost_center_csv: PathBuf,

    #[serde(default = "default_cache_db")]
    pub cache_db: PathBuf,

    /// Holds the enriched output table
    #[serde(default = "default_output_db")]
    pub output_db: PathBuf,

    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Single-character CSV delimiter; sniffed from the header when absent
    #[serde(default)]
    pub delimiter: Option<String>,

    #[serde(default)]
    pub corrections: CorrectionsConfig,

    #[serde(default)]
    pub matching: MatchingConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_budget_csv() -> PathBuf {
    PathBuf::from("orcado_nacional.csv")
}

fn default_cost_center_csv() -> PathBuf {
    PathBuf::from("cc_estrutura.csv")
}

fn default_cache_db() -> PathBuf {
    PathBuf::from("cache_dados.db")
}

fn default_output_db() -> PathBuf {
    PathBuf::from("orcado_enriquecido.db")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_json_path() -> PathBuf {
    PathBuf::from("mapa_correcoes.json")
}

fn default_sql_path() -> PathBuf {
    PathBuf::from("mapa_correcoes.db")
}

fn default_unit_prefix() -> String {
    DEFAULT_UNIT_PREFIX.to_string()
}

fn default_fuzzy_limit() -> usize {
    DEFAULT_FUZZY_LIMIT
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            data_dir: default_data_dir(),
            budget_csv: default_budget_csv(),
            cost_center_csv: default_cost_center_csv(),
            cache_db: default_cache_db(),
            output_db: default_output_db(),
            logs_dir: default_logs_dir(),
            delimiter: None,
            corrections: CorrectionsConfig::default(),
            matching: MatchingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, overlaid with `path` when given, then with the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ReconcileError::Config(format!("cannot read '{}': {}", path.display(), e))
                })?;
                Self::from_toml_str(&text)?
            }
            None => AppConfig::default(),
        };

        config.apply_overrides(
            std::env::var(ENV_DATA_DIR).ok(),
            std::env::var(ENV_BACKEND).ok(),
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ReconcileError::Config(e.to_string()))
    }

    /// Environment overrides, split out so they can be tested without
    /// touching the process environment
    pub fn apply_overrides(&mut self, data_dir: Option<String>, backend: Option<String>) -> Result<()> {
        if let Some(dir) = data_dir.filter(|d| !d.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(backend) = backend.filter(|b| !b.trim().is_empty()) {
            self.corrections.backend = backend.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.delimiter_byte()?;
        if self.matching.fuzzy_limit == 0 {
            return Err(ReconcileError::Config("matching.fuzzy_limit must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Anchor a configured path at `data_dir` unless it is absolute
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn delimiter_byte(&self) -> Result<Option<u8>> {
        let raw = match &self.delimiter {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let raw = if raw == "\\t" { "\t" } else { raw.as_str() };
        match raw.as_bytes() {
            [byte] => Ok(Some(*byte)),
            _ => Err(ReconcileError::Config(format!(
                "delimiter must be a single ASCII character, got '{}'",
                raw
            ))),
        }
    }

    pub fn budget_csv_path(&self) -> PathBuf {
        self.resolve(&self.budget_csv)
    }

    pub fn cost_center_csv_path(&self) -> PathBuf {
        self.resolve(&self.cost_center_csv)
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.resolve(&self.cache_db)
    }

    pub fn output_db_path(&self) -> PathBuf {
        self.resolve(&self.output_db)
    }

    pub fn logs_dir_path(&self) -> PathBuf {
        self.resolve(&self.logs_dir)
    }

    pub fn json_map_path(&self) -> PathBuf {
        self.resolve(&self.corrections.json_path)
    }

    pub fn sql_map_path(&self) -> PathBuf {
        self.resolve(&self.corrections.sql_path)
    }
}

// Budget Key Reconciliation - Core Library
// Exposes all modules for use in the CLI and tests

pub mod error;
pub mod keys;           // Canonical keys: PROJECT|ACTION|UNIT|YEAR
pub mod entities;       // Budget rows and cost-center rows
pub mod db;             // CSV loading, output table, event log
pub mod schema;         // Column renaming + normalization into typed rows
pub mod corrections;    // Correction map store (JSON / SQLite)
pub mod suggest;        // Candidate suggester
pub mod resolver;       // Interactive resolver (state machine + shell)
pub mod reconciliation; // Enrichment merge
pub mod cache;          // SQLite cache of raw extracts
pub mod config;
pub mod logging;
pub mod pipeline;

// Re-export commonly used types
pub use error::{ReconcileError, Result};
pub use keys::{CanonicalKey, KeyComponent, KeyParts};
pub use entities::{BudgetRow, CostCenterRow};
pub use db::{
    RawTable, Event, PersistSummary,
    load_csv, setup_database, replace_enriched_rows, get_enriched_key_pairs,
    verify_count, insert_event, get_events_for_entity, last_persist_event,
};
pub use schema::{normalize_budget, normalize_cost_centers};
pub use corrections::{
    CorrectionMap, CorrectionStore, JsonCorrectionStore, SqlCorrectionStore,
    apply_corrections, orphaned_corrections, rebuild_from_pairs, migrate_json_to_sql,
};
pub use suggest::{CandidateSuggester, RankedCandidate, Suggestion};
pub use resolver::{
    KeyResolution, ResolutionState, AcceptOrigin, Prompt, Notice,
    InteractiveResolver, LineSource, StdinSource, ScriptedSource, SessionSummary,
};
pub use reconciliation::{
    ReconciliationEngine, ReconciliationReport, ReconciliationResult, EnrichedRow,
};
pub use cache::{SourceCache, CacheOrigin};
pub use config::{AppConfig, StoreBackend};
pub use pipeline::{PipelineOptions, PipelineOutcome, run_pipeline};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// End-to-end runs of the pipeline over CSV exports in a temp directory

use budget_reconcile::config::AppConfig;
use budget_reconcile::pipeline::{collect_stats, rebuild_corrections};
use budget_reconcile::{
    run_pipeline, CacheOrigin, CanonicalKey, CorrectionStore, JsonCorrectionStore, PipelineOptions,
    ReconcileError, ScriptedSource,
};
use rusqlite::Connection;
use std::fs;
use std::path::Path;

const BUDGET_CSV: &str = "\
PROJETO;ACAO;UNIDADE;ANO;MES;Valor_Ajustado;Descricao_PPA
P1;A1;U1;2025;1;100,00;Plano um
Projeto X;Acao Y;SP - Unidade Z;2024;2;50,5;Plano dois
Projeto X;Acao Y;SP - Unidade Z;2024;3;70;Plano dois
";

const COST_CENTER_CSV: &str = "\
PROJETO;ACAO;UNIDADE;ANO;CODCCUSTO;DTACAO
P1;A1;U1;2025;CC-1;2025-01-01
Projeto X;Acao Y;Unidade Z;2025;CC-2;2025-02-01
Projeto X;Acao Y;Unidade Z;2024;CC-OLD;2024-02-01
";

fn workspace(budget: &str, cost_centers: &str) -> (tempfile::TempDir, AppConfig) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("orcado_nacional.csv"), budget).unwrap();
    fs::write(dir.path().join("cc_estrutura.csv"), cost_centers).unwrap();

    let config = AppConfig {
        data_dir: dir.path().to_path_buf(),
        ..AppConfig::default()
    };
    (dir, config)
}

fn run(config: &AppConfig, options: &PipelineOptions, answers: &[&str]) -> budget_reconcile::PipelineOutcome {
    let mut input = ScriptedSource::new(answers.iter().copied());
    let mut out = Vec::new();
    run_pipeline(config, options, &mut input, &mut out).unwrap()
}

fn key(s: &str) -> CanonicalKey {
    CanonicalKey::from_raw(s)
}

#[test]
fn test_correct_then_enrich_across_runs() {
    let (dir, config) = workspace(BUDGET_CSV, COST_CENTER_CSV);
    let batch = PipelineOptions::default();

    // Run 1: one key fails, only the matched row is persisted
    let first = run(&config, &batch, &[]);
    assert_eq!(first.cache_origin, CacheOrigin::Extracted);
    assert_eq!(first.budget_rows, 3);
    assert_eq!(first.matched_rows, 1);
    assert_eq!(first.unmatched_rows, 2);
    assert_eq!(first.residual_keys, vec![key("PROJETO X|ACAO Y|SP - UNIDADE Z|2024")]);
    assert_eq!(first.inserted_rows, 1);
    assert!(first.session.is_none());

    // Run 2: operator accepts the suggested key (most recent year)
    let interactive = PipelineOptions {
        interactive: true,
        ..PipelineOptions::default()
    };
    let second = run(&config, &interactive, &["s"]);
    assert_eq!(second.cache_origin, CacheOrigin::Cache);
    assert_eq!(second.session.as_ref().map(|s| s.accepted), Some(1));
    assert_eq!(second.inserted_rows, 0);

    let map = JsonCorrectionStore::new(dir.path().join("mapa_correcoes.json")).load().unwrap();
    assert_eq!(
        map.get(&key("PROJETO X|ACAO Y|SP - UNIDADE Z|2024")),
        Some(&key("PROJETO X|ACAO Y|UNIDADE Z|2025"))
    );

    // Run 3: the stored correction is applied, no prompt needed
    let csv_path = dir.path().join("export").join("enriquecido.csv");
    let third = run(
        &config,
        &PipelineOptions {
            interactive: true,
            csv_out: Some(csv_path.clone()),
            ..PipelineOptions::default()
        },
        &[],
    );
    assert_eq!(third.corrected_rows, 2);
    assert_eq!(third.unmatched_rows, 0);
    assert_eq!(third.inserted_rows, 2);
    assert!(third.session.is_none());
    assert_eq!(third.exported_rows, Some(3));

    let exported = fs::read_to_string(&csv_path).unwrap();
    assert!(exported.contains("2024;2;PROJETO X;ACAO Y;UNIDADE Z;CC-2;50,50;Plano dois"));

    // Idempotent persistence: a fourth run adds nothing
    let fourth = run(&config, &batch, &[]);
    assert_eq!(fourth.inserted_rows, 0);

    let stats = collect_stats(&config).unwrap();
    assert_eq!(stats.corrections, 1);
    assert_eq!(stats.orphaned, Some(0));
    assert_eq!(stats.enriched_rows, Some(3));
    assert!(stats.cache_present);
    let last_run = stats.last_run.unwrap();
    assert_eq!(last_run.data["written"], 3);
    assert_eq!(last_run.data["added"], 0);
}

#[test]
fn test_changed_correction_replaces_persisted_row() {
    let (dir, config) = workspace(
        "PROJETO;ACAO;UNIDADE;ANO;MES;Valor_Ajustado\nP;A;SP - U;2024;1;100\n",
        "PROJETO;ACAO;UNIDADE;ANO;CODCCUSTO;DTACAO\nP;A;U;2025;CC-1;2025-01-01\nP;A;U2;2025;CC-2;2025-01-01\n",
    );
    let store = JsonCorrectionStore::new(dir.path().join("mapa_correcoes.json"));
    store.upsert(&key("P|A|SP - U|2024"), &key("P|A|U|2025")).unwrap();

    let first = run(&config, &PipelineOptions::default(), &[]);
    assert_eq!(first.matched_rows, 1);
    assert_eq!(first.persisted_rows, 1);

    // Operator re-points the broken key
    store.upsert(&key("P|A|SP - U|2024"), &key("P|A|U2|2025")).unwrap();
    let second = run(&config, &PipelineOptions::default(), &[]);
    assert_eq!(second.matched_rows, 1);
    assert_eq!(second.persisted_rows, 1);
    assert_eq!(second.inserted_rows, 1);
    assert_eq!(second.retired_rows, 1);

    let conn = Connection::open(dir.path().join("orcado_enriquecido.db")).unwrap();
    let (rows, total, code): (i64, f64, String) = conn
        .query_row(
            "SELECT COUNT(*), SUM(Valor_Ajustado), MAX(CODCCUSTO) FROM orcado_enriquecido_com_cc",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(total, 100.0);
    assert_eq!(code, "CC-2");
}

#[test]
fn test_rebuild_map_from_output() {
    let (dir, config) = workspace(BUDGET_CSV, COST_CENTER_CSV);
    let map_path = dir.path().join("mapa_correcoes.json");

    run(&config, &PipelineOptions { interactive: true, ..PipelineOptions::default() }, &["s"]);
    run(&config, &PipelineOptions::default(), &[]);

    fs::remove_file(&map_path).unwrap();
    assert_eq!(rebuild_corrections(&config).unwrap(), 1);

    let rebuilt = JsonCorrectionStore::new(&map_path).load().unwrap();
    assert_eq!(
        rebuilt.get(&key("PROJETO X|ACAO Y|SP - UNIDADE Z|2024")),
        Some(&key("PROJETO X|ACAO Y|UNIDADE Z|2025"))
    );
}

#[test]
fn test_corrupted_map_does_not_stop_the_run() {
    let (dir, config) = workspace(BUDGET_CSV, COST_CENTER_CSV);
    fs::write(dir.path().join("mapa_correcoes.json"), "{ broken").unwrap();

    let outcome = run(&config, &PipelineOptions::default(), &[]);

    assert_eq!(outcome.corrected_rows, 0);
    assert_eq!(outcome.unmatched_rows, 2);
}

#[test]
fn test_empty_source_aborts_without_output() {
    let (dir, config) = workspace("PROJETO;ACAO;UNIDADE;ANO\n", COST_CENTER_CSV);

    let mut input = ScriptedSource::new(Vec::<String>::new());
    let mut out = Vec::new();
    let result = run_pipeline(&config, &PipelineOptions::default(), &mut input, &mut out);

    assert!(matches!(result, Err(ReconcileError::EmptySource(_))));
    assert!(!dir.path().join("orcado_enriquecido.db").exists());
}

#[test]
fn test_missing_column_fails_fast() {
    let (_dir, config) = workspace("PROJETO;ACAO;ANO\nP1;A1;2025\n", COST_CENTER_CSV);

    let mut input = ScriptedSource::new(Vec::<String>::new());
    let mut out = Vec::new();
    let result = run_pipeline(&config, &PipelineOptions::default(), &mut input, &mut out);

    match result {
        Err(ReconcileError::MissingColumn { column, .. }) => assert_eq!(column, "UNIDADE"),
        other => panic!("expected a missing column error, got {:?}", other.map(|o| o.budget_rows)),
    }
}

#[test]
fn test_corrupt_cache_is_rebuilt_from_sources() {
    let (dir, config) = workspace(BUDGET_CSV, COST_CENTER_CSV);
    let cache_path: &Path = &dir.path().join("cache_dados.db");
    fs::write(cache_path, b"garbage bytes instead of a sqlite database").unwrap();

    let outcome = run(&config, &PipelineOptions::default(), &[]);

    assert_eq!(outcome.cache_origin, CacheOrigin::Rebuilt);
    assert_eq!(outcome.budget_rows, 3);
}

//! THE MOST IMPORTANT TEST IN THE PROJECT.
//!
//! Two engines, same corpus, same overrides.
//! They must produce identical event logs, warehouse rows and dashboards.
//! Any divergence is a blocker: do not merge until fixed.

mod common;

use distmetrics_core::{
    config::PipelineConfig,
    engine::{MetricsEngine, PipelineOutput},
    ingest::RawCorpus,
    store::WarehouseStore,
};

const RUN_ID: &str = "det-test";
const GENERATED_AT: &str = "2026-01-01T00:00:00Z";

/// Every table persisted as JSON rows.
const DERIVED_TABLES: &[&str] = &[
    "dim_indicador_servico",
    "fato_uc_ativa_mensal_distribuidora",
    "fato_indicadores_anuais",
    "fato_servicos_municipio_mes",
    "fato_transgressao_mensal_porte",
    "grupos_anual_sem_cod_69_93",
    "grupos_classe_local",
    "grupos_share_codigos_foco",
    "grupos_alertas_comparabilidade",
    "grupos_longa",
    "grupos_longa_resumo",
    "grupos_data_quality_checks",
    "grupos_cobertura_mensal",
];

fn build_engine() -> MetricsEngine {
    common::init_logging();
    let store = WarehouseStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    let config = PipelineConfig::default_test(std::path::Path::new("unused"));
    MetricsEngine::new(RUN_ID.into(), config, store)
}

fn execute(engine: &mut MetricsEngine, corpus: &RawCorpus) -> PipelineOutput {
    engine
        .execute(corpus, &common::fixture_overrides(), GENERATED_AT)
        .expect("execute")
}

fn event_log(engine: &MetricsEngine) -> Vec<String> {
    engine
        .events()
        .expect("read events")
        .into_iter()
        .map(|e| format!("{} {} {}", e.seq, e.event_type, e.payload))
        .collect()
}

fn assert_same_warehouse(a: &MetricsEngine, b: &MetricsEngine) {
    assert_eq!(
        a.store().group_members(RUN_ID).expect("members a"),
        b.store().group_members(RUN_ID).expect("members b"),
    );
    for table in DERIVED_TABLES {
        let rows_a = a.store().derived_rows(RUN_ID, table).expect("rows a");
        let rows_b = b.store().derived_rows(RUN_ID, table).expect("rows b");
        assert_eq!(rows_a.len(), rows_b.len(), "row counts differ for {table}");
        for (i, (ra, rb)) in rows_a.iter().zip(rows_b.iter()).enumerate() {
            assert_eq!(ra, rb, "{table} diverged at row {i}:\n  A: {ra}\n  B: {rb}");
        }
    }
}

#[test]
fn same_inputs_produce_identical_outputs() {
    let corpus = common::fixture_corpus();
    let mut engine_a = build_engine();
    let mut engine_b = build_engine();

    let out_a = execute(&mut engine_a, &corpus);
    let out_b = execute(&mut engine_b, &corpus);

    let log_a = event_log(&engine_a);
    let log_b = event_log(&engine_b);
    assert_eq!(
        log_a.len(), log_b.len(),
        "Event log lengths differ: {} vs {}",
        log_a.len(), log_b.len()
    );
    for (i, (a, b)) in log_a.iter().zip(log_b.iter()).enumerate() {
        assert_eq!(a, b, "Event log diverged at entry {i}:\n  A: {a}\n  B: {b}");
    }

    assert_same_warehouse(&engine_a, &engine_b);
    assert_eq!(out_a.facts.monthly, out_b.facts.monthly);
    assert_eq!(out_a.analysis.trends, out_b.analysis.trends);
    assert_eq!(
        serde_json::to_string(&out_a.dashboard).expect("serialize a"),
        serde_json::to_string(&out_b.dashboard).expect("serialize b"),
    );
}

#[test]
fn input_row_order_does_not_change_outputs() {
    let corpus = common::fixture_corpus();
    let mut reversed = common::fixture_corpus();
    reversed.indicators.rows.reverse();
    reversed.domain.rows.reverse();
    reversed.connections.rows.reverse();
    reversed.services.rows.reverse();

    let mut engine_a = build_engine();
    let mut engine_b = build_engine();
    let out_a = execute(&mut engine_a, &corpus);
    let out_b = execute(&mut engine_b, &reversed);

    assert_same_warehouse(&engine_a, &engine_b);
    assert_eq!(out_a.group_dimension, out_b.group_dimension);
    assert_eq!(out_a.analysis.benchmark, out_b.analysis.benchmark);
    assert_eq!(out_a.dashboard, out_b.dashboard);
}

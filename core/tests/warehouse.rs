//! Warehouse persistence and the run event log.

mod common;

use distmetrics_core::{
    config::PipelineConfig,
    engine::MetricsEngine,
    event::StageEvent,
    store::WarehouseStore,
};

const RUN_ID: &str = "wh-test";

fn executed_engine() -> MetricsEngine {
    let store = WarehouseStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    let config = PipelineConfig::default_test(std::path::Path::new("unused"));
    let mut engine = MetricsEngine::new(RUN_ID.into(), config, store);
    engine
        .execute(&common::fixture_corpus(), &common::fixture_overrides(), "2026-01-01T00:00:00Z")
        .expect("execute");
    engine
}

#[test]
fn migrations_are_idempotent() {
    let store = WarehouseStore::in_memory().expect("in-memory store");
    store.migrate().expect("first migration");
    store.migrate().expect("second migration");
    assert_eq!(store.path(), None);
}

#[test]
fn every_table_is_stored_under_the_run_id() {
    let engine = executed_engine();
    let store = engine.store();
    let count = |table: &str| store.table_count(RUN_ID, table).expect("count");

    assert_eq!(count("dim_distributor_group"), 4);
    assert_eq!(count("dim_distribuidora_porte"), 6);
    assert_eq!(count("fato_transgressao_mensal_distribuidora"), 12);
    assert_eq!(count("fato_anual_grupo"), 6);
    assert_eq!(count("kpi_regulatorio_anual"), 2);
    assert_eq!(count("trend"), 16);
    assert_eq!(count("benchmark"), 4);
    assert_eq!(count("grupos_longa"), 4);
    assert_eq!(count("grupos_anual_sem_cod_69_93"), 6);

    assert_eq!(store.table_count("other-run", "trend").expect("count"), 0);
    assert_eq!(store.run_status(RUN_ID).expect("status").as_deref(), Some("running"));
}

#[test]
fn stored_annual_totals_match_stored_monthly_rows() {
    let engine = executed_engine();
    let store = engine.store();
    for (distributor, ano) in [
        ("neoenergia_coelba", 2023),
        ("neoenergia_coelba", 2025),
        ("cpfl_paulista", 2025),
        ("cemig_d", 2025),
    ] {
        let monthly = store.monthly_late_total(RUN_ID, distributor, ano).expect("monthly total");
        let annual = store.annual_late_total(RUN_ID, distributor, ano).expect("annual total");
        assert_eq!(annual, Some(monthly), "{distributor} {ano}");
    }
    assert_eq!(store.annual_late_total(RUN_ID, "cemig_d", 2023).expect("annual total"), None);
}

#[test]
fn stored_trend_keeps_null_deltas() {
    let engine = executed_engine();
    let (base, last, pct) = engine
        .store()
        .trend_for(RUN_ID, "neoenergia_coelba", "taxa_fora_prazo")
        .expect("coelba trend");
    assert_eq!((base, last), (Some(0.1), Some(0.05)));
    assert!(pct.is_some_and(|p| (p + 0.5).abs() < 1e-9));

    let (base, _, pct) = engine
        .store()
        .trend_for(RUN_ID, "cemig_d", "taxa_fora_prazo")
        .expect("cemig trend");
    assert_eq!((base, pct), (None, None));
}

#[test]
fn group_members_follow_the_dimension() {
    let engine = executed_engine();
    let members = engine.store().group_members(RUN_ID).expect("members");
    let pairs: Vec<(&str, &str)> = members.iter().map(|(g, d)| (g.as_str(), d.as_str())).collect();
    assert_eq!(
        pairs,
        vec![
            ("cemig", "cemig_d"),
            ("cpfl", "cpfl_paulista"),
            ("cpfl", "cpfl_piratininga"),
            ("neoenergia", "neoenergia_coelba"),
        ]
    );
}

#[test]
fn event_log_records_stages_in_order() {
    let engine = executed_engine();
    let events = engine.events().expect("events");

    let seqs: Vec<u32> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<u32> = (1..=events.len() as u32).collect();
    assert_eq!(seqs, expected);

    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        &types[..4],
        &["run_started", "overrides_loaded", "sources_loaded", "identities_resolved"]
    );
    assert!(types[4..14].iter().all(|t| *t == "table_built"));
    assert_eq!(types[14], "referential_check_passed");
    assert_eq!(types.last().copied(), Some("comparability_break"));

    let first: StageEvent = serde_json::from_str(&events[0].payload).expect("decode run_started");
    assert_eq!(
        first,
        StageEvent::RunStarted { run_id: RUN_ID.into(), version: env!("CARGO_PKG_VERSION").into() }
    );
    let sources: StageEvent = serde_json::from_str(&events[2].payload).expect("decode sources_loaded");
    assert_eq!(
        sources,
        StageEvent::SourcesLoaded {
            indicators: 8,
            indicator_domain: 4,
            connections: 12,
            services: 13,
            skipped_rows: 0,
        }
    );
    assert!(events.iter().any(|e| e.event_type == "spike_detected"
        && e.payload.contains("cpfl_paulista")));
}

#[test]
fn rows_are_isolated_by_run_id() {
    let store = WarehouseStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    let config = PipelineConfig::default_test(std::path::Path::new("unused"));
    let mut first = MetricsEngine::new("run-a".into(), config, store);
    first
        .execute(&common::fixture_corpus(), &common::fixture_overrides(), "2026-01-01T00:00:00Z")
        .expect("first run");

    assert_eq!(first.store().table_count("run-a", "trend").expect("count"), 16);
    assert_eq!(first.store().table_count("run-b", "trend").expect("count"), 0);
    assert_eq!(first.store().derived_rows("run-b", "grupos_longa").expect("rows").len(), 0);
}

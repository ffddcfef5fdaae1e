//! End-to-end: raw files on disk to CSV tables and the dashboard document.

mod common;

use distmetrics_core::{
    config::PipelineConfig,
    engine::MetricsEngine,
    error::PipelineError,
    export::{self, DASHBOARD_FILE, REQUIRED_SECTIONS},
    store::WarehouseStore,
};
use serde_json::Value;
use std::path::Path;

fn engine_for(dir: &Path) -> MetricsEngine {
    common::init_logging();
    let store = WarehouseStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    MetricsEngine::new("e2e-test".into(), PipelineConfig::default_test(dir), store)
}

fn read_dashboard(dir: &Path) -> Value {
    let text = std::fs::read_to_string(dir.join("out").join(DASHBOARD_FILE)).expect("dashboard file");
    serde_json::from_str(&text).expect("dashboard is JSON")
}

fn csv_rows(path: &Path) -> usize {
    let mut reader = csv::Reader::from_path(path).expect("open csv");
    reader.records().map(|r| r.expect("csv record")).count()
}

#[test]
fn full_run_writes_tables_and_dashboard() {
    let tmp = tempfile::tempdir().expect("tempdir");
    common::write_fixture_files(tmp.path());

    let mut engine = engine_for(tmp.path());
    let summary = engine.run().expect("run");

    assert_eq!(summary.distributors, 4);
    assert_eq!(summary.groups, 3);
    assert_eq!(summary.monthly_rows, 12);
    assert_eq!(summary.alerts, 1);
    assert_eq!(summary.tables_exported, 22);
    assert_eq!(summary.dashboard_path, tmp.path().join("out").join(DASHBOARD_FILE));
    assert_eq!(
        engine.store().run_status("e2e-test").expect("status").as_deref(),
        Some("completed")
    );

    let out = tmp.path().join("out");
    assert_eq!(csv_rows(&out.join("dim_distributor_group.csv")), 4);
    assert_eq!(csv_rows(&out.join("kpi_regulatorio_anual.csv")), 2);
    assert_eq!(csv_rows(&out.join("grupos").join("grupos_tendencia.csv")), 16);
    assert_eq!(csv_rows(&out.join("grupos").join("grupos_benchmark_porte_latest.csv")), 4);

    let events = engine.events().expect("events");
    assert_eq!(events.last().map(|e| e.event_type.as_str()), Some("run_completed"));
    assert_eq!(events.iter().filter(|e| e.event_type == "table_exported").count(), 22);
}

#[test]
fn dashboard_has_every_section_filled() {
    let tmp = tempfile::tempdir().expect("tempdir");
    common::write_fixture_files(tmp.path());
    engine_for(tmp.path()).run().expect("run");

    let dashboard = read_dashboard(tmp.path());
    export::validate_dashboard(&dashboard).expect("contract holds");
    for section in REQUIRED_SECTIONS {
        assert!(dashboard.get(*section).is_some(), "missing {section}");
    }

    assert_eq!(dashboard["default_group_id"], "neoenergia");
    assert_eq!(dashboard["meta"]["run_id"], "e2e-test");
    let views = dashboard["group_views"].as_object().expect("group views object");
    let ids: Vec<&str> = views.keys().map(String::as_str).collect();
    assert_eq!(ids, vec!["cemig", "cpfl", "neoenergia"]);
    assert_eq!(views["cpfl"]["group_label"], "Grupo CPFL");
    assert_eq!(views["neoenergia"]["group_label"], "Neoenergia");

    let overview = &dashboard["kpi_overview"];
    assert!((overview["pre_taxa_media"].as_f64().expect("pre") - 0.1).abs() < 1e-9);
    assert!((overview["pos_taxa_media"].as_f64().expect("pos") - 0.175).abs() < 1e-9);

    assert_eq!(dashboard["top_distributors"][0]["distributor_id"], "cemig_d");
    assert_eq!(dashboard["default_class"], "grupo_b_urbana");
    let classes = dashboard["regulatory_classes"].as_array().expect("classes");
    assert!(classes.iter().any(|c| c == "grupo_a"));
}

#[test]
fn run_without_overrides_file_still_completes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    common::write_fixture_files(tmp.path());
    std::fs::remove_file(tmp.path().join("overrides.json")).expect("remove overrides");

    engine_for(tmp.path()).run().expect("run");

    let dashboard = read_dashboard(tmp.path());
    export::validate_dashboard(&dashboard).expect("contract holds");
    assert_eq!(dashboard["default_group_id"], "neoenergia");
    assert_eq!(dashboard["group_views"]["neoenergia"]["group_label"], "Grupo Neoenergia");
}

#[test]
fn run_fails_on_missing_source() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let err = engine_for(tmp.path()).run().expect_err("no raw files");
    assert!(matches!(err, PipelineError::MissingSource { .. }), "got {err:?}");
    assert!(!tmp.path().join("out").join(DASHBOARD_FILE).exists());
}

#[test]
fn contract_violation_blocks_the_write() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let payload = serde_json::json!({ "meta": { "run_id": "x" }, "kpi_overview": {} });
    let err = export::write_dashboard(tmp.path(), &payload).expect_err("incomplete payload");
    match err {
        PipelineError::DashboardContract { missing } => {
            assert!(missing.contains(&"kpi_overview".to_string()));
            assert!(missing.contains(&"group_views".to_string()));
            assert!(!missing.contains(&"meta".to_string()));
        }
        other => panic!("expected contract violation, got {other:?}"),
    }
    assert!(!tmp.path().join(DASHBOARD_FILE).exists());
}

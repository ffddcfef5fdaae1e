//! metrics-runner: headless batch runner for the distributor metrics engine.
//!
//! Usage:
//!   metrics-runner --data-dir data/raw --out data/processed/analysis --db warehouse.db
//!   metrics-runner --config config/pipeline.json --validate-only
//!   metrics-runner --audit-naming

use anyhow::{bail, Context, Result};
use distmetrics_core::{
    config::PipelineConfig,
    dimension::{
        audit_labels, audit_misgrouped, build_group_dimension, collect_identities, to_group_objects,
        EntityDirectory,
    },
    engine::MetricsEngine,
    ingest,
    overrides::OverrideStore,
    store::WarehouseStore,
};
use std::env;
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let config_path = flag_value(&args, "--config").unwrap_or("config/pipeline.json");
    let mut config = PipelineConfig::load_or_default(Path::new(config_path))?;
    if let Some(dir) = flag_value(&args, "--data-dir") {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(dir) = flag_value(&args, "--out") {
        config.output_dir = PathBuf::from(dir);
    }
    if let Some(path) = flag_value(&args, "--overrides") {
        config.overrides_path = PathBuf::from(path);
    }
    config.top_n_distributors = parse_arg(&args, "--top-n", config.top_n_distributors);
    config.spike_threshold = parse_arg(&args, "--spike-threshold", config.spike_threshold);
    let db = flag_value(&args, "--db").unwrap_or(":memory:");

    if args.iter().any(|a| a == "--validate-only") {
        return validate(&config);
    }
    if args.iter().any(|a| a == "--audit-naming") {
        return audit_naming(&config);
    }

    println!("Distributor metrics: metrics-runner");
    println!("  data_dir:  {}", config.data_dir.display());
    println!("  out:       {}", config.output_dir.display());
    println!("  overrides: {}", config.overrides_path.display());
    println!("  db:        {db}");
    println!();

    let store = WarehouseStore::open(db).with_context(|| format!("Failed to open warehouse {db}"))?;
    store.migrate()?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let mut engine = MetricsEngine::new(run_id, config, store);
    let summary = engine.run()?;

    println!("Run {} completed.", summary.run_id);
    println!("  distributors:    {}", summary.distributors);
    println!("  groups:          {}", summary.groups);
    println!("  monthly rows:    {}", summary.monthly_rows);
    println!("  spikes:          {}", summary.spikes);
    println!("  breaks:          {}", summary.alerts);
    println!("  tables exported: {}", summary.tables_exported);
    println!("  dashboard:       {}", summary.dashboard_path.display());
    log::debug!("event log entries: {}", engine.events()?.len());
    Ok(())
}

/// Header contracts of every raw source, without building anything.
fn validate(config: &PipelineConfig) -> Result<()> {
    let errors = ingest::validate_raw_contracts(config);
    if errors.is_empty() {
        println!("Raw contracts OK ({})", config.data_dir.display());
        return Ok(());
    }
    for error in &errors {
        eprintln!(" - {error}");
    }
    bail!("{} raw contract violation(s)", errors.len())
}

/// Resolve identities and groups only, and report naming problems.
fn audit_naming(config: &PipelineConfig) -> Result<()> {
    let overrides = OverrideStore::load(&config.overrides_path)?;
    let corpus = ingest::load_corpus(config)?;
    let registry = collect_identities(&overrides, &corpus);
    let directory = EntityDirectory::build(&overrides, &registry);
    let dimension = build_group_dimension(&directory);
    let groups = to_group_objects(&dimension);

    println!("{}", serde_json::to_string_pretty(&groups)?);
    let broken = audit_labels(&dimension);
    let misgrouped = audit_misgrouped(&dimension);
    if broken.is_empty() && misgrouped.is_empty() {
        println!("{} distributors in {} groups, naming audit OK", dimension.len(), groups.len());
        return Ok(());
    }
    for id in &broken {
        eprintln!(" - inconsistent label: {id}");
    }
    if !misgrouped.is_empty() {
        let shown: Vec<&str> = misgrouped.iter().take(10).map(String::as_str).collect();
        eprintln!(" - unexpected group companhia for: {}", shown.join(", "));
    }
    bail!(
        "naming audit failed: {} inconsistent label(s), {} misgrouped distributor(s)",
        broken.len(),
        misgrouped.len()
    )
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

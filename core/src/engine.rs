//! The metrics engine: one deterministic batch pass over a raw corpus.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Overrides        (loaded once, absence tolerated)
//!   2. Ingest           (raw tables, schema contracts)
//!   3. Identity         (registry of resolved distributors)
//!   4. Directory        (one group per distributor)
//!   5. Dimension        (group dimension, group objects)
//!   6. Facts            (see facts.rs BUILD ORDER)
//!   7. Referential      (every fact key exists in the dimension)
//!   8. Trends           (trend, benchmark, spikes, diagnostics)
//!   9. Persist          (warehouse rows keyed by run_id)
//!  10. Export           (CSV tables, dashboard document)
//!
//! RULES:
//!   - Each stage consumes fully built tables from the stages before it.
//!   - Stages never touch the database; the engine hands tables to the store.
//!   - Every completed stage is recorded in the run event log.
//!   - No wall-clock value reaches a derived table.

use crate::{
    config::PipelineConfig,
    dimension::{
        audit_labels, audit_misgrouped, build_group_dimension, check_referential_completeness,
        collect_identities, to_group_objects, EconomicGroup, EntityDirectory, GroupDimensionRow,
    },
    error::PipelineResult,
    event::{EventLogEntry, StageEvent},
    export::{self, DashboardInputs},
    facts::{self, FactTables},
    ingest::{self, RawCorpus},
    overrides::OverrideStore,
    store::WarehouseStore,
    trends::{self, AnalysisTables},
    types::RunId,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Every table one pass produces, plus the dashboard document.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub group_dimension: Vec<GroupDimensionRow>,
    pub groups:          Vec<EconomicGroup>,
    pub facts:           FactTables,
    pub analysis:        AnalysisTables,
    pub dashboard:       Value,
}

/// End-of-run counters printed by the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id:          RunId,
    pub distributors:    usize,
    pub groups:          usize,
    pub monthly_rows:    usize,
    pub spikes:          usize,
    pub alerts:          usize,
    pub tables_exported: usize,
    pub dashboard_path:  PathBuf,
}

pub struct MetricsEngine {
    pub run_id: RunId,
    config:     PipelineConfig,
    store:      WarehouseStore,
    seq:        u32,
}

impl MetricsEngine {
    pub fn new(run_id: RunId, config: PipelineConfig, store: WarehouseStore) -> Self {
        Self { run_id, config, store, seq: 0 }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &WarehouseStore {
        &self.store
    }

    /// Load overrides and raw sources from disk, run every stage, export,
    /// and mark the run completed.
    pub fn run(&mut self) -> PipelineResult<RunSummary> {
        let overrides = OverrideStore::load(&self.config.overrides_path)?;
        let corpus = ingest::load_corpus(&self.config)?;
        let generated_at = chrono::Utc::now().to_rfc3339();

        let output = self.execute(&corpus, &overrides, &generated_at)?;
        let exported = self.export(&output)?;
        let dashboard_path = self.config.output_dir.join(export::DASHBOARD_FILE);
        self.finish(exported.len())?;

        Ok(RunSummary {
            run_id: self.run_id.clone(),
            distributors: output.group_dimension.len(),
            groups: output.groups.len(),
            monthly_rows: output.facts.monthly.len(),
            spikes: output.analysis.spikes.len(),
            alerts: output
                .analysis
                .comparability_alerts
                .iter()
                .filter(|a| a.alerta_quebra_volume || a.alerta_quebra_mix)
                .count(),
            tables_exported: exported.len(),
            dashboard_path,
        })
    }

    /// Stages 3 to 9 over an already loaded corpus. The warehouse holds
    /// every derived row for this run when this returns.
    pub fn execute(
        &mut self,
        corpus: &RawCorpus,
        overrides: &OverrideStore,
        generated_at: &str,
    ) -> PipelineResult<PipelineOutput> {
        self.store
            .insert_run(&self.run_id, env!("CARGO_PKG_VERSION"), generated_at)?;
        self.emit(
            "engine",
            StageEvent::RunStarted {
                run_id: self.run_id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )?;
        log::info!("stage=engine run {} started", self.run_id);

        self.emit(
            "overrides",
            StageEvent::OverridesLoaded {
                group_assignments: overrides.distributor_to_group.len(),
                group_labels: overrides.group_labels.len(),
                name_overrides: overrides.name_overrides.len(),
                aliases: overrides.aliases.len(),
            },
        )?;
        let skipped = corpus.indicators.skipped
            + corpus.domain.skipped
            + corpus.connections.skipped
            + corpus.services.skipped;
        if skipped > 0 {
            log::warn!("stage=ingest {skipped} raw rows skipped (unparseable period or empty agent)");
        }
        self.emit(
            "ingest",
            StageEvent::SourcesLoaded {
                indicators: corpus.indicators.rows.len(),
                indicator_domain: corpus.domain.rows.len(),
                connections: corpus.connections.rows.len(),
                services: corpus.services.rows.len(),
                skipped_rows: skipped,
            },
        )?;

        // Identity, directory, dimension.
        let registry = collect_identities(overrides, corpus);
        let directory = EntityDirectory::build(overrides, &registry);
        let group_dimension = build_group_dimension(&directory);
        let groups = to_group_objects(&group_dimension);
        for id in audit_labels(&group_dimension) {
            log::warn!("stage=dimension label for {id} does not follow the composition rule");
        }
        for name in audit_misgrouped(&group_dimension) {
            log::warn!("stage=dimension {name} resolved to group companhia");
        }
        self.emit(
            "dimension",
            StageEvent::IdentitiesResolved {
                distributors: group_dimension.len(),
                groups: groups.len(),
                selectable_groups: groups.iter().filter(|g| g.selector_enabled).count(),
            },
        )?;

        // Facts.
        let facts = facts::build_all(corpus, &directory, &self.config)?;
        for (table, rows) in fact_table_sizes(&facts) {
            self.emit("facts", StageEvent::TableBuilt { table: table.to_string(), rows })?;
        }

        // Referential completeness, one table at a time.
        let mut keys_by_table: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
        for (table, group_id, distributor_id) in facts.entity_keys() {
            keys_by_table.entry(table).or_default().push((group_id, distributor_id));
        }
        for (table, keys) in &keys_by_table {
            check_referential_completeness(&group_dimension, table, keys.iter().copied())?;
        }
        self.emit(
            "referential",
            StageEvent::ReferentialCheckPassed { tables: keys_by_table.len() },
        )?;

        // Trends, benchmark and diagnostics.
        let analysis = trends::build_all(&facts, &directory, &self.config);
        for spike in &analysis.spikes {
            if let Some(taxa_var_pct) = spike.taxa_var_pct {
                self.emit(
                    "trends",
                    StageEvent::SpikeDetected {
                        distributor_id: spike.distributor_id.clone(),
                        ano: spike.ano,
                        mes: spike.mes,
                        taxa_var_pct,
                    },
                )?;
            }
        }
        for alert in &analysis.comparability_alerts {
            if alert.alerta_quebra_volume || alert.alerta_quebra_mix {
                self.emit(
                    "trends",
                    StageEvent::ComparabilityBreak {
                        distributor_id: alert.distributor_id.clone(),
                        ano: alert.ano,
                        volume: alert.alerta_quebra_volume,
                        mix: alert.alerta_quebra_mix,
                    },
                )?;
            }
        }

        self.persist(&group_dimension, &facts, &analysis)?;

        let dashboard = export::build_dashboard(&DashboardInputs {
            run_id: &self.run_id,
            generated_at,
            config: &self.config,
            groups: &groups,
            facts: &facts,
            analysis: &analysis,
        })?;

        Ok(PipelineOutput { group_dimension, groups, facts, analysis, dashboard })
    }

    /// Stage 10: CSV tables and the validated dashboard into the output
    /// directory.
    pub fn export(&mut self, output: &PipelineOutput) -> PipelineResult<Vec<(String, usize)>> {
        let dir = self.config.output_dir.clone();
        let written = export::export_tables(&dir, &output.group_dimension, &output.facts, &output.analysis)?;
        for (table, rows) in &written {
            self.emit("export", StageEvent::TableExported { table: table.clone(), rows: *rows })?;
        }
        export::write_dashboard(&dir, &output.dashboard)?;
        let sections = output.dashboard.as_object().map_or(0, |o| o.len());
        self.emit("export", StageEvent::DashboardWritten { sections })?;
        log::info!("stage=export {} tables written to {}", written.len(), dir.display());
        Ok(written)
    }

    /// Close the run in the warehouse.
    pub fn finish(&mut self, tables: usize) -> PipelineResult<()> {
        self.emit(
            "engine",
            StageEvent::RunCompleted { run_id: self.run_id.clone(), tables },
        )?;
        self.store
            .complete_run(&self.run_id, &chrono::Utc::now().to_rfc3339())?;
        log::info!("stage=engine run {} completed", self.run_id);
        Ok(())
    }

    pub fn events(&self) -> PipelineResult<Vec<EventLogEntry>> {
        self.store.events_for_run(&self.run_id)
    }

    fn persist(
        &self,
        group_dimension: &[GroupDimensionRow],
        facts: &FactTables,
        analysis: &AnalysisTables,
    ) -> PipelineResult<()> {
        let run = self.run_id.as_str();
        let store = &self.store;

        store.insert_group_dimension(run, group_dimension)?;
        store.insert_size_dimension(run, &facts.size_dimension)?;
        store.insert_monthly_facts(run, &facts.monthly)?;
        store.insert_annual_facts(run, &facts.annual)?;
        store.insert_kpi(run, &facts.kpi)?;
        store.insert_trends(run, &analysis.trends)?;
        store.insert_benchmark(run, &analysis.benchmark)?;
        store.insert_spikes(run, &analysis.spikes)?;

        store.insert_derived_rows(run, "dim_indicador_servico", &facts.indicator_dimension)?;
        store.insert_derived_rows(run, "fato_uc_ativa_mensal_distribuidora", &facts.monthly_connections)?;
        store.insert_derived_rows(run, "fato_indicadores_anuais", &facts.annual_indicators)?;
        store.insert_derived_rows(run, "fato_servicos_municipio_mes", &facts.services_by_municipality)?;
        store.insert_derived_rows(run, "fato_transgressao_mensal_porte", &facts.monthly_by_class)?;
        store.insert_derived_rows(run, "grupos_anual_sem_cod_69_93", &facts.annual_excluding_focus)?;
        store.insert_derived_rows(run, "grupos_classe_local", &analysis.class_view)?;
        store.insert_derived_rows(run, "grupos_share_codigos_foco", &analysis.service_code_share)?;
        store.insert_derived_rows(run, "grupos_alertas_comparabilidade", &analysis.comparability_alerts)?;
        store.insert_derived_rows(run, "grupos_longa", &analysis.long_run)?;
        store.insert_derived_rows(run, "grupos_longa_resumo", &analysis.long_run_summary)?;
        store.insert_derived_rows(run, "grupos_data_quality_checks", &analysis.quality_checks)?;
        store.insert_derived_rows(run, "grupos_cobertura_mensal", &analysis.coverage)?;

        let distinct_groups: BTreeSet<&str> = group_dimension.iter().map(|r| r.group_id.as_str()).collect();
        log::info!(
            "stage=persist run {} groups={} monthly={} annual={}",
            run,
            distinct_groups.len(),
            facts.monthly.len(),
            facts.annual.len(),
        );
        Ok(())
    }

    fn emit(&mut self, stage: &str, event: StageEvent) -> PipelineResult<()> {
        self.seq += 1;
        let entry = EventLogEntry {
            id:         None,
            run_id:     self.run_id.clone(),
            seq:        self.seq,
            stage:      stage.to_string(),
            event_type: event.type_name().to_string(),
            payload:    serde_json::to_string(&event)?,
        };
        self.store.append_event(&entry)
    }
}

fn fact_table_sizes(facts: &FactTables) -> [(&'static str, usize); 10] {
    [
        ("dim_indicador_servico", facts.indicator_dimension.len()),
        ("fato_uc_ativa_mensal_distribuidora", facts.monthly_connections.len()),
        ("dim_distribuidora_porte", facts.size_dimension.len()),
        ("fato_indicadores_anuais", facts.annual_indicators.len()),
        ("fato_servicos_municipio_mes", facts.services_by_municipality.len()),
        ("fato_transgressao_mensal_porte", facts.monthly_by_class.len()),
        ("fato_transgressao_mensal_distribuidora", facts.monthly.len()),
        ("kpi_regulatorio_anual", facts.kpi.len()),
        ("grupos_anual", facts.annual.len()),
        ("grupos_anual_sem_cod_69_93", facts.annual_excluding_focus.len()),
    ]
}

//! CSV export of derived tables and the dashboard document.
//!
//! Exports are projections: they never compute anything the fact and
//! analysis stages did not already produce, apart from the dashboard
//! summaries (pre/post KPI overview, default selections, availability).

use crate::{
    config::PipelineConfig,
    dimension::{EconomicGroup, GroupDimensionRow},
    error::{PipelineError, PipelineResult},
    facts::{FactTables, KpiRow, MonthlyFact},
    stats::{mean_present, sum_present},
    trends::{AnalysisTables, BenchmarkRecord},
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

pub const DASHBOARD_FILE: &str = "dashboard_data.json";

/// Top-level dashboard sections. Each must be present and non-empty.
pub const REQUIRED_SECTIONS: &[&str] = &[
    "meta",
    "kpi_overview",
    "serie_anual",
    "serie_mensal_nacional",
    "distributor_groups",
    "group_views",
    "default_group_id",
    "regulatory_classes",
    "default_class",
    "top_distributors",
    "data_availability",
];

// ── CSV tables ─────────────────────────────────────────────────

/// Write `rows` to `{dir}/{name}.csv` with a header taken from the row
/// type's field names. Returns the number of rows written.
pub fn write_table<T: Serialize>(dir: &Path, name: &str, rows: &[T]) -> PipelineResult<usize> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{name}.csv"));
    let mut writer = csv::Writer::from_path(&path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    log::debug!("stage=export wrote {} ({} rows)", path.display(), rows.len());
    Ok(rows.len())
}

/// Write every derived table. Base tables land in `dir`, group views in
/// `dir/grupos`. Returns `(table, rows)` in write order.
pub fn export_tables(
    dir: &Path,
    dimension: &[GroupDimensionRow],
    facts: &FactTables,
    analysis: &AnalysisTables,
) -> PipelineResult<Vec<(String, usize)>> {
    let groups_dir = dir.join("grupos");
    let mut written = Vec::new();
    let mut record = |name: &str, rows: usize| written.push((name.to_string(), rows));

    record("dim_distributor_group", write_table(dir, "dim_distributor_group", dimension)?);
    record("dim_indicador_servico", write_table(dir, "dim_indicador_servico", &facts.indicator_dimension)?);
    record(
        "fato_uc_ativa_mensal_distribuidora",
        write_table(dir, "fato_uc_ativa_mensal_distribuidora", &facts.monthly_connections)?,
    );
    record("dim_distribuidora_porte", write_table(dir, "dim_distribuidora_porte", &facts.size_dimension)?);
    record("fato_indicadores_anuais", write_table(dir, "fato_indicadores_anuais", &facts.annual_indicators)?);
    record(
        "fato_servicos_municipio_mes",
        write_table(dir, "fato_servicos_municipio_mes", &facts.services_by_municipality)?,
    );
    record(
        "fato_transgressao_mensal_porte",
        write_table(dir, "fato_transgressao_mensal_porte", &facts.monthly_by_class)?,
    );
    record(
        "fato_transgressao_mensal_distribuidora",
        write_table(dir, "fato_transgressao_mensal_distribuidora", &facts.monthly)?,
    );
    record("kpi_regulatorio_anual", write_table(dir, "kpi_regulatorio_anual", &facts.kpi)?);

    record("grupos_mensal", write_table(&groups_dir, "grupos_mensal", &analysis.monthly_view)?);
    record("grupos_anual", write_table(&groups_dir, "grupos_anual", &facts.annual)?);
    record(
        "grupos_anual_sem_cod_69_93",
        write_table(&groups_dir, "grupos_anual_sem_cod_69_93", &facts.annual_excluding_focus)?,
    );
    record("grupos_tendencia", write_table(&groups_dir, "grupos_tendencia", &analysis.trends)?);
    record(
        "grupos_benchmark_porte_latest",
        write_table(&groups_dir, "grupos_benchmark_porte_latest", &analysis.benchmark)?,
    );
    record("grupos_outliers_taxa", write_table(&groups_dir, "grupos_outliers_taxa", &analysis.spikes)?);
    record("grupos_classe_local", write_table(&groups_dir, "grupos_classe_local", &analysis.class_view)?);
    record(
        "grupos_share_codigos_foco",
        write_table(&groups_dir, "grupos_share_codigos_foco", &analysis.service_code_share)?,
    );
    record(
        "grupos_alertas_comparabilidade",
        write_table(&groups_dir, "grupos_alertas_comparabilidade", &analysis.comparability_alerts)?,
    );
    record("grupos_longa", write_table(&groups_dir, "grupos_longa", &analysis.long_run)?);
    record("grupos_longa_resumo", write_table(&groups_dir, "grupos_longa_resumo", &analysis.long_run_summary)?);
    record(
        "grupos_data_quality_checks",
        write_table(&groups_dir, "grupos_data_quality_checks", &analysis.quality_checks)?,
    );
    record("grupos_cobertura_mensal", write_table(&groups_dir, "grupos_cobertura_mensal", &analysis.coverage)?);

    Ok(written)
}

// ── Dashboard ──────────────────────────────────────────────────

/// Everything the dashboard document is assembled from.
pub struct DashboardInputs<'a> {
    pub run_id:       &'a str,
    pub generated_at: &'a str,
    pub config:       &'a PipelineConfig,
    pub groups:       &'a [EconomicGroup],
    pub facts:        &'a FactTables,
    pub analysis:     &'a AnalysisTables,
}

/// Pre/post cutoff comparison over the national KPI series.
pub fn kpi_overview(kpi: &[KpiRow]) -> Value {
    if kpi.is_empty() {
        return json!({});
    }
    let (pre, pos): (Vec<&KpiRow>, Vec<&KpiRow>) =
        kpi.iter().partition(|r| r.periodo_regulatorio == "pre_2022");

    fn taxa(rows: &[&KpiRow]) -> f64 {
        mean_present(rows.iter().map(|r| r.taxa_fora_prazo)).unwrap_or(0.0)
    }
    fn total(rows: &[&KpiRow], measure: fn(&KpiRow) -> f64) -> f64 {
        rows.iter().map(|r| measure(r)).sum()
    }
    fn years(rows: &[&KpiRow]) -> BTreeSet<i32> {
        rows.iter().map(|r| r.ano).collect()
    }

    let pre_taxa = taxa(&pre);
    let pos_taxa = taxa(&pos);
    let pre_comp = total(&pre, |r| r.compensacao_rs);
    let pos_comp = total(&pos, |r| r.compensacao_rs);

    json!({
        "pre_taxa_media": pre_taxa,
        "pos_taxa_media": pos_taxa,
        "delta_taxa": pos_taxa - pre_taxa,
        "pre_compensacao_total": pre_comp,
        "pos_compensacao_total": pos_comp,
        "delta_compensacao": pos_comp - pre_comp,
        "pre_servicos_total": total(&pre, |r| r.qtd_serv),
        "pos_servicos_total": total(&pos, |r| r.qtd_serv),
        "pre_fora_prazo_total": total(&pre, |r| r.qtd_fora_prazo),
        "pos_fora_prazo_total": total(&pos, |r| r.qtd_fora_prazo),
        "anos_pre": years(&pre),
        "anos_pos": years(&pos),
    })
}

fn national_monthly_series(monthly: &[MonthlyFact]) -> Vec<Value> {
    let mut rows: Vec<&MonthlyFact> = monthly.iter().collect();
    rows.sort_by(|a, b| (a.ano, a.mes, &a.distributor_id).cmp(&(b.ano, b.mes, &b.distributor_id)));
    rows.into_iter()
        .map(|r| {
            json!({
                "ano": r.ano,
                "mes": r.mes,
                "group_id": r.group_id,
                "distributor_id": r.distributor_id,
                "distributor_label": r.distributor_label,
                "uc_ativa_mes": r.uc_ativa_mes,
                "qtd_serv_realizado": r.qtd_serv_realizado,
                "qtd_fora_prazo": r.qtd_fora_prazo,
                "compensacao_rs": r.compensacao_rs,
                "taxa_fora_prazo": r.taxa_fora_prazo,
                "fora_prazo_por_100k_uc_mes": r.fora_prazo_por_100k_uc_mes,
                "compensacao_rs_por_uc_mes": r.compensacao_rs_por_uc_mes,
                "bucket_porte": r.bucket_porte,
            })
        })
        .collect()
}

fn rows_for_group<T: Serialize>(rows: &[T], group_of: impl Fn(&T) -> &str, group_id: &str) -> PipelineResult<Value> {
    let selected: Vec<&T> = rows.iter().filter(|r| group_of(r) == group_id).collect();
    Ok(serde_json::to_value(selected)?)
}

fn group_views(groups: &[EconomicGroup], facts: &FactTables, analysis: &AnalysisTables) -> PipelineResult<Value> {
    let mut views = Map::new();
    for group in groups {
        let id = group.group_id.as_str();
        let view = json!({
            "group_label": group.group_label,
            "annual": rows_for_group(&facts.annual, |r| r.group_id.as_str(), id)?,
            "trend": rows_for_group(&analysis.trends, |r| r.group_id.as_str(), id)?,
            "benchmark": rows_for_group(&analysis.benchmark, |r| r.group_id.as_str(), id)?,
            "class_view": rows_for_group(&analysis.class_view, |r| r.group_id.as_str(), id)?,
            "long_run_summary": rows_for_group(&analysis.long_run_summary, |r| r.group_id.as_str(), id)?,
            "monthly": rows_for_group(&analysis.monthly_view, |r| r.group_id.as_str(), id)?,
            "spikes": rows_for_group(&analysis.spikes, |r| r.group_id.as_str(), id)?,
        });
        views.insert(group.group_id.clone(), view);
    }
    Ok(Value::Object(views))
}

/// The configured group when it exists, otherwise the group with the most
/// distributors (smallest id on ties).
pub fn default_group_id(groups: &[EconomicGroup], preferred: &str) -> Option<String> {
    if groups.iter().any(|g| g.group_id == preferred) {
        return Some(preferred.to_string());
    }
    groups
        .iter()
        .max_by(|a, b| {
            a.distributor_count
                .cmp(&b.distributor_count)
                .then_with(|| b.group_id.cmp(&a.group_id))
        })
        .map(|g| g.group_id.clone())
}

/// Service classes seen in the class view, plus the class with the most
/// services (first in name order on ties).
fn regulatory_classes(analysis: &AnalysisTables) -> (Vec<String>, Option<String>) {
    let mut volume: BTreeMap<&str, f64> = BTreeMap::new();
    for row in &analysis.class_view {
        *volume.entry(row.classe_local_servico.as_str()).or_default() += row.qtd_serv_realizado;
    }
    let default = volume
        .iter()
        .fold(None::<(&str, f64)>, |best, (class, total)| match best {
            Some((_, b)) if b >= *total => best,
            _ => Some((*class, *total)),
        })
        .map(|(class, _)| class.to_string());
    (volume.keys().map(|c| c.to_string()).collect(), default)
}

fn top_distributors(benchmark: &[BenchmarkRecord], n: usize) -> Vec<Value> {
    let mut ranked: Vec<&BenchmarkRecord> = benchmark.iter().filter(|r| r.rank_porte_nacional.is_some()).collect();
    ranked.sort_by(|a, b| {
        (a.rank_porte_nacional, &a.distributor_id).cmp(&(b.rank_porte_nacional, &b.distributor_id))
    });
    ranked
        .into_iter()
        .take(n)
        .map(|r| {
            json!({
                "distributor_id": r.distributor_id,
                "distributor_label": r.distributor_label,
                "group_id": r.group_id,
                "group_label": r.group_label,
                "ano": r.ano,
                "uc_ativa_media_ano": r.uc_ativa_media_ano,
                "rank_porte_nacional": r.rank_porte_nacional,
                "fora_prazo_por_100k_uc_mes": r.fora_prazo_por_100k_uc_mes,
            })
        })
        .collect()
}

fn data_availability(facts: &FactTables, analysis: &AnalysisTables) -> Value {
    let months: BTreeSet<(i32, u32)> = facts.monthly.iter().map(|r| (r.ano, r.mes)).collect();
    let years: BTreeSet<i32> = months.iter().map(|(y, _)| *y).collect();
    let indicator_years: BTreeSet<i32> = facts.annual_indicators.iter().map(|r| r.ano).collect();
    let distributors: BTreeSet<&str> = facts.monthly.iter().map(|r| r.distributor_id.as_str()).collect();
    let fmt = |m: Option<&(i32, u32)>| m.map(|(y, mo)| format!("{y}-{mo:02}"));
    json!({
        "anos_servicos": years,
        "anos_indicadores": indicator_years,
        "primeiro_mes": fmt(months.iter().next()),
        "ultimo_mes": fmt(months.iter().next_back()),
        "meses": months.len(),
        "distribuidoras": distributors.len(),
        "servicos_total": sum_present(facts.monthly.iter().map(|r| Some(r.qtd_serv_realizado))),
        "cobertura": analysis.coverage,
    })
}

pub fn build_dashboard(inputs: &DashboardInputs<'_>) -> PipelineResult<Value> {
    let DashboardInputs { run_id, generated_at, config, groups, facts, analysis } = inputs;

    let mut serie_anual: Vec<&KpiRow> = facts.kpi.iter().collect();
    serie_anual.sort_by_key(|r| r.ano);
    let (classes, default_class) = regulatory_classes(analysis);

    Ok(json!({
        "meta": {
            "generated_at": generated_at,
            "run_id": run_id,
            "version": env!("CARGO_PKG_VERSION"),
            "analysis_window": [config.analysis_window.start, config.analysis_window.end],
            "trend_years": [config.trend_base_year, config.trend_last_year],
        },
        "kpi_overview": kpi_overview(&facts.kpi),
        "serie_anual": serie_anual,
        "serie_mensal_nacional": national_monthly_series(&facts.monthly),
        "distributor_groups": groups,
        "group_views": group_views(groups, facts, analysis)?,
        "default_group_id": default_group_id(groups, &config.default_group_id),
        "regulatory_classes": classes,
        "default_class": default_class,
        "top_distributors": top_distributors(&analysis.benchmark, config.top_n_distributors),
        "data_availability": data_availability(facts, analysis),
    }))
}

fn is_empty_section(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Fail when a required section is absent or empty.
pub fn validate_dashboard(payload: &Value) -> PipelineResult<()> {
    let missing: Vec<String> = REQUIRED_SECTIONS
        .iter()
        .filter(|key| payload.get(**key).map_or(true, is_empty_section))
        .map(|key| key.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::DashboardContract { missing })
    }
}

/// Validate and write the dashboard to `{dir}/dashboard_data.json`.
pub fn write_dashboard(dir: &Path, payload: &Value) -> PipelineResult<PathBuf> {
    validate_dashboard(payload)?;
    fs::create_dir_all(dir)?;
    let path = dir.join(DASHBOARD_FILE);
    fs::write(&path, serde_json::to_string_pretty(payload)?)?;
    log::info!("stage=export dashboard written to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str, count: usize) -> EconomicGroup {
        EconomicGroup {
            group_id: id.into(),
            group_label: id.to_uppercase(),
            distributor_count: count,
            selector_enabled: count >= 2,
            distributor_ids: Vec::new(),
            distributor_names: Vec::new(),
        }
    }

    #[test]
    fn default_group_prefers_configured_then_largest() {
        let groups = vec![group("cemig", 1), group("cpfl", 3), group("enel", 3)];
        assert_eq!(default_group_id(&groups, "cemig").as_deref(), Some("cemig"));
        assert_eq!(default_group_id(&groups, "neoenergia").as_deref(), Some("cpfl"));
        assert_eq!(default_group_id(&[], "neoenergia"), None);
    }

    #[test]
    fn empty_sections_are_reported() {
        let payload = json!({ "meta": {}, "serie_anual": [1] });
        match validate_dashboard(&payload) {
            Err(PipelineError::DashboardContract { missing }) => {
                assert!(missing.contains(&"meta".to_string()));
                assert!(missing.contains(&"kpi_overview".to_string()));
                assert!(!missing.contains(&"serie_anual".to_string()));
            }
            other => panic!("expected contract violation, got {other:?}"),
        }
    }
}

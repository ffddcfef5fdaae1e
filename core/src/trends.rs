//! Trend & benchmark builder.
//!
//! Reads only the fact tables. Advisory findings (spikes, alerts, quality
//! checks) are output rows, never errors.

use crate::{
    config::PipelineConfig,
    diagnostics,
    dimension::EntityDirectory,
    facts::{AnnualFact, FactTables, MonthlyFact},
    stats::{abs_delta, dense_rank_desc, median, pct_delta, ratio},
    types::{DistributorId, GroupId, Month, Year},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metrics tracked from the base year to the last year.
pub const TREND_METRICS: &[&str] = &[
    "taxa_fora_prazo",
    "fora_prazo_por_100k_uc_mes",
    "compensacao_rs_por_uc_mes",
    "compensacao_media_por_transgressao_rs",
];

/// Value of a tracked metric on an annual row.
pub fn metric_value(row: &AnnualFact, metric: &str) -> Option<f64> {
    match metric {
        "taxa_fora_prazo" => row.taxa_fora_prazo,
        "fora_prazo_por_100k_uc_mes" => row.fora_prazo_por_100k_uc_mes,
        "compensacao_rs_por_uc_mes" => row.compensacao_rs_por_uc_mes,
        "compensacao_media_por_transgressao_rs" => row.compensacao_media_por_transgressao_rs,
        _ => None,
    }
}

/// One tracked metric of one distributor, base year against last year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRecord {
    pub group_id:          GroupId,
    pub group_label:       String,
    pub distributor_id:    DistributorId,
    pub distributor_label: String,
    pub metric:            String,
    pub base_year:         Year,
    pub last_year:         Year,
    pub base_value:        Option<f64>,
    pub last_value:        Option<f64>,
    pub delta_abs:         Option<f64>,
    pub delta_pct:         Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub group_id:                     GroupId,
    pub group_label:                  String,
    pub distributor_id:               DistributorId,
    pub distributor_label:            String,
    pub ano:                          Year,
    pub uc_ativa_media_ano:           Option<f64>,
    pub qtd_serv_realizado:           f64,
    pub qtd_fora_prazo:               f64,
    pub compensacao_rs:               f64,
    pub taxa_fora_prazo:              Option<f64>,
    pub fora_prazo_por_100k_uc_mes:   Option<f64>,
    pub compensacao_rs_por_uc_mes:    Option<f64>,
    pub rank_porte_nacional:          Option<u32>,
    pub rank_porte_grupo:             Option<u32>,
    pub indice_fora_vs_mediana_grupo: Option<f64>,
    pub indice_comp_vs_mediana_grupo: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeRecord {
    pub group_id:          GroupId,
    pub group_label:       String,
    pub distributor_id:    DistributorId,
    pub distributor_label: String,
    pub ano:               Year,
    pub mes:               Month,
    pub taxa_fora_prazo:   Option<f64>,
    pub taxa_var_abs:      Option<f64>,
    pub taxa_var_pct:      Option<f64>,
    pub qtd_fora_prazo:    f64,
    pub compensacao_rs:    f64,
}

/// Base-year to last-year deltas, one record per distributor and metric,
/// in (group_id, distributor_id) order.
pub fn build_trends(annual: &[AnnualFact], base_year: Year, last_year: Year) -> Vec<TrendRecord> {
    let mut by_entity: BTreeMap<(&str, &str), Vec<&AnnualFact>> = BTreeMap::new();
    for row in annual {
        by_entity
            .entry((row.group_id.as_str(), row.distributor_id.as_str()))
            .or_default()
            .push(row);
    }

    let mut records = Vec::new();
    for ((group_id, distributor_id), rows) in by_entity {
        let at = |year: Year| rows.iter().find(|r| r.ano == year).copied();
        let (base_row, last_row) = (at(base_year), at(last_year));
        for metric in TREND_METRICS {
            let base_value = base_row.and_then(|r| metric_value(r, metric));
            let last_value = last_row.and_then(|r| metric_value(r, metric));
            records.push(TrendRecord {
                group_id: group_id.to_string(),
                group_label: rows[0].group_label.clone(),
                distributor_id: distributor_id.to_string(),
                distributor_label: rows[0].distributor_label.clone(),
                metric: metric.to_string(),
                base_year,
                last_year,
                base_value,
                last_value,
                delta_abs: abs_delta(base_value, last_value),
                delta_pct: pct_delta(base_value, last_value),
            });
        }
    }
    records
}

fn ranks_for(rows: &[&AnnualFact]) -> BTreeMap<String, u32> {
    let sized: Vec<(&str, f64)> = rows
        .iter()
        .filter_map(|r| r.uc_ativa_media_ano.map(|v| (r.distributor_id.as_str(), v)))
        .collect();
    let values: Vec<f64> = sized.iter().map(|(_, v)| *v).collect();
    sized
        .iter()
        .zip(dense_rank_desc(&values))
        .map(|((id, _), rank)| (id.to_string(), rank))
        .collect()
}

/// Latest-year rows with national and in-group size ranks and indices
/// against the group median.
pub fn build_benchmark(annual: &[AnnualFact]) -> Vec<BenchmarkRecord> {
    let Some(latest_year) = annual.iter().map(|r| r.ano).max() else {
        return Vec::new();
    };
    let latest: Vec<&AnnualFact> = annual.iter().filter(|r| r.ano == latest_year).collect();
    let national = ranks_for(&latest);

    let mut by_group: BTreeMap<&str, Vec<&AnnualFact>> = BTreeMap::new();
    for row in latest.iter().copied() {
        by_group.entry(row.group_id.as_str()).or_default().push(row);
    }

    let mut records = Vec::new();
    for (_, rows) in by_group {
        let in_group = ranks_for(&rows);
        let median_late = median(rows.iter().map(|r| r.fora_prazo_por_100k_uc_mes));
        let median_comp = median(rows.iter().map(|r| r.compensacao_rs_por_uc_mes));
        for row in &rows {
            records.push(BenchmarkRecord {
                group_id: row.group_id.clone(),
                group_label: row.group_label.clone(),
                distributor_id: row.distributor_id.clone(),
                distributor_label: row.distributor_label.clone(),
                ano: row.ano,
                uc_ativa_media_ano: row.uc_ativa_media_ano,
                qtd_serv_realizado: row.qtd_serv_realizado,
                qtd_fora_prazo: row.qtd_fora_prazo,
                compensacao_rs: row.compensacao_rs,
                taxa_fora_prazo: row.taxa_fora_prazo,
                fora_prazo_por_100k_uc_mes: row.fora_prazo_por_100k_uc_mes,
                compensacao_rs_por_uc_mes: row.compensacao_rs_por_uc_mes,
                rank_porte_nacional: national.get(&row.distributor_id).copied(),
                rank_porte_grupo: in_group.get(&row.distributor_id).copied(),
                indice_fora_vs_mediana_grupo: ratio(row.fora_prazo_por_100k_uc_mes, median_late),
                indice_comp_vs_mediana_grupo: ratio(row.compensacao_rs_por_uc_mes, median_comp),
            });
        }
    }
    // group ascending, then size descending; unsized rows last
    records.sort_by(|a, b| {
        a.group_id
            .cmp(&b.group_id)
            .then_with(|| match (a.uc_ativa_media_ano, b.uc_ativa_media_ano) {
                (Some(x), Some(y)) => y.total_cmp(&x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.distributor_id.cmp(&b.distributor_id))
    });
    records
}

/// Month-over-month late-rate jumps of at least `threshold` (absolute pct).
pub fn build_spikes(monthly: &[MonthlyFact], threshold: f64) -> Vec<SpikeRecord> {
    let mut by_entity: BTreeMap<(&str, &str), Vec<&MonthlyFact>> = BTreeMap::new();
    for row in monthly {
        by_entity
            .entry((row.group_id.as_str(), row.distributor_id.as_str()))
            .or_default()
            .push(row);
    }

    let mut spikes = Vec::new();
    for (_, mut rows) in by_entity {
        rows.sort_by_key(|r| (r.ano, r.mes));
        for pair in rows.windows(2) {
            let (prev, cur) = (pair[0], pair[1]);
            let var_pct = pct_delta(prev.taxa_fora_prazo, cur.taxa_fora_prazo);
            if !var_pct.is_some_and(|p| p.abs() >= threshold) {
                continue;
            }
            spikes.push(SpikeRecord {
                group_id: cur.group_id.clone(),
                group_label: cur.group_label.clone(),
                distributor_id: cur.distributor_id.clone(),
                distributor_label: cur.distributor_label.clone(),
                ano: cur.ano,
                mes: cur.mes,
                taxa_fora_prazo: cur.taxa_fora_prazo,
                taxa_var_abs: abs_delta(prev.taxa_fora_prazo, cur.taxa_fora_prazo),
                taxa_var_pct: var_pct,
                qtd_fora_prazo: cur.qtd_fora_prazo,
                compensacao_rs: cur.compensacao_rs,
            });
        }
    }
    spikes.sort_by(|a, b| {
        (&a.group_id, &a.distributor_label, a.ano, a.mes)
            .cmp(&(&b.group_id, &b.distributor_label, b.ano, b.mes))
    });
    spikes
}

/// Every analysis table derived from the facts.
#[derive(Debug, Clone, Default)]
pub struct AnalysisTables {
    pub monthly_view:         Vec<MonthlyFact>,
    pub trends:               Vec<TrendRecord>,
    pub benchmark:            Vec<BenchmarkRecord>,
    pub spikes:               Vec<SpikeRecord>,
    pub class_view:           Vec<diagnostics::ClassViewRecord>,
    pub service_code_share:   Vec<diagnostics::ServiceCodeShare>,
    pub comparability_alerts: Vec<diagnostics::ComparabilityAlert>,
    pub long_run:             Vec<diagnostics::LongRunRow>,
    pub long_run_summary:     Vec<diagnostics::LongRunSummary>,
    pub quality_checks:       Vec<diagnostics::QualityCheck>,
    pub coverage:             Vec<diagnostics::CoverageRecord>,
}

pub fn build_all(
    facts: &FactTables,
    directory: &EntityDirectory<'_>,
    config: &PipelineConfig,
) -> AnalysisTables {
    let mut monthly_view: Vec<MonthlyFact> = facts
        .monthly
        .iter()
        .filter(|r| config.analysis_window.contains(r.ano))
        .cloned()
        .collect();
    monthly_view.sort_by(|a, b| {
        (&a.group_id, &a.distributor_label, a.ano, a.mes)
            .cmp(&(&b.group_id, &b.distributor_label, b.ano, b.mes))
    });

    let trends = build_trends(&facts.annual, config.trend_base_year, config.trend_last_year);
    let benchmark = build_benchmark(&facts.annual);
    let spikes = build_spikes(&monthly_view, config.spike_threshold);
    let class_view = diagnostics::build_class_view(&facts.monthly_by_class, directory, config);
    let service_code_share =
        diagnostics::build_service_code_share(&facts.services_by_municipality, directory, config);
    let comparability_alerts =
        diagnostics::build_comparability_alerts(&facts.annual, &service_code_share, config);
    let (long_run, long_run_summary) =
        diagnostics::build_long_run(&facts.annual_indicators, directory, config);
    let quality_checks = diagnostics::build_quality_checks(&monthly_view);
    let coverage = diagnostics::build_coverage(&monthly_view);

    log::info!(
        "stage=trends trends={} benchmark={} spikes={} alerts={}",
        trends.len(),
        benchmark.len(),
        spikes.len(),
        comparability_alerts.len(),
    );
    for spike in &spikes {
        log::debug!(
            "stage=trends spike {} {}-{:02} var_pct={:?}",
            spike.distributor_id,
            spike.ano,
            spike.mes,
            spike.taxa_var_pct
        );
    }

    AnalysisTables {
        monthly_view,
        trends,
        benchmark,
        spikes,
        class_view,
        service_code_share,
        comparability_alerts,
        long_run,
        long_run_summary,
        quality_checks,
        coverage,
    }
}

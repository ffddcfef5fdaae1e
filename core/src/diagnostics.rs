//! Diagnostic views over the fact tables: class mix, focus-code share,
//! comparability alerts, the long-run indicator summary, data-quality
//! checks and monthly coverage.

use crate::{
    config::PipelineConfig,
    dimension::EntityDirectory,
    facts::{AnnualFact, AnnualIndicatorFact, MonthlyClassFact, MonthlyFact, ServiceMunicipalityFact},
    stats::{abs_delta, pct_delta, ratio, scaled_ratio, sum_present},
    types::{DistributorId, GroupId, Month, Year},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassViewRecord {
    pub group_id:                   GroupId,
    pub group_label:                String,
    pub distributor_id:             DistributorId,
    pub distributor_label:          String,
    pub classe_local_servico:       String,
    pub qtd_serv_realizado:         f64,
    pub qtd_fora_prazo:             f64,
    pub compensacao_rs:             f64,
    pub exposicao_uc_mes:           Option<f64>,
    pub taxa_fora_prazo:            Option<f64>,
    pub fora_prazo_por_100k_uc_mes: Option<f64>,
    pub compensacao_rs_por_uc_mes:  Option<f64>,
    pub share_fora_prazo:           Option<f64>,
    pub share_compensacao:          Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCodeShare {
    pub group_id:          GroupId,
    pub group_label:       String,
    pub distributor_id:    DistributorId,
    pub distributor_label: String,
    pub ano:               Year,
    pub total_serv:        f64,
    pub serv_focus:        f64,
    pub share_serv_focus:  Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparabilityAlert {
    pub group_id:              GroupId,
    pub group_label:           String,
    pub distributor_id:        DistributorId,
    pub distributor_label:     String,
    pub ano:                   Year,
    pub qtd_serv_realizado:    f64,
    pub delta_serv_pct:        Option<f64>,
    pub share_serv_focus:      Option<f64>,
    pub delta_share_focus_abs: Option<f64>,
    pub alerta_quebra_volume:  bool,
    pub alerta_quebra_mix:     bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRunRow {
    pub group_id:          GroupId,
    pub group_label:       String,
    pub distributor_id:    DistributorId,
    pub distributor_label: String,
    pub ano:               Year,
    pub qtd_serv:          f64,
    pub qtd_fora_prazo:    f64,
    pub compensacao_rs:    f64,
    pub taxa_fora_prazo:   Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRunSummary {
    pub group_id:           GroupId,
    pub group_label:        String,
    pub distributor_id:     DistributorId,
    pub distributor_label:  String,
    pub ano_inicio:         Year,
    pub ano_fim:            Year,
    pub taxa_inicio:        Option<f64>,
    pub taxa_fim:           Option<f64>,
    pub delta_taxa_abs:     Option<f64>,
    pub delta_taxa_pct:     Option<f64>,
    pub compensacao_inicio: f64,
    pub compensacao_fim:    f64,
    pub delta_comp_abs:     f64,
    pub delta_comp_pct:     Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheck {
    pub group_id:    GroupId,
    pub group_label: String,
    pub checagem:    String,
    pub qtd_linhas:  u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub group_id:          GroupId,
    pub group_label:       String,
    pub distributor_id:    DistributorId,
    pub distributor_label: String,
    pub ano:               Year,
    pub meses_com_dados:   u32,
    pub meses_faltantes:   String,
}

fn labels_of(directory: &EntityDirectory<'_>, distributor_id: &str) -> (String, String) {
    directory
        .get(distributor_id)
        .map(|e| (e.group_label.clone(), e.identity.label.clone()))
        .unwrap_or_default()
}

/// Per-class totals over the analysis window, with each class's share of
/// its distributor's late services and compensation.
pub fn build_class_view(
    by_class: &[MonthlyClassFact],
    directory: &EntityDirectory<'_>,
    config: &PipelineConfig,
) -> Vec<ClassViewRecord> {
    #[derive(Default)]
    struct Acc {
        services: f64,
        late:     f64,
        comp:     f64,
        exposure: Vec<Option<f64>>,
    }

    let mut acc: BTreeMap<(GroupId, DistributorId, String), Acc> = BTreeMap::new();
    for row in by_class.iter().filter(|r| config.analysis_window.contains(r.ano)) {
        let slot = acc
            .entry((row.group_id.clone(), row.distributor_id.clone(), row.classe_local_servico.clone()))
            .or_default();
        slot.services += row.qtd_serv_realizado;
        slot.late += row.qtd_fora_prazo;
        slot.comp += row.compensacao_rs;
        slot.exposure.push(row.uc_ativa_mes);
    }

    let mut totals: BTreeMap<(&str, &str), (f64, f64)> = BTreeMap::new();
    for ((group_id, distributor_id, _), a) in &acc {
        let t = totals.entry((group_id.as_str(), distributor_id.as_str())).or_default();
        t.0 += a.late;
        t.1 += a.comp;
    }

    let scale = config.late_rate_scale;
    let mut rows: Vec<ClassViewRecord> = acc
        .iter()
        .map(|((group_id, distributor_id, classe), a)| {
            let (late_total, comp_total) = totals
                .get(&(group_id.as_str(), distributor_id.as_str()))
                .copied()
                .unwrap_or_default();
            let exposure = sum_present(a.exposure.iter().copied());
            let (group_label, distributor_label) = labels_of(directory, distributor_id);
            ClassViewRecord {
                group_id: group_id.clone(),
                group_label,
                distributor_id: distributor_id.clone(),
                distributor_label,
                classe_local_servico: classe.clone(),
                qtd_serv_realizado: a.services,
                qtd_fora_prazo: a.late,
                compensacao_rs: a.comp,
                exposicao_uc_mes: exposure,
                taxa_fora_prazo: ratio(Some(a.late), Some(a.services)),
                fora_prazo_por_100k_uc_mes: scaled_ratio(Some(a.late), exposure, scale),
                compensacao_rs_por_uc_mes: ratio(Some(a.comp), exposure),
                share_fora_prazo: ratio(Some(a.late), Some(late_total)),
                share_compensacao: ratio(Some(a.comp), Some(comp_total)),
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.group_id, &a.distributor_label)
            .cmp(&(&b.group_id, &b.distributor_label))
            .then_with(|| b.qtd_fora_prazo.total_cmp(&a.qtd_fora_prazo))
            .then_with(|| a.classe_local_servico.cmp(&b.classe_local_servico))
    });
    rows
}

/// Share of services carrying a focus service code, per distributor and year.
pub fn build_service_code_share(
    services: &[ServiceMunicipalityFact],
    directory: &EntityDirectory<'_>,
    config: &PipelineConfig,
) -> Vec<ServiceCodeShare> {
    let focus: BTreeSet<&str> = config.focus_service_codes.iter().map(String::as_str).collect();
    let mut acc: BTreeMap<(GroupId, DistributorId, Year), (f64, f64)> = BTreeMap::new();
    for row in services.iter().filter(|r| config.analysis_window.contains(r.ano)) {
        let slot = acc
            .entry((row.group_id.clone(), row.distributor_id.clone(), row.ano))
            .or_default();
        slot.0 += row.qtd_serv_realizado;
        if focus.contains(row.codtiposervico.trim()) {
            slot.1 += row.qtd_serv_realizado;
        }
    }

    let mut rows: Vec<ServiceCodeShare> = acc
        .into_iter()
        .map(|((group_id, distributor_id, ano), (total, focus_total))| {
            let (group_label, distributor_label) = labels_of(directory, &distributor_id);
            ServiceCodeShare {
                group_id,
                group_label,
                distributor_id,
                distributor_label,
                ano,
                total_serv: total,
                serv_focus: focus_total,
                share_serv_focus: ratio(Some(focus_total), Some(total)),
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.group_id, &a.distributor_label, a.ano).cmp(&(&b.group_id, &b.distributor_label, b.ano))
    });
    rows
}

/// Years whose service volume or focus-code mix moved enough to make the
/// year-over-year comparison suspect.
pub fn build_comparability_alerts(
    annual: &[AnnualFact],
    shares: &[ServiceCodeShare],
    config: &PipelineConfig,
) -> Vec<ComparabilityAlert> {
    let mut volumes: BTreeMap<(&str, &str), Vec<&AnnualFact>> = BTreeMap::new();
    for row in annual {
        volumes
            .entry((row.group_id.as_str(), row.distributor_id.as_str()))
            .or_default()
            .push(row);
    }

    let mut share_series: BTreeMap<(&str, &str), Vec<&ServiceCodeShare>> = BTreeMap::new();
    for row in shares {
        share_series
            .entry((row.group_id.as_str(), row.distributor_id.as_str()))
            .or_default()
            .push(row);
    }
    let mut mix: BTreeMap<(&str, &str, Year), (Option<f64>, Option<f64>)> = BTreeMap::new();
    for (key, mut series) in share_series {
        series.sort_by_key(|r| r.ano);
        let mut previous: Option<Option<f64>> = None;
        for row in series {
            let delta = previous.and_then(|prev| abs_delta(prev, row.share_serv_focus));
            mix.insert((key.0, key.1, row.ano), (row.share_serv_focus, delta));
            previous = Some(row.share_serv_focus);
        }
    }

    let mut alerts = Vec::new();
    for (key, mut series) in volumes {
        series.sort_by_key(|r| r.ano);
        let mut previous: Option<f64> = None;
        for row in series {
            let delta_serv_pct = previous.and_then(|prev| pct_delta(Some(prev), Some(row.qtd_serv_realizado)));
            previous = Some(row.qtd_serv_realizado);
            let (share, delta_share) = mix.get(&(key.0, key.1, row.ano)).copied().unwrap_or((None, None));

            let volume_break = delta_serv_pct.is_some_and(|d| d.abs() >= config.volume_break_threshold);
            let mix_break = delta_share.is_some_and(|d| d.abs() >= config.mix_break_threshold);
            if !(volume_break || mix_break) {
                continue;
            }
            log::warn!(
                "stage=trends comparability break {} {} volume={} mix={}",
                row.distributor_id,
                row.ano,
                volume_break,
                mix_break
            );
            alerts.push(ComparabilityAlert {
                group_id: row.group_id.clone(),
                group_label: row.group_label.clone(),
                distributor_id: row.distributor_id.clone(),
                distributor_label: row.distributor_label.clone(),
                ano: row.ano,
                qtd_serv_realizado: row.qtd_serv_realizado,
                delta_serv_pct,
                share_serv_focus: share,
                delta_share_focus_abs: delta_share,
                alerta_quebra_volume: volume_break,
                alerta_quebra_mix: mix_break,
            });
        }
    }
    alerts.sort_by(|a, b| {
        (&a.group_id, &a.distributor_label, a.ano).cmp(&(&b.group_id, &b.distributor_label, b.ano))
    });
    alerts
}

/// Annual indicator totals up to the long-run end year, and a first-year
/// against last-year summary per distributor.
pub fn build_long_run(
    indicators: &[AnnualIndicatorFact],
    directory: &EntityDirectory<'_>,
    config: &PipelineConfig,
) -> (Vec<LongRunRow>, Vec<LongRunSummary>) {
    let mut acc: BTreeMap<(GroupId, DistributorId, Year), (f64, f64, f64)> = BTreeMap::new();
    for row in indicators.iter().filter(|r| r.ano <= config.long_run_end_year) {
        let slot = acc
            .entry((row.group_id.clone(), row.distributor_id.clone(), row.ano))
            .or_default();
        slot.0 += row.qtd_serv.unwrap_or(0.0);
        slot.1 += row.qtd_fora_prazo.unwrap_or(0.0);
        slot.2 += row.compensacao_rs.unwrap_or(0.0);
    }

    let mut annual: Vec<LongRunRow> = acc
        .into_iter()
        .map(|((group_id, distributor_id, ano), (serv, late, comp))| {
            let (group_label, distributor_label) = labels_of(directory, &distributor_id);
            LongRunRow {
                group_id,
                group_label,
                distributor_id,
                distributor_label,
                ano,
                qtd_serv: serv,
                qtd_fora_prazo: late,
                compensacao_rs: comp,
                taxa_fora_prazo: ratio(Some(late), Some(serv)),
            }
        })
        .collect();
    annual.sort_by(|a, b| {
        (&a.group_id, &a.distributor_label, a.ano).cmp(&(&b.group_id, &b.distributor_label, b.ano))
    });

    let mut series: BTreeMap<(&str, &str), Vec<&LongRunRow>> = BTreeMap::new();
    for row in &annual {
        series
            .entry((row.group_id.as_str(), row.distributor_id.as_str()))
            .or_default()
            .push(row);
    }
    let mut summary: Vec<LongRunSummary> = series
        .into_values()
        .filter_map(|mut rows| {
            rows.sort_by_key(|r| r.ano);
            let (first, last) = (*rows.first()?, *rows.last()?);
            Some(LongRunSummary {
                group_id: first.group_id.clone(),
                group_label: first.group_label.clone(),
                distributor_id: first.distributor_id.clone(),
                distributor_label: first.distributor_label.clone(),
                ano_inicio: first.ano,
                ano_fim: last.ano,
                taxa_inicio: first.taxa_fora_prazo,
                taxa_fim: last.taxa_fora_prazo,
                delta_taxa_abs: abs_delta(first.taxa_fora_prazo, last.taxa_fora_prazo),
                delta_taxa_pct: pct_delta(first.taxa_fora_prazo, last.taxa_fora_prazo),
                compensacao_inicio: first.compensacao_rs,
                compensacao_fim: last.compensacao_rs,
                delta_comp_abs: last.compensacao_rs - first.compensacao_rs,
                delta_comp_pct: pct_delta(Some(first.compensacao_rs), Some(last.compensacao_rs)),
            })
        })
        .collect();
    summary.sort_by(|a, b| {
        (&a.group_id, &a.distributor_label).cmp(&(&b.group_id, &b.distributor_label))
    });
    (annual, summary)
}

/// Named row-count checks per group. A non-zero count on any check other
/// than `linhas_total` points at a source problem.
pub fn build_quality_checks(monthly: &[MonthlyFact]) -> Vec<QualityCheck> {
    let mut by_group: BTreeMap<&str, Vec<&MonthlyFact>> = BTreeMap::new();
    for row in monthly {
        by_group.entry(row.group_id.as_str()).or_default().push(row);
    }

    let mut checks = Vec::new();
    for (group_id, rows) in by_group {
        let count = |pred: &dyn Fn(&MonthlyFact) -> bool| rows.iter().filter(|r| pred(**r)).count() as u64;

        let mut keys: BTreeMap<(Year, Month, &str), u64> = BTreeMap::new();
        for r in &rows {
            *keys.entry((r.ano, r.mes, r.distributor_id.as_str())).or_default() += 1;
        }
        let duplicates: u64 = keys.values().filter(|n| **n > 1).sum();

        let results: [(&str, u64); 7] = [
            ("linhas_total", rows.len() as u64),
            ("duplicidades_chave_ano_mes_distribuidora", duplicates),
            ("fora_prazo_maior_que_servico", count(&|r: &MonthlyFact| r.qtd_fora_prazo > r.qtd_serv_realizado)),
            ("linhas_taxa_fora_prazo_maior_1", count(&|r: &MonthlyFact| r.taxa_fora_prazo.is_some_and(|t| t > 1.0))),
            ("linhas_uc_ativa_zero_ou_negativa", count(&|r: &MonthlyFact| r.uc_ativa_mes.is_some_and(|u| u <= 0.0))),
            (
                "linhas_compensacao_positiva_sem_fora",
                count(&|r: &MonthlyFact| r.compensacao_rs > 0.0 && r.qtd_fora_prazo <= 0.0),
            ),
            (
                "linhas_valor_negativo",
                count(&|r: &MonthlyFact| {
                    r.qtd_serv_realizado < 0.0
                        || r.qtd_fora_prazo < 0.0
                        || r.compensacao_rs < 0.0
                        || r.uc_ativa_mes.is_some_and(|u| u < 0.0)
                        || r.taxa_fora_prazo.is_some_and(|t| t < 0.0)
                }),
            ),
        ];
        let group_label = rows.first().map(|r| r.group_label.clone()).unwrap_or_default();
        for (name, n) in results {
            if name != "linhas_total" && n > 0 {
                log::warn!("stage=quality group={group_id} {name}={n}");
            }
            checks.push(QualityCheck {
                group_id: group_id.to_string(),
                group_label: group_label.clone(),
                checagem: name.to_string(),
                qtd_linhas: n,
            });
        }
    }
    checks.sort_by(|a, b| (&a.group_id, &a.checagem).cmp(&(&b.group_id, &b.checagem)));
    checks
}

/// Months with data and the comma-separated list of missing months,
/// per distributor and year.
pub fn build_coverage(monthly: &[MonthlyFact]) -> Vec<CoverageRecord> {
    let mut months: BTreeMap<(&str, &str, Year), (BTreeSet<Month>, &MonthlyFact)> = BTreeMap::new();
    for row in monthly {
        months
            .entry((row.group_id.as_str(), row.distributor_id.as_str(), row.ano))
            .or_insert_with(|| (BTreeSet::new(), row))
            .0
            .insert(row.mes);
    }

    let mut rows: Vec<CoverageRecord> = months
        .into_iter()
        .map(|((group_id, distributor_id, ano), (seen, any))| {
            let missing: Vec<String> = (1..=12)
                .filter(|m| !seen.contains(m))
                .map(|m| m.to_string())
                .collect();
            CoverageRecord {
                group_id: group_id.to_string(),
                group_label: any.group_label.clone(),
                distributor_id: distributor_id.to_string(),
                distributor_label: any.distributor_label.clone(),
                ano,
                meses_com_dados: seen.len() as u32,
                meses_faltantes: missing.join(","),
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.group_id, &a.distributor_label, a.ano).cmp(&(&b.group_id, &b.distributor_label, b.ano))
    });
    rows
}

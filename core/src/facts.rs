//! Fact aggregation: raw observations to monthly and annual fact tables.
//!
//! BUILD ORDER (each table only reads tables built before it):
//!   1. dim_indicador_servico
//!   2. fato_uc_ativa_mensal_distribuidora
//!   3. dim_distribuidora_porte
//!   4. fato_indicadores_anuais           (enriched with size)
//!   5. fato_servicos_municipio_mes
//!   6. fato_transgressao_mensal_porte
//!   7. fato_transgressao_mensal_distribuidora   (MonthlyFact)
//!   8. kpi_regulatorio_anual
//!   9. annual group view                         (AnnualFact)
//!  10. annual view without the focus service codes
//!
//! RULES:
//!   - Every row is keyed by a resolved (group_id, distributor_id).
//!   - A raw row the directory cannot place is a ResolutionDefect.
//!   - All grouping goes through BTreeMap keys, so output order is fixed.

use crate::{
    config::PipelineConfig,
    dimension::{DirectoryEntry, EntityDirectory},
    error::{PipelineError, PipelineResult},
    ingest::{AgentRow, IndicatorDomainRow, IndicatorObservation, RawCorpus, RawTable, ServiceObservation},
    stats::{dense_rank_desc, mean_present, percentile_rank, ratio, scaled_ratio, size_bucket, sum_present},
    text::{classify_segment, clean_service_name, collapse_whitespace, extract_article},
    types::{DistributorId, GroupId, Month, Year},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Indicator families that feed the annual fact.
pub const INDICATOR_FAMILIES: &[&str] = &["QS", "QV", "PM", "CR"];

// ── Row types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDimensionRow {
    pub sigindicador:      String,
    pub dscindicador:      String,
    pub familia_indicador: String,
    pub codigo_base:       String,
    pub servico_nome:      String,
    pub classe_local:      String,
    pub artigo_ren:        String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualIndicatorFact {
    pub ano:                      Year,
    pub group_id:                 GroupId,
    pub distributor_id:           DistributorId,
    pub sigagente:                String,
    pub codigo_base:              String,
    pub classe_local:             String,
    pub qtd_serv:                 Option<f64>,
    pub qtd_fora_prazo:           Option<f64>,
    pub prazo_medio:              Option<f64>,
    pub compensacao_rs:           Option<f64>,
    pub has_qs:                   bool,
    pub has_qv:                   bool,
    pub has_pm:                   bool,
    pub has_cr:                   bool,
    pub taxa_fora_prazo:          Option<f64>,
    pub periodo_regulatorio:      String,
    pub ano_comparavel_principal: bool,
    pub uc_ativa_media_mensal:    Option<f64>,
    pub bucket_porte:             Option<String>,
    pub rank_porte_ano:           Option<u32>,
    pub fora_prazo_por_100k_uc:   Option<f64>,
    pub compensacao_rs_por_uc:    Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyConnectionRow {
    pub ano:            Year,
    pub mes:            Month,
    pub group_id:       GroupId,
    pub distributor_id: DistributorId,
    pub uc_ativa_mes:   f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeDimensionRow {
    pub ano:                   Year,
    pub group_id:              GroupId,
    pub distributor_id:        DistributorId,
    pub distributor_label:     String,
    pub uc_ativa_media_mensal: f64,
    pub rank_porte_ano:        u32,
    pub bucket_porte:          String,
    pub share_uc_ano:          Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMunicipalityFact {
    pub ano:                      Year,
    pub mes:                      Month,
    pub group_id:                 GroupId,
    pub distributor_id:           DistributorId,
    pub codmunicipioibge:         String,
    pub codtiposervico:           String,
    pub dsctiposervico:           String,
    pub dscprazo:                 String,
    pub classe_local_servico:     String,
    pub qtd_serv_realizado:       f64,
    pub qtd_fora_prazo:           f64,
    pub compensacao_rs:           f64,
    pub taxa_fora_prazo:          Option<f64>,
    pub periodo_regulatorio:      String,
    pub ano_comparavel_principal: bool,
}

/// Monthly transgressions per service class, normalized by size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyClassFact {
    pub ano:                                   Year,
    pub mes:                                   Month,
    pub group_id:                              GroupId,
    pub distributor_id:                        DistributorId,
    pub classe_local_servico:                  String,
    pub qtd_serv_realizado:                    f64,
    pub qtd_fora_prazo:                        f64,
    pub compensacao_rs:                        f64,
    pub uc_ativa_mes:                          Option<f64>,
    pub uc_ativa_media_mensal:                 Option<f64>,
    pub bucket_porte:                          Option<String>,
    pub rank_porte_ano:                        Option<u32>,
    pub taxa_fora_prazo:                       Option<f64>,
    pub fora_prazo_por_100k_uc_mes:            Option<f64>,
    pub compensacao_rs_por_uc_mes:             Option<f64>,
    pub compensacao_media_por_transgressao_rs: Option<f64>,
    pub periodo_regulatorio:                   String,
    pub ano_comparavel_principal:              bool,
}

/// The monthly fact: one row per (year, month, group, distributor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyFact {
    pub ano:                                   Year,
    pub mes:                                   Month,
    pub group_id:                              GroupId,
    pub group_label:                           String,
    pub distributor_id:                        DistributorId,
    pub distributor_label:                     String,
    pub qtd_serv_realizado:                    f64,
    pub qtd_fora_prazo:                        f64,
    pub compensacao_rs:                        f64,
    pub uc_ativa_mes:                          Option<f64>,
    pub uc_ativa_media_mensal:                 Option<f64>,
    pub bucket_porte:                          Option<String>,
    pub rank_porte_ano:                        Option<u32>,
    pub taxa_fora_prazo:                       Option<f64>,
    pub fora_prazo_por_100k_uc_mes:            Option<f64>,
    pub compensacao_rs_por_uc_mes:             Option<f64>,
    pub compensacao_media_por_transgressao_rs: Option<f64>,
    pub periodo_regulatorio:                   String,
    pub ano_comparavel_principal:              bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiRow {
    pub ano:                 Year,
    pub periodo_regulatorio: String,
    pub qtd_serv:            f64,
    pub qtd_fora_prazo:      f64,
    pub compensacao_rs:      f64,
    pub taxa_fora_prazo:     Option<f64>,
}

/// The annual fact: one row per (group, distributor, year) in the analysis window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualFact {
    pub group_id:                              GroupId,
    pub group_label:                           String,
    pub distributor_id:                        DistributorId,
    pub distributor_label:                     String,
    pub ano:                                   Year,
    pub meses_com_dados:                       u32,
    pub qtd_serv_realizado:                    f64,
    pub qtd_fora_prazo:                        f64,
    pub compensacao_rs:                        f64,
    pub uc_ativa_media_ano:                    Option<f64>,
    pub exposicao_uc_mes:                      Option<f64>,
    pub taxa_fora_prazo:                       Option<f64>,
    pub fora_prazo_por_100k_uc_mes:            Option<f64>,
    pub compensacao_rs_por_uc_mes:             Option<f64>,
    pub compensacao_media_por_transgressao_rs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualExcludingFocusFact {
    pub group_id:                   GroupId,
    pub group_label:                String,
    pub distributor_id:             DistributorId,
    pub distributor_label:          String,
    pub ano:                        Year,
    pub qtd_serv_realizado:         f64,
    pub qtd_fora_prazo:             f64,
    pub compensacao_rs:             f64,
    pub exposicao_uc_mes:           Option<f64>,
    pub taxa_fora_prazo:            Option<f64>,
    pub fora_prazo_por_100k_uc_mes: Option<f64>,
    pub compensacao_rs_por_uc_mes:  Option<f64>,
    pub escopo_servico:             String,
}

/// Every fact table of one run.
#[derive(Debug, Clone, Default)]
pub struct FactTables {
    pub indicator_dimension:      Vec<IndicatorDimensionRow>,
    pub monthly_connections:      Vec<MonthlyConnectionRow>,
    pub size_dimension:           Vec<SizeDimensionRow>,
    pub annual_indicators:        Vec<AnnualIndicatorFact>,
    pub services_by_municipality: Vec<ServiceMunicipalityFact>,
    pub monthly_by_class:         Vec<MonthlyClassFact>,
    pub monthly:                  Vec<MonthlyFact>,
    pub kpi:                      Vec<KpiRow>,
    pub annual:                   Vec<AnnualFact>,
    pub annual_excluding_focus:   Vec<AnnualExcludingFocusFact>,
}

impl FactTables {
    /// `(table name, group_id, distributor_id)` for every keyed row.
    pub fn entity_keys(&self) -> Vec<(&'static str, &str, &str)> {
        let mut keys = Vec::new();
        keys.extend(self.monthly_connections.iter().map(|r| ("fato_uc_ativa_mensal_distribuidora", r.group_id.as_str(), r.distributor_id.as_str())));
        keys.extend(self.size_dimension.iter().map(|r| ("dim_distribuidora_porte", r.group_id.as_str(), r.distributor_id.as_str())));
        keys.extend(self.annual_indicators.iter().map(|r| ("fato_indicadores_anuais", r.group_id.as_str(), r.distributor_id.as_str())));
        keys.extend(self.services_by_municipality.iter().map(|r| ("fato_servicos_municipio_mes", r.group_id.as_str(), r.distributor_id.as_str())));
        keys.extend(self.monthly_by_class.iter().map(|r| ("fato_transgressao_mensal_porte", r.group_id.as_str(), r.distributor_id.as_str())));
        keys.extend(self.monthly.iter().map(|r| ("fato_transgressao_mensal_distribuidora", r.group_id.as_str(), r.distributor_id.as_str())));
        keys
    }
}

// ── Resolution ───────────────────────────────────────────────────────────────

/// Pair every raw row with its directory entry. Rows that cannot be
/// placed, or land on an empty key, are collected and reported together.
pub fn annotate<'t, 'd, T: AgentRow>(
    table: &'t RawTable<T>,
    directory: &'d EntityDirectory<'_>,
) -> PipelineResult<Vec<(&'t T, &'d DirectoryEntry)>> {
    let mut resolved = Vec::with_capacity(table.rows.len());
    let mut defects = Vec::new();
    for (index, row) in table.rows.iter().enumerate() {
        match directory.lookup(row.sigagente(), row.nomagente()) {
            Some(entry) if !entry.group_id.is_empty() && !entry.identity.distributor_id.is_empty() => {
                resolved.push((row, entry))
            }
            _ => defects.push(index),
        }
    }
    if defects.is_empty() {
        Ok(resolved)
    } else {
        Err(PipelineError::ResolutionDefect {
            table: table.source.clone(),
            rows: defects,
        })
    }
}

fn labels<'d>(directory: &'d EntityDirectory<'_>, distributor_id: &str) -> (&'d str, &'d str) {
    directory
        .get(distributor_id)
        .map(|e| (e.group_label.as_str(), e.identity.label.as_str()))
        .unwrap_or(("", ""))
}

// ── 1. Indicator dimension ───────────────────────────────────────────────────

/// `QS`/`QV`/`PM`/`CR` from the first two characters, else `OUTRO`.
pub fn infer_family(sigindicador: &str) -> &'static str {
    let code = collapse_whitespace(sigindicador);
    let prefix: String = code.chars().take(2).collect();
    if code.chars().count() < 2 {
        return "OUTRO";
    }
    INDICATOR_FAMILIES
        .iter()
        .find(|f| **f == prefix)
        .copied()
        .unwrap_or("OUTRO")
}

/// The code without its family prefix.
pub fn infer_base_code(sigindicador: &str, family: &str) -> String {
    let code = collapse_whitespace(sigindicador);
    if INDICATOR_FAMILIES.contains(&family) && code.chars().count() > 2 {
        code.chars().skip(2).collect()
    } else {
        code
    }
}

pub fn build_indicator_dimension(
    indicators: &[IndicatorObservation],
    domain: &[IndicatorDomainRow],
) -> Vec<IndicatorDimensionRow> {
    let mut descriptions: BTreeMap<&str, &str> = BTreeMap::new();
    for row in domain {
        descriptions.entry(row.sigindicador.as_str()).or_insert(row.dscindicador.as_str());
    }
    let codes: BTreeSet<&str> = indicators
        .iter()
        .map(|o| o.sigindicador.as_str())
        .filter(|c| !c.is_empty())
        .collect();

    codes
        .into_iter()
        .map(|code| {
            let description = descriptions.get(code).copied().unwrap_or("");
            let family = infer_family(code);
            IndicatorDimensionRow {
                sigindicador: code.to_string(),
                dscindicador: description.to_string(),
                familia_indicador: family.to_string(),
                codigo_base: infer_base_code(code, family),
                servico_nome: clean_service_name(description),
                classe_local: classify_segment(description).to_string(),
                artigo_ren: extract_article(description),
            }
        })
        .collect()
}

// ── 2–3. Active connections and size ─────────────────────────────────────────

type EntityKey = (GroupId, DistributorId);
type YearEntityKey = (Year, GroupId, DistributorId);
type MonthEntityKey = (Year, Month, GroupId, DistributorId);

pub fn build_monthly_connections(corpus: &RawCorpus, directory: &EntityDirectory<'_>) -> PipelineResult<Vec<MonthlyConnectionRow>> {
    let mut totals: BTreeMap<MonthEntityKey, f64> = BTreeMap::new();
    for (row, entry) in annotate(&corpus.connections, directory)? {
        let key = (row.ano, row.mes, entry.group_id.clone(), entry.identity.distributor_id.clone());
        *totals.entry(key).or_default() += row.uc_ativa;
    }
    Ok(totals
        .into_iter()
        .map(|((ano, mes, group_id, distributor_id), uc_ativa_mes)| MonthlyConnectionRow {
            ano,
            mes,
            group_id,
            distributor_id,
            uc_ativa_mes,
        })
        .collect())
}

/// Size proxy per (year, distributor): mean monthly active connections,
/// ranked and bucketed within the year.
pub fn build_size_dimension(
    monthly_connections: &[MonthlyConnectionRow],
    directory: &EntityDirectory<'_>,
) -> Vec<SizeDimensionRow> {
    let mut by_entity: BTreeMap<YearEntityKey, Vec<f64>> = BTreeMap::new();
    for row in monthly_connections {
        by_entity
            .entry((row.ano, row.group_id.clone(), row.distributor_id.clone()))
            .or_default()
            .push(row.uc_ativa_mes);
    }

    let mut by_year: BTreeMap<Year, Vec<(EntityKey, f64)>> = BTreeMap::new();
    for ((ano, group_id, distributor_id), values) in by_entity {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        by_year.entry(ano).or_default().push(((group_id, distributor_id), mean));
    }

    let mut rows = Vec::new();
    for (ano, entities) in by_year {
        let values: Vec<f64> = entities.iter().map(|(_, v)| *v).collect();
        let ranks = dense_rank_desc(&values);
        let percentiles = percentile_rank(&values);
        let total: f64 = values.iter().sum();
        for (i, ((group_id, distributor_id), mean)) in entities.into_iter().enumerate() {
            let (_, label) = labels(directory, &distributor_id);
            rows.push(SizeDimensionRow {
                ano,
                distributor_label: label.to_string(),
                group_id,
                distributor_id,
                uc_ativa_media_mensal: mean,
                rank_porte_ano: ranks[i],
                bucket_porte: size_bucket(percentiles[i]).to_string(),
                share_uc_ano: ratio(Some(mean), Some(total)),
            });
        }
    }
    rows.sort_by(|a, b| {
        (a.ano, a.rank_porte_ano, &a.group_id, &a.distributor_id)
            .cmp(&(b.ano, b.rank_porte_ano, &b.group_id, &b.distributor_id))
    });
    rows
}

fn size_index(size: &[SizeDimensionRow]) -> BTreeMap<YearEntityKey, &SizeDimensionRow> {
    size.iter()
        .map(|r| ((r.ano, r.group_id.clone(), r.distributor_id.clone()), r))
        .collect()
}

fn connection_index(connections: &[MonthlyConnectionRow]) -> BTreeMap<MonthEntityKey, f64> {
    connections
        .iter()
        .map(|r| ((r.ano, r.mes, r.group_id.clone(), r.distributor_id.clone()), r.uc_ativa_mes))
        .collect()
}

// ── 4. Annual indicators ─────────────────────────────────────────────────────

#[derive(Default)]
struct IndicatorAccumulator {
    sigagente: String,
    qs:        Option<f64>,
    qv:        Option<f64>,
    pm:        Vec<f64>,
    cr:        Option<f64>,
}

fn add(slot: &mut Option<f64>, value: f64) {
    *slot = Some(slot.unwrap_or(0.0) + value);
}

pub fn build_annual_indicators(
    corpus: &RawCorpus,
    indicator_dimension: &[IndicatorDimensionRow],
    size: &[SizeDimensionRow],
    directory: &EntityDirectory<'_>,
    config: &PipelineConfig,
) -> PipelineResult<Vec<AnnualIndicatorFact>> {
    let dim: BTreeMap<&str, &IndicatorDimensionRow> = indicator_dimension
        .iter()
        .map(|r| (r.sigindicador.as_str(), r))
        .collect();

    type IndicatorKey = (Year, GroupId, DistributorId, String, String);
    let mut acc: BTreeMap<IndicatorKey, IndicatorAccumulator> = BTreeMap::new();
    for (obs, entry) in annotate(&corpus.indicators, directory)? {
        let Some(indicator) = dim.get(obs.sigindicador.as_str()) else {
            continue;
        };
        if !INDICATOR_FAMILIES.contains(&indicator.familia_indicador.as_str())
            || indicator.codigo_base.is_empty()
        {
            continue;
        }
        let key = (
            obs.ano,
            entry.group_id.clone(),
            entry.identity.distributor_id.clone(),
            indicator.codigo_base.clone(),
            indicator.classe_local.clone(),
        );
        let slot = acc.entry(key).or_default();
        if slot.sigagente.is_empty() {
            slot.sigagente = entry.identity.name_sig.clone();
        }
        match indicator.familia_indicador.as_str() {
            "QS" => add(&mut slot.qs, obs.valor),
            "QV" => add(&mut slot.qv, obs.valor),
            "PM" => slot.pm.push(obs.valor),
            _ => add(&mut slot.cr, obs.valor),
        }
    }

    let sizes = size_index(size);
    let scale = config.late_rate_scale;
    Ok(acc
        .into_iter()
        .map(|((ano, group_id, distributor_id, codigo_base, classe_local), a)| {
            let prazo_medio = mean_present(a.pm.iter().copied().map(Some));
            let porte = sizes.get(&(ano, group_id.clone(), distributor_id.clone()));
            let uc_media = porte.map(|p| p.uc_ativa_media_mensal);
            AnnualIndicatorFact {
                ano,
                sigagente: a.sigagente,
                codigo_base,
                classe_local,
                has_qs: a.qs.is_some(),
                has_qv: a.qv.is_some(),
                has_pm: prazo_medio.is_some(),
                has_cr: a.cr.is_some(),
                taxa_fora_prazo: ratio(a.qv, a.qs),
                periodo_regulatorio: config.regulatory_period(ano).to_string(),
                ano_comparavel_principal: config.indicator_comparable_window.contains(ano),
                uc_ativa_media_mensal: uc_media,
                bucket_porte: porte.map(|p| p.bucket_porte.clone()),
                rank_porte_ano: porte.map(|p| p.rank_porte_ano),
                fora_prazo_por_100k_uc: scaled_ratio(a.qv, uc_media, scale),
                compensacao_rs_por_uc: ratio(a.cr, uc_media),
                qtd_serv: a.qs,
                qtd_fora_prazo: a.qv,
                prazo_medio,
                compensacao_rs: a.cr,
                group_id,
                distributor_id,
            }
        })
        .collect())
}

// ── 5. Services per municipality ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Measures {
    services: f64,
    late:     f64,
    comp:     f64,
}

impl Measures {
    fn add(&mut self, services: f64, late: f64, comp: f64) {
        self.services += services;
        self.late += late;
        self.comp += comp;
    }

    fn late_rate(&self) -> Option<f64> {
        ratio(Some(self.late), Some(self.services))
    }

    fn comp_per_late(&self) -> Option<f64> {
        ratio(Some(self.comp), Some(self.late))
    }
}

pub fn build_services_by_municipality(
    corpus: &RawCorpus,
    directory: &EntityDirectory<'_>,
    config: &PipelineConfig,
) -> PipelineResult<Vec<ServiceMunicipalityFact>> {
    type ServiceKey = (Year, Month, GroupId, DistributorId, String, String, String, String, String);
    let mut acc: BTreeMap<ServiceKey, Measures> = BTreeMap::new();
    for (row, entry) in annotate(&corpus.services, directory)? {
        let ServiceObservation {
            ano,
            mes,
            codmunicipioibge,
            codtiposervico,
            dsctiposervico,
            dscprazo,
            ..
        } = row;
        let key = (
            *ano,
            *mes,
            entry.group_id.clone(),
            entry.identity.distributor_id.clone(),
            codmunicipioibge.clone(),
            codtiposervico.clone(),
            dsctiposervico.clone(),
            dscprazo.clone(),
            classify_segment(dsctiposervico).to_string(),
        );
        acc.entry(key)
            .or_default()
            .add(row.qtd_serv_realizado, row.qtd_fora_prazo, row.compensacao_rs);
    }

    Ok(acc
        .into_iter()
        .map(|((ano, mes, group_id, distributor_id, municipio, codigo, descricao, prazo, classe), m)| {
            ServiceMunicipalityFact {
                ano,
                mes,
                group_id,
                distributor_id,
                codmunicipioibge: municipio,
                codtiposervico: codigo,
                dsctiposervico: descricao,
                dscprazo: prazo,
                classe_local_servico: classe,
                qtd_serv_realizado: m.services,
                qtd_fora_prazo: m.late,
                compensacao_rs: m.comp,
                taxa_fora_prazo: m.late_rate(),
                periodo_regulatorio: config.regulatory_period(ano).to_string(),
                ano_comparavel_principal: config.analysis_window.contains(ano),
            }
        })
        .collect())
}

// ── 6–7. Monthly transgressions ──────────────────────────────────────────────

pub fn build_monthly_by_class(
    services: &[ServiceMunicipalityFact],
    connections: &[MonthlyConnectionRow],
    size: &[SizeDimensionRow],
    config: &PipelineConfig,
) -> Vec<MonthlyClassFact> {
    let mut acc: BTreeMap<(MonthEntityKey, String), Measures> = BTreeMap::new();
    for row in services {
        let key = (row.ano, row.mes, row.group_id.clone(), row.distributor_id.clone());
        acc.entry((key, row.classe_local_servico.clone()))
            .or_default()
            .add(row.qtd_serv_realizado, row.qtd_fora_prazo, row.compensacao_rs);
    }

    let uc = connection_index(connections);
    let sizes = size_index(size);
    let scale = config.late_rate_scale;
    acc.into_iter()
        .map(|((key, classe), m)| {
            let uc_mes = uc.get(&key).copied();
            let (ano, mes, group_id, distributor_id) = key;
            let porte = sizes.get(&(ano, group_id.clone(), distributor_id.clone()));
            MonthlyClassFact {
                ano,
                mes,
                group_id,
                distributor_id,
                classe_local_servico: classe,
                qtd_serv_realizado: m.services,
                qtd_fora_prazo: m.late,
                compensacao_rs: m.comp,
                uc_ativa_mes: uc_mes,
                uc_ativa_media_mensal: porte.map(|p| p.uc_ativa_media_mensal),
                bucket_porte: porte.map(|p| p.bucket_porte.clone()),
                rank_porte_ano: porte.map(|p| p.rank_porte_ano),
                taxa_fora_prazo: m.late_rate(),
                fora_prazo_por_100k_uc_mes: scaled_ratio(Some(m.late), uc_mes, scale),
                compensacao_rs_por_uc_mes: ratio(Some(m.comp), uc_mes),
                compensacao_media_por_transgressao_rs: m.comp_per_late(),
                periodo_regulatorio: config.regulatory_period(ano).to_string(),
                ano_comparavel_principal: config.analysis_window.contains(ano),
            }
        })
        .collect()
}

/// Collapse the per-class monthly rows into the monthly fact.
pub fn build_monthly(
    by_class: &[MonthlyClassFact],
    directory: &EntityDirectory<'_>,
    config: &PipelineConfig,
) -> Vec<MonthlyFact> {
    let mut acc: BTreeMap<MonthEntityKey, (Measures, &MonthlyClassFact)> = BTreeMap::new();
    for row in by_class {
        let key = (row.ano, row.mes, row.group_id.clone(), row.distributor_id.clone());
        acc.entry(key)
            .or_insert((Measures::default(), row))
            .0
            .add(row.qtd_serv_realizado, row.qtd_fora_prazo, row.compensacao_rs);
    }

    let scale = config.late_rate_scale;
    acc.into_iter()
        .map(|((ano, mes, group_id, distributor_id), (m, first))| {
            let (group_label, distributor_label) = labels(directory, &distributor_id);
            MonthlyFact {
                ano,
                mes,
                group_label: group_label.to_string(),
                distributor_label: distributor_label.to_string(),
                group_id,
                distributor_id,
                qtd_serv_realizado: m.services,
                qtd_fora_prazo: m.late,
                compensacao_rs: m.comp,
                uc_ativa_mes: first.uc_ativa_mes,
                uc_ativa_media_mensal: first.uc_ativa_media_mensal,
                bucket_porte: first.bucket_porte.clone(),
                rank_porte_ano: first.rank_porte_ano,
                taxa_fora_prazo: m.late_rate(),
                fora_prazo_por_100k_uc_mes: scaled_ratio(Some(m.late), first.uc_ativa_mes, scale),
                compensacao_rs_por_uc_mes: ratio(Some(m.comp), first.uc_ativa_mes),
                compensacao_media_por_transgressao_rs: m.comp_per_late(),
                periodo_regulatorio: config.regulatory_period(ano).to_string(),
                ano_comparavel_principal: config.analysis_window.contains(ano),
            }
        })
        .collect()
}

// ── 8. National KPI ──────────────────────────────────────────────────────────

pub fn build_kpi(annual_indicators: &[AnnualIndicatorFact], config: &PipelineConfig) -> Vec<KpiRow> {
    let mut acc: BTreeMap<Year, Measures> = BTreeMap::new();
    for row in annual_indicators.iter().filter(|r| r.ano_comparavel_principal) {
        acc.entry(row.ano).or_default().add(
            row.qtd_serv.unwrap_or(0.0),
            row.qtd_fora_prazo.unwrap_or(0.0),
            row.compensacao_rs.unwrap_or(0.0),
        );
    }
    acc.into_iter()
        .map(|(ano, m)| KpiRow {
            ano,
            periodo_regulatorio: config.regulatory_period(ano).to_string(),
            qtd_serv: m.services,
            qtd_fora_prazo: m.late,
            compensacao_rs: m.comp,
            taxa_fora_prazo: m.late_rate(),
        })
        .collect()
}

// ── 9–10. Annual group views ─────────────────────────────────────────────────

fn sort_by_period<T>(rows: &mut [T], key: impl Fn(&T) -> (Year, &str, &str)) {
    rows.sort_by(|a, b| key(a).cmp(&key(b)));
}

/// Annual rows within the analysis window; every sum is the sum of the
/// matching monthly rows.
pub fn build_annual(monthly: &[MonthlyFact], config: &PipelineConfig) -> Vec<AnnualFact> {
    let mut acc: BTreeMap<(GroupId, DistributorId, Year), Vec<&MonthlyFact>> = BTreeMap::new();
    for row in monthly.iter().filter(|r| config.analysis_window.contains(r.ano)) {
        acc.entry((row.group_id.clone(), row.distributor_id.clone(), row.ano))
            .or_default()
            .push(row);
    }

    let scale = config.late_rate_scale;
    let mut rows: Vec<AnnualFact> = acc
        .into_iter()
        .map(|((group_id, distributor_id, ano), months)| {
            let mut m = Measures::default();
            for row in &months {
                m.add(row.qtd_serv_realizado, row.qtd_fora_prazo, row.compensacao_rs);
            }
            let distinct: BTreeSet<Month> = months.iter().map(|r| r.mes).collect();
            let exposure = sum_present(months.iter().map(|r| r.uc_ativa_mes));
            AnnualFact {
                group_label: months[0].group_label.clone(),
                distributor_label: months[0].distributor_label.clone(),
                group_id,
                distributor_id,
                ano,
                meses_com_dados: distinct.len() as u32,
                qtd_serv_realizado: m.services,
                qtd_fora_prazo: m.late,
                compensacao_rs: m.comp,
                uc_ativa_media_ano: mean_present(months.iter().map(|r| r.uc_ativa_mes)),
                exposicao_uc_mes: exposure,
                taxa_fora_prazo: m.late_rate(),
                fora_prazo_por_100k_uc_mes: scaled_ratio(Some(m.late), exposure, scale),
                compensacao_rs_por_uc_mes: ratio(Some(m.comp), exposure),
                compensacao_media_por_transgressao_rs: m.comp_per_late(),
            }
        })
        .collect();
    sort_by_period(&mut rows, |r| (r.ano, r.group_id.as_str(), r.distributor_id.as_str()));
    rows
}

/// Annual rows recomputed without the focus service codes. Exposure only
/// counts months that still have services after the exclusion.
pub fn build_annual_excluding_focus(
    services: &[ServiceMunicipalityFact],
    monthly: &[MonthlyFact],
    directory: &EntityDirectory<'_>,
    config: &PipelineConfig,
) -> Vec<AnnualExcludingFocusFact> {
    let focus: BTreeSet<&str> = config.focus_service_codes.iter().map(String::as_str).collect();
    let mut months: BTreeMap<MonthEntityKey, Measures> = BTreeMap::new();
    for row in services.iter().filter(|r| {
        config.analysis_window.contains(r.ano) && !focus.contains(r.codtiposervico.trim())
    }) {
        months
            .entry((row.ano, row.mes, row.group_id.clone(), row.distributor_id.clone()))
            .or_default()
            .add(row.qtd_serv_realizado, row.qtd_fora_prazo, row.compensacao_rs);
    }

    let uc: BTreeMap<MonthEntityKey, Option<f64>> = monthly
        .iter()
        .map(|r| ((r.ano, r.mes, r.group_id.clone(), r.distributor_id.clone()), r.uc_ativa_mes))
        .collect();

    let mut annual: BTreeMap<YearEntityKey, (Measures, Vec<Option<f64>>)> = BTreeMap::new();
    for (key, m) in months {
        let exposure = uc.get(&key).copied().flatten();
        let (ano, _, group_id, distributor_id) = key;
        let slot = annual.entry((ano, group_id, distributor_id)).or_default();
        slot.0.add(m.services, m.late, m.comp);
        slot.1.push(exposure);
    }

    let scope = format!("sem_cod_{}", config.focus_service_codes.join("_"));
    let scale = config.late_rate_scale;
    let mut rows: Vec<AnnualExcludingFocusFact> = annual
        .into_iter()
        .map(|((ano, group_id, distributor_id), (m, exposures))| {
            let exposure = sum_present(exposures);
            let (group_label, distributor_label) = labels(directory, &distributor_id);
            AnnualExcludingFocusFact {
                group_label: group_label.to_string(),
                distributor_label: distributor_label.to_string(),
                group_id,
                distributor_id,
                ano,
                qtd_serv_realizado: m.services,
                qtd_fora_prazo: m.late,
                compensacao_rs: m.comp,
                exposicao_uc_mes: exposure,
                taxa_fora_prazo: m.late_rate(),
                fora_prazo_por_100k_uc_mes: scaled_ratio(Some(m.late), exposure, scale),
                compensacao_rs_por_uc_mes: ratio(Some(m.comp), exposure),
                escopo_servico: scope.clone(),
            }
        })
        .collect();
    sort_by_period(&mut rows, |r| (r.ano, r.group_id.as_str(), r.distributor_id.as_str()));
    rows
}

/// Build every fact table, in the documented order.
pub fn build_all(
    corpus: &RawCorpus,
    directory: &EntityDirectory<'_>,
    config: &PipelineConfig,
) -> PipelineResult<FactTables> {
    let indicator_dimension = build_indicator_dimension(&corpus.indicators.rows, &corpus.domain.rows);
    let monthly_connections = build_monthly_connections(corpus, directory)?;
    let size_dimension = build_size_dimension(&monthly_connections, directory);
    let annual_indicators =
        build_annual_indicators(corpus, &indicator_dimension, &size_dimension, directory, config)?;
    let services_by_municipality = build_services_by_municipality(corpus, directory, config)?;
    let monthly_by_class =
        build_monthly_by_class(&services_by_municipality, &monthly_connections, &size_dimension, config);
    let monthly = build_monthly(&monthly_by_class, directory, config);
    let kpi = build_kpi(&annual_indicators, config);
    let annual = build_annual(&monthly, config);
    let annual_excluding_focus =
        build_annual_excluding_focus(&services_by_municipality, &monthly, directory, config);

    log::info!(
        "stage=facts indicators={} monthly={} annual={} kpi_years={}",
        annual_indicators.len(),
        monthly.len(),
        annual.len(),
        kpi.len(),
    );
    Ok(FactTables {
        indicator_dimension,
        monthly_connections,
        size_dimension,
        annual_indicators,
        services_by_municipality,
        monthly_by_class,
        monthly,
        kpi,
        annual,
        annual_excluding_focus,
    })
}

//! Fact aggregation over the shared fixture corpus.

mod common;

use common::approx;
use distmetrics_core::{
    config::PipelineConfig,
    dimension::{collect_identities, EntityDirectory},
    error::PipelineError,
    facts::{self, FactTables},
    ingest::RawTable,
    stats::{dense_rank_desc, percentile_rank, size_bucket},
};

fn build_facts() -> FactTables {
    let overrides = common::fixture_overrides();
    let corpus = common::fixture_corpus();
    let registry = collect_identities(&overrides, &corpus);
    let directory = EntityDirectory::build(&overrides, &registry);
    let config = PipelineConfig::default_test(std::path::Path::new("."));
    facts::build_all(&corpus, &directory, &config).expect("facts build")
}

#[test]
fn zero_services_month_has_null_rate_not_error() {
    let facts = build_facts();
    let jan = facts
        .monthly
        .iter()
        .find(|r| r.distributor_id == "cpfl_paulista" && r.ano == 2023 && r.mes == 1)
        .expect("cpfl paulista january 2023");
    assert_eq!(jan.qtd_serv_realizado, 0.0);
    assert_eq!(jan.taxa_fora_prazo, None);
    assert_eq!(jan.compensacao_media_por_transgressao_rs, None);
    assert!(approx(jan.fora_prazo_por_100k_uc_mes, 0.0));

    // Same rule on the annual indicator series: QS = 0, QV = 5.
    let indicator = facts
        .annual_indicators
        .iter()
        .find(|r| r.distributor_id == "cpfl_paulista" && r.ano == 2022)
        .expect("cpfl paulista indicator row");
    assert!(indicator.has_qs && indicator.has_qv);
    assert_eq!(indicator.taxa_fora_prazo, None);
}

#[test]
fn annual_sums_equal_the_sum_of_monthly_facts() {
    let facts = build_facts();
    assert!(!facts.annual.is_empty());
    for annual in &facts.annual {
        let months: Vec<_> = facts
            .monthly
            .iter()
            .filter(|m| {
                m.group_id == annual.group_id && m.distributor_id == annual.distributor_id && m.ano == annual.ano
            })
            .collect();
        let services: f64 = months.iter().map(|m| m.qtd_serv_realizado).sum();
        let late: f64 = months.iter().map(|m| m.qtd_fora_prazo).sum();
        let comp: f64 = months.iter().map(|m| m.compensacao_rs).sum();
        assert_eq!(annual.qtd_serv_realizado, services, "{} {}", annual.distributor_id, annual.ano);
        assert_eq!(annual.qtd_fora_prazo, late, "{} {}", annual.distributor_id, annual.ano);
        assert_eq!(annual.compensacao_rs, comp, "{} {}", annual.distributor_id, annual.ano);
        assert_eq!(annual.meses_com_dados as usize, months.len());
    }
}

#[test]
fn monthly_rates_are_normalized_by_active_connections() {
    let facts = build_facts();
    let coelba = facts
        .monthly
        .iter()
        .find(|r| r.distributor_id == "neoenergia_coelba" && r.ano == 2023 && r.mes == 1)
        .expect("coelba january 2023");
    assert_eq!(coelba.group_id, "neoenergia");
    assert_eq!(coelba.uc_ativa_mes, Some(1000.0));
    assert!(approx(coelba.taxa_fora_prazo, 0.1));
    assert!(approx(coelba.fora_prazo_por_100k_uc_mes, 1000.0));
    assert!(approx(coelba.compensacao_rs_por_uc_mes, 0.05));
    assert!(approx(coelba.compensacao_media_por_transgressao_rs, 5.0));
    assert_eq!(coelba.periodo_regulatorio, "pos_2022");

    let annual = facts
        .annual
        .iter()
        .find(|r| r.distributor_id == "neoenergia_coelba" && r.ano == 2025)
        .expect("coelba 2025");
    assert_eq!(annual.exposicao_uc_mes, Some(4000.0));
    assert_eq!(annual.uc_ativa_media_ano, Some(2000.0));
    assert!(approx(annual.fora_prazo_por_100k_uc_mes, 250.0));
}

#[test]
fn size_dimension_ranks_densely_and_buckets_by_quartile() {
    let facts = build_facts();
    let year: Vec<_> = facts.size_dimension.iter().filter(|r| r.ano == 2025).collect();
    let by_id = |id: &str| {
        year.iter()
            .find(|r| r.distributor_id == id)
            .map(|r| (r.rank_porte_ano, r.bucket_porte.as_str()))
            .expect("sized distributor")
    };
    assert_eq!(by_id("cemig_d"), (1, "GG"));
    assert_eq!(by_id("neoenergia_coelba"), (2, "G"));
    assert_eq!(by_id("cpfl_paulista"), (3, "M"));
    assert_eq!(by_id("cpfl_piratininga"), (4, "P"));

    let shares: f64 = year.iter().filter_map(|r| r.share_uc_ano).sum();
    assert!((shares - 1.0).abs() < 1e-9);
}

#[test]
fn dense_rank_shares_ranks_on_ties() {
    assert_eq!(dense_rank_desc(&[10.0, 30.0, 30.0, 5.0]), vec![2, 1, 1, 3]);
    let pct = percentile_rank(&[10.0, 30.0, 30.0, 5.0]);
    assert_eq!(size_bucket(pct[3]), "P");
    assert_eq!(size_bucket(pct[1]), "GG");
    assert_eq!(pct[1], pct[2]);
}

#[test]
fn kpi_covers_comparable_years_with_regulatory_period() {
    let facts = build_facts();
    let years: Vec<(i32, &str)> = facts
        .kpi
        .iter()
        .map(|r| (r.ano, r.periodo_regulatorio.as_str()))
        .collect();
    assert_eq!(years, vec![(2021, "pre_2022"), (2022, "pos_2022")]);
    assert!(approx(facts.kpi[0].taxa_fora_prazo, 0.1));
    assert!(approx(Some(facts.kpi[0].compensacao_rs), 1234.56));
    assert_eq!(facts.kpi[1].qtd_serv, 200.0);
    assert_eq!(facts.kpi[1].qtd_fora_prazo, 35.0);
}

#[test]
fn focus_codes_are_excluded_from_the_reduced_annual_view() {
    let facts = build_facts();
    let cemig = facts
        .annual
        .iter()
        .find(|r| r.distributor_id == "cemig_d")
        .expect("cemig annual");
    let reduced = facts
        .annual_excluding_focus
        .iter()
        .find(|r| r.distributor_id == "cemig_d")
        .expect("cemig reduced annual");
    assert_eq!(cemig.qtd_serv_realizado, 450.0);
    assert_eq!(reduced.qtd_serv_realizado, 400.0);
    assert_eq!(reduced.qtd_fora_prazo, 40.0);
    assert_eq!(reduced.exposicao_uc_mes, Some(8000.0));
    assert_eq!(reduced.escopo_servico, "sem_cod_69_93");
}

#[test]
fn indicator_dimension_classifies_families_and_segments() {
    let facts = build_facts();
    let families: Vec<(&str, &str)> = facts
        .indicator_dimension
        .iter()
        .map(|r| (r.sigindicador.as_str(), r.familia_indicador.as_str()))
        .collect();
    assert_eq!(families, vec![("CR01", "CR"), ("PM01", "PM"), ("QS01", "QS"), ("QV01", "QV")]);
    for row in &facts.indicator_dimension {
        assert_eq!(row.codigo_base, "01");
        assert_eq!(row.classe_local, "grupo_b_urbana");
        assert_eq!(row.artigo_ren, "Art. 88");
    }
}

#[test]
fn unregistered_rows_are_a_resolution_defect() {
    let overrides = common::fixture_overrides();
    let corpus = common::fixture_corpus();
    let registry = collect_identities(&overrides, &corpus);
    let directory = EntityDirectory::build(&overrides, &registry);

    let known = corpus.services.rows[0].clone();
    let mut stranger = known.clone();
    stranger.sigagente = "LIGHT".into();
    stranger.nomagente = "Light Serviços de Eletricidade".into();
    let table = RawTable::new(
        "indger-servicos-comerciais.csv",
        vec![known.clone(), stranger.clone(), known, stranger],
    );

    match facts::annotate(&table, &directory) {
        Err(PipelineError::ResolutionDefect { table, rows }) => {
            assert_eq!(table, "indger-servicos-comerciais.csv");
            assert_eq!(rows, vec![1, 3]);
        }
        Err(other) => panic!("expected a resolution defect, got {other:?}"),
        Ok(_) => panic!("unregistered rows must not resolve"),
    }

    let clean = RawTable::new("ok.csv", corpus.services.rows.clone());
    let resolved = facts::annotate(&clean, &directory).expect("fixture rows resolve");
    assert_eq!(resolved.len(), corpus.services.rows.len());
}

#[test]
fn annual_views_are_ordered_by_year_then_entity() {
    let facts = build_facts();
    let keys: Vec<(i32, &str, &str)> = facts
        .annual
        .iter()
        .map(|r| (r.ano, r.group_id.as_str(), r.distributor_id.as_str()))
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert_eq!(keys.first().map(|k| k.0), Some(2023));

    let focus_keys: Vec<(i32, &str, &str)> = facts
        .annual_excluding_focus
        .iter()
        .map(|r| (r.ano, r.group_id.as_str(), r.distributor_id.as_str()))
        .collect();
    let mut focus_sorted = focus_keys.clone();
    focus_sorted.sort();
    assert_eq!(focus_keys, focus_sorted);
}

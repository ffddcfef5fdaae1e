//! Shared raw-file fixtures for the integration tests.
//!
//! Four distributors across three groups, two analysis years:
//!   NEOENERGIA COELBA (neoenergia), CPFL PAULISTA and CPFL PIRATININGA
//!   (cpfl), CEMIG-D (cemig).
#![allow(dead_code)]

use distmetrics_core::{
    config::PipelineConfig,
    ingest::{self, RawCorpus, RawTable},
    overrides::OverrideStore,
};
use std::path::Path;

pub const INDICATORS_CSV: &str = "\
sigagente;nomagente;sigindicador;anoindice;numperiodoindice;vlrindiceenviado
COELBA;Neoenergia Coelba Distribuição S.A.;QS01;2021;1;100
COELBA;Neoenergia Coelba Distribuição S.A.;QV01;2021;1;10
COELBA;Neoenergia Coelba Distribuição S.A.;CR01;2021;1;1.234,56
NEOENERGIA COELBA;Neoenergia Coelba;QS01;2022;1;200
NEOENERGIA COELBA;Neoenergia Coelba;QV01;2022;1;30
CPFL PAULISTA;Companhia Paulista de Força e Luz;QS01;2022;1;0
CPFL PAULISTA;Companhia Paulista de Força e Luz;QV01;2022;1;5
CEMIG-D;Cemig Distribuição S.A.;PM01;2022;1;3,5
";

pub const DOMAIN_CSV: &str = "\
sigindicador;dscindicador
QS01;Quantidade de serviços de ligação Grupo B Urbana (Art. 88)
QV01;Quantidade de serviços violados de ligação Grupo B Urbana (Art. 88)
CR01;Compensação paga de ligação Grupo B Urbana (Art. 88)
PM01;Prazo médio de ligação Grupo B Urbana (Art. 88)
";

pub const CONNECTIONS_CSV: &str = "\
datreferenciainformada;sigagente;nomagente;qtducativa
2023-01-01;NEOENERGIA COELBA;Neoenergia Coelba;1000
2023-02-01;NEOENERGIA COELBA;Neoenergia Coelba;1000
2025-01-01;NEOENERGIA COELBA;Neoenergia Coelba;2000
2025-02-01;NEOENERGIA COELBA;Neoenergia Coelba;2000
2023-01-01;CPFL PAULISTA;Companhia Paulista de Força e Luz;500
2023-02-01;CPFL PAULISTA;Companhia Paulista de Força e Luz;500
2025-01-01;CPFL PAULISTA;Companhia Paulista de Força e Luz;600
2025-02-01;CPFL PAULISTA;Companhia Paulista de Força e Luz;600
2025-01-01;CPFL PIRATININGA;Companhia Piratininga de Força e Luz;300
2025-02-01;CPFL PIRATININGA;Companhia Piratininga de Força e Luz;300
2025-01-01;CEMIG-D;Cemig Distribuição S.A.;4000
2025-02-01;CEMIG-D;Cemig Distribuição S.A.;4000
";

pub const SERVICES_CSV: &str = "\
datreferenciainformada;sigagente;nomagente;codmunicipioibge;codtiposervico;dsctiposervico;dscprazo;qtdservrealizado;qtdservrealizdescprazo;vlrpagocompensacao
2023-01-01;NEOENERGIA COELBA;Neoenergia Coelba;2927408.0;10;Ligação Grupo B Urbana;2 dias úteis;100;10;50,00
2023-02-01;NEOENERGIA COELBA;Neoenergia Coelba;2927408.0;10;Ligação Grupo B Urbana;2 dias úteis;100;10;50,00
2025-01-01;NEOENERGIA COELBA;Neoenergia Coelba;2927408.0;10;Ligação Grupo B Urbana;2 dias úteis;100;5;25,00
2025-02-01;NEOENERGIA COELBA;Neoenergia Coelba;2927408.0;10;Ligação Grupo B Urbana;2 dias úteis;100;5;25,00
2023-01-01;CPFL PAULISTA;Companhia Paulista de Força e Luz;3509502;10;Ligação Grupo B Urbana;2 dias úteis;0;0;0
2023-02-01;CPFL PAULISTA;Companhia Paulista de Força e Luz;3509502;10;Ligação Grupo B Urbana;2 dias úteis;50;5;10,00
2025-01-01;CPFL PAULISTA;Companhia Paulista de Força e Luz;3509502;10;Ligação Grupo B Urbana;2 dias úteis;40;4;8,00
2025-02-01;CPFL PAULISTA;Companhia Paulista de Força e Luz;3509502;10;Ligação Grupo B Urbana;2 dias úteis;40;20;40,00
2025-01-01;CPFL PIRATININGA;Companhia Piratininga de Força e Luz;3548500;10;Ligação Grupo B Urbana;2 dias úteis;30;3;6,00
2025-02-01;CPFL PIRATININGA;Companhia Piratininga de Força e Luz;3548500;10;Ligação Grupo B Urbana;2 dias úteis;30;3;6,00
2025-01-01;CEMIG-D;Cemig Distribuição S.A.;3106200;10;Ligação Grupo B Urbana;2 dias úteis;200;20;100,00
2025-01-01;CEMIG-D;Cemig Distribuição S.A.;3106200;69;Vistoria Grupo A;3 dias úteis;50;0;0
2025-02-01;CEMIG-D;Cemig Distribuição S.A.;3106200;10;Ligação Grupo B Urbana;2 dias úteis;200;20;100,00
";

pub const OVERRIDES_JSON: &str = r#"{
  "distributor_aliases": { "COELBA": "neoenergia_coelba" },
  "group_labels": { "neoenergia": "Neoenergia" }
}"#;

pub const SERVICES_FILE: &str = "indger-servicos-comerciais.csv";

pub fn fixture_corpus() -> RawCorpus {
    RawCorpus {
        indicators: ingest::parse_indicators("qualidade-atendimento-comercial.csv", INDICATORS_CSV)
            .expect("indicator fixture parses"),
        domain: ingest::parse_domain("dominio-indicadores.csv", DOMAIN_CSV).expect("domain fixture parses"),
        connections: ingest::parse_connections("indger-dados-comerciais.csv", CONNECTIONS_CSV)
            .expect("connection fixture parses"),
        services: ingest::parse_services(SERVICES_FILE, SERVICES_CSV).expect("service fixture parses"),
    }
}

pub fn fixture_overrides() -> OverrideStore {
    OverrideStore::from_json(OVERRIDES_JSON).expect("override fixture parses")
}

/// Write every fixture file into `dir`, laid out like the raw data folder.
pub fn write_fixture_files(dir: &Path) {
    let config = PipelineConfig::default_test(dir);
    let write = |name: &str, content: &str| {
        std::fs::write(dir.join(name), content).expect("write fixture file");
    };
    write(&config.sources.indicators, INDICATORS_CSV);
    write(&config.sources.indicator_domain, DOMAIN_CSV);
    write(&config.sources.active_connections, CONNECTIONS_CSV);
    write(SERVICES_FILE, SERVICES_CSV);
    write("overrides.json", OVERRIDES_JSON);
}

pub fn empty_table<T>(source: &str) -> RawTable<T> {
    RawTable::new(source, Vec::new())
}

pub fn approx(actual: Option<f64>, expected: f64) -> bool {
    actual.is_some_and(|v| (v - expected).abs() < 1e-9)
}

/// Route `log` output through the test harness; safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

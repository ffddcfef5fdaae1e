//! Raw source tables: typed rows checked at the input boundary.
//!
//! RULE: a missing required column aborts with the file and column names.
//! Rows are never silently invented; unparseable periods are skipped and
//! counted on the table.

use crate::{
    config::PipelineConfig,
    error::{PipelineError, PipelineResult},
    text::{collapse_whitespace, parse_br_number},
    types::{Month, Year},
};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const INDICATOR_COLUMNS: &[&str] =
    &["sigagente", "sigindicador", "anoindice", "numperiodoindice", "vlrindiceenviado"];

pub const DOMAIN_COLUMNS: &[&str] = &["sigindicador", "dscindicador"];

pub const CONNECTION_COLUMNS: &[&str] =
    &["datreferenciainformada", "sigagente", "nomagente", "qtducativa"];

pub const SERVICE_COLUMNS: &[&str] = &[
    "datreferenciainformada",
    "sigagente",
    "nomagente",
    "codmunicipioibge",
    "codtiposervico",
    "dsctiposervico",
    "dscprazo",
    "qtdservrealizado",
    "qtdservrealizdescprazo",
    "vlrpagocompensacao",
];

/// Rows that carry a raw agent signature and legal name.
pub trait AgentRow {
    fn sigagente(&self) -> &str;
    fn nomagente(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct RawTable<T> {
    pub source:  String,
    pub rows:    Vec<T>,
    pub skipped: usize,
}

impl<T> RawTable<T> {
    pub fn new(source: impl Into<String>, rows: Vec<T>) -> Self {
        Self { source: source.into(), rows, skipped: 0 }
    }
}

/// Quality-indicator observation: one indicator value per agent and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorObservation {
    pub sigagente:    String,
    pub nomagente:    String,
    pub sigindicador: String,
    pub ano:          Year,
    pub periodo:      Option<Month>,
    pub valor:        f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDomainRow {
    pub sigindicador: String,
    pub dscindicador: String,
}

/// Active consumer-unit count reported for a month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionObservation {
    pub sigagente: String,
    pub nomagente: String,
    pub ano:       Year,
    pub mes:       Month,
    pub uc_ativa:  f64,
}

/// Commercial services performed in a municipality and month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceObservation {
    pub sigagente:          String,
    pub nomagente:          String,
    pub ano:                Year,
    pub mes:                Month,
    pub codmunicipioibge:   String,
    pub codtiposervico:     String,
    pub dsctiposervico:     String,
    pub dscprazo:           String,
    pub qtd_serv_realizado: f64,
    pub qtd_fora_prazo:     f64,
    pub compensacao_rs:     f64,
}

macro_rules! agent_row {
    ($($ty:ty),*) => {
        $(impl AgentRow for $ty {
            fn sigagente(&self) -> &str { &self.sigagente }
            fn nomagente(&self) -> &str { &self.nomagente }
        })*
    };
}

agent_row!(IndicatorObservation, ConnectionObservation, ServiceObservation);

/// Every raw table one run consumes.
#[derive(Debug, Clone)]
pub struct RawCorpus {
    pub indicators:  RawTable<IndicatorObservation>,
    pub domain:      RawTable<IndicatorDomainRow>,
    pub connections: RawTable<ConnectionObservation>,
    pub services:    RawTable<ServiceObservation>,
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Decode a raw file: UTF-16 (BOM), UTF-8, else Latin-1.
pub fn decode_text(bytes: &[u8]) -> String {
    if let [0xFF, 0xFE, rest @ ..] = bytes {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Header names of one file, normalized, plus their positions.
struct ColumnIndex {
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    fn new(headers: &csv::StringRecord) -> Self {
        let positions = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().trim_start_matches('\u{feff}').to_lowercase(), i))
            .collect();
        Self { positions }
    }

    fn missing(&self, required: &[&str]) -> Vec<String> {
        let mut missing: Vec<String> = required
            .iter()
            .filter(|c| !self.positions.contains_key(**c))
            .map(|c| c.to_string())
            .collect();
        missing.sort();
        missing
    }

    fn get<'r>(&self, record: &'r csv::StringRecord, column: &str) -> &'r str {
        self.positions
            .get(column)
            .and_then(|&i| record.get(i))
            .map(str::trim)
            .unwrap_or("")
    }
}

fn delimiter_for(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or("");
    if header.contains(';') {
        b';'
    } else {
        b','
    }
}

/// Parse CSV text, check required columns, map every record.
/// `map` returns `None` for rows that cannot be placed in time.
pub fn parse_table<T>(
    source: &str,
    text: &str,
    required: &[&str],
    map: impl Fn(&dyn Fn(&str) -> String) -> Option<T>,
) -> PipelineResult<RawTable<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(text))
        .flexible(true)
        .from_reader(text.as_bytes());
    let columns = ColumnIndex::new(reader.headers()?);
    let missing = columns.missing(required);
    if !missing.is_empty() {
        return Err(PipelineError::SchemaViolation {
            file: source.to_string(),
            missing,
        });
    }

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for record in reader.records() {
        let record = record?;
        let field = |column: &str| collapse_whitespace(columns.get(&record, column));
        match map(&field) {
            Some(row) => rows.push(row),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        log::warn!("stage=ingest {source}: skipped {skipped} row(s) without a usable period or agent");
    }
    Ok(RawTable { source: source.to_string(), rows, skipped })
}

/// `(year, month)` from a reference date such as `2023-01-01`,
/// `2023-01-01 00:00:00` or `01/01/2023`.
pub fn parse_reference_date(raw: &str) -> Option<(Year, Month)> {
    let raw = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some((dt.year(), dt.month()));
    }
    ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), fmt).ok())
        .map(|d| (d.year(), d.month()))
}

fn parse_year(raw: &str) -> Option<Year> {
    parse_br_number(raw).map(|v| v as Year).filter(|y| *y > 0)
}

fn agent_present(field: &dyn Fn(&str) -> String) -> bool {
    !field("sigagente").is_empty() || !field("nomagente").is_empty()
}

pub fn parse_indicators(source: &str, text: &str) -> PipelineResult<RawTable<IndicatorObservation>> {
    parse_table(source, text, INDICATOR_COLUMNS, |field| {
        if !agent_present(field) {
            return None;
        }
        Some(IndicatorObservation {
            sigagente: field("sigagente"),
            nomagente: field("nomagente"),
            sigindicador: field("sigindicador"),
            ano: parse_year(&field("anoindice"))?,
            periodo: parse_br_number(&field("numperiodoindice")).map(|v| v as Month),
            valor: parse_br_number(&field("vlrindiceenviado")).unwrap_or(0.0),
        })
    })
}

pub fn parse_domain(source: &str, text: &str) -> PipelineResult<RawTable<IndicatorDomainRow>> {
    parse_table(source, text, DOMAIN_COLUMNS, |field| {
        let sigindicador = field("sigindicador");
        if sigindicador.is_empty() {
            return None;
        }
        Some(IndicatorDomainRow {
            sigindicador,
            dscindicador: field("dscindicador"),
        })
    })
}

pub fn parse_connections(source: &str, text: &str) -> PipelineResult<RawTable<ConnectionObservation>> {
    parse_table(source, text, CONNECTION_COLUMNS, |field| {
        if !agent_present(field) {
            return None;
        }
        let (ano, mes) = parse_reference_date(&field("datreferenciainformada"))?;
        Some(ConnectionObservation {
            sigagente: field("sigagente"),
            nomagente: field("nomagente"),
            ano,
            mes,
            uc_ativa: parse_br_number(&field("qtducativa")).unwrap_or(0.0),
        })
    })
}

pub fn parse_services(source: &str, text: &str) -> PipelineResult<RawTable<ServiceObservation>> {
    parse_table(source, text, SERVICE_COLUMNS, |field| {
        if !agent_present(field) {
            return None;
        }
        let (ano, mes) = parse_reference_date(&field("datreferenciainformada"))?;
        let municipio = field("codmunicipioibge");
        Some(ServiceObservation {
            sigagente: field("sigagente"),
            nomagente: field("nomagente"),
            ano,
            mes,
            codmunicipioibge: municipio.strip_suffix(".0").unwrap_or(&municipio).to_string(),
            codtiposervico: field("codtiposervico"),
            dsctiposervico: field("dsctiposervico"),
            dscprazo: field("dscprazo"),
            qtd_serv_realizado: parse_br_number(&field("qtdservrealizado")).unwrap_or(0.0),
            qtd_fora_prazo: parse_br_number(&field("qtdservrealizdescprazo")).unwrap_or(0.0),
            compensacao_rs: parse_br_number(&field("vlrpagocompensacao")).unwrap_or(0.0),
        })
    })
}

// ── Files ────────────────────────────────────────────────────────────────────

fn read_source(path: &Path) -> PipelineResult<String> {
    if !path.exists() {
        return Err(PipelineError::MissingSource { path: path.display().to_string() });
    }
    Ok(decode_text(&std::fs::read(path)?))
}

fn collect_matching(dir: &Path, fragments: &[String], out: &mut Vec<PathBuf>) -> PipelineResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_matching(&path, fragments, out)?;
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".csv") && fragments.iter().all(|f| name.contains(&f.to_lowercase())) {
            out.push(path);
        }
    }
    Ok(())
}

/// Service files under `data_dir`, sorted by path.
pub fn service_files(config: &PipelineConfig) -> PipelineResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    if config.data_dir.is_dir() {
        collect_matching(&config.data_dir, &config.sources.services_name_fragments, &mut files)?;
    }
    files.sort();
    if files.is_empty() {
        return Err(PipelineError::MissingSource {
            path: format!(
                "{}/**/*{}*.csv",
                config.data_dir.display(),
                config.sources.services_name_fragments.join("*")
            ),
        });
    }
    Ok(files)
}

/// Read every raw source named by the config.
pub fn load_corpus(config: &PipelineConfig) -> PipelineResult<RawCorpus> {
    let src = &config.sources;
    let indicator_path = config.data_dir.join(&src.indicators);
    let domain_path = config.data_dir.join(&src.indicator_domain);
    let connection_path = config.data_dir.join(&src.active_connections);

    let indicators = parse_indicators(&src.indicators, &read_source(&indicator_path)?)?;
    let domain = parse_domain(&src.indicator_domain, &read_source(&domain_path)?)?;
    let connections = parse_connections(&src.active_connections, &read_source(&connection_path)?)?;

    let mut services = RawTable::new("servicos", Vec::new());
    for path in service_files(config)? {
        let name = path.display().to_string();
        let table = parse_services(&name, &read_source(&path)?)?;
        services.rows.extend(table.rows);
        services.skipped += table.skipped;
    }

    log::info!(
        "stage=ingest indicators={} domain={} connections={} services={}",
        indicators.rows.len(),
        domain.rows.len(),
        connections.rows.len(),
        services.rows.len(),
    );
    Ok(RawCorpus { indicators, domain, connections, services })
}

/// Header-only contract check of every raw file. Collects all problems.
pub fn validate_raw_contracts(config: &PipelineConfig) -> Vec<PipelineError> {
    let src = &config.sources;
    let mut checks: Vec<(PathBuf, &[&str])> = vec![
        (config.data_dir.join(&src.indicators), INDICATOR_COLUMNS),
        (config.data_dir.join(&src.indicator_domain), DOMAIN_COLUMNS),
        (config.data_dir.join(&src.active_connections), CONNECTION_COLUMNS),
    ];
    let mut errors = Vec::new();
    match service_files(config) {
        Ok(files) => checks.extend(files.into_iter().map(|p| (p, SERVICE_COLUMNS))),
        Err(e) => errors.push(e),
    }

    for (path, required) in checks {
        let text = match read_source(&path) {
            Ok(text) => text,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter_for(&text))
            .flexible(true)
            .from_reader(text.as_bytes());
        match reader.headers() {
            Ok(headers) => {
                let missing = ColumnIndex::new(headers).missing(required);
                if !missing.is_empty() {
                    errors.push(PipelineError::SchemaViolation {
                        file: path.display().to_string(),
                        missing,
                    });
                }
            }
            Err(e) => errors.push(e.into()),
        }
    }
    errors
}

use crate::types::Year;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Raw source file names, relative to `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFiles {
    #[serde(default = "default_indicator_file")]
    pub indicators: String,
    #[serde(default = "default_domain_file")]
    pub indicator_domain: String,
    #[serde(default = "default_connections_file")]
    pub active_connections: String,
    /// Services come split across several files; every file whose name
    /// contains all of these fragments is read.
    #[serde(default = "default_services_fragments")]
    pub services_name_fragments: Vec<String>,
}

impl Default for SourceFiles {
    fn default() -> Self {
        Self {
            indicators: default_indicator_file(),
            indicator_domain: default_domain_file(),
            active_connections: default_connections_file(),
            services_name_fragments: default_services_fragments(),
        }
    }
}

fn default_indicator_file() -> String {
    "qualidade-atendimento-comercial.csv".into()
}

fn default_domain_file() -> String {
    "dominio-indicadores.csv".into()
}

fn default_connections_file() -> String {
    "indger-dados-comerciais.csv".into()
}

fn default_services_fragments() -> Vec<String> {
    vec!["servico".into(), "comercia".into()]
}

/// Inclusive year window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct YearWindow {
    pub start: Year,
    pub end:   Year,
}

impl YearWindow {
    pub fn contains(&self, year: Year) -> bool {
        year >= self.start && year <= self.end
    }
}

/// Every knob the pipeline reads. Passed explicitly into each stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_overrides_path")]
    pub overrides_path: PathBuf,
    #[serde(default)]
    pub sources: SourceFiles,

    /// Years up to and including this one are `pre_2022`.
    #[serde(default = "default_regulatory_cutoff")]
    pub regulatory_cutoff_year: Year,
    /// Comparable window for the annual indicator series.
    #[serde(default = "default_indicator_window")]
    pub indicator_comparable_window: YearWindow,
    /// Window for monthly service analysis, trends and group views.
    #[serde(default = "default_analysis_window")]
    pub analysis_window: YearWindow,
    /// Last year of the long-run indicator summary.
    #[serde(default = "default_long_run_end")]
    pub long_run_end_year: Year,

    #[serde(default = "default_base_year")]
    pub trend_base_year: Year,
    #[serde(default = "default_last_year")]
    pub trend_last_year: Year,

    /// Absolute month-over-month change that flags a spike.
    #[serde(default = "default_spike_threshold")]
    pub spike_threshold: f64,
    /// Absolute annual volume change that flags a comparability break.
    #[serde(default = "default_volume_break")]
    pub volume_break_threshold: f64,
    /// Absolute change in focus-code share that flags a mix break.
    #[serde(default = "default_mix_break")]
    pub mix_break_threshold: f64,
    /// Service type codes tracked separately (and excluded from the
    /// "without focus codes" annual view).
    #[serde(default = "default_focus_codes")]
    pub focus_service_codes: Vec<String>,

    /// Scale for the per-connection late-service rate.
    #[serde(default = "default_rate_scale")]
    pub late_rate_scale: f64,

    #[serde(default = "default_top_n")]
    pub top_n_distributors: usize,
    /// Preferred group for the dashboard when present.
    #[serde(default = "default_group")]
    pub default_group_id: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/processed/analysis")
}

fn default_overrides_path() -> PathBuf {
    PathBuf::from("data/config/distributor_groups_overrides.json")
}

fn default_regulatory_cutoff() -> Year {
    2021
}

fn default_indicator_window() -> YearWindow {
    YearWindow { start: 2011, end: 2023 }
}

fn default_analysis_window() -> YearWindow {
    YearWindow { start: 2023, end: 2025 }
}

fn default_long_run_end() -> Year {
    2023
}

fn default_base_year() -> Year {
    2023
}

fn default_last_year() -> Year {
    2025
}

fn default_spike_threshold() -> f64 {
    0.5
}

fn default_volume_break() -> f64 {
    0.5
}

fn default_mix_break() -> f64 {
    0.3
}

fn default_focus_codes() -> Vec<String> {
    vec!["69".into(), "93".into()]
}

fn default_rate_scale() -> f64 {
    100_000.0
}

fn default_top_n() -> usize {
    10
}

fn default_group() -> String {
    "neoenergia".into()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            output_dir: default_output_dir(),
            overrides_path: default_overrides_path(),
            sources: SourceFiles::default(),
            regulatory_cutoff_year: default_regulatory_cutoff(),
            indicator_comparable_window: default_indicator_window(),
            analysis_window: default_analysis_window(),
            long_run_end_year: default_long_run_end(),
            trend_base_year: default_base_year(),
            trend_last_year: default_last_year(),
            spike_threshold: default_spike_threshold(),
            volume_break_threshold: default_volume_break(),
            mix_break_threshold: default_mix_break(),
            focus_service_codes: default_focus_codes(),
            late_rate_scale: default_rate_scale(),
            top_n_distributors: default_top_n(),
            default_group_id: default_group(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline config: {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!("No pipeline config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Config rooted at `dir` for tests: raw files read from `dir`,
    /// outputs written to `dir/out`, overrides read from `dir/overrides.json`.
    pub fn default_test(dir: &Path) -> Self {
        Self {
            data_dir: dir.to_path_buf(),
            output_dir: dir.join("out"),
            overrides_path: dir.join("overrides.json"),
            ..Self::default()
        }
    }

    pub fn is_pre_cutoff(&self, year: Year) -> bool {
        year <= self.regulatory_cutoff_year
    }

    pub fn regulatory_period(&self, year: Year) -> &'static str {
        if self.is_pre_cutoff(year) {
            "pre_2022"
        } else {
            "pos_2022"
        }
    }
}

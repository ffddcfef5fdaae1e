use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema violation in '{file}': missing columns {}", missing.join(", "))]
    SchemaViolation { file: String, missing: Vec<String> },

    #[error("Missing source file: {path}")]
    MissingSource { path: String },

    #[error("Resolution defect in '{table}': {} row(s) without distributor_id/group_id (rows {rows:?})", rows.len())]
    ResolutionDefect { table: String, rows: Vec<usize> },

    #[error("Referential gap in '{table}': ids absent from dimension: {}", ids.join(", "))]
    ReferentialGap { table: String, ids: Vec<String> },

    #[error("Invalid overrides document '{path}': {reason}")]
    InvalidOverrides { path: String, reason: String },

    #[error("Dashboard contract violated: missing or empty sections {}", missing.join(", "))]
    DashboardContract { missing: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

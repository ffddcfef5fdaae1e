//! The run event log: one event per completed stage.
//!
//! RULE: events are appended in stage order and never rewritten.
//! They carry counts and names only, never table contents.

use crate::types::RunId;
use serde::{Deserialize, Serialize};

/// Every event a run can emit.
/// Variants are appended over time, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageEvent {
    // ── Run lifecycle ──────────────────────────────
    RunStarted {
        run_id: RunId,
        version: String,
    },
    RunCompleted {
        run_id: RunId,
        tables: usize,
    },

    // ── Inputs ─────────────────────────────────────
    OverridesLoaded {
        group_assignments: usize,
        group_labels: usize,
        name_overrides: usize,
        aliases: usize,
    },
    SourcesLoaded {
        indicators: usize,
        indicator_domain: usize,
        connections: usize,
        services: usize,
        skipped_rows: usize,
    },

    // ── Identity ───────────────────────────────────
    IdentitiesResolved {
        distributors: usize,
        groups: usize,
        selectable_groups: usize,
    },

    // ── Facts and analysis ─────────────────────────
    TableBuilt {
        table: String,
        rows: usize,
    },
    ReferentialCheckPassed {
        tables: usize,
    },
    SpikeDetected {
        distributor_id: String,
        ano: i32,
        mes: u32,
        taxa_var_pct: f64,
    },
    ComparabilityBreak {
        distributor_id: String,
        ano: i32,
        volume: bool,
        mix: bool,
    },

    // ── Exports ────────────────────────────────────
    TableExported {
        table: String,
        rows: usize,
    },
    DashboardWritten {
        sections: usize,
    },
}

impl StageEvent {
    /// Stable name stored in the `event_type` column.
    pub fn type_name(&self) -> &'static str {
        match self {
            StageEvent::RunStarted { .. }             => "run_started",
            StageEvent::RunCompleted { .. }           => "run_completed",
            StageEvent::OverridesLoaded { .. }        => "overrides_loaded",
            StageEvent::SourcesLoaded { .. }          => "sources_loaded",
            StageEvent::IdentitiesResolved { .. }     => "identities_resolved",
            StageEvent::TableBuilt { .. }             => "table_built",
            StageEvent::ReferentialCheckPassed { .. } => "referential_check_passed",
            StageEvent::SpikeDetected { .. }          => "spike_detected",
            StageEvent::ComparabilityBreak { .. }     => "comparability_break",
            StageEvent::TableExported { .. }          => "table_exported",
            StageEvent::DashboardWritten { .. }       => "dashboard_written",
        }
    }
}

/// Persisted form of a StageEvent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub seq:        u32,
    pub stage:      String,
    pub event_type: String,
    pub payload:    String, // JSON-serialized StageEvent
}

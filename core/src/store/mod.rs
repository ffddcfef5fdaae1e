//! SQLite warehouse for derived tables.
//!
//! RULE: only the store talks to the database.
//! Stages hand finished tables to store methods; they never execute SQL.
//! Every row is keyed by run_id, so runs never overwrite each other.

use crate::{error::PipelineResult, event::EventLogEntry};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

mod analysis;
mod dimension;
mod facts;

pub struct WarehouseStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl WarehouseStore {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only matters for real files.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// File path of the database, `None` when in memory.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> PipelineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_dimensions.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_facts.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_analysis.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(&self, run_id: &str, version: &str, started_at: &str) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO run (run_id, version, started_at) VALUES (?1, ?2, ?3)",
            params![run_id, version, started_at],
        )?;
        Ok(())
    }

    pub fn complete_run(&self, run_id: &str, completed_at: &str) -> PipelineResult<()> {
        self.conn.execute(
            "UPDATE run SET status = 'completed', completed_at = ?1 WHERE run_id = ?2",
            params![completed_at, run_id],
        )?;
        Ok(())
    }

    pub fn run_status(&self, run_id: &str) -> PipelineResult<Option<String>> {
        let status = self
            .conn
            .query_row(
                "SELECT status FROM run WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO run_event (run_id, seq, stage, event_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.run_id,
                entry.seq as i64,
                entry.stage,
                entry.event_type,
                entry.payload,
            ],
        )?;
        Ok(())
    }

    pub fn events_for_run(&self, run_id: &str) -> PipelineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, seq, stage, event_type, payload
             FROM run_event WHERE run_id = ?1
             ORDER BY seq ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    seq: row.get::<_, i64>(2)? as u32,
                    stage: row.get(3)?,
                    event_type: row.get(4)?,
                    payload: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ── Untyped derived tables ─────────────────────────────────

    /// Store every row of a table as a JSON payload, in table order.
    pub fn insert_derived_rows<T: Serialize>(
        &self,
        run_id: &str,
        table: &str,
        rows: &[T],
    ) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO derived_row (run_id, table_name, row_index, payload)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (index, row) in rows.iter().enumerate() {
                let payload = serde_json::to_string(row)?;
                stmt.execute(params![run_id, table, index as i64, payload])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn derived_rows(&self, run_id: &str, table: &str) -> PipelineResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT payload FROM derived_row
             WHERE run_id = ?1 AND table_name = ?2
             ORDER BY row_index ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id, table], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    /// Row count of a warehouse table for one run.
    pub fn table_count(&self, run_id: &str, table: &str) -> PipelineResult<i64> {
        let sql = match table {
            "dim_distributor_group"
            | "dim_distribuidora_porte"
            | "fato_transgressao_mensal_distribuidora"
            | "fato_anual_grupo"
            | "kpi_regulatorio_anual"
            | "trend"
            | "benchmark"
            | "spike" => format!("SELECT COUNT(*) FROM {table} WHERE run_id = ?1"),
            _ => {
                return Ok(self.conn.query_row(
                    "SELECT COUNT(*) FROM derived_row WHERE run_id = ?1 AND table_name = ?2",
                    params![run_id, table],
                    |row| row.get(0),
                )?)
            }
        };
        Ok(self.conn.query_row(&sql, params![run_id], |row| row.get(0))?)
    }
}

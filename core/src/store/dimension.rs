use super::WarehouseStore;
use crate::{
    dimension::GroupDimensionRow,
    error::PipelineResult,
    facts::SizeDimensionRow,
};
use rusqlite::params;

impl WarehouseStore {
    // ── Group dimension ────────────────────────────────────────

    pub fn insert_group_dimension(&self, run_id: &str, rows: &[GroupDimensionRow]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO dim_distributor_group (
                    run_id, group_id, group_label, distributor_id,
                    distributor_name_sig, distributor_name_legal, distributor_label,
                    distributor_count, selector_enabled, group_rule
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )?;
            for r in rows {
                stmt.execute(params![
                    run_id,
                    r.group_id,
                    r.group_label,
                    r.distributor_id,
                    r.distributor_name_sig,
                    r.distributor_name_legal,
                    r.distributor_label,
                    r.distributor_count as i64,
                    if r.selector_enabled { 1 } else { 0 },
                    r.group_rule,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// `(group_id, distributor_id)` pairs stored for a run, in key order.
    pub fn group_members(&self, run_id: &str) -> PipelineResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id, distributor_id FROM dim_distributor_group
             WHERE run_id = ?1 ORDER BY group_id, distributor_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Size dimension ─────────────────────────────────────────

    pub fn insert_size_dimension(&self, run_id: &str, rows: &[SizeDimensionRow]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO dim_distribuidora_porte (
                    run_id, ano, group_id, distributor_id, distributor_label,
                    uc_ativa_media_mensal, rank_porte_ano, bucket_porte, share_uc_ano
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            )?;
            for r in rows {
                stmt.execute(params![
                    run_id,
                    r.ano,
                    r.group_id,
                    r.distributor_id,
                    r.distributor_label,
                    r.uc_ativa_media_mensal,
                    r.rank_porte_ano,
                    r.bucket_porte,
                    r.share_uc_ano,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

use super::WarehouseStore;
use crate::{
    error::PipelineResult,
    trends::{BenchmarkRecord, SpikeRecord, TrendRecord},
};
use rusqlite::params;

impl WarehouseStore {
    // ── Trends ─────────────────────────────────────────────────

    pub fn insert_trends(&self, run_id: &str, rows: &[TrendRecord]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO trend (
                    run_id, group_id, distributor_id, metric, base_year, last_year,
                    base_value, last_value, delta_abs, delta_pct
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )?;
            for r in rows {
                stmt.execute(params![
                    run_id,
                    r.group_id,
                    r.distributor_id,
                    r.metric,
                    r.base_year,
                    r.last_year,
                    r.base_value,
                    r.last_value,
                    r.delta_abs,
                    r.delta_pct,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// `(base_value, last_value, delta_pct)` of one stored trend metric.
    pub fn trend_for(
        &self,
        run_id: &str,
        distributor_id: &str,
        metric: &str,
    ) -> PipelineResult<(Option<f64>, Option<f64>, Option<f64>)> {
        let values = self.conn.query_row(
            "SELECT base_value, last_value, delta_pct FROM trend
             WHERE run_id = ?1 AND distributor_id = ?2 AND metric = ?3",
            params![run_id, distributor_id, metric],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(values)
    }

    // ── Benchmark ──────────────────────────────────────────────

    pub fn insert_benchmark(&self, run_id: &str, rows: &[BenchmarkRecord]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO benchmark (
                    run_id, group_id, distributor_id, ano, uc_ativa_media_ano,
                    rank_porte_nacional, rank_porte_grupo,
                    fora_prazo_por_100k_uc_mes, compensacao_rs_por_uc_mes,
                    indice_fora_vs_mediana_grupo, indice_comp_vs_mediana_grupo
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            )?;
            for r in rows {
                stmt.execute(params![
                    run_id,
                    r.group_id,
                    r.distributor_id,
                    r.ano,
                    r.uc_ativa_media_ano,
                    r.rank_porte_nacional,
                    r.rank_porte_grupo,
                    r.fora_prazo_por_100k_uc_mes,
                    r.compensacao_rs_por_uc_mes,
                    r.indice_fora_vs_mediana_grupo,
                    r.indice_comp_vs_mediana_grupo,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── Spikes ─────────────────────────────────────────────────

    pub fn insert_spikes(&self, run_id: &str, rows: &[SpikeRecord]) -> PipelineResult<()> {
        for r in rows {
            self.conn.execute(
                "INSERT INTO spike (
                    run_id, group_id, distributor_id, ano, mes,
                    taxa_fora_prazo, taxa_var_abs, taxa_var_pct
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    run_id,
                    r.group_id,
                    r.distributor_id,
                    r.ano,
                    r.mes,
                    r.taxa_fora_prazo,
                    r.taxa_var_abs,
                    r.taxa_var_pct,
                ],
            )?;
        }
        Ok(())
    }
}

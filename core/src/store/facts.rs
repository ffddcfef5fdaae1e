use super::WarehouseStore;
use crate::{
    error::PipelineResult,
    facts::{AnnualFact, KpiRow, MonthlyFact},
};
use rusqlite::params;

impl WarehouseStore {
    // ── Monthly fact ───────────────────────────────────────────

    pub fn insert_monthly_facts(&self, run_id: &str, rows: &[MonthlyFact]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO fato_transgressao_mensal_distribuidora (
                    run_id, ano, mes, group_id, distributor_id,
                    qtd_serv_realizado, qtd_fora_prazo, compensacao_rs, uc_ativa_mes,
                    bucket_porte, taxa_fora_prazo, fora_prazo_por_100k_uc_mes,
                    compensacao_rs_por_uc_mes, compensacao_media_por_transgressao_rs,
                    periodo_regulatorio
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            )?;
            for r in rows {
                stmt.execute(params![
                    run_id,
                    r.ano,
                    r.mes,
                    r.group_id,
                    r.distributor_id,
                    r.qtd_serv_realizado,
                    r.qtd_fora_prazo,
                    r.compensacao_rs,
                    r.uc_ativa_mes,
                    r.bucket_porte,
                    r.taxa_fora_prazo,
                    r.fora_prazo_por_100k_uc_mes,
                    r.compensacao_rs_por_uc_mes,
                    r.compensacao_media_por_transgressao_rs,
                    r.periodo_regulatorio,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Sum of late services over the stored monthly rows of one
    /// distributor and year.
    pub fn monthly_late_total(&self, run_id: &str, distributor_id: &str, ano: i32) -> PipelineResult<f64> {
        let total = self.conn.query_row(
            "SELECT COALESCE(SUM(qtd_fora_prazo), 0.0)
             FROM fato_transgressao_mensal_distribuidora
             WHERE run_id = ?1 AND distributor_id = ?2 AND ano = ?3",
            params![run_id, distributor_id, ano],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // ── Annual fact ────────────────────────────────────────────

    pub fn insert_annual_facts(&self, run_id: &str, rows: &[AnnualFact]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO fato_anual_grupo (
                    run_id, group_id, distributor_id, ano, meses_com_dados,
                    qtd_serv_realizado, qtd_fora_prazo, compensacao_rs,
                    uc_ativa_media_ano, exposicao_uc_mes, taxa_fora_prazo,
                    fora_prazo_por_100k_uc_mes, compensacao_rs_por_uc_mes,
                    compensacao_media_por_transgressao_rs
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            )?;
            for r in rows {
                stmt.execute(params![
                    run_id,
                    r.group_id,
                    r.distributor_id,
                    r.ano,
                    r.meses_com_dados,
                    r.qtd_serv_realizado,
                    r.qtd_fora_prazo,
                    r.compensacao_rs,
                    r.uc_ativa_media_ano,
                    r.exposicao_uc_mes,
                    r.taxa_fora_prazo,
                    r.fora_prazo_por_100k_uc_mes,
                    r.compensacao_rs_por_uc_mes,
                    r.compensacao_media_por_transgressao_rs,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn annual_late_total(&self, run_id: &str, distributor_id: &str, ano: i32) -> PipelineResult<Option<f64>> {
        let total = self.conn.query_row(
            "SELECT SUM(qtd_fora_prazo) FROM fato_anual_grupo
             WHERE run_id = ?1 AND distributor_id = ?2 AND ano = ?3",
            params![run_id, distributor_id, ano],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // ── KPI ────────────────────────────────────────────────────

    pub fn insert_kpi(&self, run_id: &str, rows: &[KpiRow]) -> PipelineResult<()> {
        for r in rows {
            self.conn.execute(
                "INSERT INTO kpi_regulatorio_anual (
                    run_id, ano, periodo_regulatorio, qtd_serv,
                    qtd_fora_prazo, compensacao_rs, taxa_fora_prazo
                ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    run_id,
                    r.ano,
                    r.periodo_regulatorio,
                    r.qtd_serv,
                    r.qtd_fora_prazo,
                    r.compensacao_rs,
                    r.taxa_fora_prazo,
                ],
            )?;
        }
        Ok(())
    }
}

use tracing::warn;

use crate::render_job::RenderJob;

/// Divisor del rendimiento al calcular el precio.
pub const PERF_PRICE_DIVISOR: f64 = 1000.0;

/// Precio de un rango de chunks con el rendimiento registrado al asignarlo.
pub fn price_for(chunks: u32, perf_index: f64) -> f64 {
    f64::from(chunks) * perf_index / PERF_PRICE_DIVISOR
}

impl RenderJob {
    /// Costo de una subtarea; 0 si el id no es de este job.
    pub fn cost(&self, subtask_id: &str) -> f64 {
        match self.ledger.get(subtask_id) {
            Ok(r) => price_for(r.len(), r.perf_index),
            Err(e) => {
                warn!("no es subtarea de este job: {}", e);
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::render_job::testing::*;

    use super::*;

    #[test]
    fn cost_usa_tamano_y_perf_registrado() {
        let (mut job, _) = job(20);
        let a = job.next_chunk(3000.0, "w1").unwrap();
        // 2 chunks * 3000 / 1000
        assert!((job.cost(&a.subtask_id) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn cost_desconocido_es_cero() {
        let (job, _) = job(20);
        assert_eq!(job.cost("nope"), 0.0);
    }

    #[test]
    fn price_for_crece_con_el_rango() {
        let mut prev = 0.0;
        for chunks in 0..50 {
            let p = price_for(chunks, 2500.0);
            assert!(p >= prev);
            prev = p;
        }
    }
}

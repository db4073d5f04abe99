use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::RenderError;
use crate::job::{ComputeDescriptor, ComputeTaskDef};
use crate::render_job::RenderJob;
use crate::subtask::SubtaskId;

/// Rendimiento que corresponde a un chunk por pedido.
pub const PERF_PER_CHUNK: f64 = 1500.0;

/// Rango asignado a un worker junto con el id de su registro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAssignment {
    pub subtask_id: SubtaskId,
    pub start_chunk: u32,
    pub end_chunk: u32,
}

/// Tamaño del rango para un rendimiento dado (al menos 1).
pub fn chunk_size_for(perf_index: f64) -> u32 {
    // `as` satura: negativos y NaN quedan en 0
    ((perf_index / PERF_PER_CHUNK).floor() as u32).max(1)
}

impl RenderJob {
    /// Próximo rango de chunks para `worker_id`.
    ///
    /// Primero reparte chunks nuevos en orden, con tamaño proporcional al
    /// rendimiento; agotados esos, reenvía algún rango fallido con su tamaño
    /// original. `None` si el worker no es admitido o no queda trabajo.
    pub fn next_chunk(&mut self, perf_index: f64, worker_id: &str) -> Option<ChunkAssignment> {
        if !self.collab.admission.admit(worker_id) {
            warn!("{}", RenderError::AdmissionDenied(worker_id.to_string()));
            return None;
        }

        let total = self.spec.total_chunks;
        let (start, end) = if self.cursor < total {
            let size = chunk_size_for(perf_index);
            let start = self.cursor;
            let end = start.saturating_add(size).min(total);
            self.cursor = end;
            (start, end)
        } else {
            let failed = self
                .ledger
                .find_failed()
                .map(|r| (r.id.clone(), r.start_chunk, r.end_chunk))?;
            let (failed_id, start, end) = failed;
            if let Err(e) = self.ledger.mark_resent(&failed_id) {
                error!("no se pudo reenviar {}: {}", failed_id, e);
                return None;
            }
            info!(
                "reenviando chunks [{}, {}) de la subtarea {} al worker {}",
                start, end, failed_id, worker_id
            );
            (start, end)
        };

        let subtask_id = self.ledger.create(start, end, worker_id, perf_index);
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }

        debug!(
            "job {}: subtarea {} = chunks [{}, {}) para {} (perf={})",
            self.id, subtask_id, start, end, worker_id, perf_index
        );

        Some(ChunkAssignment {
            subtask_id,
            start_chunk: start,
            end_chunk: end,
        })
    }

    /// Asigna un rango y arma la definición completa para el worker.
    ///
    /// `num_cores == 0` usa el valor del job.
    pub fn query_extra_data(
        &mut self,
        perf_index: f64,
        num_cores: u32,
        worker_id: &str,
    ) -> Option<ComputeTaskDef> {
        let Some(assignment) = self.next_chunk(perf_index, worker_id) else {
            info!("job {}: no queda trabajo para {}", self.id, worker_id);
            return None;
        };

        let num_cores = if num_cores == 0 {
            self.spec.num_cores
        } else {
            num_cores
        };

        let descriptor = self.descriptor_for(
            assignment.start_chunk,
            assignment.end_chunk,
            num_cores,
            self.spec.res_x,
            self.spec.res_y,
        );
        debug!("subtarea {}: {}", assignment.subtask_id, descriptor.short_repr());

        self.collab.assembler.update_preview(None);

        Some(ComputeTaskDef {
            subtask_id: assignment.subtask_id,
            job_id: self.id.clone(),
            perf_index,
            descriptor,
        })
    }

    /// Tarea de prueba: siempre el primer chunk, escena a 1x1.
    ///
    /// No pasa por el ledger ni mueve el cursor.
    pub fn test_task(&self) -> ComputeTaskDef {
        ComputeTaskDef {
            subtask_id: uuid::Uuid::new_v4().to_string(),
            job_id: self.id.clone(),
            perf_index: 0.0,
            descriptor: self.descriptor_for(0, 1, self.spec.num_cores, 1, 1),
        }
    }

    pub(crate) fn descriptor_for(
        &self,
        start_task: u32,
        end_task: u32,
        num_cores: u32,
        width: u32,
        height: u32,
    ) -> ComputeDescriptor {
        let opts = &self.spec.renderer;
        let scene_file_src = self.collab.templater.template_scene(
            &self.scene_src,
            width,
            height,
            &opts.pixel_filter,
            &opts.sampler,
            opts.samples_per_pixel,
        );

        ComputeDescriptor {
            path_root: self.spec.path_root.clone(),
            start_task,
            end_task,
            total_tasks: self.spec.total_chunks,
            num_subtasks: self.spec.subtasks_per_chunk,
            num_cores,
            outfilebasename: self.spec.outfilebasename.clone(),
            scene_file_src,
            scene_dir: self.spec.scene_dir.clone(),
            pbrt_path: self.spec.pbrt_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::render_job::testing::*;
    use crate::subtask::SubtaskStatus;

    use super::*;

    #[test]
    fn chunk_size_for_minimo_uno() {
        assert_eq!(chunk_size_for(0.0), 1);
        assert_eq!(chunk_size_for(1499.0), 1);
        assert_eq!(chunk_size_for(3000.0), 2);
        assert_eq!(chunk_size_for(4499.9), 2);
        assert_eq!(chunk_size_for(-10.0), 1);
        assert_eq!(chunk_size_for(f64::NAN), 1);
    }

    #[test]
    fn rangos_secuenciales_de_tamano_fijo() {
        let (mut job, _) = job(20);
        let mut ranges = Vec::new();
        for _ in 0..10 {
            let a = job.next_chunk(3000.0, "w1").unwrap();
            ranges.push((a.start_chunk, a.end_chunk));
        }
        let expected: Vec<(u32, u32)> = (0..10).map(|i| (2 * i, 2 * i + 2)).collect();
        assert_eq!(ranges, expected);
        assert_eq!(job.cursor(), 20);

        // sin fallas no queda nada
        assert!(job.next_chunk(3000.0, "w1").is_none());
    }

    #[test]
    fn ultimo_rango_puede_ser_mas_chico() {
        let (mut job, _) = job(7);
        let mut covered = 0;
        let mut last = None;
        while let Some(a) = job.next_chunk(4500.0, "w1") {
            assert_eq!(a.start_chunk, covered);
            covered = a.end_chunk;
            last = Some((a.start_chunk, a.end_chunk));
        }
        assert_eq!(covered, 7);
        assert_eq!(last, Some((6, 7)));
    }

    #[test]
    fn reenvia_rango_fallido_con_su_tamano() {
        let (mut job, _) = job(20);
        let mut failed_id = None;
        for _ in 0..10 {
            let a = job.next_chunk(3000.0, "w1").unwrap();
            if a.start_chunk == 4 {
                failed_id = Some(a.subtask_id.clone());
            }
        }
        let failed_id = failed_id.unwrap();
        job.report_failure(&failed_id);
        assert_eq!(job.failed_count(), 1);

        // un worker rápido igual recibe el rango original
        let retry = job.next_chunk(30000.0, "w2").unwrap();
        assert_eq!((retry.start_chunk, retry.end_chunk), (4, 6));
        assert_eq!(job.failed_count(), 0);
        assert_eq!(
            job.ledger().get(&failed_id).unwrap().status,
            SubtaskStatus::Resent
        );
        assert_eq!(
            job.ledger().get(&retry.subtask_id).unwrap().status,
            SubtaskStatus::Starting
        );

        assert!(job.next_chunk(3000.0, "w2").is_none());
    }

    #[test]
    fn worker_no_admitido_no_muta_estado() {
        let (mut job, fakes) = job(20);
        job.next_chunk(3000.0, "w1").unwrap();
        fakes.admission.ban("malo");

        assert!(job.next_chunk(3000.0, "malo").is_none());
        assert!(job.query_extra_data(3000.0, 0, "malo").is_none());

        assert_eq!(job.cursor(), 2);
        assert_eq!(job.ledger().len(), 1);
        assert_eq!(job.failed_count(), 0);
        assert_eq!(job.completed_units(), 0);
    }

    #[test]
    fn query_extra_data_arma_descriptor() {
        let (mut job, _) = job(20);
        let def = job.query_extra_data(3000.0, 0, "w1").unwrap();

        assert_eq!(def.job_id, "job-1");
        let d = &def.descriptor;
        assert_eq!((d.start_task, d.end_task), (0, 2));
        assert_eq!(d.total_tasks, 20);
        assert_eq!(d.num_subtasks, 1);
        assert_eq!(d.num_cores, 4);
        assert_eq!(d.outfilebasename, "temp");
        assert_eq!(d.scene_file_src, "Scene|300x200|mitchell|lowdiscrepancy|32");
        assert!(job.ledger().contains(&def.subtask_id));

        let def = job.query_extra_data(1500.0, 8, "w1").unwrap();
        assert_eq!(def.descriptor.num_cores, 8);
    }

    #[test]
    fn test_task_es_fija_y_no_toca_el_ledger() {
        let (job, _) = job(20);
        let t = job.test_task();
        assert_eq!((t.descriptor.start_task, t.descriptor.end_task), (0, 1));
        assert_eq!(t.descriptor.scene_file_src, "Scene|1x1|mitchell|lowdiscrepancy|32");
        assert!(job.ledger().is_empty());
        assert_eq!(job.cursor(), 0);
    }
}

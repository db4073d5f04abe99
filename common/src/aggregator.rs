use chrono::Utc;
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::collab::TileHandle;
use crate::error::{RenderError, RenderResult};
use crate::grid::{chunk_area_pixels, pixel_to_chunk, PixelBox};
use crate::job::VerificationDescriptor;
use crate::render_job::RenderJob;
use crate::subtask::SubtaskStatus;

/// Resultado de procesar una entrega.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Subtarea desconocida o worker no admitido: no se tocó nada
    Ignored,
    /// Sin tiles o con tiles que no pasan la verificación
    Rejected,
    Accepted { tiles: u32, finalized: bool },
}

/// Número de chunk codificado en un nombre `<basename><N>.<ext>`.
pub fn chunk_from_file_name(file: &str, basename: &str) -> RenderResult<u32> {
    let malformed = |reason: &str| RenderError::MalformedResultName {
        name: file.to_string(),
        reason: reason.to_string(),
    };

    let stem = Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| malformed("sin nombre de archivo"))?;
    let idx = stem
        .find(basename)
        .ok_or_else(|| malformed("no contiene el nombre base"))?;

    stem[idx + basename.len()..]
        .parse::<u32>()
        .map_err(|e| malformed(&e.to_string()))
}

impl RenderJob {
    /// Procesa los tiles entregados para `subtask_id`.
    pub fn accept(&mut self, subtask_id: &str, payload: &[String], worker_id: &str) -> Delivery {
        let record = match self.ledger.get(subtask_id) {
            Ok(r) => r.clone(),
            Err(e) => {
                warn!("entrega ignorada: {}", e);
                return Delivery::Ignored;
            }
        };

        // sólo se aceptan subtareas en vuelo: duplicadas o ya reenviadas no cuentan
        if record.status != SubtaskStatus::Starting {
            warn!(
                "entrega de {} ignorada: la subtarea está en {:?}",
                subtask_id, record.status
            );
            return Delivery::Ignored;
        }

        if record.worker_id != worker_id || !self.collab.admission.admit(worker_id) {
            warn!(
                "entrega de {} ignorada: {}",
                subtask_id,
                RenderError::AdmissionDenied(worker_id.to_string())
            );
            return Delivery::Ignored;
        }

        let tiles = self.collab.loader.load_result_tiles(payload);
        let rejected = if tiles.is_empty() {
            Some("sin tiles".to_string())
        } else {
            tiles
                .iter()
                .find(|t| !self.collab.loader.verify_tile(&record, t))
                .map(|t| format!("tile {} no verifica", t.0.display()))
        };

        if let Some(reason) = rejected {
            let err = RenderError::VerificationFailure {
                subtask_id: subtask_id.to_string(),
                reason,
            };
            warn!("{}", err);
            if let Err(e) = self.ledger.mark_failure(subtask_id) {
                error!("{}", e);
            }
            self.collab.assembler.update_preview(None);
            return Delivery::Rejected;
        }

        if let Err(e) = self.ledger.mark_finished(subtask_id) {
            error!("{}", e);
        }

        let count = tiles.len() as u32;
        for tile in tiles {
            self.completed_units += 1;
            *self.contributions.entry(worker_id.to_string()).or_insert(0) += 1;
            self.collab.assembler.update_preview(Some(&tile));
            self.collected.insert(tile);
        }
        self.collab.assembler.update_preview(None);

        debug!(
            "job {}: subtarea {} aceptada ({} tiles, {}/{})",
            self.id, subtask_id, count, self.completed_units, self.spec.total_chunks
        );

        let finalized = self.finalize_if_complete();
        Delivery::Accepted {
            tiles: count,
            finalized,
        }
    }

    /// Arma la imagen final la primera vez que se completan todos los chunks.
    fn finalize_if_complete(&mut self) -> bool {
        if self.finalized || self.completed_units < self.spec.total_chunks {
            return false;
        }
        self.finalized = true;
        self.finished_at = Some(Utc::now());

        let tiles: Vec<TileHandle> = self.collected.iter().cloned().collect();
        let output = PathBuf::from(&self.spec.output_file);
        let format = self.spec.output_format;

        info!(
            "job {} completo: uniendo {} tiles en {} ({:?})",
            self.id,
            tiles.len(),
            output.display(),
            format
        );

        if format.is_native() {
            if let Err(e) = self.collab.assembler.assemble_tiles_native(&tiles, &output) {
                error!("falló el ensamblado de {}: {:?}", output.display(), e);
            }
        } else {
            match self.collab.assembler.merge_tiles(&tiles, &output, format) {
                Ok(path) => self.preview_path = Some(path),
                Err(e) => error!("falló la composición de {}: {:?}", output.display(), e),
            }
        }
        true
    }

    /// Marca una subtarea como fallida a pedido externo (timeout, worker caído).
    pub fn report_failure(&mut self, subtask_id: &str) -> bool {
        match self.ledger.mark_failure(subtask_id) {
            Ok(prev) => {
                info!("subtarea {} marcada como fallida (estaba {:?})", subtask_id, prev);
                self.collab.assembler.update_preview(None);
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Vuelve a poner una subtarea en la cola de reintentos.
    ///
    /// Una subtarea terminada primero suma 1 a `completed_units` y después
    /// descuenta su cantidad de chunks, sin bajar de 0.
    pub fn restart_subtask(&mut self, subtask_id: &str) {
        let (status, len) = match self.ledger.get(subtask_id) {
            Ok(r) => (r.status, r.len()),
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        if status == SubtaskStatus::Finished {
            self.completed_units += 1;
        }

        if matches!(status, SubtaskStatus::Starting | SubtaskStatus::Finished) {
            if let Err(e) = self.ledger.mark_failure(subtask_id) {
                error!("{}", e);
            }
            if status == SubtaskStatus::Finished {
                self.completed_units = self.completed_units.saturating_sub(len);
            }
        }

        self.collab.assembler.update_preview(None);
    }

    /// Caja de un tile fino al azar dentro de la entrega, para verificar.
    ///
    /// El chunk sale del nombre del archivo entregado; si no se puede leer se
    /// usa el primer chunk de la subtarea.
    pub fn part_image_box(&self, subtask_id: &str, result_file: Option<&str>) -> Option<PixelBox> {
        let record = match self.ledger.get(subtask_id) {
            Ok(r) => r,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };

        let parsed = result_file.map(|file| {
            chunk_from_file_name(file, &self.spec.outfilebasename).and_then(|n| {
                if (record.start_chunk..record.end_chunk).contains(&n) {
                    Ok(n)
                } else {
                    Err(RenderError::MalformedResultName {
                        name: file.to_string(),
                        reason: format!(
                            "chunk {} fuera de [{}, {})",
                            n, record.start_chunk, record.end_chunk
                        ),
                    })
                }
            })
        });
        let chunk = match parsed {
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                warn!("{}", e);
                record.start_chunk
            }
            None => record.start_chunk,
        };

        let subtasks = self.spec.subtasks_per_chunk.max(1);
        let sb = rand::thread_rng().gen_range(0..subtasks);
        let Some(fine) = chunk.checked_mul(subtasks).and_then(|f| f.checked_add(sb)) else {
            warn!("subtarea {}: índice fino fuera de rango", subtask_id);
            return None;
        };
        Some(self.grid.area_box(fine))
    }

    /// Descriptor para re-renderizar el tile fino que empieza en `start_box`.
    ///
    /// Se trata cada unidad fina como un chunk propio.
    pub fn verification_descriptor(
        &self,
        subtask_id: &str,
        start_box: (u32, u32),
        resource_path: &str,
        tmp_path: &str,
    ) -> Option<VerificationDescriptor> {
        let record = match self.ledger.get(subtask_id) {
            Ok(r) => r,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };

        let mut descriptor = self.descriptor_for(
            record.start_chunk,
            record.end_chunk,
            self.spec.num_cores,
            self.spec.res_x,
            self.spec.res_y,
        );
        let total_tasks = self.spec.total_fine_units();
        descriptor.total_tasks = total_tasks;
        descriptor.num_subtasks = 1;
        descriptor.start_task = pixel_to_chunk(
            f64::from(start_box.0),
            f64::from(start_box.1),
            total_tasks,
            self.spec.res_x,
            self.spec.res_y,
            1,
        ) - 1;
        descriptor.end_task = descriptor.start_task + 1;

        Some(VerificationDescriptor {
            descriptor,
            resource_path: resource_path.to_string(),
            tmp_path: tmp_path.to_string(),
        })
    }

    /// Píxeles cubiertos por una subtarea, para pintarla en la preview.
    pub fn task_area_pixels(&self, subtask_id: &str) -> Vec<(u32, u32)> {
        match self.ledger.get(subtask_id) {
            Ok(r) => chunk_area_pixels(
                r.start_chunk,
                r.end_chunk,
                self.spec.subtasks_per_chunk,
                &self.grid,
            ),
            Err(e) => {
                warn!("{}", e);
                Vec::new()
            }
        }
    }
}

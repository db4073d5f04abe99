//! Colaboradores externos que el núcleo consume pero no implementa:
//! admisión de workers, carga y verificación de tiles, composición de la
//! imagen final y plantillas de escena.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::job::OutputFormat;
use crate::subtask::SubtaskRecord;

/// Identificador opaco de un tile de resultado (normalmente una ruta).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileHandle(pub PathBuf);

impl TileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

pub trait WorkerAdmission: Send + Sync {
    fn admit(&self, worker_id: &str) -> bool;
}

pub trait TileLoader: Send + Sync {
    /// Convierte el payload entregado por el worker en tiles.
    fn load_result_tiles(&self, payload: &[String]) -> Vec<TileHandle>;

    /// Chequeo de plausibilidad de un tile respecto de su subtarea.
    fn verify_tile(&self, record: &SubtaskRecord, tile: &TileHandle) -> bool;
}

pub trait ImageAssembler: Send + Sync {
    /// Compone todos los tiles en una imagen y devuelve la ruta guardada.
    fn merge_tiles(
        &self,
        tiles: &[TileHandle],
        output: &Path,
        format: OutputFormat,
    ) -> anyhow::Result<PathBuf>;

    /// Ensamblado directo en el formato nativo del tiling.
    fn assemble_tiles_native(&self, tiles: &[TileHandle], output: &Path) -> anyhow::Result<()>;

    /// Refresco de la preview; `None` redibuja sólo el estado de las tareas.
    fn update_preview(&self, _tile: Option<&TileHandle>) {}
}

pub trait SceneTemplater: Send + Sync {
    fn template_scene(
        &self,
        src: &str,
        width: u32,
        height: u32,
        pixel_filter: &str,
        sampler: &str,
        samples_per_pixel: u32,
    ) -> String;
}

/// Admite a cualquier worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmitAll;

impl WorkerAdmission for AdmitAll {
    fn admit(&self, _worker_id: &str) -> bool {
        true
    }
}

/// Conjunto de colaboradores con el que se construye un job.
#[derive(Clone)]
pub struct Collaborators {
    pub admission: Arc<dyn WorkerAdmission>,
    pub loader: Arc<dyn TileLoader>,
    pub assembler: Arc<dyn ImageAssembler>,
    pub templater: Arc<dyn SceneTemplater>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::error;

use crate::error::RenderError;
use crate::subtask::SubtaskId;
use crate::worker::WorkerId;

pub type JobId = String;

/// Valores por defecto del renderer.
pub struct RendererDefaults;

impl RendererDefaults {
    pub const OUTPUT_FORMAT: OutputFormat = OutputFormat::Exr;
    pub const MIN_SUBTASKS: u32 = 4;
    pub const MAX_SUBTASKS: u32 = 200;
    pub const DEFAULT_SUBTASKS: u32 = 60;
    /// Unidades finas por chunk
    pub const SUBTASKS_PER_CHUNK: u32 = 20;
    pub const NUM_CORES: u32 = 4;
    pub const OUTFILE_BASENAME: &'static str = "temp";
    /// Operaciones (píxeles * muestras) por subtarea al optimizar el total
    pub const TASK_BASE: u64 = 1_000_000;

    pub const PIXEL_FILTERS: &'static [&'static str] =
        &["box", "gaussian", "mitchell", "sinc", "triangle"];
    pub const SAMPLERS: &'static [&'static str] = &[
        "adaptive",
        "bestcandidate",
        "halton",
        "lowdiscrepancy",
        "random",
        "stratified",
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputFormat {
    Bmp,
    Eps,
    Exr,
    Gif,
    Im,
    Jpeg,
    Pcx,
    Pdf,
    Png,
    Ppm,
    Tiff,
}

impl OutputFormat {
    /// EXR es el formato en el que el renderer entrega los tiles.
    pub fn is_native(self) -> bool {
        matches!(self, OutputFormat::Exr)
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Bmp => "bmp",
            OutputFormat::Eps => "eps",
            OutputFormat::Exr => "exr",
            OutputFormat::Gif => "gif",
            OutputFormat::Im => "im",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Pcx => "pcx",
            OutputFormat::Pdf => "pdf",
            OutputFormat::Png => "png",
            OutputFormat::Ppm => "ppm",
            OutputFormat::Tiff => "tiff",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererOptions {
    pub pixel_filter: String,
    pub sampler: String,
    pub samples_per_pixel: u32,
    /// Ruta del binario del renderer
    pub pbrt_path: String,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            pixel_filter: "mitchell".to_string(),
            sampler: "lowdiscrepancy".to_string(),
            samples_per_pixel: 32,
            pbrt_path: String::new(),
        }
    }
}

/// Pedido de render tal como llega del cliente.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJobDefinition {
    pub name: String,
    pub resolution: (u32, u32),
    pub main_scene_file: String,
    pub output_file: String,
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
    /// Raíz de los recursos del job; vacía = directorio de la escena
    #[serde(default)]
    pub resource_root: String,
    #[serde(default = "default_total_subtasks")]
    pub total_subtasks: u32,
    /// Si es true se ignora `total_subtasks` y se calcula según el trabajo
    #[serde(default)]
    pub optimize_total: bool,
    #[serde(default)]
    pub renderer: RendererOptions,
}

fn default_output_format() -> OutputFormat {
    RendererDefaults::OUTPUT_FORMAT
}

fn default_total_subtasks() -> u32 {
    RendererDefaults::DEFAULT_SUBTASKS
}

impl RenderJobDefinition {
    pub fn validate(&self) -> anyhow::Result<()> {
        let (x, y) = self.resolution;
        if x == 0 || y == 0 {
            anyhow::bail!("resolución inválida {}x{}", x, y);
        }
        if !RendererDefaults::PIXEL_FILTERS.contains(&self.renderer.pixel_filter.as_str()) {
            anyhow::bail!("filtro de píxel desconocido: {}", self.renderer.pixel_filter);
        }
        if !RendererDefaults::SAMPLERS.contains(&self.renderer.sampler.as_str()) {
            anyhow::bail!("sampler desconocido: {}", self.renderer.sampler);
        }
        if self.renderer.samples_per_pixel == 0 {
            anyhow::bail!("samples_per_pixel debe ser mayor que 0");
        }
        Ok(())
    }

    /// Cantidad de chunks del job.
    ///
    /// Se respeta el pedido si está dentro de los límites y no se pidió
    /// optimizar; si no, se estima por píxeles * muestras y se acota.
    pub fn calculate_total(&self) -> u32 {
        let min = RendererDefaults::MIN_SUBTASKS;
        let max = RendererDefaults::MAX_SUBTASKS;

        if !self.optimize_total && (min..=max).contains(&self.total_subtasks) {
            return self.total_subtasks;
        }

        let all_ops = u64::from(self.resolution.0)
            * u64::from(self.resolution.1)
            * u64::from(self.renderer.samples_per_pixel);
        let estimate = (all_ops / RendererDefaults::TASK_BASE).min(u64::from(max)) as u32;
        estimate.max(min)
    }
}

/// Parámetros inmutables de un job de render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJobSpec {
    pub name: String,
    pub res_x: u32,
    pub res_y: u32,
    pub total_chunks: u32,
    pub subtasks_per_chunk: u32,
    pub num_cores: u32,
    pub renderer: RendererOptions,
    /// Directorio de la escena principal, raíz de trabajo del worker
    pub path_root: String,
    pub scene_file: String,
    /// Directorio de la escena relativo a los recursos
    pub scene_dir: String,
    /// Renderer relativo al directorio de la escena
    pub pbrt_path: String,
    pub outfilebasename: String,
    pub output_file: String,
    pub output_format: OutputFormat,
}

impl RenderJobSpec {
    pub fn from_definition(def: &RenderJobDefinition) -> Self {
        let scene = Path::new(&def.main_scene_file);
        let scene_root = scene.parent().unwrap_or_else(|| Path::new(""));

        let resource_root = if def.resource_root.is_empty() {
            scene_root
        } else {
            Path::new(&def.resource_root)
        };
        let scene_dir = relative_path(scene_root, resource_root);

        // el renderer se ubica relativo al directorio de la escena
        let pbrt = Path::new(&def.renderer.pbrt_path);
        let pbrt_rel = match (pbrt.parent(), pbrt.file_name()) {
            (Some(dir), Some(file)) => relative_path(dir, scene_root).join(file),
            _ => pbrt.to_path_buf(),
        };

        Self {
            name: def.name.clone(),
            res_x: def.resolution.0,
            res_y: def.resolution.1,
            total_chunks: def.calculate_total(),
            subtasks_per_chunk: RendererDefaults::SUBTASKS_PER_CHUNK,
            num_cores: RendererDefaults::NUM_CORES,
            renderer: def.renderer.clone(),
            path_root: scene_root.to_string_lossy().to_string(),
            scene_file: def.main_scene_file.clone(),
            scene_dir: scene_dir.to_string_lossy().to_string(),
            pbrt_path: pbrt_rel.to_string_lossy().to_string(),
            outfilebasename: RendererDefaults::OUTFILE_BASENAME.to_string(),
            output_file: def.output_file.clone(),
            output_format: def.output_format,
        }
    }

    pub fn total_fine_units(&self) -> u32 {
        self.total_chunks * self.subtasks_per_chunk
    }
}

/// Ruta de `target` vista desde `base`, sólo por componentes (sin tocar
/// el disco). Ambas tienen que ser absolutas o ambas relativas; si no,
/// devuelve `target` tal cual. Igual ruta da ".".
pub fn relative_path(target: &Path, base: &Path) -> PathBuf {
    if target.is_absolute() != base.is_absolute() {
        return target.to_path_buf();
    }

    let target: Vec<Component> = target
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    let base: Vec<Component> = base
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for c in &target[common..] {
        out.push(c.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Lee el archivo de escena. Si falla se loguea y se sigue con escena vacía.
pub fn load_scene_source(path: &str) -> String {
    match fs::read_to_string(path) {
        Ok(src) => src,
        Err(source) => {
            let err = RenderError::SceneLoad {
                path: path.to_string(),
                source,
            };
            error!("{}", err);
            String::new()
        }
    }
}

/// Lo que necesita un worker para renderizar un rango de chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeDescriptor {
    pub path_root: String,
    pub start_task: u32,
    pub end_task: u32,
    pub total_tasks: u32,
    pub num_subtasks: u32,
    #[serde(rename = "num_cores")]
    pub num_cores: u32,
    #[serde(rename = "outfilebasename")]
    pub outfilebasename: String,
    pub scene_file_src: String,
    pub scene_dir: String,
    pub pbrt_path: String,
}

impl ComputeDescriptor {
    /// Versión corta para logs (sin rutas del renderer).
    pub fn short_repr(&self) -> String {
        format!(
            "pathRoot: {}, startTask: {}, endTask: {}, totalTasks: {}, numSubtasks: {}, num_cores: {}, outfilebasename: {}, sceneFileSrc: {} bytes",
            self.path_root,
            self.start_task,
            self.end_task,
            self.total_tasks,
            self.num_subtasks,
            self.num_cores,
            self.outfilebasename,
            self.scene_file_src.len()
        )
    }
}

/// Descriptor para re-renderizar un único tile fino al verificar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationDescriptor {
    #[serde(flatten)]
    pub descriptor: ComputeDescriptor,
    pub resource_path: String,
    pub tmp_path: String,
}

/// Subtarea lista para enviar a un worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeTaskDef {
    pub subtask_id: SubtaskId,
    pub job_id: JobId,
    pub perf_index: f64,
    pub descriptor: ComputeDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Accepted,
    Computing,
    Finished,
}

/// Foto del estado de un job para clientes y logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub res_x: u32,
    pub res_y: u32,
    pub total_chunks: u32,
    pub cursor: u32,
    pub completed_units: u32,
    pub failed_count: u32,
    pub subtasks_issued: usize,
    pub collected_tiles: usize,
    pub preview_path: Option<String>,
    pub contributions: HashMap<WorkerId, u32>,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        (f64::from(self.completed_units) / f64::from(self.total_chunks)).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> RenderJobDefinition {
        RenderJobDefinition {
            name: "escena".to_string(),
            resolution: (800, 600),
            main_scene_file: "/scenes/cornell/scene.pbrt".to_string(),
            output_file: "/data/output/cornell".to_string(),
            output_format: OutputFormat::Png,
            resource_root: String::new(),
            total_subtasks: 60,
            optimize_total: false,
            renderer: RendererOptions {
                pbrt_path: "/scenes/cornell/bin/pbrt".to_string(),
                ..RendererOptions::default()
            },
        }
    }

    #[test]
    fn calculate_total_respeta_pedido_dentro_de_limites() {
        let def = definition();
        assert_eq!(def.calculate_total(), 60);
    }

    #[test]
    fn calculate_total_estima_por_trabajo() {
        let mut def = definition();
        def.optimize_total = true;
        // 800 * 600 * 32 / 1e6 = 15
        assert_eq!(def.calculate_total(), 15);

        def.renderer.samples_per_pixel = 1;
        // 0.48 -> acotado al mínimo
        assert_eq!(def.calculate_total(), RendererDefaults::MIN_SUBTASKS);

        def.resolution = (4000, 4000);
        def.renderer.samples_per_pixel = 64;
        assert_eq!(def.calculate_total(), RendererDefaults::MAX_SUBTASKS);
    }

    #[test]
    fn calculate_total_fuera_de_limites_se_estima() {
        let mut def = definition();
        def.total_subtasks = 1000;
        assert_eq!(def.calculate_total(), 15);
    }

    #[test]
    fn validate_rechaza_opciones_desconocidas() {
        let mut def = definition();
        assert!(def.validate().is_ok());

        def.renderer.sampler = "magic".to_string();
        assert!(def.validate().is_err());

        let mut def = definition();
        def.resolution = (0, 10);
        assert!(def.validate().is_err());
    }

    #[test]
    fn spec_desde_definicion() {
        let spec = RenderJobSpec::from_definition(&definition());
        assert_eq!(spec.total_chunks, 60);
        assert_eq!(spec.subtasks_per_chunk, RendererDefaults::SUBTASKS_PER_CHUNK);
        assert_eq!(spec.num_cores, RendererDefaults::NUM_CORES);
        assert_eq!(spec.path_root, "/scenes/cornell");
        assert_eq!(spec.pbrt_path, "bin/pbrt");
        assert_eq!(spec.scene_dir, ".");
        assert_eq!(spec.outfilebasename, "temp");
        assert_eq!(spec.total_fine_units(), 1200);
    }

    #[test]
    fn spec_rutas_relativas_a_recursos_y_escena() {
        let mut def = definition();
        def.resource_root = "/scenes".to_string();
        def.renderer.pbrt_path = "/scenes/bin/pbrt".to_string();

        let spec = RenderJobSpec::from_definition(&def);
        assert_eq!(spec.scene_dir, "cornell");
        assert_eq!(spec.pbrt_path, "../bin/pbrt");
    }

    #[test]
    fn relative_path_sube_y_baja() {
        let rel = |t: &str, b: &str| relative_path(Path::new(t), Path::new(b));
        assert_eq!(rel("/a/b/c", "/a"), PathBuf::from("b/c"));
        assert_eq!(rel("/a/x", "/a/b/c"), PathBuf::from("../../x"));
        assert_eq!(rel("/a/b", "/a/b"), PathBuf::from("."));
        assert_eq!(rel("rel/dir", "/abs"), PathBuf::from("rel/dir"));
    }

    #[test]
    fn definicion_sin_formato_usa_exr() {
        let json = r#"{
            "name": "n",
            "resolution": [10, 10],
            "main_scene_file": "/s/scene.pbrt",
            "output_file": "/o/out"
        }"#;
        let def: RenderJobDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.output_format, RendererDefaults::OUTPUT_FORMAT);
        assert_eq!(def.total_subtasks, RendererDefaults::DEFAULT_SUBTASKS);
        assert!(def.resource_root.is_empty());
    }

    #[test]
    fn descriptor_usa_nombres_del_protocolo() {
        let d = ComputeDescriptor {
            path_root: "/scenes".to_string(),
            start_task: 0,
            end_task: 2,
            total_tasks: 20,
            num_subtasks: 20,
            num_cores: 4,
            outfilebasename: "temp".to_string(),
            scene_file_src: "Film".to_string(),
            scene_dir: "".to_string(),
            pbrt_path: "pbrt".to_string(),
        };
        let v = serde_json::to_value(&d).unwrap();
        for key in [
            "pathRoot",
            "startTask",
            "endTask",
            "totalTasks",
            "numSubtasks",
            "num_cores",
            "outfilebasename",
            "sceneFileSrc",
            "sceneDir",
            "pbrtPath",
        ] {
            assert!(v.get(key).is_some(), "falta {key}");
        }
        assert_eq!(v.as_object().unwrap().len(), 10);
    }

    #[test]
    fn load_scene_source_inexistente_devuelve_vacio() {
        let path = std::env::temp_dir().join("render_job_tests_no_existe.pbrt");
        let _ = fs::remove_file(&path);
        assert_eq!(load_scene_source(&path.to_string_lossy()), "");
    }
}

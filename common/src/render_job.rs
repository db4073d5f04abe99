use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tracing::info;

use crate::collab::{Collaborators, TileHandle};
use crate::grid::{compute_grid, GridPartition};
use crate::job::{load_scene_source, JobId, JobSnapshot, JobStatus, RenderJobSpec};
use crate::subtask::SubtaskLedger;
use crate::worker::WorkerId;

/// Estado completo de un job de render.
///
/// No es thread-safe a propósito: el host tiene que serializar todas las
/// llamadas sobre un mismo job (por ejemplo un `Mutex` por job).
pub struct RenderJob {
    pub(crate) id: JobId,
    pub(crate) spec: RenderJobSpec,
    pub(crate) scene_src: String,
    /// Grilla fina (total_chunks * subtasks_per_chunk)
    pub(crate) grid: GridPartition,
    pub(crate) ledger: SubtaskLedger,
    /// Próximo chunk sin asignar
    pub(crate) cursor: u32,
    pub(crate) completed_units: u32,
    pub(crate) collected: BTreeSet<TileHandle>,
    pub(crate) contributions: HashMap<WorkerId, u32>,
    pub(crate) finalized: bool,
    pub(crate) preview_path: Option<PathBuf>,
    pub(crate) collab: Collaborators,

    pub(crate) submitted_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
}

impl RenderJob {
    /// Crea el job leyendo la escena de `spec.scene_file`.
    pub fn new(id: JobId, spec: RenderJobSpec, collab: Collaborators) -> Self {
        let scene_src = load_scene_source(&spec.scene_file);
        Self::with_scene_source(id, spec, scene_src, collab)
    }

    pub fn with_scene_source(
        id: JobId,
        spec: RenderJobSpec,
        scene_src: String,
        collab: Collaborators,
    ) -> Self {
        let grid = compute_grid(spec.total_fine_units(), spec.res_x, spec.res_y);
        Self {
            id,
            spec,
            scene_src,
            grid,
            ledger: SubtaskLedger::new(),
            cursor: 0,
            completed_units: 0,
            collected: BTreeSet::new(),
            contributions: HashMap::new(),
            finalized: false,
            preview_path: None,
            collab,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &RenderJobSpec {
        &self.spec
    }

    pub fn grid(&self) -> &GridPartition {
        &self.grid
    }

    pub fn ledger(&self) -> &SubtaskLedger {
        &self.ledger
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn completed_units(&self) -> u32 {
        self.completed_units
    }

    pub fn failed_count(&self) -> u32 {
        self.ledger.failed_count()
    }

    pub fn collected_tiles(&self) -> &BTreeSet<TileHandle> {
        &self.collected
    }

    pub fn contributions(&self) -> &HashMap<WorkerId, u32> {
        &self.contributions
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn preview_path(&self) -> Option<&PathBuf> {
        self.preview_path.as_ref()
    }

    pub fn status(&self) -> JobStatus {
        if self.finalized {
            JobStatus::Finished
        } else if self.ledger.is_empty() {
            JobStatus::Accepted
        } else {
            JobStatus::Computing
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            status: self.status(),
            res_x: self.spec.res_x,
            res_y: self.spec.res_y,
            total_chunks: self.spec.total_chunks,
            cursor: self.cursor,
            completed_units: self.completed_units,
            failed_count: self.ledger.failed_count(),
            subtasks_issued: self.ledger.len(),
            collected_tiles: self.collected.len(),
            preview_path: self
                .preview_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            contributions: self.contributions.clone(),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    /// Reinicio completo: se olvidan subtareas, contadores y tiles.
    pub fn restart_job(&mut self) {
        info!(
            "reiniciando job {} ({} subtareas, {} tiles descartados)",
            self.id,
            self.ledger.len(),
            self.collected.len()
        );
        self.collected.clear();
        self.ledger.clear();
        self.cursor = 0;
        self.completed_units = 0;
        self.contributions.clear();
        self.finalized = false;
        self.preview_path = None;
        self.started_at = None;
        self.finished_at = None;
        self.collab.assembler.update_preview(None);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Colaboradores falsos compartidos por los tests del núcleo.

    use super::*;
    use crate::collab::{ImageAssembler, SceneTemplater, TileLoader, WorkerAdmission};
    use crate::job::{OutputFormat, RendererOptions};
    use crate::subtask::SubtaskRecord;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct FakeAdmission {
        pub banned: Mutex<HashSet<String>>,
    }

    impl FakeAdmission {
        pub fn ban(&self, worker_id: &str) {
            self.banned.lock().unwrap().insert(worker_id.to_string());
        }
    }

    impl WorkerAdmission for FakeAdmission {
        fn admit(&self, worker_id: &str) -> bool {
            !self.banned.lock().unwrap().contains(worker_id)
        }
    }

    /// Cada string del payload es un tile; los que empiezan con "bad" fallan.
    #[derive(Default)]
    pub struct FakeLoader;

    impl TileLoader for FakeLoader {
        fn load_result_tiles(&self, payload: &[String]) -> Vec<TileHandle> {
            payload.iter().map(TileHandle::new).collect()
        }

        fn verify_tile(&self, _record: &SubtaskRecord, tile: &TileHandle) -> bool {
            !tile.file_name().starts_with("bad")
        }
    }

    #[derive(Default)]
    pub struct FakeAssembler {
        pub merges: Mutex<Vec<Vec<TileHandle>>>,
        pub native: Mutex<Vec<Vec<TileHandle>>>,
        pub previews: Mutex<u32>,
    }

    impl ImageAssembler for FakeAssembler {
        fn merge_tiles(
            &self,
            tiles: &[TileHandle],
            output: &Path,
            format: OutputFormat,
        ) -> anyhow::Result<PathBuf> {
            self.merges.lock().unwrap().push(tiles.to_vec());
            Ok(output.with_extension(format.extension()))
        }

        fn assemble_tiles_native(&self, tiles: &[TileHandle], _output: &Path) -> anyhow::Result<()> {
            self.native.lock().unwrap().push(tiles.to_vec());
            Ok(())
        }

        fn update_preview(&self, _tile: Option<&TileHandle>) {
            *self.previews.lock().unwrap() += 1;
        }
    }

    pub struct FakeTemplater;

    impl SceneTemplater for FakeTemplater {
        fn template_scene(
            &self,
            src: &str,
            width: u32,
            height: u32,
            pixel_filter: &str,
            sampler: &str,
            samples_per_pixel: u32,
        ) -> String {
            format!("{src}|{width}x{height}|{pixel_filter}|{sampler}|{samples_per_pixel}")
        }
    }

    pub struct Fakes {
        pub admission: Arc<FakeAdmission>,
        pub assembler: Arc<FakeAssembler>,
    }

    pub fn spec(total_chunks: u32, subtasks_per_chunk: u32, format: OutputFormat) -> RenderJobSpec {
        RenderJobSpec {
            name: "test".to_string(),
            res_x: 300,
            res_y: 200,
            total_chunks,
            subtasks_per_chunk,
            num_cores: 4,
            renderer: RendererOptions::default(),
            path_root: "/scenes".to_string(),
            scene_file: "/scenes/scene.pbrt".to_string(),
            scene_dir: "".to_string(),
            pbrt_path: "pbrt".to_string(),
            outfilebasename: "temp".to_string(),
            output_file: "/out/final".to_string(),
            output_format: format,
        }
    }

    pub fn job_with(spec: RenderJobSpec) -> (RenderJob, Fakes) {
        let admission = Arc::new(FakeAdmission::default());
        let assembler = Arc::new(FakeAssembler::default());
        let collab = Collaborators {
            admission: admission.clone(),
            loader: Arc::new(FakeLoader),
            assembler: assembler.clone(),
            templater: Arc::new(FakeTemplater),
        };
        let job = RenderJob::with_scene_source("job-1".to_string(), spec, "Scene".to_string(), collab);
        (job, Fakes { admission, assembler })
    }

    pub fn job(total_chunks: u32) -> (RenderJob, Fakes) {
        job_with(spec(total_chunks, 1, OutputFormat::Png))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn job_nuevo_arranca_vacio() {
        let (job, _) = job(20);
        assert_eq!(job.cursor(), 0);
        assert_eq!(job.completed_units(), 0);
        assert_eq!(job.status(), JobStatus::Accepted);
        assert_eq!(job.grid().nx * job.grid().ny, 20);
    }

    #[test]
    fn restart_job_limpia_todo() {
        let (mut job, _) = job(4);
        let a = job.next_chunk(3000.0, "w1").unwrap();
        job.accept(&a.subtask_id, &["temp0.png".to_string()], "w1");
        assert_eq!(job.completed_units(), 1);

        job.restart_job();

        assert_eq!(job.cursor(), 0);
        assert_eq!(job.completed_units(), 0);
        assert_eq!(job.failed_count(), 0);
        assert!(job.collected_tiles().is_empty());
        assert!(job.ledger().is_empty());
        assert!(job.contributions().is_empty());
        assert_eq!(job.status(), JobStatus::Accepted);
    }

    #[test]
    fn snapshot_refleja_progreso() {
        let (mut job, _) = job(4);
        let a = job.next_chunk(1500.0, "w1").unwrap();
        job.accept(&a.subtask_id, &["temp0.png".to_string()], "w1");

        let snap = job.snapshot();
        assert_eq!(snap.status, JobStatus::Computing);
        assert_eq!(snap.cursor, 1);
        assert_eq!(snap.completed_units, 1);
        assert_eq!(snap.subtasks_issued, 1);
        assert_eq!(snap.contributions.get("w1"), Some(&1));
        assert!((snap.progress() - 0.25).abs() < 1e-9);
    }
}

// master/src/state.rs

use common::{AdmitAll, Collaborators, JobId, RenderJob, WorkerAdmission, WorkerId};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use crate::collab::{BanList, FsTileLoader, ManifestAssembler, PbrtTemplater};
use crate::config::Settings;

/// Un `Mutex` por job: todas las llamadas al núcleo de un mismo job quedan
/// serializadas.
pub type SharedJob = Arc<Mutex<RenderJob>>;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<Mutex<HashMap<JobId, SharedJob>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            settings: Arc::new(settings),
        }
    }

    /// Colaboradores de archivo para un job nuevo.
    pub fn collaborators(&self, outfilebasename: &str) -> Collaborators {
        let admission: Arc<dyn WorkerAdmission> = if self.settings.banned_workers.is_empty() {
            Arc::new(AdmitAll)
        } else {
            Arc::new(BanList::new(self.settings.banned_workers.clone()))
        };
        Collaborators {
            admission,
            loader: Arc::new(FsTileLoader::new(outfilebasename)),
            assembler: Arc::new(ManifestAssembler),
            templater: Arc::new(PbrtTemplater),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub perf_index: f64,
    pub num_cores: u32,

    // Métricas
    pub subtasks_started: u64,
    pub subtasks_accepted: u64,
    pub subtasks_rejected: u64,
}

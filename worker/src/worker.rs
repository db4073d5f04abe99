use anyhow::{bail, Context, Result};
use common::{
    chunk_from_file_name, ComputeTaskDef, SubtaskCompleteRequest, SubtaskCompleteResponse,
    SubtaskRef, SubtaskRequest, SubtaskResponse, WorkerHeartbeatRequest, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::Client;
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::{fs, process::Command, sync::Semaphore, time::sleep};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_WORKER_CONCURRENCY: u32 = 1;
const DEFAULT_RENDER_CMD: &str = "pbrt-task";
const DEFAULT_TMP_DIR: &str = "/data/tmp";
/// MHz por core que equivalen a un chunk por pedido
const MHZ_PER_PERF_UNIT: f64 = 2.0;

/// Configuración del worker, leída de variables de entorno.
#[derive(Debug, Clone)]
struct WorkerConfig {
    base_url: String,
    job_id: String,
    render_cmd: String,
    tmp_dir: PathBuf,
    perf_index: Option<f64>,
    concurrency: u32,
}

impl WorkerConfig {
    fn from_env() -> Result<Self> {
        let job_id = env::var("WORKER_JOB_ID").context("falta WORKER_JOB_ID")?;
        Ok(Self {
            base_url: env::var("MASTER_URL").unwrap_or_else(|_| "http://master:8080".to_string()),
            job_id,
            render_cmd: env::var("RENDER_CMD").unwrap_or_else(|_| DEFAULT_RENDER_CMD.to_string()),
            tmp_dir: env::var("WORKER_TMP_DIR")
                .unwrap_or_else(|_| DEFAULT_TMP_DIR.to_string())
                .into(),
            perf_index: env::var("WORKER_PERF_INDEX")
                .ok()
                .and_then(|s| s.parse::<f64>().ok()),
            concurrency: env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
                .max(1),
        })
    }
}

/// Índice de rendimiento a partir de los cores y su frecuencia.
fn perf_from(cores: usize, mhz: u64) -> f64 {
    cores as f64 * mhz as f64 / MHZ_PER_PERF_UNIT
}

fn estimate_perf(sys: &mut System) -> (f64, u32) {
    sys.refresh_cpu();
    let cores = sys
        .physical_core_count()
        .unwrap_or_else(|| sys.cpus().len())
        .max(1);
    let mhz = sys.cpus().iter().map(|c| c.frequency()).max().unwrap_or(0);
    (perf_from(cores, mhz), cores as u32)
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide subtareas del job mientras tenga "slots" libres.
/// - Renderiza cada subtarea con RENDER_CMD y entrega los tiles.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    let cfg = Arc::new(WorkerConfig::from_env()?);
    let client = Client::new();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let mut sys = System::new_all();
    let (estimated, num_cores) = estimate_perf(&mut sys);
    let perf_index = cfg.perf_index.unwrap_or(estimated);

    let register_url = format!("{}/api/v1/workers/register", cfg.base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname,
            perf_index,
            num_cores,
        })
        .send()
        .await?
        .error_for_status()?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;

    info!(
        "worker {} registrado (perf_index={:.0}, cores={}, concurrency={}) contra {}",
        worker_id, perf_index, num_cores, cfg.concurrency, cfg.base_url
    );

    let sem = Arc::new(Semaphore::new(cfg.concurrency as usize));

    loop {
        let hb_url = format!("{}/api/v1/workers/heartbeat", cfg.base_url);
        if let Err(e) = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await
        {
            warn!("heartbeat fallido: {:?}", e);
        }

        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let next_url = format!("{}/api/v1/subtasks/next", cfg.base_url);
        let res = client
            .post(&next_url)
            .json(&SubtaskRequest {
                job_id: cfg.job_id.clone(),
                worker_id: worker_id.clone(),
                perf_index,
                num_cores,
            })
            .send()
            .await?
            .error_for_status()?;
        let SubtaskResponse { task } = res.json().await?;

        let Some(task) = task else {
            drop(permit);
            info!("worker {} pidió subtarea pero no hay", worker_id);
            sleep(Duration::from_secs(2)).await;
            continue;
        };

        info!(
            "tengo subtarea {} del job {}: {}",
            task.subtask_id,
            task.job_id,
            task.descriptor.short_repr()
        );

        let client = client.clone();
        let cfg = cfg.clone();
        let worker_id = worker_id.clone();

        tokio::spawn(async move {
            let outcome = render_subtask(&cfg, &task).await;
            if let Err(e) = report(&client, &cfg, &worker_id, &task, outcome).await {
                warn!("no se pudo reportar la subtarea {}: {:?}", task.subtask_id, e);
            }
            drop(permit);
        });
    }
}

/// Escribe el descriptor, corre el renderer y junta los tiles producidos.
async fn render_subtask(cfg: &WorkerConfig, task: &ComputeTaskDef) -> Result<Vec<String>> {
    let work_dir = cfg.tmp_dir.join(&task.subtask_id);
    fs::create_dir_all(&work_dir)
        .await
        .with_context(|| format!("creando {}", work_dir.display()))?;

    let descriptor_path = work_dir.join("descriptor.json");
    let body = serde_json::to_vec_pretty(&task.descriptor)?;
    fs::write(&descriptor_path, body).await?;

    let mut parts = cfg.render_cmd.split_whitespace();
    let Some(program) = parts.next() else {
        bail!("RENDER_CMD vacío");
    };

    debug!("ejecutando {} sobre {}", cfg.render_cmd, descriptor_path.display());
    let status = Command::new(program)
        .args(parts)
        .arg(&descriptor_path)
        .arg(&work_dir)
        .status()
        .await
        .with_context(|| format!("lanzando {}", program))?;

    if !status.success() {
        bail!("el renderer terminó con {}", status);
    }

    let d = &task.descriptor;
    let tiles = collect_tiles(&work_dir, &d.outfilebasename, d.start_task, d.end_task).await?;
    if tiles.is_empty() {
        bail!("el renderer no produjo tiles en {}", work_dir.display());
    }
    Ok(tiles)
}

/// Archivos `<basename><N>.*` del directorio con N en [start, end), ordenados.
async fn collect_tiles(dir: &Path, basename: &str, start: u32, end: u32) -> Result<Vec<String>> {
    let mut found = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        match chunk_from_file_name(&name, basename) {
            Ok(n) if (start..end).contains(&n) => {
                found.push((n, entry.path().to_string_lossy().to_string()));
            }
            _ => {}
        }
    }

    found.sort();
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

async fn report(
    client: &Client,
    cfg: &WorkerConfig,
    worker_id: &str,
    task: &ComputeTaskDef,
    outcome: Result<Vec<String>>,
) -> Result<()> {
    match outcome {
        Ok(files) => {
            let url = format!("{}/api/v1/subtasks/complete", cfg.base_url);
            let resp: SubtaskCompleteResponse = client
                .post(&url)
                .json(&SubtaskCompleteRequest {
                    job_id: task.job_id.clone(),
                    subtask_id: task.subtask_id.clone(),
                    worker_id: worker_id.to_string(),
                    files,
                })
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if resp.accepted {
                info!("subtarea {} aceptada", task.subtask_id);
            } else {
                warn!("subtarea {} rechazada por el master", task.subtask_id);
            }
            if resp.finalized {
                info!("job {} terminado", task.job_id);
            }
        }
        Err(e) => {
            warn!("error renderizando subtarea {}: {:?}", task.subtask_id, e);
            let url = format!("{}/api/v1/subtasks/fail", cfg.base_url);
            client
                .post(&url)
                .json(&SubtaskRef {
                    job_id: task.job_id.clone(),
                    subtask_id: task.subtask_id.clone(),
                })
                .send()
                .await?
                .error_for_status()?;
        }
    }
    Ok(())
}

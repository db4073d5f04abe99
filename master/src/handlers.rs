use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{
    pixel_to_chunk, tile_boundary, ComputeTaskDef, Delivery, JobSnapshot, RenderJob,
    RenderJobDefinition, RenderJobSpec, SubtaskCompleteRequest, SubtaskCompleteResponse,
    SubtaskCostResponse, SubtaskRef, SubtaskRequest, SubtaskResponse,
    SubtaskVerificationRequest, SubtaskVerificationResponse, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerId, WorkerMetrics, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::{AppState, SharedJob, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/restart", post(restart_job))
        .route("/api/v1/jobs/:id/boundary", get(job_boundary))
        .route("/api/v1/jobs/:id/pixel", get(job_pixel))
        .route("/api/v1/jobs/:id/test-task", get(job_test_task))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/subtasks/next", post(next_subtask))
        .route("/api/v1/subtasks/complete", post(complete_subtask))
        .route("/api/v1/subtasks/fail", post(fail_subtask))
        .route("/api/v1/subtasks/restart", post(restart_subtask))
        .route("/api/v1/subtasks/cost", get(subtask_cost))
        .route("/api/v1/subtasks/area", get(subtask_area))
        .route("/api/v1/subtasks/verification", post(subtask_verification))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/* ---------------- helpers ---------------- */

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StatusCode> {
    m.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn find_job(state: &AppState, id: &str) -> Result<SharedJob, StatusCode> {
    let jobs = lock(&state.jobs)?;
    jobs.get(id).cloned().ok_or(StatusCode::NOT_FOUND)
}

/// Las rutas relativas se resuelven contra DATA_DIR.
fn rebase(state: &AppState, path: &str) -> String {
    let p = std::path::Path::new(path);
    if p.is_absolute() || path.is_empty() {
        path.to_string()
    } else {
        state.settings.data_dir.join(p).to_string_lossy().to_string()
    }
}

/* ---------------- jobs ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Crea un job a partir de la definición; la escena se lee acá
async fn create_job(
    State(state): State<AppState>,
    Json(mut def): Json<RenderJobDefinition>,
) -> Result<Json<JobSnapshot>, (StatusCode, String)> {
    def.main_scene_file = rebase(&state, &def.main_scene_file);
    def.output_file = rebase(&state, &def.output_file);
    if def.resource_root.is_empty() {
        def.resource_root = state.settings.data_dir.to_string_lossy().to_string();
    }
    def.validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let job_id = uuid::Uuid::new_v4().to_string();
    let spec = RenderJobSpec::from_definition(&def);
    let collab = state.collaborators(&spec.outfilebasename);

    info!(
        "job {} creado: {}x{} en {} chunks de {} subtareas",
        job_id, spec.res_x, spec.res_y, spec.total_chunks, spec.subtasks_per_chunk
    );

    let job = RenderJob::new(job_id.clone(), spec, collab);
    let snapshot = job.snapshot();

    let mut jobs = state
        .jobs
        .lock()
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "lock jobs".to_string()))?;
    jobs.insert(job_id, Arc::new(Mutex::new(job)));

    Ok(Json(snapshot))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, StatusCode> {
    let job = find_job(&state, &id)?;
    let job = lock(&job)?;
    Ok(Json(job.snapshot()))
}

async fn restart_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, StatusCode> {
    let job = find_job(&state, &id)?;
    let mut job = lock(&job)?;
    job.restart_job();
    Ok(Json(job.snapshot()))
}

#[derive(Debug, Deserialize)]
struct BoundaryQuery {
    start: u32,
    end: u32,
}

// Contorno de un rango de chunks para resaltarlo en la preview
async fn job_boundary(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<BoundaryQuery>,
) -> Result<Json<Vec<(u32, u32)>>, StatusCode> {
    let job = find_job(&state, &id)?;
    let job = lock(&job)?;
    let spec = job.spec();

    if q.start > q.end || q.end > spec.total_chunks {
        return Err(StatusCode::BAD_REQUEST);
    }

    Ok(Json(tile_boundary(
        q.start,
        q.end,
        spec.total_chunks,
        spec.res_x,
        spec.res_y,
        spec.subtasks_per_chunk,
    )))
}

#[derive(Debug, Deserialize)]
struct PixelQuery {
    x: f64,
    y: f64,
}

#[derive(Debug, Serialize)]
struct PixelResponse {
    chunk: u32,
}

async fn job_pixel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<PixelQuery>,
) -> Result<Json<PixelResponse>, StatusCode> {
    let job = find_job(&state, &id)?;
    let job = lock(&job)?;
    let spec = job.spec();

    if q.x < 0.0 || q.y < 0.0 || q.x >= f64::from(spec.res_x) || q.y >= f64::from(spec.res_y) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let chunk = pixel_to_chunk(
        q.x,
        q.y,
        spec.total_fine_units(),
        spec.res_x,
        spec.res_y,
        spec.subtasks_per_chunk,
    );
    Ok(Json(PixelResponse { chunk }))
}

async fn job_test_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ComputeTaskDef>, StatusCode> {
    let job = find_job(&state, &id)?;
    let job = lock(&job)?;
    Ok(Json(job.test_task()))
}

/* ---------------- workers ---------------- */

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Result<Json<WorkerRegisterResponse>, StatusCode> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    {
        let mut workers = lock(&state.workers)?;
        workers.insert(
            worker_id.clone(),
            WorkerMeta {
                hostname: req.hostname,
                last_heartbeat: SystemTime::now(),
                dead: false,
                perf_index: req.perf_index,
                num_cores: req.num_cores,

                subtasks_started: 0,
                subtasks_accepted: 0,
                subtasks_rejected: 0,
            },
        );
    }

    info!(
        "worker registrado: {} (perf_index={}, num_cores={})",
        worker_id, req.perf_index, req.num_cores
    );
    Ok(Json(WorkerRegisterResponse { worker_id }))
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = lock(&state.workers)?;
    let meta = workers.get_mut(&req.worker_id).ok_or(StatusCode::NOT_FOUND)?;
    meta.last_heartbeat = SystemTime::now();
    if meta.dead {
        info!("worker {} volvió a dar señales", req.worker_id);
        meta.dead = false;
    }
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkerMetrics>>, StatusCode> {
    let now = SystemTime::now();
    let workers = lock(&state.workers)?;

    let out = workers
        .iter()
        .map(|(wid, meta)| WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            perf_index: meta.perf_index,
            num_cores: meta.num_cores,
            last_heartbeat_secs_ago: now
                .duration_since(meta.last_heartbeat)
                .unwrap_or_default()
                .as_secs(),
            subtasks_started: meta.subtasks_started,
            subtasks_accepted: meta.subtasks_accepted,
            subtasks_rejected: meta.subtasks_rejected,
        })
        .collect();

    Ok(Json(out))
}

fn with_worker<F>(state: &AppState, worker_id: &WorkerId, f: F) -> Result<(), StatusCode>
where
    F: FnOnce(&mut WorkerMeta),
{
    let mut workers = lock(&state.workers)?;
    if let Some(meta) = workers.get_mut(worker_id) {
        f(meta);
    }
    Ok(())
}

/* ---------------- subtareas ---------------- */

// Asigna el próximo rango de chunks del job al worker
async fn next_subtask(
    State(state): State<AppState>,
    Json(req): Json<SubtaskRequest>,
) -> Result<Json<SubtaskResponse>, StatusCode> {
    {
        let workers = lock(&state.workers)?;
        match workers.get(&req.worker_id) {
            Some(meta) if !meta.dead => {}
            Some(_) => {
                warn!("worker {} marcado como muerto pidió trabajo", req.worker_id);
                return Ok(Json(SubtaskResponse { task: None }));
            }
            None => return Err(StatusCode::NOT_FOUND),
        }
    }

    let job = find_job(&state, &req.job_id)?;
    let task = {
        let mut job = lock(&job)?;
        job.query_extra_data(req.perf_index, req.num_cores, &req.worker_id)
    };

    if let Some(ref t) = task {
        info!(
            "asignando subtarea {} (job={}, chunks [{}, {})) al worker {}",
            t.subtask_id,
            t.job_id,
            t.descriptor.start_task,
            t.descriptor.end_task,
            req.worker_id
        );
        with_worker(&state, &req.worker_id, |m| m.subtasks_started += 1)?;
    }

    Ok(Json(SubtaskResponse { task }))
}

// El worker entrega los tiles producidos
async fn complete_subtask(
    State(state): State<AppState>,
    Json(req): Json<SubtaskCompleteRequest>,
) -> Result<Json<SubtaskCompleteResponse>, StatusCode> {
    let job = find_job(&state, &req.job_id)?;
    let delivery = {
        let mut job = lock(&job)?;
        job.accept(&req.subtask_id, &req.files, &req.worker_id)
    };

    let resp = match delivery {
        Delivery::Ignored => return Err(StatusCode::NOT_FOUND),
        Delivery::Rejected => {
            with_worker(&state, &req.worker_id, |m| m.subtasks_rejected += 1)?;
            SubtaskCompleteResponse {
                accepted: false,
                finalized: false,
            }
        }
        Delivery::Accepted { finalized, .. } => {
            with_worker(&state, &req.worker_id, |m| m.subtasks_accepted += 1)?;
            if finalized {
                info!("job {} finalizado", req.job_id);
            }
            SubtaskCompleteResponse {
                accepted: true,
                finalized,
            }
        }
    };

    Ok(Json(resp))
}

async fn fail_subtask(
    State(state): State<AppState>,
    Json(req): Json<SubtaskRef>,
) -> Result<StatusCode, StatusCode> {
    let job = find_job(&state, &req.job_id)?;
    let mut job = lock(&job)?;
    if job.report_failure(&req.subtask_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn restart_subtask(
    State(state): State<AppState>,
    Json(req): Json<SubtaskRef>,
) -> Result<Json<JobSnapshot>, StatusCode> {
    let job = find_job(&state, &req.job_id)?;
    let mut job = lock(&job)?;
    if !job.ledger().contains(&req.subtask_id) {
        return Err(StatusCode::NOT_FOUND);
    }
    job.restart_subtask(&req.subtask_id);
    Ok(Json(job.snapshot()))
}

fn subtask_query(q: &HashMap<String, String>) -> Result<(&String, &String), StatusCode> {
    let job_id = q.get("job_id").ok_or(StatusCode::BAD_REQUEST)?;
    let subtask_id = q.get("subtask_id").ok_or(StatusCode::BAD_REQUEST)?;
    Ok((job_id, subtask_id))
}

async fn subtask_cost(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<SubtaskCostResponse>, StatusCode> {
    let (job_id, subtask_id) = subtask_query(&q)?;

    let job = find_job(&state, job_id)?;
    let job = lock(&job)?;
    Ok(Json(SubtaskCostResponse {
        subtask_id: subtask_id.clone(),
        cost: job.cost(subtask_id),
    }))
}

// Píxeles de la subtarea, para pintarla en la preview
async fn subtask_area(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Vec<(u32, u32)>>, StatusCode> {
    let (job_id, subtask_id) = subtask_query(&q)?;

    let job = find_job(&state, job_id)?;
    let job = lock(&job)?;
    if !job.ledger().contains(subtask_id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(job.task_area_pixels(subtask_id)))
}

// Caja al azar de la entrega + descriptor para re-renderizarla
async fn subtask_verification(
    State(state): State<AppState>,
    Json(req): Json<SubtaskVerificationRequest>,
) -> Result<Json<SubtaskVerificationResponse>, StatusCode> {
    let job = find_job(&state, &req.job_id)?;
    let job = lock(&job)?;

    let part_box = job
        .part_image_box(&req.subtask_id, req.result_file.as_deref())
        .ok_or(StatusCode::NOT_FOUND)?;

    let tmp_path = state
        .settings
        .data_dir
        .join("tmp")
        .join(&req.subtask_id)
        .to_string_lossy()
        .to_string();
    let descriptor = job
        .verification_descriptor(
            &req.subtask_id,
            (part_box.x0, part_box.y0),
            &job.spec().path_root,
            &tmp_path,
        )
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(SubtaskVerificationResponse {
        part_box,
        descriptor,
    }))
}

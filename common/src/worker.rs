use serde::{Deserialize, Serialize};

use crate::grid::PixelBox;
use crate::job::{ComputeTaskDef, JobId, VerificationDescriptor};
use crate::subtask::SubtaskId;

pub type WorkerId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    pub perf_index: f64,
    pub num_cores: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
}

/// Pedido de trabajo; `num_cores == 0` usa el valor del job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskRequest {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub perf_index: f64,
    #[serde(default)]
    pub num_cores: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResponse {
    pub task: Option<ComputeTaskDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskCompleteRequest {
    pub job_id: JobId,
    pub subtask_id: SubtaskId,
    pub worker_id: WorkerId,
    /// Rutas de los tiles producidos
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskCompleteResponse {
    pub accepted: bool,
    pub finalized: bool,
}

/// Falla reportada por el worker o restart pedido por un cliente.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskRef {
    pub job_id: JobId,
    pub subtask_id: SubtaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskCostResponse {
    pub subtask_id: SubtaskId,
    pub cost: f64,
}

/// Pedido de verificación de una entrega: se elige un tile fino al azar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskVerificationRequest {
    pub job_id: JobId,
    pub subtask_id: SubtaskId,
    #[serde(default)]
    pub result_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskVerificationResponse {
    pub part_box: PixelBox,
    pub descriptor: VerificationDescriptor,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub dead: bool,
    pub perf_index: f64,
    pub num_cores: u32,
    pub last_heartbeat_secs_ago: u64,
    pub subtasks_started: u64,
    pub subtasks_accepted: u64,
    pub subtasks_rejected: u64,
}

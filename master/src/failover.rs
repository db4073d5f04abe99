use std::time::SystemTime;

use tokio::time::sleep;
use tracing::{info, warn};

use common::SubtaskId;

use crate::state::{AppState, SharedJob};

/// Loop de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat)
/// - marca como fallidas sus subtareas en curso para que se reenvíen
pub async fn run_failover_loop(state: AppState) {
    let interval = state.settings.sweep_interval;
    loop {
        sleep(interval).await;

        match sweep_once(&state) {
            Ok(0) => {}
            Ok(n) => info!("failover: {} subtareas marcadas como fallidas", n),
            Err(e) => warn!("error en failover sweep: {:?}", e),
        }
    }
}

/// Una pasada de chequeo. Devuelve cuántas subtareas pasaron a FAILURE.
pub(crate) fn sweep_once(state: &AppState) -> Result<usize, String> {
    let now = SystemTime::now();
    let timeout = state.settings.heartbeat_timeout;

    // 1) Detectar qué workers están muertos
    let mut newly_dead: Vec<String> = Vec::new();
    {
        let mut workers = state.workers.lock().map_err(|_| "lock workers")?;

        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            // last_heartbeat en el futuro: se ignora
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                continue;
            };
            if elapsed > timeout {
                meta.dead = true;
                newly_dead.push(worker_id.clone());
                warn!(
                    "marcando worker {} como DEAD (sin heartbeat hace {:?})",
                    worker_id, elapsed
                );
            }
        }
    }

    if newly_dead.is_empty() {
        return Ok(0);
    }

    // 2) Sus subtareas STARTING pasan a FAILURE en cada job
    let jobs: Vec<SharedJob> = {
        let jobs = state.jobs.lock().map_err(|_| "lock jobs")?;
        jobs.values().cloned().collect()
    };

    let mut failed = 0;
    for job in jobs {
        let mut job = job.lock().map_err(|_| "lock job")?;
        for worker_id in &newly_dead {
            let in_flight: Vec<SubtaskId> = job.ledger().in_flight_for(worker_id);
            for subtask_id in in_flight {
                if job.report_failure(&subtask_id) {
                    info!(
                        "subtarea {} del job {} fallida por caída del worker {}",
                        subtask_id,
                        job.id(),
                        worker_id
                    );
                    failed += 1;
                }
            }
        }
    }

    Ok(failed)
}

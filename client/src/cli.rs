use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{JobSnapshot, RenderJobDefinition, SubtaskCostResponse, SubtaskRef, WorkerMetrics};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::{env, fs};

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI para enviar y seguir jobs de render")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Envía un job nuevo a partir de una definición JSON
    Submit {
        #[arg(value_name = "DEFINICION_JSON")]
        file: String,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Costo de una subtarea
    Cost {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
        #[arg(value_name = "SUBTASK_ID")]
        subtask_id: String,
    },
    /// Contorno en píxeles de un rango de chunks
    Boundary {
        #[arg(value_name = "JOB_ID")]
        id: String,
        start: u32,
        end: u32,
    },
    /// Chunk que cubre un píxel
    Pixel {
        #[arg(value_name = "JOB_ID")]
        id: String,
        x: f64,
        y: f64,
    },
    /// Reinicia un job completo, o una subtarea con --subtask
    Restart {
        #[arg(value_name = "JOB_ID")]
        id: String,
        #[arg(long)]
        subtask: Option<String>,
    },

    Workers,
}

/// Deserializa la respuesta o falla con el status del master.
async fn parse<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{} falló (status {}): {}", what, status, body);
    }
    Ok(resp.json().await?)
}

fn print_job(job: &JobSnapshot) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {:?}", job.status);
    println!("  resolución: {}x{}", job.res_x, job.res_y);
    println!(
        "  chunks: total={}, asignados={}, completados={}, fallidos={}",
        job.total_chunks, job.cursor, job.completed_units, job.failed_count
    );
    println!("  progreso: {:.1}%", job.progress() * 100.0);
    println!(
        "  subtareas emitidas: {}, tiles recibidos: {}",
        job.subtasks_issued, job.collected_tiles
    );
    if let Some(ref p) = job.preview_path {
        println!("  preview: {}", p);
    }
    for (worker, chunks) in &job.contributions {
        println!("  worker {}: {} chunks", worker, chunks);
    }
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref started) = job.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = job.finished_at {
        println!("  finalizado: {}", done);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit { file } => {
            let raw = fs::read_to_string(&file).with_context(|| format!("leyendo {}", file))?;
            let def: RenderJobDefinition =
                serde_json::from_str(&raw).with_context(|| format!("parseando {}", file))?;

            let url = format!("{}/api/v1/jobs", base_url);
            let resp = client.post(&url).json(&def).send().await?;
            let job: JobSnapshot = parse(resp, "crear job").await?;

            println!("Job creado:");
            print_job(&job);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            let job: JobSnapshot = parse(resp, "consultar job").await?;
            print_job(&job);
        }

        Commands::Cost { job_id, subtask_id } => {
            let url = format!("{}/api/v1/subtasks/cost", base_url);
            let resp = client
                .get(&url)
                .query(&[("job_id", &job_id), ("subtask_id", &subtask_id)])
                .send()
                .await?;
            let cost: SubtaskCostResponse = parse(resp, "consultar costo").await?;
            println!("Subtarea {}: costo {:.3}", cost.subtask_id, cost.cost);
        }

        Commands::Boundary { id, start, end } => {
            let url = format!("{}/api/v1/jobs/{}/boundary", base_url, id);
            let resp = client
                .get(&url)
                .query(&[("start", start), ("end", end)])
                .send()
                .await?;
            let pixels: Vec<(u32, u32)> = parse(resp, "consultar contorno").await?;
            println!("Contorno de [{}, {}): {} píxeles", start, end, pixels.len());
            for (x, y) in pixels {
                println!("  {} {}", x, y);
            }
        }

        Commands::Pixel { id, x, y } => {
            let url = format!("{}/api/v1/jobs/{}/pixel", base_url, id);
            let resp = client
                .get(&url)
                .query(&[("x", x), ("y", y)])
                .send()
                .await?;
            let body: serde_json::Value = parse(resp, "consultar píxel").await?;
            println!("Píxel ({}, {}) -> chunk {}", x, y, body["chunk"]);
        }

        Commands::Restart { id, subtask } => {
            let resp = match subtask {
                Some(subtask_id) => {
                    let url = format!("{}/api/v1/subtasks/restart", base_url);
                    client
                        .post(&url)
                        .json(&SubtaskRef {
                            job_id: id,
                            subtask_id,
                        })
                        .send()
                        .await?
                }
                None => {
                    let url = format!("{}/api/v1/jobs/{}/restart", base_url, id);
                    client.post(&url).send().await?
                }
            };
            let job: JobSnapshot = parse(resp, "reiniciar").await?;
            println!("Reiniciado:");
            print_job(&job);
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            let workers: Vec<WorkerMetrics> = parse(resp, "listar workers").await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {}", w.hostname);
                println!("  dead           : {}", w.dead);
                println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                println!(
                    "  perf_index     : {:.0} ({} cores)",
                    w.perf_index, w.num_cores
                );
                println!(
                    "  subtareas      : started={}, aceptadas={}, rechazadas={}",
                    w.subtasks_started, w.subtasks_accepted, w.subtasks_rejected
                );
                println!();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_restart_de_subtarea() {
        let cli = Cli::try_parse_from(["client", "restart", "j1", "--subtask", "s1"]).unwrap();
        match cli.command {
            Commands::Restart { id, subtask } => {
                assert_eq!(id, "j1");
                assert_eq!(subtask.as_deref(), Some("s1"));
            }
            other => panic!("comando inesperado: {:?}", other),
        }
    }

    #[test]
    fn parsea_boundary() {
        let cli = Cli::try_parse_from(["client", "boundary", "j1", "2", "5"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Boundary { start: 2, end: 5, .. }
        ));
    }
}

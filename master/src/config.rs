use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DATA_DIR: &str = "/data";
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_FAILOVER_SWEEP_INTERVAL_SECS: u64 = 5;

/// Configuración del master, leída de variables de entorno.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub banned_workers: HashSet<String>,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            data_dir: env::var("DATA_DIR")
                .unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string())
                .into(),
            banned_workers: parse_list(&env::var("BANNED_WORKERS").unwrap_or_default()),
            heartbeat_timeout: Duration::from_secs(env_u64(
                "WORKER_HEARTBEAT_TIMEOUT_SECS",
                DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            )),
            sweep_interval: Duration::from_secs(env_u64(
                "FAILOVER_SWEEP_INTERVAL_SECS",
                DEFAULT_FAILOVER_SWEEP_INTERVAL_SECS,
            )),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

/// "a, b,,c" -> {"a", "b", "c"}
fn parse_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

mod collab;
mod config;
mod failover;
mod handlers;
mod state;

use crate::config::Settings;
use crate::state::AppState;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,axum=info")),
        )
        .init();

    let settings = Settings::from_env();
    info!("configuración: {:?}", settings);
    let state = AppState::new(settings);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // detección de workers caídos en segundo plano
    let failover_state = state.clone();
    tokio::spawn(async move {
        failover::run_failover_loop(failover_state).await;
    });

    let listener = TcpListener::bind(&state.settings.bind_addr).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

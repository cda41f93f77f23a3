//! Binary entry point.
//!
//! Environment variables:
//!   PORT                 - HTTP/WebSocket port (default: 5000)
//!   STORAGE_PATH         - persistence root (default: ./data/collab)
//!   LOG_LEVEL            - env_logger filter (default: info)
//!   LIVEKIT_API_KEY      - voice credential issuer (optional)
//!   LIVEKIT_API_SECRET
//!   LIVEKIT_URL
//!   ATELIER_MAX_PEERS    - peers per room (default: 32)
//!   ATELIER_MAX_ROOMS    - resident rooms (default: 100000)
//!   ATELIER_MAX_DOC_SIZE - document cap in bytes (default: 10485760)

use std::net::SocketAddr;

use log::{error, info, warn};
use tokio::net::TcpListener;

use atelier_server::config::{Config, limits};
use atelier_server::server::{self, AppState};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("LOG_LEVEL", "info"),
    )
    .init();

    let config = Config::from_env();
    info!(
        "atelier-server starting: port={}, storage={}, max_peers={}, max_rooms={}, voice={}",
        config.port,
        config.storage_path.display(),
        config.max_peers_per_room,
        config.max_rooms,
        if config.livekit.is_some() { "livekit" } else { "disabled" },
    );

    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    spawn_sync_state_sweeper(&state);

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind");
    info!("listening on http://{addr} (ws at /ws/{{project_id}})");

    let app = server::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    info!("shutting down, closing rooms");
    state.rooms.shutdown_all().await;
    info!("bye");
}

/// Expired sync-state checkpoints accumulate from peers that never come
/// back; reap them on a slow cadence.
fn spawn_sync_state_sweeper(state: &AppState) {
    let store = state.store.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(limits::SYNC_STATE_SWEEP_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            match store.delete_expired_sync_states().await {
                Ok(0) => {}
                Ok(n) => info!("[store] swept {n} expired sync checkpoint(s)"),
                Err(e) => warn!("[store] sync checkpoint sweep failed: {e}"),
            }
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

//! Process-wide state: the room registry, server counters, and the HTTP
//! surface (admin endpoints plus the WebSocket upgrade).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use atelier_proto::ServerMessage;
use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::connection;
use crate::error::ServerError;
use crate::now_ms;
use crate::room::{Room, RoomHandle, RoomMap};
use crate::session::SessionKeys;
use crate::store::{ProjectMeta, Store, validate_project_id};
use crate::voice::CredentialIssuer;

/// Live gauges reported by `/health` and the `Stats` frame.
pub struct ServerCounters {
    started_at: Instant,
    active_peers: AtomicUsize,
    active_rooms: AtomicUsize,
}

impl Default for ServerCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCounters {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            active_peers: AtomicUsize::new(0),
            active_rooms: AtomicUsize::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn peer_joined(&self) {
        self.active_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_left(&self) {
        self.active_peers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn room_opened(&self) {
        self.active_rooms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_closed(&self) {
        self.active_rooms.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_peers(&self) -> usize {
        self.active_peers.load(Ordering::Relaxed)
    }

    pub fn active_rooms(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }
}

/// Registry guaranteeing at most one live room per project.
#[derive(Clone)]
pub struct RoomRegistry {
    map: RoomMap,
    config: Arc<Config>,
    store: Arc<Store>,
    voice: Arc<CredentialIssuer>,
    counters: Arc<ServerCounters>,
}

impl RoomRegistry {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        voice: Arc<CredentialIssuer>,
        counters: Arc<ServerCounters>,
    ) -> Self {
        Self {
            map: RoomMap::default(),
            config,
            store,
            voice,
            counters,
        }
    }

    /// Existing live room, or a cold open from the store. Double-checked
    /// under the write guard so concurrent connects race to exactly one
    /// instance.
    pub async fn get_or_open(&self, project_id: &str) -> Result<RoomHandle, ServerError> {
        {
            let rooms = self.map.read().await;
            if let Some(handle) = rooms.get(project_id)
                && !handle.is_closed()
            {
                return Ok(handle.clone());
            }
        }

        let mut rooms = self.map.write().await;
        if let Some(handle) = rooms.get(project_id)
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }
        if rooms.len() >= self.config.max_rooms {
            warn!("[registry] room limit {} reached", self.config.max_rooms);
            return Err(ServerError::ServerAtCapacity);
        }

        let handle = Room::open(
            project_id,
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            Arc::clone(&self.voice),
            Arc::clone(&self.counters),
            Arc::clone(&self.map),
        )
        .await?;
        rooms.insert(project_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn live_ids(&self) -> HashSet<String> {
        self.map.read().await.keys().cloned().collect()
    }

    pub async fn is_live(&self, project_id: &str) -> bool {
        self.map
            .read()
            .await
            .get(project_id)
            .is_some_and(|h| !h.is_closed())
    }

    /// Orderly shutdown: every room flushes, compacts, checkpoints, and
    /// drains its mailbox with `ServerError`.
    pub async fn shutdown_all(&self) {
        let handles: Vec<RoomHandle> = self.map.read().await.values().cloned().collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub rooms: RoomRegistry,
    pub sessions: Arc<SessionKeys>,
    pub counters: Arc<ServerCounters>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let config = Arc::new(config);
        let store = Arc::new(Store::open(&config.storage_path).await?);
        let voice = Arc::new(CredentialIssuer::from_config(config.livekit.clone()));
        let counters = Arc::new(ServerCounters::new());
        let rooms = RoomRegistry::new(
            Arc::clone(&config),
            Arc::clone(&store),
            voice,
            Arc::clone(&counters),
        );
        Ok(Self {
            config,
            store,
            rooms,
            sessions: Arc::new(SessionKeys::generate()),
            counters,
        })
    }

    pub fn stats_message(&self) -> ServerMessage {
        ServerMessage::Stats {
            active_projects: self.counters.active_rooms() as u32,
            active_peers: self.counters.active_peers() as u32,
            uptime_seconds: self.counters.uptime_seconds(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(project_detail))
        .route("/ws/{project_id}", get(ws_upgrade))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "atelier-server",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.counters.uptime_seconds(),
        "active_projects": state.counters.active_rooms(),
        "active_peers": state.counters.active_peers(),
    }))
}

#[derive(Debug, Serialize)]
struct ProjectSummary {
    project_id: String,
    name: String,
    created_at: i64,
    active: bool,
}

async fn list_projects(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProjectSummary>>, StatusCode> {
    let metas = state
        .store
        .list_meta()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let live = state.rooms.live_ids().await;
    Ok(Json(
        metas
            .into_iter()
            .map(|m| ProjectSummary {
                active: live.contains(&m.project_id),
                project_id: m.project_id,
                name: m.name,
                created_at: m.created_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
struct CreateProject {
    name: String,
}

async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProject>,
) -> Result<(StatusCode, Json<ProjectMeta>), StatusCode> {
    if req.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let meta = ProjectMeta {
        project_id: Uuid::new_v4().to_string(),
        name: req.name,
        created_at: now_ms(),
    };
    state
        .store
        .put_meta(&meta)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    info!("[admin] project '{}' created as {}", meta.name, meta.project_id);
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn project_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectSummary>, StatusCode> {
    if !validate_project_id(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    let meta = state
        .store
        .load_meta(&id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(ProjectSummary {
        active: state.rooms.is_live(&meta.project_id).await,
        project_id: meta.project_id,
        name: meta.name,
        created_at: meta.created_at,
    }))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(project_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if !validate_project_id(&project_id) {
        return (StatusCode::BAD_REQUEST, "invalid project id").into_response();
    }
    ws.on_upgrade(move |socket| connection::serve_socket(socket, project_id, state))
}

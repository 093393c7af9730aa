//! HTTP route handlers.

use std::path::PathBuf;
use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::mux::MuxClient;
use crate::pty::{PtyManager, SharedPtyManager};
use crate::session::{RegistryError, Session, SessionRegistry, SharedSessionRegistry};
use crate::token::{AttachmentTokenStore, SharedTokenStore};

use super::auth::{self, AuthUser};
use super::types::*;
use super::ws;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub registry: SharedSessionRegistry,
    pub manager: SharedPtyManager,
    pub tokens: SharedTokenStore,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let mux = MuxClient::new(config.mux_socket.clone());

    // A gateway without its multiplexer is useless; fail now, loudly.
    mux.probe()
        .await
        .map_err(|e| anyhow::anyhow!("multiplexer unavailable at startup: {e}"))?;

    let registry: SharedSessionRegistry = Arc::new(SessionRegistry::new(mux.clone()));
    registry.discover_existing().await?;
    Arc::clone(&registry).start_cleanup_task(config.cleanup_period);

    let manager: SharedPtyManager = Arc::new(PtyManager::new(mux, &config));

    let tokens: SharedTokenStore = Arc::new(AttachmentTokenStore::new(config.token_ttl));
    Arc::clone(&tokens).start_sweep_task(config.token_sweep_period);

    let state = Arc::new(AppState {
        config: config.clone(),
        registry,
        manager,
        tokens,
    });

    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth::login))
        // The WebSocket endpoint authenticates via its one-shot attachment
        // token (browsers cannot set headers on an upgrade).
        .route("/ws", get(ws::ws_handler));

    let protected_routes = Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/sessions/:id/rename", post(rename_session))
        .route("/api/sessions/:id/persistent", post(set_persistent))
        .route("/api/sessions/:id/attach", post(attach_session))
        .route("/api/sessions/:id/broadcast", post(broadcast_session))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGINT/SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

fn registry_error(e: RegistryError) -> (StatusCode, String) {
    let status = match &e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Persistent(_) => StatusCode::CONFLICT,
        RegistryError::NameCollision | RegistryError::Mux(_) => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string())
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dev_mode: state.config.dev_mode,
        auth_required: !state.config.dev_mode,
    })
}

/// List all sessions, ghosts included.
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<Session>> {
    Json(state.registry.list().await)
}

/// Create a new session backed by a fresh multiplexer session.
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Session>, (StatusCode, String)> {
    let working_dir = req.working_dir.map(PathBuf::from);
    state
        .registry
        .create(req.title, working_dir)
        .await
        .map(Json)
        .map_err(registry_error)
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, (StatusCode, String)> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Session {id} not found")))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteSessionQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let existed = state
        .registry
        .delete(&id, query.force)
        .await
        .map_err(registry_error)?;
    Ok(Json(serde_json::json!({ "id": id, "deleted": existed })))
}

async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RenameSessionRequest>,
) -> Result<Json<Session>, (StatusCode, String)> {
    let session = state
        .registry
        .rename(&id, req.title)
        .await
        .map_err(registry_error)?;

    // Attached clients get the new label immediately.
    state
        .manager
        .broadcast(&id, ws::title_frame(&session.title))
        .await;

    Ok(Json(session))
}

async fn set_persistent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PersistentRequest>,
) -> Result<Json<Session>, (StatusCode, String)> {
    state
        .registry
        .set_persistent(&id, req.persistent)
        .await
        .map(Json)
        .map_err(registry_error)
}

/// Issue a one-shot attachment token for the WebSocket upgrade.
async fn attach_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<AttachResponse>, (StatusCode, String)> {
    let session = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Session {id} not found")))?;

    // Ghosts are read-only: nothing to attach to.
    if session.is_ghost {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Session {id} no longer exists in the multiplexer"),
        ));
    }

    let token = state.tokens.issue(session.id.clone(), user.id).await;
    let ws_url = format!("/ws?token={token}&session={}", session.id);

    Ok(Json(AttachResponse {
        attachment_token: token,
        expires_in: state.tokens.ttl().as_secs(),
        ws_url,
    }))
}

/// Best-effort text broadcast to current subscribers (summary pipelines
/// and other collaborators post here). Always accepted.
async fn broadcast_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<BroadcastRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    if state.registry.get(&id).await.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Session {id} not found")));
    }
    // Delivered as an informational text frame; clients that do not
    // recognize the type ignore it.
    let frame = serde_json::json!({ "type": "summary", "text": req.text }).to_string();
    state.manager.broadcast(&id, frame).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": true })),
    ))
}

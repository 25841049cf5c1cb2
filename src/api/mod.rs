//! HTTP surface: REST handlers, bearer auth, and the agent WebSocket.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::api::auth::AuthService;
use crate::config::ServerConfig;
use crate::dispatcher::CommandDispatcher;
use crate::hub::AgentHub;
use crate::reconciler::SessionReconciler;
use crate::reposync::RepositorySynchronizer;
use crate::storage::{AgentStore, CatalogStore, RepositoryStore, SessionStore};
use crate::tracker::ConnectionTracker;

pub mod auth;
pub mod rest;
pub mod ws;

/// Shared handler state. Subsystems are constructed once at startup and
/// threaded through explicitly; tests wire fakes into the same shape.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<AgentHub>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub reconciler: Arc<SessionReconciler>,
    pub tracker: Arc<ConnectionTracker>,
    pub sessions: Arc<dyn SessionStore>,
    pub agents: Arc<dyn AgentStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub repositories: Arc<dyn RepositoryStore>,
    pub synchronizer: Arc<RepositorySynchronizer>,
    pub auth: Arc<AuthService>,
    pub config: Arc<ServerConfig>,
}

/// Assembles the full application router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/sessions",
            get(rest::list_sessions).post(rest::create_session),
        )
        .route(
            "/sessions/{id}",
            get(rest::get_session)
                .patch(rest::patch_session)
                .delete(rest::delete_session),
        )
        .route("/sessions/{id}/connect", post(rest::connect_session))
        .route("/sessions/{id}/heartbeat", post(rest::session_heartbeat))
        .route("/sessions/batch/{op}", post(rest::batch_sessions))
        .route("/templates", get(rest::list_templates))
        .route("/templates/{name}", axum::routing::delete(rest::delete_template))
        .route("/catalog", get(rest::list_catalog))
        .route("/catalog/favorites", get(rest::list_favorites))
        .route("/catalog/{id}/install", post(rest::install_catalog_entry))
        .route(
            "/catalog/{id}/favorite",
            post(rest::add_favorite).delete(rest::remove_favorite),
        )
        .route(
            "/repositories",
            get(rest::list_repositories).post(rest::create_repository),
        )
        .route(
            "/repositories/{id}",
            get(rest::get_repository).delete(rest::delete_repository),
        )
        .route("/repositories/{id}/sync", post(rest::sync_repository))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/healthz", get(rest::health))
        .route("/auth/login", post(auth::login))
        .route("/agents/ws", get(ws::agent_ws_handler))
        .merge(protected)
        .with_state(state)
}

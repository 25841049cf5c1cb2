//! REST handlers for sessions, templates, catalog, and repositories.
//!
//! Handlers validate at the boundary, convert to domain types, and defer to
//! the reconciler/synchronizer. State-changing session calls answer 202:
//! acceptance is synchronous, provisioning is not.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ResourceSpec, SessionName, SessionState, TemplateName, UserId};
use crate::error::ApiError;
use crate::reconciler::{BatchOutcome, CreateSessionSpec, SessionIntent, TemplateRef};
use crate::storage::{
    CatalogFilter, RepoAuthType, RepositoryRecord, RepositoryStatus, SessionRecord, TemplateRecord,
};
use crate::tracker::TrackerError;

use super::AppState;
use super::auth::AuthUser;

// ---- session DTOs ----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ResourcesBody {
    pub memory: String,
    pub cpu: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub application_id: Option<Uuid>,
    pub resources: ResourcesBody,
    #[serde(default)]
    pub persistent_home: bool,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusBody {
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub name: String,
    pub user: String,
    pub template: String,
    pub namespace: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub persistent_home: bool,
    pub tags: Vec<String>,
    pub status: SessionStatusBody,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

fn phase_of(state: SessionState) -> String {
    match state {
        SessionState::Pending => "Pending",
        SessionState::Running => "Running",
        SessionState::Hibernated => "Hibernated",
        SessionState::Terminated => "Terminated",
        SessionState::Failed => "Failed",
    }
    .to_string()
}

impl From<SessionRecord> for SessionResponse {
    fn from(record: SessionRecord) -> Self {
        Self {
            name: record.name.to_string(),
            user: record.user.to_string(),
            template: record.template.to_string(),
            namespace: record.namespace,
            platform: record.platform,
            url: record.url,
            pod_name: record.pod_name,
            cpu_millis: record.resources.cpu_millis,
            memory_bytes: record.resources.memory_bytes,
            persistent_home: record.persistent_home,
            tags: record.tags,
            status: SessionStatusBody {
                phase: phase_of(record.state),
                message: record.state_message,
            },
            created_at: record.created_at,
            last_activity: record.last_activity,
            agent_id: record.agent_id.map(|id| id.to_string()),
        }
    }
}

fn parse_session_name(raw: &str) -> Result<SessionName, ApiError> {
    SessionName::try_new(raw.to_string())
        .map_err(|_| ApiError::NotFound("session not found".to_string()))
}

async fn load_authorized_session(
    state: &AppState,
    caller: &AuthUser,
    name: &SessionName,
) -> Result<SessionRecord, ApiError> {
    let session = state
        .sessions
        .get(name)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;
    caller.authorize_user(&session.user)?;
    Ok(session)
}

// ---- session handlers ------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub user: Option<String>,
}

/// `GET /sessions?user=`: admins see everything when `user` is omitted.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let scope = if caller.admin {
        match query.user {
            Some(user) => Some(
                UserId::try_new(user).map_err(|e| ApiError::Validation(e.to_string()))?,
            ),
            None => None,
        }
    } else {
        Some(caller.user.clone())
    };

    let sessions = state.sessions.list(scope.as_ref()).await?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

/// `POST /sessions`: answers 202; the session is accepted and provisions
/// asynchronously.
pub async fn create_session(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let user = match body.user {
        Some(raw) => {
            let requested =
                UserId::try_new(raw).map_err(|e| ApiError::Validation(e.to_string()))?;
            caller.authorize_user(&requested)?;
            requested
        }
        None => caller.user.clone(),
    };

    let template = match (body.template, body.application_id) {
        (Some(name), None) => TemplateRef::Name(
            TemplateName::try_new(name).map_err(|e| ApiError::Validation(e.to_string()))?,
        ),
        (None, Some(id)) => TemplateRef::Application(id),
        (Some(_), Some(_)) => {
            return Err(ApiError::Validation(
                "specify either template or applicationId, not both".to_string(),
            ));
        }
        (None, None) => {
            return Err(ApiError::Validation(
                "template or applicationId is required".to_string(),
            ));
        }
    };

    let resources = ResourceSpec::parse(&body.resources.cpu, &body.resources.memory)?;

    let record = state
        .reconciler
        .create_session(CreateSessionSpec {
            user,
            template,
            resources,
            namespace: body.namespace,
            persistent_home: body.persistent_home,
            idle_timeout_secs: body.idle_timeout_secs,
            max_duration_secs: body.max_duration_secs,
            tags: body.tags,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(SessionResponse::from(record))))
}

/// `GET /sessions/{id}`.
pub async fn get_session(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let name = parse_session_name(&id)?;
    let session = load_authorized_session(&state, &caller, &name).await?;
    Ok(Json(session.into()))
}

#[derive(Debug, Deserialize)]
pub struct PatchSessionBody {
    pub state: String,
}

/// `PATCH /sessions/{id}`: request a transition to
/// `running`/`hibernated`/`terminated`.
pub async fn patch_session(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(body): Json<PatchSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let name = parse_session_name(&id)?;
    load_authorized_session(&state, &caller, &name).await?;

    let target = SessionState::parse(&body.state)
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let intent = SessionIntent::from_target_state(target)?;
    let updated = state.reconciler.transition(&name, intent).await?;
    Ok((StatusCode::ACCEPTED, Json(SessionResponse::from(updated))))
}

/// `DELETE /sessions/{id}`: terminate.
pub async fn delete_session(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let name = parse_session_name(&id)?;
    load_authorized_session(&state, &caller, &name).await?;
    let updated = state
        .reconciler
        .transition(&name, SessionIntent::Delete)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SessionResponse::from(updated))))
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub connection_id: Uuid,
    pub session: String,
    pub user: String,
}

/// `POST /sessions/{id}/connect?user=`: open a connection record.
pub async fn connect_session(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<String>,
    Query(query): Query<ConnectQuery>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let name = parse_session_name(&id)?;
    let session = load_authorized_session(&state, &caller, &name).await?;

    let user = match query.user {
        Some(raw) => UserId::try_new(raw).map_err(|e| ApiError::Validation(e.to_string()))?,
        None => caller.user.clone(),
    };

    let record = state.tracker.add(session.name.clone(), user, "api".to_string());
    state.sessions.touch_activity(&name, Utc::now()).await?;
    Ok(Json(ConnectResponse {
        connection_id: record.id,
        session: record.session.to_string(),
        user: record.user.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatQuery {
    /// Kept as a string so a malformed id flows through the uniform error
    /// mapping instead of an extractor-level rejection.
    pub connection_id: String,
}

/// `POST /sessions/{id}/heartbeat?connectionId=`: refresh liveness. A
/// connection bound to another session is rejected with 403.
pub async fn session_heartbeat(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<String>,
    Query(query): Query<HeartbeatQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = parse_session_name(&id)?;
    load_authorized_session(&state, &caller, &name).await?;

    // A malformed connection id cannot belong to any session; treat it
    // like an unknown connection.
    let connection_id = Uuid::parse_str(&query.connection_id)
        .map_err(|_| ApiError::NotFound("connection not found".to_string()))?;

    let stamped = state
        .tracker
        .update_heartbeat(connection_id, &name)
        .map_err(|err| match err {
            TrackerError::UnknownConnection(_) => {
                ApiError::NotFound("connection not found".to_string())
            }
            TrackerError::SessionMismatch => ApiError::Authorization(
                "connection belongs to another session".to_string(),
            ),
        })?;
    state.sessions.touch_activity(&name, stamped).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub sessions: Vec<String>,
}

/// `POST /sessions/batch/{hibernate|wake|delete}`: 200 even on partial
/// failure.
pub async fn batch_sessions(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(op): Path<String>,
    Json(body): Json<BatchBody>,
) -> Result<Json<BatchOutcome>, ApiError> {
    let intent = match op.as_str() {
        "hibernate" => SessionIntent::Hibernate,
        "wake" => SessionIntent::Wake,
        "delete" => SessionIntent::Delete,
        other => {
            return Err(ApiError::Validation(format!(
                "unknown batch operation {other:?}"
            )));
        }
    };

    // Scope enforcement happens per item: skip sessions the caller cannot
    // touch by reporting them as not found.
    let mut allowed = Vec::with_capacity(body.sessions.len());
    let mut outcome_errors = Vec::new();
    for raw in &body.sessions {
        let authorized = match SessionName::try_new(raw.clone()) {
            Ok(name) => match state.sessions.get(&name).await? {
                Some(session) => caller.authorize_user(&session.user).is_ok(),
                None => true, // let the reconciler report not-found
            },
            Err(_) => true,
        };
        if authorized {
            allowed.push(raw.clone());
        } else {
            outcome_errors.push(crate::reconciler::BatchItemError {
                name: raw.clone(),
                error: "session not found".to_string(),
            });
        }
    }

    let mut outcome = state.reconciler.batch(intent, &allowed).await;
    outcome.total += outcome_errors.len();
    outcome.failed += outcome_errors.len();
    outcome.errors.extend(outcome_errors);
    Ok(Json(outcome))
}

// ---- template & catalog handlers -------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateResponse {
    pub name: String,
    pub display_name: String,
    pub image: String,
    pub platform: String,
    pub app_type: String,
    pub created_at: DateTime<Utc>,
}

impl From<TemplateRecord> for TemplateResponse {
    fn from(record: TemplateRecord) -> Self {
        Self {
            name: record.name.to_string(),
            display_name: record.display_name,
            image: record.image,
            platform: record.platform,
            app_type: record.app_type,
            created_at: record.created_at,
        }
    }
}

/// `GET /templates`: installed templates.
pub async fn list_templates(
    State(state): State<AppState>,
) -> Result<Json<Vec<TemplateResponse>>, ApiError> {
    let templates = state.catalog.list_templates().await?;
    Ok(Json(templates.into_iter().map(Into::into).collect()))
}

/// `DELETE /templates/{name}`: uninstall (admin only).
pub async fn delete_template(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !caller.admin {
        return Err(ApiError::Authorization(
            "template removal requires admin".to_string(),
        ));
    }
    let name =
        TemplateName::try_new(name).map_err(|e| ApiError::Validation(e.to_string()))?;
    state.reconciler.uninstall_template(&name).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

#[derive(Debug, Deserialize)]
pub struct CatalogQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    /// Comma-separated tag list; entries must match all of them.
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
}

/// `GET /catalog`: list with filters.
pub async fn list_catalog(
    State(state): State<AppState>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Vec<crate::storage::CatalogEntry>>, ApiError> {
    let filter = CatalogFilter {
        category: query.category,
        search: query.search,
        tags: query
            .tags
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        sort: query.sort,
    };
    let entries = state.catalog.list_entries(&filter).await?;
    Ok(Json(entries))
}

/// `POST /catalog/{id}/install`: materialize a catalog entry as an
/// installed template.
pub async fn install_catalog_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let entry_id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::Validation("catalog id must be a UUID".to_string()))?;
    let template = state.reconciler.install_catalog_entry(entry_id).await?;
    Ok((StatusCode::CREATED, Json(TemplateResponse::from(template))))
}

/// `POST /catalog/{id}/favorite`: favorite a template by name.
pub async fn add_favorite(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let template =
        TemplateName::try_new(name).map_err(|e| ApiError::Validation(e.to_string()))?;
    state.catalog.add_favorite(&caller.user, &template).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// `DELETE /catalog/{id}/favorite`.
pub async fn remove_favorite(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let template =
        TemplateName::try_new(name).map_err(|e| ApiError::Validation(e.to_string()))?;
    if !state.catalog.remove_favorite(&caller.user, &template).await? {
        return Err(ApiError::NotFound("favorite not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /catalog/favorites`.
pub async fn list_favorites(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
) -> Result<Json<Vec<String>>, ApiError> {
    let favorites = state.catalog.list_favorites(&caller.user).await?;
    Ok(Json(favorites.into_iter().map(|t| t.to_string()).collect()))
}

// ---- repository handlers ---------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRepositoryBody {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub repo_type: Option<String>,
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub auth_secret: Option<String>,
}

/// `POST /repositories`: register a repository and kick off the first
/// sync detached from this request.
pub async fn create_repository(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Json(body): Json<CreateRepositoryBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !caller.admin {
        return Err(ApiError::Authorization(
            "repository management requires admin".to_string(),
        ));
    }
    if body.name.trim().is_empty() || body.url.trim().is_empty() {
        return Err(ApiError::Validation("name and url are required".to_string()));
    }
    let auth_type = match body.auth_type.as_deref() {
        None => RepoAuthType::None,
        Some(raw) => RepoAuthType::parse(raw).map_err(ApiError::Validation)?,
    };
    let repo_type = body.repo_type.unwrap_or_else(|| "template".to_string());
    if repo_type != "template" && repo_type != "plugin" {
        return Err(ApiError::Validation(format!(
            "unknown repository type {repo_type:?}"
        )));
    }

    let record = RepositoryRecord {
        id: Uuid::new_v4(),
        name: body.name.trim().to_string(),
        url: body.url.trim().to_string(),
        branch: body.branch.unwrap_or_else(|| "main".to_string()),
        repo_type,
        auth_type,
        auth_secret: body.auth_secret,
        status: RepositoryStatus::Pending,
        error_message: None,
        last_sync: None,
        template_count: 0,
        created_at: Utc::now(),
    };
    state.repositories.insert(&record).await?;
    state.synchronizer.trigger_detached(record.id);
    Ok((StatusCode::CREATED, Json(record)))
}

/// `GET /repositories`.
pub async fn list_repositories(
    State(state): State<AppState>,
) -> Result<Json<Vec<RepositoryRecord>>, ApiError> {
    Ok(Json(state.repositories.list().await?))
}

/// `GET /repositories/{id}`.
pub async fn get_repository(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RepositoryRecord>, ApiError> {
    state
        .repositories
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("repository not found".to_string()))
}

/// `DELETE /repositories/{id}`: catalog entries cascade with the row.
pub async fn delete_repository(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !caller.admin {
        return Err(ApiError::Authorization(
            "repository management requires admin".to_string(),
        ));
    }
    if !state.repositories.delete(id).await? {
        return Err(ApiError::NotFound("repository not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

/// `POST /repositories/{id}/sync`: 202; the sync runs detached so it is
/// not canceled when this request returns.
pub async fn sync_repository(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.repositories.get(id).await?.is_none() {
        return Err(ApiError::NotFound("repository not found".to_string()));
    }
    state.synchronizer.trigger_detached(id);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "sync started" })),
    ))
}

// ---- health ----------------------------------------------------------------

/// `GET /healthz`.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (queued, capacity) = state.dispatcher.queue_depth();
    Json(serde_json::json!({
        "status": "ok",
        "connectedAgents": state.hub.connected_agents().len(),
        "queueDepth": queued,
        "queueCapacity": capacity,
    }))
}

//! Persistence layer: records, store traits, and SQLite implementations.
//!
//! The database is the authoritative shared store; every store here is a
//! trait seam so the dispatcher and reconciler can run against in-memory
//! fakes in unit tests. SQLite implementations live in the submodules, one
//! per table family.
//!
//! Timestamps persist as RFC 3339 TEXT; structured columns (`capacity_json`,
//! `payload_json`, `manifest`, `tags`) persist as serialized JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    AgentCapacity, AgentId, AgentStatus, CommandAction, CommandStatus, ResourceSpec,
    ResourceUsage, SessionName, SessionState, TemplateName, UserId,
};

pub mod agent_store;
pub mod catalog_store;
pub mod command_store;
pub mod repository_store;
pub mod session_store;

pub use agent_store::SqliteAgentStore;
pub use catalog_store::SqliteCatalogStore;
pub use command_store::SqliteCommandStore;
pub use repository_store::SqliteRepositoryStore;
pub use session_store::SqliteSessionStore;

#[cfg(test)]
pub mod test_utils;

/// Storage-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted value failed to parse back into its domain type.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    /// Uniqueness violation (duplicate session name, repository name, ...).
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for crate::error::ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Internal(other.into()),
        }
    }
}

pub(crate) fn corrupt(table: &'static str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        table,
        reason: reason.to_string(),
    }
}

/// Renders a timestamp for a TEXT column.
pub(crate) fn ts_to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parses a TEXT timestamp column.
pub(crate) fn text_to_ts(table: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(table, format!("bad timestamp {raw:?}: {e}")))
}

/// Registry row for one agent identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub platform: String,
    pub region: Option<String>,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub capacity: AgentCapacity,
    pub active_sessions: u64,
}

/// One user session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub name: SessionName,
    pub user: UserId,
    pub template: TemplateName,
    pub state: SessionState,
    pub namespace: String,
    pub platform: String,
    pub url: Option<String>,
    pub pod_name: Option<String>,
    pub resources: ResourceSpec,
    pub persistent_home: bool,
    pub idle_timeout_secs: Option<u64>,
    pub max_duration_secs: Option<u64>,
    pub tags: Vec<String>,
    /// Operator-facing detail for `failed`/`pending` states.
    pub state_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub agent_id: Option<AgentId>,
}

/// A durable command row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: Uuid,
    pub agent_id: AgentId,
    pub session_id: Option<SessionName>,
    pub action: CommandAction,
    pub payload: Map<String, Value>,
    pub status: CommandStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields for a new command; the store stamps `created_at` and status.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub command_id: Uuid,
    pub agent_id: AgentId,
    pub session_id: Option<SessionName>,
    pub action: CommandAction,
    pub payload: Map<String, Value>,
}

/// Outcome of a monotonic status update attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusAdvance {
    /// The update moved the status forward.
    Advanced(CommandRecord),
    /// The update would not strictly advance; nothing was written.
    Rejected { current: CommandStatus },
    NotFound,
}

/// Sync lifecycle of an external repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl RepositoryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown repository status {other:?}")),
        }
    }
}

/// Authentication mode for cloning a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoAuthType {
    None,
    Token,
    Basic,
    Ssh,
}

impl RepoAuthType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Token => "token",
            Self::Basic => "basic",
            Self::Ssh => "ssh",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "none" => Ok(Self::None),
            "token" => Ok(Self::Token),
            "basic" => Ok(Self::Basic),
            "ssh" => Ok(Self::Ssh),
            other => Err(format!("unknown auth type {other:?}")),
        }
    }
}

/// External Git repository feeding the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub branch: String,
    pub repo_type: String,
    pub auth_type: RepoAuthType,
    #[serde(skip_serializing, default)]
    pub auth_secret: Option<String>,
    pub status: RepositoryStatus,
    pub error_message: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub template_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Install lifecycle of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    Available,
    Pending,
    Creating,
    Installed,
    Failed,
}

impl InstallStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Installed => "installed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "available" => Ok(Self::Available),
            "pending" => Ok(Self::Pending),
            "creating" => Ok(Self::Creating),
            "installed" => Ok(Self::Installed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown install status {other:?}")),
        }
    }
}

/// One parsed catalog entry, scoped to its owning repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    pub app_type: String,
    pub icon_url: Option<String>,
    /// JSON-encoded copy of the parsed manifest. Stored, never executed.
    pub manifest: Value,
    pub tags: Vec<String>,
    pub install_count: u64,
    pub install_status: InstallStatus,
}

/// Installed template usable for session creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub name: TemplateName,
    pub display_name: String,
    pub image: String,
    pub platform: String,
    pub app_type: String,
    pub manifest: Value,
    pub created_at: DateTime<Utc>,
}

/// Query filters for catalog listing.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub category: Option<String>,
    pub search: Option<String>,
    pub tags: Vec<String>,
    /// `name` (default) or `installs`.
    pub sort: Option<String>,
}

/// Agent registry persistence.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Inserts or refreshes the agent row at registration time.
    async fn upsert_registration(
        &self,
        agent_id: &AgentId,
        platform: &str,
        region: Option<&str>,
        capacity: &AgentCapacity,
    ) -> StoreResult<()>;

    async fn set_status(&self, agent_id: &AgentId, status: AgentStatus) -> StoreResult<()>;

    async fn set_heartbeat(&self, agent_id: &AgentId, at: DateTime<Utc>) -> StoreResult<()>;

    async fn get(&self, agent_id: &AgentId) -> StoreResult<Option<AgentRecord>>;

    async fn list(&self) -> StoreResult<Vec<AgentRecord>>;

    async fn list_online(&self) -> StoreResult<Vec<AgentRecord>>;

    /// Recomputes `active_sessions` from the sessions table (invariant:
    /// counter equals the count of non-terminal sessions bound to the
    /// agent).
    async fn recount_active_sessions(&self, agent_id: &AgentId) -> StoreResult<u64>;
}

/// Session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a new session; a duplicate name is a conflict.
    async fn insert(&self, session: &SessionRecord) -> StoreResult<()>;

    async fn get(&self, name: &SessionName) -> StoreResult<Option<SessionRecord>>;

    /// Lists sessions, optionally scoped to one user.
    async fn list(&self, user: Option<&UserId>) -> StoreResult<Vec<SessionRecord>>;

    /// Writes state and optional detail message.
    async fn set_state(
        &self,
        name: &SessionName,
        state: SessionState,
        message: Option<&str>,
    ) -> StoreResult<()>;

    /// Records runtime endpoints reported by the agent.
    async fn set_endpoints(
        &self,
        name: &SessionName,
        url: Option<&str>,
        pod_name: Option<&str>,
    ) -> StoreResult<()>;

    async fn touch_activity(&self, name: &SessionName, at: DateTime<Utc>) -> StoreResult<()>;

    /// Sums resources over the user's non-terminal sessions.
    async fn usage_for_user(&self, user: &UserId) -> StoreResult<ResourceUsage>;

    /// Sums resources over non-terminal sessions bound to the agent.
    async fn usage_for_agent(&self, agent_id: &AgentId) -> StoreResult<ResourceUsage>;
}

/// Durable command persistence.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Persists a new command with status `pending`.
    async fn insert(&self, command: NewCommand) -> StoreResult<CommandRecord>;

    async fn get(&self, command_id: Uuid) -> StoreResult<Option<CommandRecord>>;

    /// Pending commands for one agent, FIFO by creation time.
    async fn pending_for_agent(&self, agent_id: &AgentId) -> StoreResult<Vec<CommandRecord>>;

    /// Distinct agent ids that have at least one pending command.
    async fn agents_with_pending(&self) -> StoreResult<Vec<AgentId>>;

    /// Attempts a monotonic status advance. Stamps the transition
    /// timestamp and, for failures, the error message. Never moves a
    /// status backwards.
    async fn advance_status(
        &self,
        command_id: Uuid,
        target: CommandStatus,
        error_message: Option<&str>,
    ) -> StoreResult<StatusAdvance>;
}

/// Repository persistence.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn insert(&self, repo: &RepositoryRecord) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<RepositoryRecord>>;

    async fn list(&self) -> StoreResult<Vec<RepositoryRecord>>;

    /// Deletes the repository; catalog entries cascade.
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;

    /// Atomically transitions to `syncing` unless a sync is already in
    /// flight. Returns false when the repository is missing or busy; this
    /// is the per-repository sync serialization point.
    async fn try_begin_sync(&self, id: Uuid) -> StoreResult<bool>;

    /// Records a finished sync (`synced` with counts, or `failed` with a
    /// message).
    async fn finish_sync(
        &self,
        id: Uuid,
        status: RepositoryStatus,
        error_message: Option<&str>,
        template_count: u64,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Catalog, installed templates, and favorites.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Replaces every entry owned by `repository_id` with `entries`, in one
    /// transaction. A failed insert rolls the whole sync back.
    async fn replace_for_repository(
        &self,
        repository_id: Uuid,
        entries: &[CatalogEntry],
    ) -> StoreResult<()>;

    async fn get_entry(&self, id: Uuid) -> StoreResult<Option<CatalogEntry>>;

    async fn list_entries(&self, filter: &CatalogFilter) -> StoreResult<Vec<CatalogEntry>>;

    async fn set_install_status(&self, id: Uuid, status: InstallStatus) -> StoreResult<()>;

    async fn increment_install_count(&self, id: Uuid) -> StoreResult<()>;

    /// Installs (or refreshes) a concrete template.
    async fn put_template(&self, template: &TemplateRecord) -> StoreResult<()>;

    async fn get_template(&self, name: &TemplateName) -> StoreResult<Option<TemplateRecord>>;

    async fn list_templates(&self) -> StoreResult<Vec<TemplateRecord>>;

    async fn delete_template(&self, name: &TemplateName) -> StoreResult<bool>;

    async fn add_favorite(&self, user: &UserId, template: &TemplateName) -> StoreResult<()>;

    async fn remove_favorite(&self, user: &UserId, template: &TemplateName) -> StoreResult<bool>;

    async fn list_favorites(&self, user: &UserId) -> StoreResult<Vec<TemplateName>>;
}

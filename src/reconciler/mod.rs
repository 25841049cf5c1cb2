//! Session reconciliation: user intent in, valid transitions and agent
//! commands out.
//!
//! The reconciler is the only writer of session state. API intent
//! (`create`, `hibernate`, `wake`, `delete`) becomes durable commands for a
//! selected agent; agent acknowledgments flow back through
//! [`SessionReconciler::handle_agent_frame`] and drive the cached state
//! forward.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dispatcher::{CommandDispatcher, DispatchError};
use crate::domain::{
    AgentId, CommandAction, CommandStatus, ResourceSpec, SessionName, SessionState, TemplateName,
    UserId, generate_session_name,
};
use crate::error::ApiError;
use crate::hub::AgentHub;
use crate::protocol::{AgentFrame, CompletionResult, StatusPayload};
use crate::reposync::manifest::TemplateManifest;
use crate::storage::{
    AgentStore, CatalogStore, CommandRecord, InstallStatus, NewCommand, SessionRecord,
    SessionStore, TemplateRecord,
};

pub mod quota;
pub mod selection;

pub use quota::QuotaPolicy;

/// How a `create` names its template.
#[derive(Debug, Clone)]
pub enum TemplateRef {
    Name(TemplateName),
    /// Catalog entry id; subject to the install self-heal probe.
    Application(Uuid),
}

/// Parsed, validated create request.
#[derive(Debug, Clone)]
pub struct CreateSessionSpec {
    pub user: UserId,
    pub template: TemplateRef,
    pub resources: ResourceSpec,
    pub namespace: Option<String>,
    pub persistent_home: bool,
    pub idle_timeout_secs: Option<u64>,
    pub max_duration_secs: Option<u64>,
    pub tags: Vec<String>,
}

/// State-changing intents addressable at an existing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIntent {
    Hibernate,
    Wake,
    Delete,
}

impl SessionIntent {
    /// Maps a PATCH target state onto an intent.
    pub fn from_target_state(state: SessionState) -> Result<Self, ApiError> {
        match state {
            SessionState::Hibernated => Ok(Self::Hibernate),
            SessionState::Running => Ok(Self::Wake),
            SessionState::Terminated => Ok(Self::Delete),
            other => Err(ApiError::Validation(format!(
                "cannot request transition to {}",
                other.as_str()
            ))),
        }
    }
}

/// Per-item error in a batch response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchItemError {
    pub name: String,
    pub error: String,
}

/// Batch result; 200 even on partial failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<BatchItemError>,
}

/// Translates intent into transitions and commands, and folds agent
/// feedback back into the stores.
///
/// Cheap to clone: every dependency sits behind an `Arc`.
#[derive(Clone)]
pub struct SessionReconciler {
    sessions: Arc<dyn SessionStore>,
    agents: Arc<dyn AgentStore>,
    catalog: Arc<dyn CatalogStore>,
    dispatcher: Arc<CommandDispatcher>,
    hub: Arc<AgentHub>,
    quota: QuotaPolicy,
    default_namespace: String,
}

impl SessionReconciler {
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        agents: Arc<dyn AgentStore>,
        catalog: Arc<dyn CatalogStore>,
        dispatcher: Arc<CommandDispatcher>,
        hub: Arc<AgentHub>,
        quota: QuotaPolicy,
        default_namespace: String,
    ) -> Self {
        Self {
            sessions,
            agents,
            catalog,
            dispatcher,
            hub,
            quota,
            default_namespace,
        }
    }

    /// Creates a session: template resolution, quota admission, agent
    /// selection, then a `start_session` command to the chosen agent.
    ///
    /// Quota rejection is the one synchronous failure an API caller sees;
    /// everything after acceptance is asynchronous.
    #[instrument(skip(self, spec), fields(user = %spec.user))]
    pub async fn create_session(
        &self,
        spec: CreateSessionSpec,
    ) -> Result<SessionRecord, ApiError> {
        let template = self.resolve_template(&spec.template).await?;

        let used = self.sessions.usage_for_user(&spec.user).await?;
        self.quota
            .check(&spec.user, &used, &spec.resources)
            .map_err(|violation| ApiError::Quota(violation.message()))?;

        let candidates = self.agents.list_online().await?;
        let mut usages = HashMap::new();
        for candidate in &candidates {
            let usage = self.sessions.usage_for_agent(&candidate.agent_id).await?;
            usages.insert(candidate.agent_id.clone(), usage);
        }
        let selected = selection::select_agent(
            &candidates,
            &template.platform,
            &spec.resources,
            |agent| usages.get(&agent.agent_id).copied().unwrap_or_default(),
        )
        .cloned();

        let name = generate_session_name(&spec.user, &template.name);
        let now = Utc::now();
        let mut record = SessionRecord {
            name: name.clone(),
            user: spec.user.clone(),
            template: template.name.clone(),
            state: SessionState::Pending,
            namespace: spec
                .namespace
                .clone()
                .unwrap_or_else(|| self.default_namespace.clone()),
            platform: template.platform.clone(),
            url: None,
            pod_name: None,
            resources: spec.resources,
            persistent_home: spec.persistent_home,
            idle_timeout_secs: spec.idle_timeout_secs,
            max_duration_secs: spec.max_duration_secs,
            tags: spec.tags.clone(),
            state_message: None,
            created_at: now,
            last_activity: now,
            agent_id: None,
        };

        let Some(agent) = selected else {
            let reason = format!(
                "no online agent matches platform {:?} with sufficient capacity",
                template.platform
            );
            record.state = SessionState::Failed;
            record.state_message = Some(reason.clone());
            self.sessions.insert(&record).await?;
            warn!(session = %record.name, "session creation failed: {reason}");
            return Err(ApiError::Unavailable(format!("{reason}; retry later")));
        };

        record.agent_id = Some(agent.agent_id.clone());
        self.sessions.insert(&record).await?;
        self.agents.recount_active_sessions(&agent.agent_id).await?;

        let payload = start_payload(&record, &template);
        let dispatched = self
            .dispatcher
            .dispatch(NewCommand {
                command_id: Uuid::new_v4(),
                agent_id: agent.agent_id.clone(),
                session_id: Some(record.name.clone()),
                action: CommandAction::StartSession,
                payload,
            })
            .await;

        if let Err(err) = dispatched {
            let reason = match &err {
                DispatchError::QueueFull { .. } => "control plane is overloaded".to_string(),
                DispatchError::Store(e) => format!("command persistence failed: {e}"),
            };
            self.sessions
                .set_state(&record.name, SessionState::Failed, Some(&reason))
                .await?;
            self.agents.recount_active_sessions(&agent.agent_id).await?;
            return Err(ApiError::Unavailable(format!("{reason}; retry later")));
        }

        info!(session = %record.name, agent = %agent.agent_id, "session accepted");
        Ok(record)
    }

    /// Applies one state-changing intent to an existing session.
    #[instrument(skip(self), fields(session = %name))]
    pub async fn transition(
        &self,
        name: &SessionName,
        intent: SessionIntent,
    ) -> Result<SessionRecord, ApiError> {
        let session = self
            .sessions
            .get(name)
            .await?
            .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;

        match intent {
            SessionIntent::Hibernate => {
                if session.state != SessionState::Running {
                    return Err(ApiError::Conflict(format!(
                        "cannot hibernate a session in state {}",
                        session.state.as_str()
                    )));
                }
                let agent = bound_agent(&session)?;
                // Park the state before emitting: the agent's completion
                // may arrive immediately and must not be overwritten.
                self.sessions
                    .set_state(name, SessionState::Pending, Some("hibernating"))
                    .await?;
                if let Err(err) = self
                    .emit_session_command(&session, &agent, CommandAction::HibernateSession)
                    .await
                {
                    self.sessions
                        .set_state(name, SessionState::Running, None)
                        .await?;
                    return Err(err);
                }
            }
            SessionIntent::Wake => {
                if session.state != SessionState::Hibernated {
                    return Err(ApiError::Conflict(format!(
                        "cannot wake a session in state {}",
                        session.state.as_str()
                    )));
                }
                let agent = bound_agent(&session)?;
                self.sessions
                    .set_state(name, SessionState::Pending, Some("waking"))
                    .await?;
                if let Err(err) = self
                    .emit_session_command(&session, &agent, CommandAction::WakeSession)
                    .await
                {
                    self.sessions
                        .set_state(name, SessionState::Hibernated, None)
                        .await?;
                    return Err(err);
                }
            }
            SessionIntent::Delete => {
                if session.state == SessionState::Terminated {
                    return Err(ApiError::Conflict("session is already terminated".to_string()));
                }
                // Sessions that never bound an agent (failed placement)
                // have nothing to stop.
                if let Some(agent) = session.agent_id.clone() {
                    self.emit_session_command(&session, &agent, CommandAction::StopSession)
                        .await?;
                }
                self.sessions
                    .set_state(name, SessionState::Terminated, None)
                    .await?;
                if let Some(agent) = &session.agent_id {
                    self.agents.recount_active_sessions(agent).await?;
                }
            }
        }

        self.sessions
            .get(name)
            .await?
            .ok_or_else(|| ApiError::NotFound("session not found".to_string()))
    }

    /// Bulk intent application; per-item failures are collected, never
    /// fatal.
    pub async fn batch(&self, intent: SessionIntent, names: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            total: names.len(),
            succeeded: 0,
            failed: 0,
            errors: Vec::new(),
        };

        for raw in names {
            let result = match SessionName::try_new(raw.clone()) {
                Ok(name) => self.transition(&name, intent).await.map(|_| ()),
                Err(_) => Err(ApiError::NotFound("session not found".to_string())),
            };
            match result {
                Ok(()) => outcome.succeeded += 1,
                Err(err) => {
                    outcome.failed += 1;
                    outcome.errors.push(BatchItemError {
                        name: raw.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        outcome
    }

    /// Routes one inbound agent frame. Heartbeats go to the hub; command
    /// acknowledgments advance command status and fold results into
    /// session state.
    pub async fn handle_agent_frame(
        &self,
        agent_id: &AgentId,
        frame: AgentFrame,
    ) -> Result<(), ApiError> {
        match frame {
            AgentFrame::Heartbeat(hb) => {
                self.hub.heartbeat(agent_id, hb.timestamp).await?;
            }
            AgentFrame::Ack(ack) => {
                self.dispatcher
                    .update_status(ack.command_id, CommandStatus::Acknowledged, None)
                    .await?;
            }
            AgentFrame::Complete(complete) => {
                let advanced = self
                    .dispatcher
                    .update_status(complete.command_id, CommandStatus::Completed, None)
                    .await?;
                if let Some(record) = advanced {
                    self.apply_completion(&record, &complete.result).await?;
                }
            }
            AgentFrame::Failed(failed) => {
                let advanced = self
                    .dispatcher
                    .update_status(failed.command_id, CommandStatus::Failed, Some(&failed.error))
                    .await?;
                if let Some(record) = advanced {
                    self.apply_failure(&record, &failed.error).await?;
                }
            }
            AgentFrame::Status(status) => {
                self.apply_status_report(agent_id, &status).await?;
            }
            AgentFrame::Register(_) => {
                // The handshake happens once at connect; a repeat is noise.
                warn!(agent_id = %agent_id, "ignoring register frame on established connection");
            }
        }
        Ok(())
    }

    /// Materializes a catalog entry as an installed template and notifies
    /// online agents with a durable `update_template` command.
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn install_catalog_entry(&self, entry_id: Uuid) -> Result<TemplateRecord, ApiError> {
        let entry = self
            .catalog
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("catalog entry not found".to_string()))?;

        let manifest: TemplateManifest = serde_json::from_value(entry.manifest.clone())
            .map_err(|e| ApiError::Validation(format!("catalog entry manifest invalid: {e}")))?;
        let name = TemplateName::try_new(entry.name.clone())
            .map_err(|e| ApiError::Validation(format!("catalog entry name invalid: {e}")))?;

        self.catalog
            .set_install_status(entry_id, InstallStatus::Creating)
            .await?;

        let template = TemplateRecord {
            name: name.clone(),
            display_name: entry.display_name.clone(),
            image: manifest.spec.image.clone(),
            platform: manifest.spec.platform.clone(),
            app_type: entry.app_type.clone(),
            manifest: entry.manifest.clone(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.catalog.put_template(&template).await {
            self.catalog
                .set_install_status(entry_id, InstallStatus::Failed)
                .await?;
            return Err(err.into());
        }

        self.catalog
            .set_install_status(entry_id, InstallStatus::Installed)
            .await?;
        self.catalog.increment_install_count(entry_id).await?;

        self.notify_template_change(CommandAction::UpdateTemplate, &name, Some(&entry.manifest))
            .await;

        info!(template = %name, "catalog entry installed");
        Ok(template)
    }

    /// Removes an installed template and notifies online agents.
    pub async fn uninstall_template(&self, name: &TemplateName) -> Result<(), ApiError> {
        if !self.catalog.delete_template(name).await? {
            return Err(ApiError::NotFound("template not found".to_string()));
        }
        self.notify_template_change(CommandAction::DeleteTemplate, name, None)
            .await;
        Ok(())
    }

    /// Durable template-change fanout. Existing sessions are untouched;
    /// agents pick the new definition up for future starts.
    async fn notify_template_change(
        &self,
        action: CommandAction,
        name: &TemplateName,
        manifest: Option<&Value>,
    ) {
        let online = match self.agents.list_online().await {
            Ok(online) => online,
            Err(err) => {
                warn!(error = %err, "template fanout skipped: agent listing failed");
                return;
            }
        };
        for agent in online {
            let mut payload = Map::new();
            payload.insert("template".into(), Value::String(name.to_string()));
            if let Some(manifest) = manifest {
                payload.insert("manifest".into(), manifest.clone());
            }
            let result = self
                .dispatcher
                .dispatch(NewCommand {
                    command_id: Uuid::new_v4(),
                    agent_id: agent.agent_id.clone(),
                    session_id: None,
                    action,
                    payload,
                })
                .await;
            if let Err(err) = result {
                warn!(agent = %agent.agent_id, error = %err, "template fanout dispatch failed");
            }
        }
    }

    async fn resolve_template(
        &self,
        template_ref: &TemplateRef,
    ) -> Result<TemplateRecord, ApiError> {
        match template_ref {
            TemplateRef::Name(name) => self
                .catalog
                .get_template(name)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("template {name} not found"))),
            TemplateRef::Application(entry_id) => {
                let entry = self
                    .catalog
                    .get_entry(*entry_id)
                    .await?
                    .ok_or_else(|| ApiError::NotFound("application not found".to_string()))?;
                let name = TemplateName::try_new(entry.name.clone())
                    .map_err(|e| ApiError::Validation(format!("application name invalid: {e}")))?;

                match self.catalog.get_template(&name).await? {
                    Some(template) => {
                        // Self-heal: the install finished but its status
                        // write was lost.
                        if matches!(
                            entry.install_status,
                            InstallStatus::Pending | InstallStatus::Creating
                        ) {
                            info!(template = %name, "repairing stuck install status");
                            self.catalog
                                .set_install_status(*entry_id, InstallStatus::Installed)
                                .await?;
                        }
                        Ok(template)
                    }
                    None => {
                        if matches!(
                            entry.install_status,
                            InstallStatus::Pending | InstallStatus::Creating
                        ) {
                            return Err(ApiError::Unavailable(
                                "template install in progress; retry shortly".to_string(),
                            ));
                        }
                        // Marked installed but the template row is gone:
                        // kick off a reinstall and tell the caller to retry.
                        self.catalog
                            .set_install_status(*entry_id, InstallStatus::Creating)
                            .await?;
                        let this = self.clone();
                        let entry_id = *entry_id;
                        tokio::spawn(async move {
                            if let Err(err) = this.install_catalog_entry(entry_id).await {
                                warn!(error = %err, "automatic template reinstall failed");
                            }
                        });
                        Err(ApiError::Unavailable(
                            "template missing; reinstalling, retry shortly".to_string(),
                        ))
                    }
                }
            }
        }
    }

    async fn emit_session_command(
        &self,
        session: &SessionRecord,
        agent: &AgentId,
        action: CommandAction,
    ) -> Result<CommandRecord, ApiError> {
        let mut payload = Map::new();
        payload.insert("sessionId".into(), Value::String(session.name.to_string()));
        payload.insert("namespace".into(), Value::String(session.namespace.clone()));

        self.dispatcher
            .dispatch(NewCommand {
                command_id: Uuid::new_v4(),
                agent_id: agent.clone(),
                session_id: Some(session.name.clone()),
                action,
                payload,
            })
            .await
            .map_err(|err| match err {
                DispatchError::QueueFull { .. } => {
                    ApiError::Unavailable("control plane is overloaded; retry later".to_string())
                }
                DispatchError::Store(e) => ApiError::from(e),
            })
    }

    async fn apply_completion(
        &self,
        command: &CommandRecord,
        result: &CompletionResult,
    ) -> Result<(), ApiError> {
        let Some(session_name) = &command.session_id else {
            return Ok(());
        };

        match command.action {
            CommandAction::StartSession | CommandAction::WakeSession => {
                if let Some(url) = &result.session_url {
                    self.sessions
                        .set_endpoints(session_name, Some(url), result.pod_name.as_deref())
                        .await?;
                    self.sessions
                        .set_state(session_name, SessionState::Running, None)
                        .await?;
                    self.sessions.touch_activity(session_name, Utc::now()).await?;
                } else {
                    // No URL means nothing to hand to the client yet; stay
                    // pending with an explanation.
                    warn!(session = %session_name, "completion without session URL");
                    self.sessions
                        .set_state(
                            session_name,
                            SessionState::Pending,
                            Some("agent completed start without a session URL"),
                        )
                        .await?;
                }
            }
            CommandAction::HibernateSession => {
                self.sessions
                    .set_state(session_name, SessionState::Hibernated, None)
                    .await?;
            }
            CommandAction::StopSession => {
                // Delete already moved the session to terminated; this is
                // the agent confirming cleanup.
                self.sessions
                    .set_state(session_name, SessionState::Terminated, None)
                    .await?;
            }
            CommandAction::UpdateTemplate | CommandAction::DeleteTemplate => {}
        }

        self.agents.recount_active_sessions(&command.agent_id).await?;
        Ok(())
    }

    async fn apply_failure(&self, command: &CommandRecord, error: &str) -> Result<(), ApiError> {
        let Some(session_name) = &command.session_id else {
            return Ok(());
        };

        match command.action {
            CommandAction::StartSession
            | CommandAction::WakeSession
            | CommandAction::HibernateSession => {
                warn!(session = %session_name, error, "agent reported command failure");
                self.sessions
                    .set_state(session_name, SessionState::Failed, Some(error))
                    .await?;
            }
            CommandAction::StopSession => {
                // The session is already terminated from the caller's view;
                // record the cleanup failure without resurrecting it.
                warn!(session = %session_name, error, "stop failed on agent; session stays terminated");
            }
            CommandAction::UpdateTemplate | CommandAction::DeleteTemplate => {}
        }

        self.agents.recount_active_sessions(&command.agent_id).await?;
        Ok(())
    }

    /// Unsolicited status reports repair stale caches: a session the store
    /// believes is pending but the runtime reports `Running` is advanced,
    /// and endpoints/activity are refreshed.
    async fn apply_status_report(
        &self,
        agent_id: &AgentId,
        status: &StatusPayload,
    ) -> Result<(), ApiError> {
        let Some(session) = self.sessions.get(&status.session_id).await? else {
            warn!(agent = %agent_id, session = %status.session_id, "status for unknown session");
            return Ok(());
        };

        if status.url.is_some() {
            self.sessions
                .set_endpoints(&status.session_id, status.url.as_deref(), None)
                .await?;
        }
        if status.phase.eq_ignore_ascii_case("running") && session.state != SessionState::Running {
            info!(session = %status.session_id, "repairing state from agent status report");
            self.sessions
                .set_state(&status.session_id, SessionState::Running, None)
                .await?;
            self.agents.recount_active_sessions(agent_id).await?;
        }
        if let Some(last_activity) = status.last_activity {
            self.sessions
                .touch_activity(&status.session_id, last_activity)
                .await?;
        }
        Ok(())
    }
}

fn bound_agent(session: &SessionRecord) -> Result<AgentId, ApiError> {
    session
        .agent_id
        .clone()
        .ok_or_else(|| ApiError::Conflict("session has no bound agent".to_string()))
}

fn start_payload(session: &SessionRecord, template: &TemplateRecord) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("sessionId".into(), Value::String(session.name.to_string()));
    payload.insert("user".into(), Value::String(session.user.to_string()));
    payload.insert("namespace".into(), Value::String(session.namespace.clone()));
    payload.insert("image".into(), Value::String(template.image.clone()));
    payload.insert("appType".into(), Value::String(template.app_type.clone()));
    payload.insert(
        "cpuMillis".into(),
        Value::from(session.resources.cpu_millis),
    );
    payload.insert(
        "memoryBytes".into(),
        Value::from(session.resources.memory_bytes),
    );
    payload.insert(
        "persistentHome".into(),
        Value::Bool(session.persistent_home),
    );
    if let Some(idle) = session.idle_timeout_secs {
        payload.insert("idleTimeoutSecs".into(), Value::from(idle));
    }
    if let Some(max) = session.max_duration_secs {
        payload.insert("maxDurationSecs".into(), Value::from(max));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConnection;
    use crate::dispatcher::DispatcherConfig;
    use crate::domain::{AgentCapacity, UserQuota};
    use crate::hub::channel::fake::FakeChannel;
    use crate::protocol::{AckPayload, CompletePayload, FailedPayload};
    use crate::storage::{
        CommandStore, RepoAuthType, RepositoryRecord, RepositoryStatus, RepositoryStore,
        SqliteAgentStore, SqliteCatalogStore, SqliteCommandStore, SqliteRepositoryStore,
        SqliteSessionStore,
    };

    const GI: u64 = 1024 * 1024 * 1024;

    struct Fixture {
        reconciler: Arc<SessionReconciler>,
        sessions: Arc<SqliteSessionStore>,
        agents: Arc<SqliteAgentStore>,
        catalog: Arc<SqliteCatalogStore>,
        commands: Arc<SqliteCommandStore>,
        hub: Arc<AgentHub>,
        repos: Arc<SqliteRepositoryStore>,
    }

    async fn fixture(quota: UserQuota) -> Fixture {
        let db = DatabaseConnection::initialize_in_memory().await.unwrap();
        let sessions = Arc::new(SqliteSessionStore::new(db.clone()));
        let agents = Arc::new(SqliteAgentStore::new(db.clone()));
        let catalog = Arc::new(SqliteCatalogStore::new(db.clone()));
        let commands = Arc::new(SqliteCommandStore::new(db.clone()));
        let repos = Arc::new(SqliteRepositoryStore::new(db));
        let hub = Arc::new(AgentHub::new(agents.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            commands.clone(),
            Arc::clone(&hub),
            DispatcherConfig::default(),
        ));
        let reconciler = Arc::new(SessionReconciler::new(
            sessions.clone(),
            agents.clone(),
            catalog.clone(),
            dispatcher,
            Arc::clone(&hub),
            QuotaPolicy::new(quota, HashMap::new()),
            "default".to_string(),
        ));
        Fixture {
            reconciler,
            sessions,
            agents,
            catalog,
            commands,
            hub,
            repos,
        }
    }

    async fn seed_template(fixture: &Fixture, name: &str) {
        fixture
            .catalog
            .put_template(&TemplateRecord {
                name: TemplateName::try_new(name).unwrap(),
                display_name: name.to_string(),
                image: format!("ghcr.io/example/{name}:latest"),
                platform: "kubernetes".into(),
                app_type: "desktop".into(),
                manifest: serde_json::json!({"kind": "Template"}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn seed_online_agent(fixture: &Fixture, id: &str) -> AgentId {
        let agent_id = AgentId::try_new(id).unwrap();
        fixture
            .agents
            .upsert_registration(&agent_id, "kubernetes", None, &AgentCapacity::default())
            .await
            .unwrap();
        fixture
            .hub
            .register(agent_id.clone(), Arc::new(FakeChannel::new()))
            .await
            .unwrap();
        agent_id
    }

    fn create_spec(user: &str, template: &str, memory: u64, cpu: u64) -> CreateSessionSpec {
        CreateSessionSpec {
            user: UserId::try_new(user).unwrap(),
            template: TemplateRef::Name(TemplateName::try_new(template).unwrap()),
            resources: ResourceSpec {
                cpu_millis: cpu,
                memory_bytes: memory,
            },
            namespace: None,
            persistent_home: false,
            idle_timeout_secs: None,
            max_duration_secs: None,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_binds_agent_and_emits_start_command() {
        let fixture = fixture(UserQuota::default()).await;
        seed_template(&fixture, "firefox").await;
        let agent_id = seed_online_agent(&fixture, "k8s-1").await;

        let record = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", 2 * GI, 1000))
            .await
            .unwrap();

        assert_eq!(record.state, SessionState::Pending);
        assert_eq!(record.agent_id.as_ref(), Some(&agent_id));
        assert!(record.name.as_str().starts_with("u1-firefox-"));

        let pending = fixture.commands.pending_for_agent(&agent_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action, CommandAction::StartSession);
        assert_eq!(
            pending[0].payload.get("image").and_then(Value::as_str),
            Some("ghcr.io/example/firefox:latest")
        );
        assert_eq!(pending[0].session_id.as_ref(), Some(&record.name));

        // Counter reflects the bound session.
        let agent = fixture.agents.get(&agent_id).await.unwrap().unwrap();
        assert_eq!(agent.active_sessions, 1);
    }

    #[tokio::test]
    async fn create_with_no_online_agent_fails_the_session() {
        let fixture = fixture(UserQuota::default()).await;
        seed_template(&fixture, "firefox").await;

        let err = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", GI, 500))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)));

        // The session exists, marked failed, with a reason.
        let sessions = fixture
            .sessions
            .list(Some(&UserId::try_new("u1").unwrap()))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Failed);
        assert!(sessions[0].state_message.as_deref().unwrap().contains("no online agent"));
    }

    #[tokio::test]
    async fn create_over_quota_is_rejected_without_side_effects() {
        let quota = UserQuota {
            max_cpu_millis: 8000,
            max_memory_bytes: 4 * GI,
            max_sessions: 10,
        };
        let fixture = fixture(quota).await;
        seed_template(&fixture, "firefox").await;
        let agent_id = seed_online_agent(&fixture, "k8s-1").await;

        fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", 2 * GI, 500))
            .await
            .unwrap();

        // 2Gi used + 3Gi requested > 4Gi quota.
        let err = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", 3 * GI, 500))
            .await
            .unwrap_err();
        let ApiError::Quota(message) = err else {
            panic!("expected quota error");
        };
        assert!(message.contains("memory"));

        // No second session, no second command.
        let sessions = fixture
            .sessions
            .list(Some(&UserId::try_new("u1").unwrap()))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(
            fixture.commands.pending_for_agent(&agent_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn unknown_template_is_not_found() {
        let fixture = fixture(UserQuota::default()).await;
        let err = fixture
            .reconciler
            .create_session(create_spec("u1", "missing", GI, 500))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn complete_with_url_advances_session_to_running() {
        let fixture = fixture(UserQuota::default()).await;
        seed_template(&fixture, "firefox").await;
        let agent_id = seed_online_agent(&fixture, "k8s-1").await;

        let record = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", GI, 500))
            .await
            .unwrap();
        let command = fixture.commands.pending_for_agent(&agent_id).await.unwrap()[0].clone();

        fixture
            .reconciler
            .handle_agent_frame(
                &agent_id,
                AgentFrame::Ack(AckPayload {
                    command_id: command.command_id,
                }),
            )
            .await
            .unwrap();
        fixture
            .reconciler
            .handle_agent_frame(
                &agent_id,
                AgentFrame::Complete(CompletePayload {
                    command_id: command.command_id,
                    result: CompletionResult {
                        session_url: Some("http://stream.example/u1".into()),
                        pod_name: Some("u1-firefox-pod".into()),
                        extra: Map::new(),
                    },
                }),
            )
            .await
            .unwrap();

        let session = fixture.sessions.get(&record.name).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Running);
        assert_eq!(session.url.as_deref(), Some("http://stream.example/u1"));
        assert_eq!(session.pod_name.as_deref(), Some("u1-firefox-pod"));

        let stored = fixture.commands.get(command.command_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert!(stored.acknowledged_at.is_some());
    }

    #[tokio::test]
    async fn complete_without_url_keeps_session_pending() {
        let fixture = fixture(UserQuota::default()).await;
        seed_template(&fixture, "firefox").await;
        let agent_id = seed_online_agent(&fixture, "k8s-1").await;

        let record = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", GI, 500))
            .await
            .unwrap();
        let command = fixture.commands.pending_for_agent(&agent_id).await.unwrap()[0].clone();

        fixture
            .reconciler
            .handle_agent_frame(
                &agent_id,
                AgentFrame::Complete(CompletePayload {
                    command_id: command.command_id,
                    result: CompletionResult::default(),
                }),
            )
            .await
            .unwrap();

        let session = fixture.sessions.get(&record.name).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Pending);
        assert!(session.state_message.as_deref().unwrap().contains("URL"));
    }

    #[tokio::test]
    async fn failed_start_fails_the_session_with_reason() {
        let fixture = fixture(UserQuota::default()).await;
        seed_template(&fixture, "firefox").await;
        let agent_id = seed_online_agent(&fixture, "k8s-1").await;

        let record = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", GI, 500))
            .await
            .unwrap();
        let command = fixture.commands.pending_for_agent(&agent_id).await.unwrap()[0].clone();

        fixture
            .reconciler
            .handle_agent_frame(
                &agent_id,
                AgentFrame::Failed(FailedPayload {
                    command_id: command.command_id,
                    error: "image pull backoff".into(),
                }),
            )
            .await
            .unwrap();

        let session = fixture.sessions.get(&record.name).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.state_message.as_deref(), Some("image pull backoff"));

        // The failed session frees the agent's slot.
        let agent = fixture.agents.get(&agent_id).await.unwrap().unwrap();
        assert_eq!(agent.active_sessions, 0);
    }

    #[tokio::test]
    async fn hibernate_requires_running_state() {
        let fixture = fixture(UserQuota::default()).await;
        seed_template(&fixture, "firefox").await;
        let agent_id = seed_online_agent(&fixture, "k8s-1").await;

        let record = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", GI, 500))
            .await
            .unwrap();

        // Still pending: hibernate is a conflict, and no command is
        // emitted.
        let before = fixture.commands.pending_for_agent(&agent_id).await.unwrap().len();
        let err = fixture
            .reconciler
            .transition(&record.name, SessionIntent::Hibernate)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        assert_eq!(
            fixture.commands.pending_for_agent(&agent_id).await.unwrap().len(),
            before
        );

        // Once running, hibernate emits the command and parks the state.
        fixture
            .sessions
            .set_state(&record.name, SessionState::Running, None)
            .await
            .unwrap();
        let updated = fixture
            .reconciler
            .transition(&record.name, SessionIntent::Hibernate)
            .await
            .unwrap();
        assert_eq!(updated.state, SessionState::Pending);
        let pending = fixture.commands.pending_for_agent(&agent_id).await.unwrap();
        assert!(
            pending
                .iter()
                .any(|c| c.action == CommandAction::HibernateSession)
        );
    }

    #[tokio::test]
    async fn delete_terminates_immediately_and_emits_stop() {
        let fixture = fixture(UserQuota::default()).await;
        seed_template(&fixture, "firefox").await;
        let agent_id = seed_online_agent(&fixture, "k8s-1").await;

        let record = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", GI, 500))
            .await
            .unwrap();

        let updated = fixture
            .reconciler
            .transition(&record.name, SessionIntent::Delete)
            .await
            .unwrap();
        assert_eq!(updated.state, SessionState::Terminated);

        let pending = fixture.commands.pending_for_agent(&agent_id).await.unwrap();
        assert!(pending.iter().any(|c| c.action == CommandAction::StopSession));

        // Double delete is a conflict.
        let err = fixture
            .reconciler
            .transition(&record.name, SessionIntent::Delete)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn batch_reports_partial_failure() {
        let fixture = fixture(UserQuota::default()).await;
        seed_template(&fixture, "firefox").await;
        seed_online_agent(&fixture, "k8s-1").await;

        let s1 = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", GI, 500))
            .await
            .unwrap();
        let s2 = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", GI, 500))
            .await
            .unwrap();
        for name in [&s1.name, &s2.name] {
            fixture
                .sessions
                .set_state(name, SessionState::Running, None)
                .await
                .unwrap();
        }

        let outcome = fixture
            .reconciler
            .batch(
                SessionIntent::Hibernate,
                &[
                    s1.name.to_string(),
                    s2.name.to_string(),
                    "does-not-exist".to_string(),
                ],
            )
            .await;

        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].name, "does-not-exist");
        assert_eq!(outcome.errors[0].error, "session not found");
    }

    #[tokio::test]
    async fn status_report_repairs_stale_state() {
        let fixture = fixture(UserQuota::default()).await;
        seed_template(&fixture, "firefox").await;
        let agent_id = seed_online_agent(&fixture, "k8s-1").await;

        let record = fixture
            .reconciler
            .create_session(create_spec("u1", "firefox", GI, 500))
            .await
            .unwrap();

        fixture
            .reconciler
            .handle_agent_frame(
                &agent_id,
                AgentFrame::Status(StatusPayload {
                    session_id: record.name.clone(),
                    phase: "Running".into(),
                    url: Some("http://stream.example/u1".into()),
                    last_activity: Some(Utc::now()),
                }),
            )
            .await
            .unwrap();

        let session = fixture.sessions.get(&record.name).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Running);
        assert_eq!(session.url.as_deref(), Some("http://stream.example/u1"));
    }

    #[tokio::test]
    async fn application_install_probe_repairs_stuck_status() {
        let fixture = fixture(UserQuota::default()).await;
        seed_online_agent(&fixture, "k8s-1").await;

        // Catalog entry whose install completed, but the status write was
        // lost at `creating`.
        let repo = RepositoryRecord {
            id: Uuid::new_v4(),
            name: "base".into(),
            url: "https://git.example/base.git".into(),
            branch: "main".into(),
            repo_type: "template".into(),
            auth_type: RepoAuthType::None,
            auth_secret: None,
            status: RepositoryStatus::Synced,
            error_message: None,
            last_sync: None,
            template_count: 1,
            created_at: Utc::now(),
        };
        fixture.repos.insert(&repo).await.unwrap();

        let manifest = TemplateManifest::parse_yaml(
            r"
apiVersion: streaming.dev/v1
kind: Template
metadata:
  name: firefox
spec:
  image: ghcr.io/example/firefox:latest
",
        )
        .unwrap();
        let mut entry = manifest.to_catalog_entry(repo.id);
        entry.install_status = InstallStatus::Creating;
        fixture
            .catalog
            .replace_for_repository(repo.id, &[entry.clone()])
            .await
            .unwrap();
        seed_template(&fixture, "firefox").await;

        let spec = CreateSessionSpec {
            template: TemplateRef::Application(entry.id),
            ..create_spec("u1", "firefox", GI, 500)
        };
        let record = fixture.reconciler.create_session(spec).await.unwrap();
        assert_eq!(record.state, SessionState::Pending);

        // The probe repaired the stuck install record.
        let repaired = fixture.catalog.get_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(repaired.install_status, InstallStatus::Installed);
    }

    #[tokio::test]
    async fn install_materializes_template_and_notifies_agents() {
        let fixture = fixture(UserQuota::default()).await;
        let agent_id = seed_online_agent(&fixture, "k8s-1").await;

        let repo = RepositoryRecord {
            id: Uuid::new_v4(),
            name: "base".into(),
            url: "https://git.example/base.git".into(),
            branch: "main".into(),
            repo_type: "template".into(),
            auth_type: RepoAuthType::None,
            auth_secret: None,
            status: RepositoryStatus::Synced,
            error_message: None,
            last_sync: None,
            template_count: 1,
            created_at: Utc::now(),
        };
        fixture.repos.insert(&repo).await.unwrap();

        let manifest = TemplateManifest::parse_yaml(
            r"
apiVersion: streaming.dev/v1
kind: Template
metadata:
  name: blender
spec:
  image: ghcr.io/example/blender:latest
",
        )
        .unwrap();
        let entry = manifest.to_catalog_entry(repo.id);
        fixture
            .catalog
            .replace_for_repository(repo.id, &[entry.clone()])
            .await
            .unwrap();

        let template = fixture
            .reconciler
            .install_catalog_entry(entry.id)
            .await
            .unwrap();
        assert_eq!(template.name.as_str(), "blender");
        assert_eq!(template.image, "ghcr.io/example/blender:latest");

        let stored = fixture.catalog.get_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.install_status, InstallStatus::Installed);
        assert_eq!(stored.install_count, 1);

        // Durable update_template fanout to the online agent.
        let pending = fixture.commands.pending_for_agent(&agent_id).await.unwrap();
        assert!(
            pending
                .iter()
                .any(|c| c.action == CommandAction::UpdateTemplate)
        );
    }
}

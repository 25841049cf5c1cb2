//! SQLite implementation of the session store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use crate::database::DatabaseConnection;
use crate::domain::{
    AgentId, ResourceSpec, ResourceUsage, SessionName, SessionState, TemplateName, UserId,
};

use super::{SessionRecord, SessionStore, StoreError, StoreResult, corrupt, text_to_ts, ts_to_text};

const INSERT_SESSION: &str = r"
INSERT INTO sessions (
    id, user_id, template_name, state, namespace, platform, url, pod_name,
    memory, cpu, persistent_home, idle_timeout_secs, max_duration_secs,
    tags, state_message, created_at, last_activity, agent_id
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18);
";

const SELECT_SESSION: &str = "SELECT * FROM sessions WHERE id = ?1;";

const SELECT_ALL: &str = "SELECT * FROM sessions ORDER BY created_at DESC;";

const SELECT_FOR_USER: &str =
    "SELECT * FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC;";

const SET_STATE: &str = "UPDATE sessions SET state = ?2, state_message = ?3 WHERE id = ?1;";

const SET_ENDPOINTS: &str = r"
UPDATE sessions SET
    url = COALESCE(?2, url),
    pod_name = COALESCE(?3, pod_name)
WHERE id = ?1;
";

const TOUCH_ACTIVITY: &str = "UPDATE sessions SET last_activity = ?2 WHERE id = ?1;";

const USAGE_FOR_USER: &str = r"
SELECT COALESCE(SUM(cpu), 0), COALESCE(SUM(memory), 0), COUNT(*)
FROM sessions
WHERE user_id = ?1 AND state NOT IN ('terminated', 'failed');
";

const USAGE_FOR_AGENT: &str = r"
SELECT COALESCE(SUM(cpu), 0), COALESCE(SUM(memory), 0), COUNT(*)
FROM sessions
WHERE agent_id = ?1 AND state NOT IN ('terminated', 'failed');
";

/// Session rows backed by the `sessions` table.
pub struct SqliteSessionStore {
    connection: DatabaseConnection,
}

impl SqliteSessionStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<SessionRecord> {
        let name: String = row.get("id");
        let name =
            SessionName::try_new(name).map_err(|e| corrupt("sessions", format!("id: {e}")))?;
        let user: String = row.get("user_id");
        let user = UserId::try_new(user).map_err(|e| corrupt("sessions", format!("user: {e}")))?;
        let template: String = row.get("template_name");
        let template = TemplateName::try_new(template)
            .map_err(|e| corrupt("sessions", format!("template: {e}")))?;
        let state: String = row.get("state");
        let state = SessionState::parse(&state).map_err(|e| corrupt("sessions", e))?;
        let created_at_raw: String = row.get("created_at");
        let last_activity_raw: String = row.get("last_activity");
        let agent_id: Option<String> = row.get("agent_id");
        let agent_id = agent_id
            .map(|raw| {
                AgentId::try_new(raw).map_err(|e| corrupt("sessions", format!("agent_id: {e}")))
            })
            .transpose()?;
        let tags_raw: String = row.get("tags");
        let tags: Vec<String> = serde_json::from_str(&tags_raw)
            .map_err(|e| corrupt("sessions", format!("tags: {e}")))?;
        let memory: i64 = row.get("memory");
        let cpu: i64 = row.get("cpu");
        let idle_timeout: Option<i64> = row.get("idle_timeout_secs");
        let max_duration: Option<i64> = row.get("max_duration_secs");

        Ok(SessionRecord {
            name,
            user,
            template,
            state,
            namespace: row.get("namespace"),
            platform: row.get("platform"),
            url: row.get("url"),
            pod_name: row.get("pod_name"),
            resources: ResourceSpec {
                cpu_millis: u64::try_from(cpu).unwrap_or(0),
                memory_bytes: u64::try_from(memory).unwrap_or(0),
            },
            persistent_home: row.get::<i64, _>("persistent_home") != 0,
            idle_timeout_secs: idle_timeout.and_then(|v| u64::try_from(v).ok()),
            max_duration_secs: max_duration.and_then(|v| u64::try_from(v).ok()),
            tags,
            state_message: row.get("state_message"),
            created_at: text_to_ts("sessions", &created_at_raw)?,
            last_activity: text_to_ts("sessions", &last_activity_raw)?,
            agent_id,
        })
    }

    fn parse_usage(row: &sqlx::sqlite::SqliteRow) -> ResourceUsage {
        let cpu: i64 = row.get(0);
        let memory: i64 = row.get(1);
        let sessions: i64 = row.get(2);
        ResourceUsage {
            cpu_millis: u64::try_from(cpu).unwrap_or(0),
            memory_bytes: u64::try_from(memory).unwrap_or(0),
            sessions: u64::try_from(sessions).unwrap_or(0),
        }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, session), fields(session = %session.name))]
    async fn insert(&self, session: &SessionRecord) -> StoreResult<()> {
        let tags = serde_json::to_string(&session.tags)
            .map_err(|e| corrupt("sessions", format!("tags encode: {e}")))?;
        let result = sqlx::query(INSERT_SESSION)
            .bind(session.name.as_str())
            .bind(session.user.as_str())
            .bind(session.template.as_str())
            .bind(session.state.as_str())
            .bind(&session.namespace)
            .bind(&session.platform)
            .bind(session.url.as_deref())
            .bind(session.pod_name.as_deref())
            .bind(i64::try_from(session.resources.memory_bytes).unwrap_or(i64::MAX))
            .bind(i64::try_from(session.resources.cpu_millis).unwrap_or(i64::MAX))
            .bind(i64::from(session.persistent_home))
            .bind(session.idle_timeout_secs.and_then(|v| i64::try_from(v).ok()))
            .bind(session.max_duration_secs.and_then(|v| i64::try_from(v).ok()))
            .bind(tags)
            .bind(session.state_message.as_deref())
            .bind(ts_to_text(session.created_at))
            .bind(ts_to_text(session.last_activity))
            .bind(session.agent_id.as_ref().map(|s| s.as_str()))
            .execute(self.connection.pool())
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                StoreError::Conflict(format!("session {} already exists", session.name)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, name: &SessionName) -> StoreResult<Option<SessionRecord>> {
        let row = sqlx::query(SELECT_SESSION)
            .bind(name.as_str())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list(&self, user: Option<&UserId>) -> StoreResult<Vec<SessionRecord>> {
        let rows = match user {
            Some(user) => {
                sqlx::query(SELECT_FOR_USER)
                    .bind(user.as_str())
                    .fetch_all(self.connection.pool())
                    .await?
            }
            None => {
                sqlx::query(SELECT_ALL)
                    .fetch_all(self.connection.pool())
                    .await?
            }
        };
        rows.iter().map(Self::parse_row).collect()
    }

    #[instrument(skip(self), fields(session = %name, state = state.as_str()))]
    async fn set_state(
        &self,
        name: &SessionName,
        state: SessionState,
        message: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(SET_STATE)
            .bind(name.as_str())
            .bind(state.as_str())
            .bind(message)
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn set_endpoints(
        &self,
        name: &SessionName,
        url: Option<&str>,
        pod_name: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(SET_ENDPOINTS)
            .bind(name.as_str())
            .bind(url)
            .bind(pod_name)
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn touch_activity(&self, name: &SessionName, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(TOUCH_ACTIVITY)
            .bind(name.as_str())
            .bind(ts_to_text(at))
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn usage_for_user(&self, user: &UserId) -> StoreResult<ResourceUsage> {
        let row = sqlx::query(USAGE_FOR_USER)
            .bind(user.as_str())
            .fetch_one(self.connection.pool())
            .await?;
        Ok(Self::parse_usage(&row))
    }

    async fn usage_for_agent(&self, agent_id: &AgentId) -> StoreResult<ResourceUsage> {
        let row = sqlx::query(USAGE_FOR_AGENT)
            .bind(agent_id.as_str())
            .fetch_one(self.connection.pool())
            .await?;
        Ok(Self::parse_usage(&row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConnection;
    use crate::domain::AgentCapacity;
    use crate::storage::{AgentStore, SqliteAgentStore};

    fn sample(name: &str, user: &str, state: SessionState) -> SessionRecord {
        SessionRecord {
            name: SessionName::try_new(name).unwrap(),
            user: UserId::try_new(user).unwrap(),
            template: TemplateName::try_new("firefox").unwrap(),
            state,
            namespace: "default".into(),
            platform: "kubernetes".into(),
            url: None,
            pod_name: None,
            resources: ResourceSpec {
                cpu_millis: 500,
                memory_bytes: 2 * 1024 * 1024 * 1024,
            },
            persistent_home: true,
            idle_timeout_secs: Some(1800),
            max_duration_secs: None,
            tags: vec!["browser".into()],
            state_message: None,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            agent_id: Some(AgentId::try_new("k8s-1").unwrap()),
        }
    }

    /// Session rows reference the agents table, so seed the agent first.
    async fn store_with_agent() -> SqliteSessionStore {
        let db = DatabaseConnection::initialize_in_memory().await.unwrap();
        let agents = SqliteAgentStore::new(db.clone());
        agents
            .upsert_registration(
                &AgentId::try_new("k8s-1").unwrap(),
                "kubernetes",
                None,
                &AgentCapacity::default(),
            )
            .await
            .unwrap();
        SqliteSessionStore::new(db)
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = store_with_agent().await;
        let record = sample("u1-firefox-aa11bb22", "u1", SessionState::Pending);
        store.insert(&record).await.unwrap();

        let loaded = store.get(&record.name).await.unwrap().unwrap();
        assert_eq!(loaded.user, record.user);
        assert_eq!(loaded.state, SessionState::Pending);
        assert_eq!(loaded.resources, record.resources);
        assert_eq!(loaded.tags, record.tags);
        assert!(loaded.persistent_home);
    }

    #[tokio::test]
    async fn duplicate_names_are_a_conflict() {
        let store = store_with_agent().await;
        let record = sample("u1-firefox-aa11bb22", "u1", SessionState::Pending);
        store.insert(&record).await.unwrap();
        let err = store.insert(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn usage_sums_only_non_terminal_sessions() {
        let store = store_with_agent().await;
        let user = UserId::try_new("u1").unwrap();
        store
            .insert(&sample("u1-firefox-00000001", "u1", SessionState::Running))
            .await
            .unwrap();
        store
            .insert(&sample("u1-firefox-00000002", "u1", SessionState::Hibernated))
            .await
            .unwrap();
        store
            .insert(&sample("u1-firefox-00000003", "u1", SessionState::Terminated))
            .await
            .unwrap();

        let usage = store.usage_for_user(&user).await.unwrap();
        assert_eq!(usage.sessions, 2);
        assert_eq!(usage.cpu_millis, 1000);
        assert_eq!(usage.memory_bytes, 4 * 1024 * 1024 * 1024);

        let agent = AgentId::try_new("k8s-1").unwrap();
        let agent_usage = store.usage_for_agent(&agent).await.unwrap();
        assert_eq!(agent_usage.sessions, 2);
    }

    #[tokio::test]
    async fn state_and_endpoint_updates_apply() {
        let store = store_with_agent().await;
        let record = sample("u1-firefox-aa11bb22", "u1", SessionState::Pending);
        store.insert(&record).await.unwrap();

        store
            .set_state(&record.name, SessionState::Running, None)
            .await
            .unwrap();
        store
            .set_endpoints(&record.name, Some("http://stream/u1"), Some("pod-1"))
            .await
            .unwrap();
        // COALESCE keeps existing endpoints when the update carries none.
        store.set_endpoints(&record.name, None, None).await.unwrap();

        let loaded = store.get(&record.name).await.unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Running);
        assert_eq!(loaded.url.as_deref(), Some("http://stream/u1"));
        assert_eq!(loaded.pod_name.as_deref(), Some("pod-1"));
    }

    #[tokio::test]
    async fn listing_scopes_to_user() {
        let store = store_with_agent().await;
        store
            .insert(&sample("u1-firefox-00000001", "u1", SessionState::Running))
            .await
            .unwrap();
        store
            .insert(&sample("u2-firefox-00000001", "u2", SessionState::Running))
            .await
            .unwrap();

        let u1 = UserId::try_new("u1").unwrap();
        assert_eq!(store.list(Some(&u1)).await.unwrap().len(), 1);
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }
}
